//! Code generator
//!
//! Turns a resolved module into a `RuntimeModule`: top-level code,
//! teardown code and one chunk per function. The generator owns the
//! stack discipline the VM relies on:
//!
//! - variable slots mirror the runtime frame layout (the resolver's
//!   numbering), with list-typed cells accessed through the `_LIST`
//!   instruction forms;
//! - `COPY_LIST` is emitted wherever a list rvalue crosses an owning
//!   boundary (declaration, assignment, by-value argument, return);
//! - every expression statement ends in the `POP` form matching the
//!   discarded value's type, so cache counts and heap lists balance;
//! - scope exits, `break`/`continue` and `return` release the locals
//!   that go out of scope, strings and lists through their owning pops;
//! - string ordering copies its operands with `ACCESS_FROM_TOP`, compares
//!   the copies and releases the originals with a `SWAP`/`POP_STRING`
//!   pair, keeping the cache balanced without a dedicated instruction;
//! - teardown code moves each surviving global out of its cell and
//!   releases it, in reverse declaration order.

use crate::ast::{Expr, ExprKind, FunctionDecl, LiteralValue, NumericConversion, ScopeKind, Stmt};
use crate::driver::{CompilerContext, ParsedModule};
use crate::scanner::TokenKind;
use crate::types::TypeDesc;
use rill_runtime::chunk::{Chunk, Instruction};
use rill_runtime::module::{RuntimeFunction, RuntimeModule};
use rill_runtime::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Trivial,
    Str,
    List,
}

fn slot_kind(var_type: &TypeDesc) -> SlotKind {
    if var_type.is_ref() {
        SlotKind::Trivial
    } else if var_type.is_string() {
        SlotKind::Str
    } else if var_type.is_list() || var_type.is_tuple() {
        SlotKind::List
    } else {
        SlotKind::Trivial
    }
}

struct LoopContext {
    is_loop: bool,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    has_increment: bool,
    start: usize,
    locals_depth: usize,
}

pub struct Generator<'c> {
    ctx: &'c CompilerContext,
    module: &'c ParsedModule,
    /// Module path -> position in the dependency-sorted module list
    final_index: &'c HashMap<String, usize>,
    /// This module's position in that list
    position: usize,
    is_main: bool,
    chunk: Chunk,
    functions: Vec<RuntimeFunction>,
    /// Cells of the frame being generated, from its base
    locals: Vec<SlotKind>,
    loops: Vec<LoopContext>,
    line: u32,
}

/// Compile one resolved module. `final_index` maps absolute module paths
/// to their position in the dependency order handed to the VM.
pub fn compile_module(
    ctx: &CompilerContext,
    module: &ParsedModule,
    final_index: &HashMap<String, usize>,
    position: usize,
    is_main: bool,
) -> RuntimeModule {
    let mut generator = Generator {
        ctx,
        module,
        final_index,
        position,
        is_main,
        chunk: Chunk::new(),
        functions: Vec::new(),
        locals: Vec::new(),
        loops: Vec::new(),
        line: 1,
    };
    generator.compile()
}

impl<'c> Generator<'c> {
    fn compile(mut self) -> RuntimeModule {
        let module = self.module;
        for statement in &module.statements {
            self.emit_stmt(statement);
        }

        if self.is_main {
            if let Some(signature) = module.functions.get("main") {
                self.emit(Instruction::PushNull, 0);
                self.emit_name_constant("main");
                self.emit(Instruction::LoadFunctionSameModule, 0);
                self.emit(Instruction::CallFunction, 0);
                self.emit_discard(&signature.return_type.clone());
            }
        }
        self.emit(Instruction::Halt, 0);

        let top_level_code = std::mem::take(&mut self.chunk);
        let teardown_code = self.build_teardown();

        let mut compiled = RuntimeModule::new(self.module.name.clone(), self.module.path.clone());
        compiled.top_level_code = top_level_code;
        compiled.teardown_code = teardown_code;
        for function in self.functions {
            compiled.add_function(function);
        }
        compiled
    }

    /// Teardown releases the module's surviving globals in reverse
    /// declaration order: strings back to the cache, lists to the heap.
    fn build_teardown(&mut self) -> Chunk {
        let mut teardown = Chunk::new();
        for (slot, global_type) in self.module.globals.iter().enumerate().rev() {
            match slot_kind(global_type) {
                SlotKind::Str => {
                    teardown.emit(Instruction::MoveGlobal, slot as u32, self.line);
                    teardown.emit(Instruction::PopString, 0, self.line);
                }
                SlotKind::List => {
                    teardown.emit(Instruction::MoveGlobal, slot as u32, self.line);
                    teardown.emit(Instruction::PopList, 0, self.line);
                }
                SlotKind::Trivial => {}
            }
        }
        teardown.emit(Instruction::Halt, 0, self.line);
        teardown
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn emit(&mut self, instruction: Instruction, operand: u32) -> usize {
        self.chunk.emit(instruction, operand, self.line)
    }

    fn emit_jump(&mut self, instruction: Instruction) -> usize {
        self.chunk.emit_jump(instruction, self.line)
    }

    fn patch_to_here(&mut self, jump: usize) {
        let distance = (self.chunk.bytes.len() - jump - 1) as u32;
        self.chunk.patch(jump, distance);
    }

    fn emit_loop_back(&mut self, start: usize) {
        let distance = (self.chunk.bytes.len() + 1 - start) as u32;
        self.emit(Instruction::JumpBackward, distance);
    }

    fn emit_name_constant(&mut self, name: &str) {
        let index = self.chunk.add_constant(Value::String(name.into()));
        self.emit(Instruction::ConstantString, index);
    }

    fn emit_int_constant(&mut self, value: i32) {
        let index = self.chunk.add_constant(Value::Int(value));
        self.emit(Instruction::Constant, index);
    }

    fn emit_discard(&mut self, discarded: &TypeDesc) {
        match slot_kind(discarded) {
            SlotKind::Str => self.emit(Instruction::PopString, 0),
            SlotKind::List => self.emit(Instruction::PopList, 0),
            SlotKind::Trivial => self.emit(Instruction::Pop, 0),
        };
    }

    fn expr_type(expr: &Expr) -> TypeDesc {
        expr.attrs.resolved.clone().unwrap_or_else(TypeDesc::null)
    }

    /// Release the cells above `depth`, top-down, without forgetting
    /// them; used before a jump that leaves their scope.
    fn emit_pops_above(&mut self, depth: usize) {
        for kind in self.locals[depth..].to_vec().into_iter().rev() {
            match kind {
                SlotKind::Str => self.emit(Instruction::PopString, 0),
                SlotKind::List => self.emit(Instruction::PopList, 0),
                SlotKind::Trivial => self.emit(Instruction::Pop, 0),
            };
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn emit_stmt(&mut self, statement: &Stmt) {
        match statement {
            Stmt::Expression { expr } => {
                self.emit_expr(expr);
                self.emit_discard(&Self::expr_type(expr));
            }
            Stmt::Var {
                name,
                initializer,
                resolved_type,
                conversion,
                slot,
                global,
                keyword,
                ..
            } => {
                self.line = keyword.line;
                let var_type = resolved_type.clone().unwrap_or_else(TypeDesc::null);
                debug_assert_eq!(
                    *slot,
                    self.locals.len(),
                    "slot numbering out of sync for '{}'",
                    name.lexeme
                );

                if let ExprKind::ListRepeat { element, count } = &initializer.kind {
                    self.emit_list_repeat(*slot, *global, element, count);
                } else if var_type.is_ref() {
                    self.emit_reference_to(initializer);
                } else {
                    self.emit_expr(initializer);
                    self.apply_conversion(*conversion);
                    if var_type.is_list() || var_type.is_tuple() {
                        self.emit(Instruction::CopyList, 0);
                    }
                }
                // The initializer value stays on the stack: it is the cell
                self.locals.push(slot_kind(&var_type));
            }
            Stmt::Function(declaration) => self.emit_function(declaration),
            Stmt::Class(_) => {}
            Stmt::If {
                keyword,
                condition,
                then_branch,
                else_branch,
            } => {
                self.line = keyword.line;
                self.emit_expr(condition);
                let skip_then = self.emit_jump(Instruction::PopJumpIfFalse);
                self.emit_stmt(then_branch);
                match else_branch {
                    Some(else_branch) => {
                        let skip_else = self.emit_jump(Instruction::JumpForward);
                        self.patch_to_here(skip_then);
                        self.emit_stmt(else_branch);
                        self.patch_to_here(skip_else);
                    }
                    None => self.patch_to_here(skip_then),
                }
            }
            Stmt::While {
                keyword,
                condition,
                body,
                increment,
            } => {
                self.line = keyword.line;
                let start = self.chunk.bytes.len();
                self.emit_expr(condition);
                let exit = self.emit_jump(Instruction::PopJumpIfFalse);

                self.loops.push(LoopContext {
                    is_loop: true,
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    has_increment: increment.is_some(),
                    start,
                    locals_depth: self.locals.len(),
                });
                self.emit_stmt(body);
                let context = self.loops.pop().expect("loop context pushed above");

                for jump in context.continue_jumps {
                    self.patch_to_here(jump);
                }
                if let Some(increment) = increment {
                    self.emit_stmt(increment);
                }
                self.emit_loop_back(start);

                self.patch_to_here(exit);
                for jump in context.break_jumps {
                    self.patch_to_here(jump);
                }
            }
            Stmt::Block { statements } => {
                let depth = self.locals.len();
                for statement in statements {
                    self.emit_stmt(statement);
                }
                self.emit_pops_above(depth);
                self.locals.truncate(depth);
            }
            Stmt::Return { keyword, value } => {
                self.line = keyword.line;
                if let Some(value) = value {
                    let value_type = Self::expr_type(value);
                    self.emit_expr(value);
                    if value_type.is_list() || value_type.is_tuple() {
                        self.emit(Instruction::CopyList, 0);
                        self.emit(Instruction::AssignLocalList, 0);
                    } else {
                        self.emit(Instruction::AssignLocal, 0);
                    }
                    // Ownership moved into the return cell
                    self.emit(Instruction::Pop, 0);
                }
                self.emit_function_exit();
            }
            Stmt::Break { keyword } => {
                self.line = keyword.line;
                let Some(depth) = self.loops.last().map(|context| context.locals_depth) else {
                    return;
                };
                self.emit_pops_above(depth);
                let jump = self.emit_jump(Instruction::JumpForward);
                if let Some(context) = self.loops.last_mut() {
                    context.break_jumps.push(jump);
                }
            }
            Stmt::Continue { keyword } => {
                self.line = keyword.line;
                let target = self
                    .loops
                    .iter()
                    .rposition(|context| context.is_loop);
                let Some(target) = target else {
                    return;
                };
                let (depth, has_increment, start) = {
                    let context = &self.loops[target];
                    (context.locals_depth, context.has_increment, context.start)
                };
                self.emit_pops_above(depth);
                if has_increment {
                    let jump = self.emit_jump(Instruction::JumpForward);
                    self.loops[target].continue_jumps.push(jump);
                } else {
                    self.emit_loop_back(start);
                }
            }
            Stmt::Switch {
                condition,
                cases,
                default,
            } => {
                self.emit_expr(condition);
                self.loops.push(LoopContext {
                    is_loop: false,
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    has_increment: false,
                    start: 0,
                    locals_depth: self.locals.len(),
                });

                let mut end_jumps = Vec::new();
                for (case, body) in cases {
                    self.emit_expr(case);
                    let into_body = self.emit_jump(Instruction::PopJumpIfEqual);
                    let skip_body = self.emit_jump(Instruction::JumpForward);
                    self.patch_to_here(into_body);
                    self.emit_stmt(body);
                    end_jumps.push(self.emit_jump(Instruction::JumpForward));
                    self.patch_to_here(skip_body);
                }

                // No case matched: the condition is still on the stack
                self.emit(Instruction::Pop, 0);
                if let Some(default) = default {
                    self.emit_stmt(default);
                }

                for jump in end_jumps {
                    self.patch_to_here(jump);
                }
                let context = self.loops.pop().expect("switch context pushed above");
                for jump in context.break_jumps {
                    self.patch_to_here(jump);
                }
            }
            Stmt::TypeAlias { .. } | Stmt::Import { .. } | Stmt::Error => {}
        }
    }

    fn emit_function(&mut self, declaration: &FunctionDecl) {
        let saved_chunk = std::mem::take(&mut self.chunk);
        let saved_locals = std::mem::take(&mut self.locals);
        let saved_line = self.line;
        self.line = declaration.name.line;

        // Slot 0 is the return value cell, parameters fill 1..=arity
        self.locals.push(SlotKind::Trivial);
        for (_, parameter_type) in &declaration.params {
            self.locals.push(slot_kind(parameter_type));
        }

        for statement in &declaration.body {
            self.emit_stmt(statement);
        }

        if declaration.return_type.is_null() {
            self.emit_function_exit();
        } else {
            // Falling off the end of a value-returning function traps
            self.emit(Instruction::TrapReturn, 0);
        }

        let code = std::mem::replace(&mut self.chunk, saved_chunk);
        self.locals = saved_locals;
        self.line = saved_line;

        self.functions.push(RuntimeFunction {
            name: declaration.name.lexeme.clone(),
            arity: declaration.params.len(),
            code,
            module_index: self.position,
        });
    }

    /// Release every frame cell above the return slot, then return.
    /// When all cells are trivial a single counted RETURN pops them.
    fn emit_function_exit(&mut self) {
        let cells = &self.locals[1..];
        if cells.iter().all(|kind| *kind == SlotKind::Trivial) {
            let count = cells.len() as u32;
            self.emit(Instruction::Return, count);
        } else {
            self.emit_pops_above(1);
            self.emit(Instruction::Return, 0);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn apply_conversion(&mut self, conversion: NumericConversion) {
        match conversion {
            NumericConversion::IntToFloat => {
                self.emit(Instruction::IntToFloat, 0);
            }
            NumericConversion::FloatToInt => {
                self.emit(Instruction::FloatToInt, 0);
            }
            NumericConversion::None => {}
        }
    }

    fn emit_expr(&mut self, expr: &Expr) {
        if expr.attrs.token.line != 0 {
            self.line = expr.attrs.token.line;
        }
        self.emit_expr_inner(expr);
        self.apply_conversion(expr.attrs.conversion);
    }

    fn emit_expr_inner(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(value) => match value {
                LiteralValue::Int(v) => self.emit_int_constant(*v),
                LiteralValue::Float(v) => {
                    let index = self.chunk.add_constant(Value::Float(*v));
                    self.emit(Instruction::Constant, index);
                }
                LiteralValue::String(s) => self.emit_name_constant(s),
                LiteralValue::Bool(true) => {
                    self.emit(Instruction::PushTrue, 0);
                }
                LiteralValue::Bool(false) => {
                    self.emit(Instruction::PushFalse, 0);
                }
                LiteralValue::Null => {
                    self.emit(Instruction::PushNull, 0);
                }
            },
            ExprKind::Variable { .. } => self.emit_variable_access(expr),
            ExprKind::Assign { .. } => self.emit_assign(expr),
            ExprKind::Binary { .. } => self.emit_binary(expr),
            ExprKind::Logical {
                left,
                operator,
                right,
            } => {
                self.emit_expr(left);
                let jump = if operator.kind == TokenKind::And {
                    self.emit_jump(Instruction::JumpIfFalse)
                } else {
                    self.emit_jump(Instruction::JumpIfTrue)
                };
                self.emit(Instruction::Pop, 0);
                self.emit_expr(right);
                self.patch_to_here(jump);
            }
            ExprKind::Unary { operator, operand } => self.emit_unary(expr, operator, operand),
            ExprKind::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                self.emit_expr(condition);
                let skip_then = self.emit_jump(Instruction::PopJumpIfFalse);
                self.emit_expr(then_branch);
                let skip_else = self.emit_jump(Instruction::JumpForward);
                self.patch_to_here(skip_then);
                self.emit_expr(else_branch);
                self.patch_to_here(skip_else);
            }
            ExprKind::Comma { expressions } => {
                let last = expressions.len() - 1;
                for (index, expression) in expressions.iter().enumerate() {
                    self.emit_expr(expression);
                    if index != last {
                        self.emit_discard(&Self::expr_type(expression));
                    }
                }
            }
            ExprKind::Grouping { inner } => self.emit_expr(inner),
            ExprKind::Call { .. } => self.emit_call(expr),
            ExprKind::Index { object, index } => {
                let object_type = Self::expr_type(object);
                self.emit_expr(object);
                self.emit_expr(index);
                if object_type.is_string() {
                    self.emit(Instruction::CheckStringIndex, 0);
                    self.emit(Instruction::IndexString, 0);
                } else {
                    self.emit(Instruction::CheckListIndex, 0);
                    self.emit(Instruction::IndexList, 0);
                }
            }
            ExprKind::ListAssign {
                object,
                index,
                operator,
                value,
            } => {
                self.emit_expr(object);
                self.emit_expr(index);
                self.emit(Instruction::CheckListIndex, 0);
                let element_type = Self::expr_type(expr);
                if operator.kind != TokenKind::Equal {
                    self.emit(Instruction::AccessFromTop, 2);
                    self.emit(Instruction::AccessFromTop, 2);
                    self.emit(Instruction::IndexList, 0);
                    self.emit_expr(value);
                    self.emit_compound_operator(operator.kind, &element_type);
                } else {
                    self.emit_expr(value);
                    if element_type.is_list() || element_type.is_tuple() {
                        self.emit(Instruction::CopyList, 0);
                    }
                }
                self.emit(Instruction::AssignList, 0);
            }
            ExprKind::List { elements } | ExprKind::Tuple { elements } => {
                self.emit(Instruction::MakeList, 0);
                for element in elements {
                    let element_type = Self::expr_type(element);
                    self.emit_expr(element);
                    if element_type.is_list() || element_type.is_tuple() {
                        self.emit(Instruction::CopyList, 0);
                    }
                    self.emit(Instruction::AppendList, 0);
                }
            }
            ExprKind::ListRepeat { .. } => {
                // Restricted to initializer positions by the resolver;
                // those are emitted by the Var/Assign handlers.
            }
            ExprKind::Get { object, name } => {
                self.emit_expr(object);
                let index: i32 = name.lexeme.parse().unwrap_or(0);
                self.emit_int_constant(index);
                self.emit(Instruction::CheckListIndex, 0);
                self.emit(Instruction::IndexList, 0);
            }
            ExprKind::Set {
                object,
                name,
                operator,
                value,
            } => {
                self.emit_expr(object);
                let index: i32 = name.lexeme.parse().unwrap_or(0);
                self.emit_int_constant(index);
                self.emit(Instruction::CheckListIndex, 0);
                let field_type = Self::expr_type(expr);
                if operator.kind != TokenKind::Equal {
                    self.emit(Instruction::AccessFromTop, 2);
                    self.emit(Instruction::AccessFromTop, 2);
                    self.emit(Instruction::IndexList, 0);
                    self.emit_expr(value);
                    self.emit_compound_operator(operator.kind, &field_type);
                } else {
                    self.emit_expr(value);
                    if field_type.is_list() || field_type.is_tuple() {
                        self.emit(Instruction::CopyList, 0);
                    }
                }
                self.emit(Instruction::AssignList, 0);
            }
            ExprKind::Move { variable } => match &variable.attrs.scope {
                ScopeKind::Local { slot } => {
                    self.emit(Instruction::MoveLocal, *slot as u32);
                }
                ScopeKind::Global { slot } => {
                    self.emit(Instruction::MoveGlobal, *slot as u32);
                }
                _ => {}
            },
            ExprKind::ScopeName { .. }
            | ExprKind::ScopeAccess { .. }
            | ExprKind::This
            | ExprKind::Super { .. }
            | ExprKind::Error => {
                // Rejected by the resolver; nothing reaches here in an
                // error-free compilation.
            }
        }
    }

    fn emit_variable_access(&mut self, expr: &Expr) {
        let var_type = Self::expr_type(expr);
        let listy = var_type.is_list() || var_type.is_tuple();
        match &expr.attrs.scope {
            ScopeKind::Local { slot } => {
                let instruction = if listy {
                    Instruction::AccessLocalList
                } else {
                    Instruction::AccessLocal
                };
                self.emit(instruction, *slot as u32);
            }
            ScopeKind::Global { slot } => {
                let instruction = if listy {
                    Instruction::AccessGlobalList
                } else {
                    Instruction::AccessGlobal
                };
                self.emit(instruction, *slot as u32);
            }
            _ => return,
        }
        if var_type.is_ref() && !listy {
            self.emit(Instruction::Deref, 0);
        }
    }

    fn emit_assign(&mut self, expr: &Expr) {
        let ExprKind::Assign {
            operator, value, ..
        } = &expr.kind
        else {
            return;
        };
        let var_type = Self::expr_type(expr);
        let listy = var_type.is_list() || var_type.is_tuple();

        if let ExprKind::ListRepeat { element, count } = &value.kind {
            let (slot, global) = match expr.attrs.scope {
                ScopeKind::Local { slot } => (slot, false),
                ScopeKind::Global { slot } => (slot, true),
                _ => return,
            };
            // Replace the old list, then resize and fill in place
            self.emit(Instruction::MakeList, 0);
            let assign = if global {
                Instruction::AssignGlobalList
            } else {
                Instruction::AssignLocalList
            };
            self.emit(assign, slot as u32);
            self.emit(Instruction::PopList, 0);
            self.emit_list_repeat_fill(slot, global, element, count);
            // The assignment expression's value
            let access = if global {
                Instruction::AccessGlobalList
            } else {
                Instruction::AccessLocalList
            };
            self.emit(access, slot as u32);
            return;
        }

        if operator.kind != TokenKind::Equal {
            self.emit_variable_access(expr);
            self.emit_expr(value);
            self.emit_compound_operator(operator.kind, &var_type);
        } else {
            self.emit_expr(value);
            if listy {
                self.emit(Instruction::CopyList, 0);
            }
        }

        let instruction = match (&expr.attrs.scope, listy) {
            (ScopeKind::Local { .. }, false) => Instruction::AssignLocal,
            (ScopeKind::Local { .. }, true) => Instruction::AssignLocalList,
            (ScopeKind::Global { .. }, false) => Instruction::AssignGlobal,
            (ScopeKind::Global { .. }, true) => Instruction::AssignGlobalList,
            _ => return,
        };
        let slot = match expr.attrs.scope {
            ScopeKind::Local { slot } | ScopeKind::Global { slot } => slot,
            _ => return,
        };
        self.emit(instruction, slot as u32);
    }

    fn emit_compound_operator(&mut self, operator: TokenKind, target_type: &TypeDesc) {
        let instruction = match operator {
            TokenKind::PlusEqual => {
                if target_type.is_string() {
                    Instruction::Concatenate
                } else if target_type.is_float() {
                    Instruction::FAdd
                } else {
                    Instruction::IAdd
                }
            }
            TokenKind::MinusEqual => {
                if target_type.is_float() {
                    Instruction::FSub
                } else {
                    Instruction::ISub
                }
            }
            TokenKind::StarEqual => {
                if target_type.is_float() {
                    Instruction::FMul
                } else {
                    Instruction::IMul
                }
            }
            TokenKind::SlashEqual => {
                if target_type.is_float() {
                    Instruction::FDiv
                } else {
                    Instruction::IDiv
                }
            }
            _ => return,
        };
        self.emit(instruction, 0);
    }

    fn emit_unary(&mut self, expr: &Expr, operator: &crate::scanner::Token, operand: &Expr) {
        let result_type = Self::expr_type(expr);
        match operator.kind {
            TokenKind::Minus => {
                self.emit_expr(operand);
                if result_type.is_float() {
                    self.emit(Instruction::FNeg, 0);
                } else {
                    self.emit(Instruction::INeg, 0);
                }
            }
            TokenKind::Plus => self.emit_expr(operand),
            TokenKind::Not => {
                self.emit_expr(operand);
                self.emit(Instruction::Not, 0);
            }
            TokenKind::BitNot => {
                self.emit_expr(operand);
                self.emit(Instruction::BitNot, 0);
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                // Prefix increment: read, adjust by one, store back
                self.emit_variable_access(operand);
                if result_type.is_float() {
                    let index = self.chunk.add_constant(Value::Float(1.0));
                    self.emit(Instruction::Constant, index);
                    let instruction = if operator.kind == TokenKind::PlusPlus {
                        Instruction::FAdd
                    } else {
                        Instruction::FSub
                    };
                    self.emit(instruction, 0);
                } else {
                    self.emit_int_constant(1);
                    let instruction = if operator.kind == TokenKind::PlusPlus {
                        Instruction::IAdd
                    } else {
                        Instruction::ISub
                    };
                    self.emit(instruction, 0);
                }
                match &operand.attrs.scope {
                    ScopeKind::Local { slot } => {
                        self.emit(Instruction::AssignLocal, *slot as u32);
                    }
                    ScopeKind::Global { slot } => {
                        self.emit(Instruction::AssignGlobal, *slot as u32);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn emit_binary(&mut self, expr: &Expr) {
        let ExprKind::Binary {
            left,
            operator,
            right,
        } = &expr.kind
        else {
            return;
        };
        let left_type = Self::expr_type(left);
        let operand_float = left_type.is_float()
            || left.attrs.conversion == NumericConversion::IntToFloat;

        self.emit_expr(left);
        self.emit_expr(right);

        use TokenKind::*;
        match operator.kind {
            Plus if left_type.is_string() => {
                self.emit(Instruction::Concatenate, 0);
            }
            Plus => {
                self.emit_arith(operand_float, Instruction::IAdd, Instruction::FAdd);
            }
            Minus => {
                self.emit_arith(operand_float, Instruction::ISub, Instruction::FSub);
            }
            Star => {
                self.emit_arith(operand_float, Instruction::IMul, Instruction::FMul);
            }
            Slash => {
                self.emit_arith(operand_float, Instruction::IDiv, Instruction::FDiv);
            }
            Modulo => {
                self.emit_arith(operand_float, Instruction::IMod, Instruction::FMod);
            }
            BitAnd => {
                self.emit(Instruction::BitAnd, 0);
            }
            BitOr => {
                self.emit(Instruction::BitOr, 0);
            }
            BitXor => {
                self.emit(Instruction::BitXor, 0);
            }
            LeftShift => {
                self.emit(Instruction::ShiftLeft, 0);
            }
            RightShift => {
                self.emit(Instruction::ShiftRight, 0);
            }
            EqualEqual | NotEqual => {
                let owning = left_type.is_string()
                    || left_type.is_list()
                    || left_type.is_tuple()
                    || Self::expr_type(right).is_string();
                let instruction = if owning {
                    Instruction::EqualSL
                } else {
                    Instruction::Equal
                };
                self.emit(instruction, 0);
                if operator.kind == NotEqual {
                    self.emit(Instruction::Not, 0);
                }
            }
            Greater | GreaterEqual | Less | LessEqual => {
                let container = left_type.is_string() || left_type.is_list() || left_type.is_tuple();
                if container {
                    self.emit_container_ordering(operator.kind, &left_type);
                } else {
                    match operator.kind {
                        Greater => {
                            self.emit(Instruction::Greater, 0);
                        }
                        Less => {
                            self.emit(Instruction::Lesser, 0);
                        }
                        GreaterEqual => {
                            self.emit(Instruction::Lesser, 0);
                            self.emit(Instruction::Not, 0);
                        }
                        _ => {
                            self.emit(Instruction::Greater, 0);
                            self.emit(Instruction::Not, 0);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn emit_arith(&mut self, float: bool, int_insn: Instruction, float_insn: Instruction) {
        let instruction = if float { float_insn } else { int_insn };
        self.emit(instruction, 0);
    }

    /// Ordering on strings (and lists) must not consume the counted
    /// operands: compare uncounted copies, then release the originals
    /// from under the result with SWAP.
    fn emit_container_ordering(&mut self, operator: TokenKind, operand_type: &TypeDesc) {
        self.emit(Instruction::AccessFromTop, 2);
        self.emit(Instruction::AccessFromTop, 2);
        match operator {
            TokenKind::Greater => {
                self.emit(Instruction::Greater, 0);
            }
            TokenKind::Less => {
                self.emit(Instruction::Lesser, 0);
            }
            TokenKind::GreaterEqual => {
                self.emit(Instruction::Lesser, 0);
                self.emit(Instruction::Not, 0);
            }
            _ => {
                self.emit(Instruction::Greater, 0);
                self.emit(Instruction::Not, 0);
            }
        }
        let pop = if operand_type.is_string() {
            Instruction::PopString
        } else {
            Instruction::PopList
        };
        self.emit(Instruction::Swap, 1);
        self.emit(pop, 0);
        self.emit(Instruction::Swap, 1);
        self.emit(pop, 0);
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn emit_call(&mut self, expr: &Expr) {
        let ExprKind::Call { arguments, .. } = &expr.kind else {
            return;
        };
        match &expr.attrs.scope {
            ScopeKind::Native { name } => {
                for argument in arguments {
                    self.emit_expr(argument);
                }
                let name = name.clone();
                self.emit_name_constant(&name);
                self.emit(Instruction::CallNative, 0);
            }
            ScopeKind::Function { name } => {
                let name = name.clone();
                let params = self
                    .module
                    .functions
                    .get(&name)
                    .map(|signature| signature.params.clone())
                    .unwrap_or_default();
                self.emit(Instruction::PushNull, 0);
                self.emit_arguments(arguments, &params);
                self.emit_name_constant(&name);
                self.emit(Instruction::LoadFunctionSameModule, 0);
                self.emit(Instruction::CallFunction, 0);
            }
            ScopeKind::ModuleFunction { module_path, name } => {
                let name = name.clone();
                let module_position = self.final_index.get(module_path).copied().unwrap_or(0);
                let params = self
                    .ctx
                    .module_paths
                    .get(module_path)
                    .and_then(|&index| {
                        self.ctx.parsed_modules[index].0.functions.get(&name)
                    })
                    .map(|signature| signature.params.clone())
                    .unwrap_or_default();
                self.emit(Instruction::PushNull, 0);
                self.emit_arguments(arguments, &params);
                self.emit_name_constant(&name);
                self.emit(Instruction::LoadFunctionModuleIndex, module_position as u32);
                self.emit(Instruction::CallFunction, 0);
            }
            _ => {}
        }
    }

    fn emit_arguments(&mut self, arguments: &[Expr], params: &[TypeDesc]) {
        for (index, argument) in arguments.iter().enumerate() {
            match params.get(index) {
                Some(parameter) if parameter.is_ref() => self.emit_reference_to(argument),
                Some(parameter) if parameter.is_list() || parameter.is_tuple() => {
                    self.emit_expr(argument);
                    self.emit(Instruction::CopyList, 0);
                }
                _ => self.emit_expr(argument),
            }
        }
    }

    /// Push a reference to an lvalue: variables alias their cell, index
    /// and field expressions alias the list element.
    fn emit_reference_to(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Variable { .. } => {
                let target_type = Self::expr_type(target);
                match &target.attrs.scope {
                    ScopeKind::Local { slot } => {
                        if target_type.is_ref() {
                            // Already a reference: pass the cell through
                            self.emit(Instruction::AccessLocal, *slot as u32);
                        } else {
                            self.emit(Instruction::MakeRefToLocal, *slot as u32);
                        }
                    }
                    ScopeKind::Global { slot } => {
                        if target_type.is_ref() {
                            self.emit(Instruction::AccessGlobal, *slot as u32);
                        } else {
                            self.emit(Instruction::MakeRefToGlobal, *slot as u32);
                        }
                    }
                    _ => {}
                }
            }
            ExprKind::Index { object, index } => {
                self.emit_expr(object);
                self.emit_expr(index);
                self.emit(Instruction::CheckListIndex, 0);
                self.emit(Instruction::MakeRefToIndex, 0);
            }
            ExprKind::Get { object, name } => {
                self.emit_expr(object);
                let index: i32 = name.lexeme.parse().unwrap_or(0);
                self.emit_int_constant(index);
                self.emit(Instruction::CheckListIndex, 0);
                self.emit(Instruction::MakeRefToIndex, 0);
            }
            ExprKind::Grouping { inner } => self.emit_reference_to(inner),
            _ => self.emit_expr(target),
        }
    }

    // ------------------------------------------------------------------
    // List repeat lowering
    // ------------------------------------------------------------------

    /// `var xs = [element; count]`: allocate the owning cell, then
    /// resize and fill it in place through the internal natives.
    fn emit_list_repeat(&mut self, slot: usize, global: bool, element: &Expr, count: &Expr) {
        self.emit(Instruction::MakeList, 0);
        self.emit_list_repeat_fill(slot, global, element, count);
    }

    fn emit_list_repeat_fill(&mut self, slot: usize, global: bool, element: &Expr, count: &Expr) {
        let access = if global {
            Instruction::AccessGlobalList
        } else {
            Instruction::AccessLocalList
        };

        self.emit(access, slot as u32);
        self.emit_expr(count);
        self.emit_name_constant("%resize_list_trivial");
        self.emit(Instruction::CallNative, 0);
        self.emit(Instruction::Pop, 0);

        self.emit(access, slot as u32);
        self.emit_expr(element);
        self.emit_name_constant("fill_trivial");
        self.emit(Instruction::CallNative, 0);
        self.emit(Instruction::Pop, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CompilerContext;
    use crate::parser::Parser;
    use crate::resolver::resolve_module;
    use crate::scanner::Scanner;
    use rill_runtime::chunk::OPERAND_MASK;

    fn compile_source(source: &str) -> RuntimeModule {
        let mut ctx = CompilerContext::for_tests();
        let mut module = ParsedModule::new("test", "/test.rill");
        let scanner = Scanner::new(source, "test");
        let statements = {
            let mut parser = Parser::new(&mut ctx, &mut module, scanner, 0);
            parser.program()
        };
        module.statements = statements;
        resolve_module(
            &mut ctx.reporter,
            &ctx.options,
            &ctx.parsed_modules,
            &mut module,
        );
        assert!(
            !ctx.reporter.had_error(),
            "source failed to check:\n{}",
            ctx.reporter.format_all()
        );
        ctx.parsed_modules.push((module, 0));
        let final_index = HashMap::from([("/test.rill".to_string(), 0)]);
        compile_module(&ctx, &ctx.parsed_modules[0].0, &final_index, 0, true)
    }

    fn opcodes(chunk: &Chunk) -> Vec<Instruction> {
        let mut decoded = Vec::new();
        let mut index = 0;
        while index < chunk.bytes.len() {
            let instruction = Instruction::from_byte((chunk.bytes[index] >> 24) as u8)
                .expect("valid opcode");
            decoded.push(instruction);
            index += 1 + chunk.trailing_words(index);
        }
        decoded
    }

    #[test]
    fn test_top_level_ends_with_halt() {
        let module = compile_source("var x = 1\n");
        assert_eq!(opcodes(&module.top_level_code).last(), Some(&Instruction::Halt));
        assert_eq!(opcodes(&module.teardown_code).last(), Some(&Instruction::Halt));
    }

    #[test]
    fn test_main_call_is_appended() {
        let module = compile_source("fn main() -> int { return 0; }\n");
        let decoded = opcodes(&module.top_level_code);
        assert!(decoded.contains(&Instruction::LoadFunctionSameModule));
        assert!(decoded.contains(&Instruction::CallFunction));
        assert!(decoded.contains(&Instruction::PushNull));
    }

    #[test]
    fn test_value_returning_function_ends_with_trap() {
        let module = compile_source("fn f() -> int { var x = 1; x = 2; }\n");
        let function = &module.functions[0];
        assert_eq!(opcodes(&function.code).last(), Some(&Instruction::TrapReturn));
    }

    #[test]
    fn test_null_function_gets_implicit_return() {
        let module = compile_source("fn f(x: int) -> null { print(x); }\n");
        let function = &module.functions[0];
        let decoded = opcodes(&function.code);
        assert_eq!(decoded.last(), Some(&Instruction::Return));
        // the counted RETURN pops the trivial parameter
        let last_word = *function.code.bytes.last().unwrap();
        assert_eq!(last_word & OPERAND_MASK, 1);
    }

    #[test]
    fn test_teardown_releases_owning_globals() {
        let module = compile_source("var s = \"x\"\nvar n = 1\nvar xs = [1]\n");
        let decoded = opcodes(&module.teardown_code);
        // reverse declaration order: the list, then the string; the int
        // needs no release
        assert_eq!(
            decoded,
            vec![
                Instruction::MoveGlobal,
                Instruction::PopList,
                Instruction::MoveGlobal,
                Instruction::PopString,
                Instruction::Halt
            ]
        );
    }

    #[test]
    fn test_list_variable_initializer_is_copied() {
        let module = compile_source("var a = [1]\nvar b = a\n");
        let decoded = opcodes(&module.top_level_code);
        assert!(decoded.contains(&Instruction::CopyList));
        assert!(decoded.contains(&Instruction::AccessGlobalList));
    }

    #[test]
    fn test_string_equality_uses_equal_sl() {
        let module =
            compile_source("var a = \"x\"\nfn f() -> bool { return a == \"y\"; }\n");
        let function = &module.functions[0];
        assert!(opcodes(&function.code).contains(&Instruction::EqualSL));
    }

    #[test]
    fn test_expression_statement_discards_by_type() {
        let module = compile_source("var s = \"x\"\nfn f() -> null { s; s + \"y\"; }\n");
        let function = &module.functions[0];
        let decoded = opcodes(&function.code);
        let pop_strings = decoded
            .iter()
            .filter(|i| **i == Instruction::PopString)
            .count();
        // both expression statements discard a string
        assert!(pop_strings >= 2, "got {:?}", decoded);
    }

    #[test]
    fn test_if_else_jumps_are_patched() {
        let module = compile_source(
            "fn f(x: int) -> int { if (x == 1) { return 1; } else { return 2; } }\n",
        );
        let function = &module.functions[0];
        for (index, word) in function.code.bytes.iter().enumerate() {
            let opcode = Instruction::from_byte((word >> 24) as u8);
            if matches!(
                opcode,
                Some(Instruction::JumpForward | Instruction::PopJumpIfFalse)
            ) {
                let distance = (word & OPERAND_MASK) as usize;
                assert!(
                    index + 1 + distance <= function.code.bytes.len(),
                    "jump at {} overshoots the chunk",
                    index
                );
                assert!(distance > 0, "unpatched jump at {}", index);
            }
        }
    }

    #[test]
    fn test_while_emits_backward_jump() {
        let module =
            compile_source("fn f() -> null { var i = 0; while i < 3 { i += 1; } }\n");
        let function = &module.functions[0];
        assert!(opcodes(&function.code).contains(&Instruction::JumpBackward));
    }

    #[test]
    fn test_list_repeat_lowers_to_natives() {
        let module = compile_source("fn f() -> null { var xs: [int] = [0; 4]; print(xs); }\n");
        let function = &module.functions[0];
        let decoded = opcodes(&function.code);
        assert!(decoded.contains(&Instruction::MakeList));
        let native_calls = decoded
            .iter()
            .filter(|i| **i == Instruction::CallNative)
            .count();
        // resize, fill and the print itself
        assert_eq!(native_calls, 3);
    }
}
