//! Type resolver
//!
//! Walks each module's AST once and fills every expression's synthesized
//! attributes: the resolved type, the lvalue flag, numeric conversion
//! tags, and the resolution of names to frame slots, module functions or
//! natives. Slot numbering mirrors the runtime stack layout: module
//! globals count up from the module frame's base; function locals count
//! up from the call frame's base, with slot 0 reserved for the return
//! value and parameters in slots 1..=arity.
//!
//! The resolver is all-or-nothing: if it reports any error the driver
//! never runs the code generator.

use crate::ast::{
    Expr, ExprKind, FunctionDecl, LiteralValue, NumericConversion, ScopeKind, Stmt,
};
use crate::builtins;
use crate::config::{FlagLevel, Options};
use crate::diagnostics::DiagnosticReporter;
use crate::driver::{FunctionSig, ParsedModule};
use crate::scanner::{Token, TokenKind};
use crate::types::{PrimitiveKind, TypeDesc};
use std::collections::HashMap;

struct VariableRecord {
    slot: usize,
    var_type: TypeDesc,
    is_const: bool,
}

#[derive(Default)]
struct Scope {
    names: HashMap<String, VariableRecord>,
    allocated: usize,
}

struct FunctionContext {
    return_type: TypeDesc,
    next_slot: usize,
    max_slot: usize,
}

pub struct Resolver<'c> {
    reporter: &'c mut DiagnosticReporter,
    options: &'c Options,
    parsed_modules: &'c [(ParsedModule, usize)],
    module_name: String,
    functions: &'c HashMap<String, FunctionSig>,
    classes: &'c std::collections::HashSet<String>,
    imported: &'c [usize],
    scopes: Vec<Scope>,
    type_aliases: HashMap<String, TypeDesc>,
    function_ctx: Option<FunctionContext>,
    module_next_slot: usize,
    globals: Vec<TypeDesc>,
    /// List-repeat expressions are only valid where a destination slot
    /// exists (declarations and whole-variable assignments)
    repeat_allowed: bool,
}

/// Resolve a parsed module in place. `module.statements` are annotated,
/// and `module.globals` is filled with the module-frame slots that need
/// teardown.
pub fn resolve_module(
    reporter: &mut DiagnosticReporter,
    options: &Options,
    parsed_modules: &[(ParsedModule, usize)],
    module: &mut ParsedModule,
) {
    let mut statements = std::mem::take(&mut module.statements);
    let mut resolver = Resolver {
        reporter,
        options,
        parsed_modules,
        module_name: module.name.clone(),
        functions: &module.functions,
        classes: &module.classes,
        imported: &module.imported,
        scopes: vec![Scope::default()],
        type_aliases: HashMap::new(),
        function_ctx: None,
        module_next_slot: 0,
        globals: Vec::new(),
        repeat_allowed: false,
    };
    for statement in &mut statements {
        resolver.resolve_stmt(statement);
    }
    module.globals = std::mem::take(&mut resolver.globals);
    module.statements = statements;
}

impl<'c> Resolver<'c> {
    fn error(&mut self, message: impl Into<String>, token: &Token) {
        self.reporter.error(&self.module_name, message, token);
    }

    fn implicit_conversion_flag(&mut self, token: &Token) {
        let message = "Implicit conversion between float and int";
        match self.options.implicit_float_int {
            FlagLevel::Warn => self.reporter.warning(
                &self.module_name,
                format!("{} [[ implicit-float-int = warn ]]", message),
                token,
            ),
            FlagLevel::Error => self.reporter.error(
                &self.module_name,
                format!("{} [[ implicit-float-int = error ]]", message),
                token,
            ),
            FlagLevel::None => {}
        }
    }

    fn error_type(&self) -> TypeDesc {
        TypeDesc::null()
    }

    // ------------------------------------------------------------------
    // Scope and slot management
    // ------------------------------------------------------------------

    fn in_function(&self) -> bool {
        self.function_ctx.is_some()
    }

    fn begin_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn end_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            match &mut self.function_ctx {
                Some(ctx) => ctx.next_slot -= scope.allocated,
                None => self.module_next_slot -= scope.allocated,
            }
        }
    }

    fn declare(&mut self, name: &Token, var_type: TypeDesc, is_const: bool) -> usize {
        let slot = match &mut self.function_ctx {
            Some(ctx) => {
                let slot = ctx.next_slot;
                ctx.next_slot += 1;
                ctx.max_slot = ctx.max_slot.max(ctx.next_slot);
                slot
            }
            None => {
                let slot = self.module_next_slot;
                self.module_next_slot += 1;
                slot
            }
        };
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        if scope.names.contains_key(&name.lexeme) {
            let token = name.clone();
            self.error(
                format!("Variable '{}' already defined in this scope", token.lexeme),
                &token,
            );
        }
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        scope.allocated += 1;
        scope.names.insert(
            name.lexeme.clone(),
            VariableRecord {
                slot,
                var_type,
                is_const,
            },
        );
        slot
    }

    /// Look a name up; returns the record plus whether it lives in the
    /// module frame (scope index 0) or the current call frame.
    fn lookup(&self, name: &str) -> Option<(&VariableRecord, bool)> {
        for (index, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(record) = scope.names.get(name) {
                // Inside a function only scope 0 is the module frame; at
                // module level every scope shares the module frame.
                let module_frame = !self.in_function() || index == 0;
                return Some((record, module_frame));
            }
        }
        None
    }

    fn scope_for(&self, record_slot: usize, module_frame: bool) -> ScopeKind {
        if module_frame {
            ScopeKind::Global { slot: record_slot }
        } else {
            ScopeKind::Local { slot: record_slot }
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn resolve_type(&mut self, declared: &TypeDesc, token: &Token) -> TypeDesc {
        match declared {
            TypeDesc::UserDefined { name, is_const, is_ref } => {
                if let Some(aliased) = self.type_aliases.get(name) {
                    let mut resolved = aliased.clone();
                    resolved.set_qualifiers(*is_const || resolved.is_const(), *is_ref || resolved.is_ref());
                    resolved
                } else if self.classes.contains(name) {
                    self.error("Classes are not executable in this build", token);
                    self.error_type()
                } else {
                    self.error(format!("Unknown type name '{}'", name), token);
                    self.error_type()
                }
            }
            TypeDesc::List { contained, is_const, is_ref } => TypeDesc::List {
                contained: Box::new(self.resolve_type(contained, token)),
                is_const: *is_const,
                is_ref: *is_ref,
            },
            TypeDesc::Tuple { elements, is_const, is_ref } => TypeDesc::Tuple {
                elements: elements
                    .iter()
                    .map(|element| self.resolve_type(element, token))
                    .collect(),
                is_const: *is_const,
                is_ref: *is_ref,
            },
            TypeDesc::Typeof { expr, is_const, is_ref } => {
                let mut probe = (**expr).clone();
                let mut resolved = self.resolve_expr(&mut probe);
                resolved.set_qualifiers(*is_const, *is_ref);
                resolved
            }
            other => other.clone(),
        }
    }

    /// Check that `actual` can initialize or be assigned to `expected`,
    /// inserting a numeric conversion tag on `value` when needed.
    fn check_assignable(
        &mut self,
        expected: &TypeDesc,
        actual: &TypeDesc,
        value: &mut Expr,
    ) -> bool {
        if expected.matches(actual) {
            return true;
        }
        if expected.is_float() && actual.is_int() {
            value.attrs.conversion = NumericConversion::IntToFloat;
            let token = value.attrs.token.clone();
            self.implicit_conversion_flag(&token);
            return true;
        }
        if expected.is_int() && actual.is_float() {
            value.attrs.conversion = NumericConversion::FloatToInt;
            let token = value.attrs.token.clone();
            self.implicit_conversion_flag(&token);
            return true;
        }
        // An empty list literal takes on any expected list type
        if expected.is_list() && matches!(actual, TypeDesc::List { contained, .. } if contained.is_null())
        {
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn resolve_stmt(&mut self, statement: &mut Stmt) {
        match statement {
            Stmt::Expression { expr } => {
                self.resolve_expr(expr);
            }
            Stmt::Var { .. } => self.resolve_var(statement),
            Stmt::Function(declaration) => self.resolve_function(declaration),
            Stmt::Class(_) => {
                // Declarations are legal; instantiation is rejected where
                // it happens. Method bodies are not resolved: no code is
                // generated for them.
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let condition_type = self.resolve_expr(condition);
                self.check_condition(&condition_type, condition);
                self.resolve_block_like(then_branch);
                if let Some(else_branch) = else_branch {
                    self.resolve_block_like(else_branch);
                }
            }
            Stmt::While {
                condition,
                body,
                increment,
                ..
            } => {
                let condition_type = self.resolve_expr(condition);
                self.check_condition(&condition_type, condition);
                self.resolve_block_like(body);
                if let Some(increment) = increment {
                    self.resolve_stmt(increment);
                }
            }
            Stmt::Block { statements } => {
                self.begin_scope();
                for statement in statements {
                    self.resolve_stmt(statement);
                }
                self.end_scope();
            }
            Stmt::Return { keyword, value } => {
                let return_type = match &self.function_ctx {
                    Some(ctx) => ctx.return_type.clone(),
                    None => {
                        let token = keyword.clone();
                        self.error("Cannot use 'return' keyword outside a function", &token);
                        return;
                    }
                };
                match value {
                    Some(value) => {
                        let actual = self.resolve_expr(value);
                        if return_type.is_null() {
                            let token = keyword.clone();
                            self.error("Cannot return a value from a null function", &token);
                        } else if !self.check_assignable(&return_type, &actual, value) {
                            let token = keyword.clone();
                            self.error(
                                format!(
                                    "Cannot return a value of type '{}' from a function returning '{}'",
                                    actual, return_type
                                ),
                                &token,
                            );
                        }
                    }
                    None => {
                        if !return_type.is_null() {
                            let token = keyword.clone();
                            self.error(
                                "Cannot return nothing from a function returning a value",
                                &token,
                            );
                        }
                    }
                }
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
            Stmt::Switch {
                condition,
                cases,
                default,
            } => {
                let condition_type = self.resolve_expr(condition);
                if !condition_type.is_trivial() {
                    let token = condition.attrs.token.clone();
                    self.error(
                        "Switch condition needs a trivial type (int, float, bool or null)",
                        &token,
                    );
                }
                for (case, body) in cases {
                    let case_type = self.resolve_expr(case);
                    if !self.check_assignable(&condition_type, &case_type, case) {
                        let token = case.attrs.token.clone();
                        self.error(
                            format!(
                                "Case type '{}' does not match switch condition type '{}'",
                                case_type, condition_type
                            ),
                            &token,
                        );
                    }
                    self.resolve_block_like(body);
                }
                if let Some(default) = default {
                    self.resolve_block_like(default);
                }
            }
            Stmt::TypeAlias { name, aliased } => {
                let token = name.clone();
                let resolved = self.resolve_type(&aliased.clone(), &token);
                self.type_aliases.insert(name.lexeme.clone(), resolved);
            }
            Stmt::Import { .. } | Stmt::Error => {}
        }
    }

    fn resolve_block_like(&mut self, statement: &mut Stmt) {
        self.resolve_stmt(statement);
    }

    fn check_condition(&mut self, condition_type: &TypeDesc, condition: &Expr) {
        if !condition_type.is_bool() && !condition_type.is_numeric() {
            let token = condition.attrs.token.clone();
            self.error(
                format!("Condition needs a bool or numeric type, got '{}'", condition_type),
                &token,
            );
        }
    }

    fn resolve_var(&mut self, statement: &mut Stmt) {
        let Stmt::Var {
            keyword,
            name,
            declared_type,
            initializer,
            resolved_type,
            conversion,
            slot,
            global,
        } = statement
        else {
            return;
        };

        let is_const = keyword.kind == TokenKind::Const;
        let is_ref = keyword.kind == TokenKind::Ref;

        self.repeat_allowed = !is_ref;
        let initializer_type = self.resolve_expr(initializer);
        self.repeat_allowed = false;

        let mut var_type = match declared_type {
            Some(declared) => {
                let token = name.clone();
                let declared = declared.clone();
                let expected = self.resolve_type(&declared, &token);
                if !self.check_assignable(&expected, &initializer_type, initializer) {
                    self.error(
                        format!(
                            "Cannot initialize a variable of type '{}' with a value of type '{}'",
                            expected, initializer_type
                        ),
                        &token,
                    );
                }
                expected
            }
            None => initializer_type.clone(),
        };

        if is_ref {
            if !initializer.attrs.is_lvalue {
                let token = name.clone();
                self.error("A ref variable needs an lvalue initializer", &token);
            }
            var_type.set_qualifiers(var_type.is_const(), true);
        } else {
            var_type.set_qualifiers(is_const || var_type.is_const(), false);
        }

        *conversion = initializer.attrs.conversion;
        initializer.attrs.conversion = NumericConversion::None;
        *resolved_type = Some(var_type.clone());
        *global = !self.in_function();
        *slot = self.declare(name, var_type.clone(), is_const);

        // Only slots in the outermost module scope survive to teardown
        if *global && self.scopes.len() == 1 {
            self.globals.push(var_type);
        }
    }

    fn resolve_function(&mut self, declaration: &mut FunctionDecl) {
        if self.in_function() {
            let token = declaration.name.clone();
            self.error("Functions cannot be nested", &token);
            return;
        }

        let token = declaration.name.clone();
        let return_type = self.resolve_type(&declaration.return_type.clone(), &token);
        declaration.return_type = return_type.clone();

        self.function_ctx = Some(FunctionContext {
            return_type,
            next_slot: 1, // slot 0 holds the return value
            max_slot: 1,
        });
        self.begin_scope();

        for (parameter, parameter_type) in &mut declaration.params {
            let resolved = {
                let parameter_type = parameter_type.clone();
                let token = parameter.clone();
                self.resolve_type(&parameter_type, &token)
            };
            *parameter_type = resolved;
        }
        for (parameter, parameter_type) in &declaration.params {
            let record_type = parameter_type.clone();
            let is_const = record_type.is_const();
            self.declare(parameter, record_type, is_const);
        }

        for statement in &mut declaration.body {
            self.resolve_stmt(statement);
        }

        self.end_scope();
        if let Some(ctx) = self.function_ctx.take() {
            declaration.locals_count = ctx.max_slot;
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn resolve_expr(&mut self, expr: &mut Expr) -> TypeDesc {
        let resolved = self.resolve_expr_inner(expr);
        expr.attrs.resolved = Some(resolved.clone());
        resolved
    }

    fn resolve_expr_inner(&mut self, expr: &mut Expr) -> TypeDesc {
        let token = expr.attrs.token.clone();
        let repeat_allowed = std::mem::replace(&mut self.repeat_allowed, false);
        match &mut expr.kind {
            ExprKind::Literal(value) => {
                expr.attrs.is_lvalue = false;
                match value {
                    LiteralValue::Int(_) => TypeDesc::int(),
                    LiteralValue::Float(_) => TypeDesc::float(),
                    LiteralValue::String(_) => TypeDesc::string(),
                    LiteralValue::Bool(_) => TypeDesc::bool(),
                    LiteralValue::Null => TypeDesc::null(),
                }
            }
            ExprKind::Variable { name } => {
                let name = name.clone();
                match self.lookup(&name.lexeme) {
                    Some((record, module_frame)) => {
                        let var_type = record.var_type.clone();
                        let slot = record.slot;
                        let is_const = record.is_const || var_type.is_const();
                        expr.attrs.scope = self.scope_for(slot, module_frame);
                        expr.attrs.is_lvalue = !is_const;
                        var_type
                    }
                    None => {
                        if self.functions.contains_key(&name.lexeme)
                            || builtins::is_builtin(&name.lexeme)
                        {
                            self.error(
                                format!("Cannot use function '{}' as a value", name.lexeme),
                                &name,
                            );
                        } else {
                            self.error(
                                format!("Undefined variable '{}'", name.lexeme),
                                &name,
                            );
                        }
                        self.error_type()
                    }
                }
            }
            ExprKind::Assign { .. } => self.resolve_assign(expr, repeat_allowed),
            ExprKind::Binary { .. } => self.resolve_binary(expr),
            ExprKind::Logical { left, operator, right } => {
                let operator = operator.clone();
                let left_type = self.resolve_expr(left);
                let right_type = self.resolve_expr(right);
                if !left_type.is_bool() || !right_type.is_bool() {
                    self.error(
                        format!(
                            "Logical '{}' needs bool operands, got '{}' and '{}'",
                            operator.lexeme, left_type, right_type
                        ),
                        &operator,
                    );
                }
                TypeDesc::bool()
            }
            ExprKind::Unary { operator, operand } => {
                let operator = operator.clone();
                let operand_type = self.resolve_expr(operand);
                let operand_lvalue = operand.attrs.is_lvalue;
                match operator.kind {
                    TokenKind::Minus | TokenKind::Plus => {
                        if !operand_type.is_numeric() {
                            self.error(
                                format!("Unary '{}' needs a numeric operand", operator.lexeme),
                                &operator,
                            );
                            return self.error_type();
                        }
                        operand_type
                    }
                    TokenKind::Not => {
                        if !operand_type.is_bool() {
                            self.error("Unary '!' needs a bool operand", &operator);
                        }
                        TypeDesc::bool()
                    }
                    TokenKind::BitNot => {
                        if !operand_type.is_int() {
                            self.error("Unary '~' needs an int operand", &operator);
                        }
                        TypeDesc::int()
                    }
                    TokenKind::PlusPlus | TokenKind::MinusMinus => {
                        let is_variable = matches!(operand.kind, ExprKind::Variable { .. });
                        if !is_variable || !operand_lvalue || !operand_type.is_numeric() {
                            self.error(
                                format!(
                                    "Prefix '{}' needs a numeric variable operand",
                                    operator.lexeme
                                ),
                                &operator,
                            );
                        }
                        operand_type
                    }
                    _ => self.error_type(),
                }
            }
            ExprKind::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition_type = self.resolve_expr(condition);
                if !condition_type.is_bool() {
                    let token = condition.attrs.token.clone();
                    self.error("Ternary condition needs a bool type", &token);
                }
                let then_type = self.resolve_expr(then_branch);
                let else_type = self.resolve_expr(else_branch);
                if !then_type.matches(&else_type) {
                    self.error(
                        format!(
                            "Ternary branches need matching types, got '{}' and '{}'",
                            then_type, else_type
                        ),
                        &token,
                    );
                }
                then_type
            }
            ExprKind::Comma { expressions } => {
                let mut last = self.error_type();
                for expression in expressions {
                    last = self.resolve_expr(expression);
                }
                last
            }
            ExprKind::Grouping { inner } => {
                let inner_type = self.resolve_expr(inner);
                expr.attrs.is_lvalue = inner.attrs.is_lvalue;
                inner_type
            }
            ExprKind::Call { .. } => self.resolve_call(expr),
            ExprKind::Index { object, index } => {
                let object_type = self.resolve_expr(object);
                let index_type = self.resolve_expr(index);
                if !index_type.is_int() {
                    let index_token = index.attrs.token.clone();
                    self.error("Subscript index needs an int type", &index_token);
                }
                expr.attrs.is_lvalue = true;
                match object_type {
                    TypeDesc::List { contained, .. } => (*contained).clone(),
                    TypeDesc::Primitive {
                        kind: PrimitiveKind::String,
                        ..
                    } => TypeDesc::string(),
                    TypeDesc::Tuple { .. } => {
                        self.error(
                            "Tuples are indexed with '.', not subscripts",
                            &token,
                        );
                        self.error_type()
                    }
                    other => {
                        self.error(
                            format!("Cannot index a value of type '{}'", other),
                            &token,
                        );
                        self.error_type()
                    }
                }
            }
            ExprKind::ListAssign { .. } => self.resolve_list_assign(expr),
            ExprKind::List { elements } => {
                if elements.is_empty() {
                    return TypeDesc::List {
                        contained: Box::new(TypeDesc::null()),
                        is_const: false,
                        is_ref: false,
                    };
                }
                let mut element_types = Vec::with_capacity(elements.len());
                for element in elements.iter_mut() {
                    element_types.push(self.resolve_expr(element));
                }
                let first = element_types[0].clone();
                for (element, element_type) in elements.iter_mut().zip(&element_types).skip(1) {
                    if !element_type.matches(&first)
                        && !self.check_assignable(&first, &element_type.clone(), element)
                    {
                        let element_token = element.attrs.token.clone();
                        self.error(
                            format!(
                                "List elements need one common type, got '{}' and '{}'",
                                first, element_type
                            ),
                            &element_token,
                        );
                    }
                }
                TypeDesc::List {
                    contained: Box::new(first),
                    is_const: false,
                    is_ref: false,
                }
            }
            ExprKind::ListRepeat { element, count } => {
                let element_type = self.resolve_expr(element);
                let count_type = self.resolve_expr(count);
                if !repeat_allowed {
                    self.error(
                        "List repeat expressions are only supported as initializers",
                        &token,
                    );
                }
                if !element_type.is_trivial() {
                    self.error(
                        "List repeat expressions need a trivial element type",
                        &token,
                    );
                }
                if !count_type.is_int() {
                    let count_token = count.attrs.token.clone();
                    self.error("List repeat count needs an int type", &count_token);
                }
                TypeDesc::List {
                    contained: Box::new(element_type),
                    is_const: false,
                    is_ref: false,
                }
            }
            ExprKind::Tuple { elements } => {
                let element_types = elements
                    .iter_mut()
                    .map(|element| self.resolve_expr(element))
                    .collect();
                TypeDesc::Tuple {
                    elements: element_types,
                    is_const: false,
                    is_ref: false,
                }
            }
            ExprKind::Get { object, name } => {
                let name = name.clone();
                let object_type = self.resolve_expr(object);
                expr.attrs.is_lvalue = true;
                self.tuple_field_type(&object_type, &name)
            }
            ExprKind::Set { .. } => self.resolve_set(expr),
            ExprKind::ScopeName { name } => {
                let name = name.clone();
                self.error(
                    format!("'{}' cannot be used outside a '::' access", name.lexeme),
                    &name,
                );
                self.error_type()
            }
            ExprKind::ScopeAccess { name, .. } => {
                let name = name.clone();
                self.error(
                    format!(
                        "Module member '{}' can only be accessed in a call",
                        name.lexeme
                    ),
                    &name,
                );
                self.error_type()
            }
            ExprKind::Move { variable } => {
                let variable_type = self.resolve_expr(variable);
                if !variable_type.is_list() && !variable_type.is_tuple() {
                    self.error("Can only move variables holding lists", &token);
                    return self.error_type();
                }
                if !variable.attrs.is_lvalue {
                    self.error("Cannot move out of a const variable", &token);
                }
                variable_type
            }
            ExprKind::This | ExprKind::Super { .. } => {
                self.error("Classes are not executable in this build", &token);
                self.error_type()
            }
            ExprKind::Error => self.error_type(),
        }
    }

    fn resolve_assign(&mut self, expr: &mut Expr, repeat_allowed: bool) -> TypeDesc {
        let ExprKind::Assign {
            name,
            operator,
            value,
        } = &mut expr.kind
        else {
            return self.error_type();
        };
        let name = name.clone();
        let operator = operator.clone();

        self.repeat_allowed = repeat_allowed && operator.kind == TokenKind::Equal;
        let value_type = self.resolve_expr(value);
        self.repeat_allowed = false;

        let (var_type, scope) = match self.lookup(&name.lexeme) {
            Some((record, module_frame)) => {
                let var_type = record.var_type.clone();
                let scope = self.scope_for(record.slot, module_frame);
                if record.is_const || var_type.is_const() {
                    self.error(
                        format!("Cannot assign to const variable '{}'", name.lexeme),
                        &name,
                    );
                }
                (var_type, scope)
            }
            None => {
                self.error(format!("Undefined variable '{}'", name.lexeme), &name);
                return self.error_type();
            }
        };

        self.check_compound_operator(&operator, &var_type, &value_type);
        if !self.check_assignable(&var_type, &value_type, value) {
            self.error(
                format!(
                    "Cannot assign a value of type '{}' to a variable of type '{}'",
                    value_type, var_type
                ),
                &operator,
            );
        }

        expr.attrs.scope = scope;
        expr.attrs.is_lvalue = false;
        var_type
    }

    fn check_compound_operator(
        &mut self,
        operator: &Token,
        target_type: &TypeDesc,
        value_type: &TypeDesc,
    ) {
        if operator.kind == TokenKind::Equal {
            return;
        }
        let numeric = target_type.is_numeric() && value_type.is_numeric();
        let string_append =
            operator.kind == TokenKind::PlusEqual && target_type.is_string() && value_type.is_string();
        if !numeric && !string_append {
            let token = operator.clone();
            self.error(
                format!(
                    "Operator '{}' needs numeric operands (or string for '+=')",
                    token.lexeme
                ),
                &token,
            );
        }
    }

    fn resolve_list_assign(&mut self, expr: &mut Expr) -> TypeDesc {
        let ExprKind::ListAssign {
            object,
            index,
            operator,
            value,
        } = &mut expr.kind
        else {
            return self.error_type();
        };
        let operator = operator.clone();

        let object_type = self.resolve_expr(object);
        let index_type = self.resolve_expr(index);
        let value_type = self.resolve_expr(value);

        if !index_type.is_int() {
            let index_token = index.attrs.token.clone();
            self.error("Subscript index needs an int type", &index_token);
        }
        if !object.attrs.is_lvalue {
            self.error("Cannot assign into a const list", &operator);
        }

        let element_type = match object_type {
            TypeDesc::List { contained, .. } => (*contained).clone(),
            other => {
                self.error(
                    format!("Cannot assign by index into a value of type '{}'", other),
                    &operator,
                );
                return self.error_type();
            }
        };

        self.check_compound_operator(&operator, &element_type, &value_type);
        if !self.check_assignable(&element_type, &value_type, value) {
            self.error(
                format!(
                    "Cannot assign a value of type '{}' to a list of '{}'",
                    value_type, element_type
                ),
                &operator,
            );
        }
        element_type
    }

    fn resolve_set(&mut self, expr: &mut Expr) -> TypeDesc {
        let ExprKind::Set {
            object,
            name,
            operator,
            value,
        } = &mut expr.kind
        else {
            return self.error_type();
        };
        let name = name.clone();
        let operator = operator.clone();

        let object_type = self.resolve_expr(object);
        let value_type = self.resolve_expr(value);
        let field_type = self.tuple_field_type(&object_type, &name);

        self.check_compound_operator(&operator, &field_type, &value_type);
        if !self.check_assignable(&field_type, &value_type, value) {
            self.error(
                format!(
                    "Cannot assign a value of type '{}' to a field of type '{}'",
                    value_type, field_type
                ),
                &operator,
            );
        }
        field_type
    }

    fn tuple_field_type(&mut self, object_type: &TypeDesc, name: &Token) -> TypeDesc {
        match object_type {
            TypeDesc::Tuple { elements, .. } => {
                if name.kind != TokenKind::IntValue {
                    self.error("Tuple fields are accessed by integer index", name);
                    return self.error_type();
                }
                match name.lexeme.parse::<usize>() {
                    Ok(index) if index < elements.len() => elements[index].clone(),
                    _ => {
                        self.error(
                            format!(
                                "Tuple field index '{}' out of range for '{}'",
                                name.lexeme, object_type
                            ),
                            name,
                        );
                        self.error_type()
                    }
                }
            }
            TypeDesc::UserDefined { .. } => {
                self.error("Classes are not executable in this build", name);
                self.error_type()
            }
            other => {
                self.error(
                    format!("Cannot access a member of a value of type '{}'", other),
                    name,
                );
                self.error_type()
            }
        }
    }

    fn resolve_binary(&mut self, expr: &mut Expr) -> TypeDesc {
        let ExprKind::Binary {
            left,
            operator,
            right,
        } = &mut expr.kind
        else {
            return self.error_type();
        };
        let operator = operator.clone();

        let left_type = self.resolve_expr(left);
        let right_type = self.resolve_expr(right);

        use TokenKind::*;
        match operator.kind {
            Plus => {
                if left_type.is_string() && right_type.is_string() {
                    return TypeDesc::string();
                }
                self.numeric_binary(&operator, left, &left_type, right, &right_type)
            }
            Minus | Star | Slash | Modulo => {
                self.numeric_binary(&operator, left, &left_type, right, &right_type)
            }
            BitAnd | BitOr | BitXor | LeftShift | RightShift => {
                if !left_type.is_int() || !right_type.is_int() {
                    self.error(
                        format!(
                            "Operator '{}' needs int operands, got '{}' and '{}'",
                            operator.lexeme, left_type, right_type
                        ),
                        &operator,
                    );
                }
                TypeDesc::int()
            }
            Greater | GreaterEqual | Less | LessEqual => {
                if left_type.is_string() && right_type.is_string() {
                    return TypeDesc::bool();
                }
                if left_type.is_numeric() && right_type.is_numeric() {
                    self.balance_numeric(left, &left_type, right, &right_type);
                } else if !left_type.matches(&right_type) {
                    self.error(
                        format!(
                            "Cannot order values of types '{}' and '{}'",
                            left_type, right_type
                        ),
                        &operator,
                    );
                }
                TypeDesc::bool()
            }
            EqualEqual | NotEqual => {
                let comparable = left_type.matches(&right_type)
                    || (left_type.is_numeric() && right_type.is_numeric())
                    || left_type.is_null()
                    || right_type.is_null();
                if left_type.is_numeric() && right_type.is_numeric() {
                    self.balance_numeric(left, &left_type, right, &right_type);
                }
                if !comparable {
                    self.error(
                        format!(
                            "Cannot compare values of types '{}' and '{}'",
                            left_type, right_type
                        ),
                        &operator,
                    );
                }
                TypeDesc::bool()
            }
            DotDot | DotDotEqual => {
                self.error("Range expressions are not supported here", &operator);
                self.error_type()
            }
            _ => {
                self.error(
                    format!("Unknown binary operator '{}'", operator.lexeme),
                    &operator,
                );
                self.error_type()
            }
        }
    }

    fn numeric_binary(
        &mut self,
        operator: &Token,
        left: &mut Expr,
        left_type: &TypeDesc,
        right: &mut Expr,
        right_type: &TypeDesc,
    ) -> TypeDesc {
        if !left_type.is_numeric() || !right_type.is_numeric() {
            let token = operator.clone();
            self.error(
                format!(
                    "Operator '{}' needs numeric operands, got '{}' and '{}'",
                    token.lexeme, left_type, right_type
                ),
                &token,
            );
            return self.error_type();
        }
        if left_type.is_int() && right_type.is_int() {
            TypeDesc::int()
        } else {
            self.balance_numeric(left, left_type, right, right_type);
            TypeDesc::float()
        }
    }

    /// Insert IntToFloat on the integer side of a mixed numeric pair.
    fn balance_numeric(
        &mut self,
        left: &mut Expr,
        left_type: &TypeDesc,
        right: &mut Expr,
        right_type: &TypeDesc,
    ) {
        if left_type.is_int() && right_type.is_float() {
            left.attrs.conversion = NumericConversion::IntToFloat;
            let token = left.attrs.token.clone();
            self.implicit_conversion_flag(&token);
        } else if left_type.is_float() && right_type.is_int() {
            right.attrs.conversion = NumericConversion::IntToFloat;
            let token = right.attrs.token.clone();
            self.implicit_conversion_flag(&token);
        }
    }

    fn resolve_call(&mut self, expr: &mut Expr) -> TypeDesc {
        let ExprKind::Call { callee, arguments } = &mut expr.kind else {
            return self.error_type();
        };

        // Resolve argument expressions first; their types drive both
        // native verification and user-function checking.
        let mut argument_types = Vec::with_capacity(arguments.len());
        for argument in arguments.iter_mut() {
            argument_types.push(self.resolve_expr(argument));
        }

        let resolved = self.resolve_callee(callee, arguments, &argument_types, &mut expr.attrs);
        // Every reachable node ends up annotated, the callee included
        callee.attrs.resolved = Some(resolved.clone());
        resolved
    }

    fn resolve_callee(
        &mut self,
        callee: &mut Expr,
        arguments: &mut [Expr],
        argument_types: &[TypeDesc],
        attrs: &mut crate::ast::SynthesizedAttrs,
    ) -> TypeDesc {
        match &callee.kind {
            ExprKind::Variable { name } => {
                let name = name.clone();
                if let Some(signature) = builtins::builtin_signature(&name.lexeme) {
                    if let Err(message) = (signature.verifier)(argument_types) {
                        self.error(
                            format!("Cannot call native function '{}': {}", name.lexeme, message),
                            &name,
                        );
                    }
                    attrs.scope = ScopeKind::Native {
                        name: name.lexeme.clone(),
                    };
                    return (signature.return_type)();
                }
                match self.functions.get(&name.lexeme).cloned() {
                    Some(signature) => {
                        self.check_user_call(&name, &signature, arguments, argument_types);
                        attrs.scope = ScopeKind::Function {
                            name: name.lexeme.clone(),
                        };
                        signature.return_type
                    }
                    None => {
                        self.error(
                            format!("Undefined function '{}'", name.lexeme),
                            &name,
                        );
                        self.error_type()
                    }
                }
            }
            ExprKind::ScopeAccess { scope, name } => {
                let name = name.clone();
                let module_token = match &scope.kind {
                    ExprKind::ScopeName { name } => name.clone(),
                    _ => {
                        self.error("Nested scope accesses are not supported", &name);
                        return self.error_type();
                    }
                };
                let Some((module_path, signature)) =
                    self.imported_function(&module_token.lexeme, &name.lexeme)
                else {
                    self.error(
                        format!(
                            "No function '{}' in an imported module named '{}'",
                            name.lexeme, module_token.lexeme
                        ),
                        &name,
                    );
                    return self.error_type();
                };
                self.check_user_call(&name, &signature, arguments, argument_types);
                attrs.scope = ScopeKind::ModuleFunction {
                    module_path,
                    name: name.lexeme.clone(),
                };
                signature.return_type
            }
            _ => {
                let token = callee.attrs.token.clone();
                self.error("Can only call named functions", &token);
                self.error_type()
            }
        }
    }

    fn imported_function(
        &self,
        module_name: &str,
        function_name: &str,
    ) -> Option<(String, FunctionSig)> {
        for &index in self.imported {
            let (module, _) = &self.parsed_modules[index];
            if module.name == module_name {
                let signature = module.functions.get(function_name)?.clone();
                return Some((module.path.clone(), signature));
            }
        }
        None
    }

    fn check_user_call(
        &mut self,
        name: &Token,
        signature: &FunctionSig,
        arguments: &mut [Expr],
        argument_types: &[TypeDesc],
    ) {
        if arguments.len() != signature.params.len() {
            self.error(
                format!(
                    "Function '{}' expects {} argument(s), got {}",
                    name.lexeme,
                    signature.params.len(),
                    arguments.len()
                ),
                name,
            );
            return;
        }
        for ((argument, argument_type), parameter) in arguments
            .iter_mut()
            .zip(argument_types)
            .zip(&signature.params)
        {
            if parameter.is_ref() && !argument.attrs.is_lvalue {
                let token = argument.attrs.token.clone();
                self.error("A ref parameter needs an lvalue argument", &token);
                continue;
            }
            if !self.check_assignable(parameter, &argument_type.clone(), argument) {
                let token = argument.attrs.token.clone();
                self.error(
                    format!(
                        "Argument of type '{}' does not match parameter of type '{}'",
                        argument_type, parameter
                    ),
                    &token,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::driver::CompilerContext;
    use crate::parser::Parser;
    use crate::scanner::Scanner;

    fn resolve_source(source: &str) -> (ParsedModule, DiagnosticReporter) {
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
        (module, ctx.reporter)
    }

    fn resolve_ok(source: &str) -> ParsedModule {
        let (module, reporter) = resolve_source(source);
        assert!(
            !reporter.had_error(),
            "unexpected errors:\n{}",
            reporter.format_all()
        );
        module
    }

    fn resolve_err(source: &str) -> DiagnosticReporter {
        let (_, reporter) = resolve_source(source);
        assert!(reporter.had_error(), "expected a resolver error");
        reporter
    }

    #[test]
    fn test_global_slots_in_declaration_order() {
        let module = resolve_ok("var a = 1\nvar b = 2.5\n");
        let slots: Vec<(usize, bool)> = module
            .statements
            .iter()
            .filter_map(|statement| match statement {
                Stmt::Var { slot, global, .. } => Some((*slot, *global)),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![(0, true), (1, true)]);
        assert_eq!(module.globals.len(), 2);
        assert!(module.globals[0].is_int());
        assert!(module.globals[1].is_float());
    }

    #[test]
    fn test_function_slots_start_after_return_cell() {
        let module =
            resolve_ok("fn f(x: int) -> int { var y: int = x; return y; }\n");
        let Stmt::Function(declaration) = &module.statements[0] else {
            panic!("expected function");
        };
        // slot 0 is the return value, the parameter takes slot 1
        let Stmt::Var { slot, global, .. } = &declaration.body[0] else {
            panic!("expected var, got {:?}", declaration.body[0]);
        };
        assert_eq!(*slot, 2);
        assert!(!*global);
    }

    #[test]
    fn test_variable_scope_annotation() {
        let module = resolve_ok("var g = 1\nfn f() -> int { return g; }\n");
        let Stmt::Function(declaration) = &module.statements[1] else {
            panic!("expected function");
        };
        let Stmt::Return { value: Some(value), .. } = &declaration.body[0] else {
            panic!("expected return");
        };
        assert_eq!(value.attrs.scope, ScopeKind::Global { slot: 0 });
        assert!(value.attrs.resolved.as_ref().is_some_and(TypeDesc::is_int));
    }

    #[test]
    fn test_undefined_variable() {
        let reporter = resolve_err("var x = missing\n");
        assert!(reporter.format_all().contains("Undefined variable"));
    }

    #[test]
    fn test_const_assignment_rejected() {
        let reporter = resolve_err("const c = 1\nc = 2\n");
        assert!(reporter.format_all().contains("const"));
    }

    #[test]
    fn test_implicit_conversion_tag_and_warning() {
        let (module, reporter) = resolve_source("var x: float = 1\n");
        assert!(!reporter.had_error());
        assert_eq!(reporter.diagnostics().len(), 1, "one implicit-conversion warning");
        let Stmt::Var { conversion, .. } = &module.statements[0] else {
            panic!("expected var");
        };
        assert_eq!(*conversion, NumericConversion::IntToFloat);
    }

    #[test]
    fn test_mixed_numeric_binary_balances_operands() {
        let module = resolve_ok("var x = 1 + 2.5\nvar y = x\n");
        // folding collapses literal arithmetic, so use a variable instead
        let module2 = resolve_ok("var a = 2.5\nvar x = 1 + a\n");
        let Stmt::Var { initializer, .. } = &module2.statements[1] else {
            panic!("expected var");
        };
        let ExprKind::Binary { left, .. } = &initializer.kind else {
            panic!("expected binary, got {:?}", initializer.kind);
        };
        assert_eq!(left.attrs.conversion, NumericConversion::IntToFloat);
        let _ = module;
    }

    #[test]
    fn test_native_verifier_rejects_bad_calls() {
        let reporter = resolve_err("readline(5)\n");
        assert!(reporter.format_all().contains("readline"));
    }

    #[test]
    fn test_function_arity_checked() {
        let reporter =
            resolve_err("fn f(x: int) -> int { return x; }\nvar y = f(1, 2)\n");
        assert!(reporter.format_all().contains("expects 1 argument"));
    }

    #[test]
    fn test_class_types_are_not_executable() {
        let reporter = resolve_err("class Foo { }\nvar f: Foo = 0\n");
        assert!(reporter
            .format_all()
            .contains("Classes are not executable"));
    }

    #[test]
    fn test_range_expressions_rejected() {
        let reporter = resolve_err("var a = 1\nvar r = a .. 5\n");
        assert!(reporter
            .format_all()
            .contains("Range expressions are not supported"));
    }

    #[test]
    fn test_type_alias_substitution() {
        let module = resolve_ok("type Num = int\nvar x: Num = 3\n");
        let Stmt::Var { resolved_type, .. } = &module.statements[1] else {
            panic!("expected var");
        };
        assert!(resolved_type.as_ref().is_some_and(TypeDesc::is_int));
    }

    #[test]
    fn test_typeof_resolves_to_operand_type() {
        let module = resolve_ok("var a = 1\nvar b: typeof a = 2\n");
        let Stmt::Var { resolved_type, .. } = &module.statements[1] else {
            panic!("expected var");
        };
        assert!(resolved_type.as_ref().is_some_and(TypeDesc::is_int));
    }

    #[test]
    fn test_list_repeat_needs_trivial_elements() {
        let reporter = resolve_err("var xs = [\"s\"; 3]\n");
        assert!(reporter.format_all().contains("trivial element type"));
    }

    #[test]
    fn test_list_repeat_restricted_to_initializers() {
        let reporter = resolve_err("print([0; 3])\n");
        assert!(reporter
            .format_all()
            .contains("only supported as initializers"));
    }

    #[test]
    fn test_ref_variable_needs_lvalue() {
        let reporter = resolve_err("ref r = 1 + 2\n");
        assert!(reporter.format_all().contains("lvalue initializer"));
    }

    #[test]
    fn test_empty_list_adopts_declared_type() {
        let module = resolve_ok("var xs: [int] = []\n");
        let Stmt::Var { resolved_type, .. } = &module.statements[0] else {
            panic!("expected var");
        };
        assert!(resolved_type.as_ref().is_some_and(TypeDesc::is_list));
    }
}
