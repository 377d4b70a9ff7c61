//! The virtual machine
//!
//! A single-threaded stack machine over preallocated storage: a value
//! stack, a call-frame stack and a module-frame stack, none of which ever
//! grow. Dispatch is a straight `match` over the decoded opcode.
//!
//! The compiler arranges the stack so that every instruction finds its
//! operands, correctly typed, on top; the VM checks nothing at runtime
//! except the documented runtime errors (divide/modulo by zero, negative
//! shift count, index range checks, trap-return, pop from empty list, and
//! storage exhaustion).
//!
//! Ownership discipline during execution:
//! - assignments into string-holding cells release the old handle and
//!   re-intern the new one, so cache counts always match live cells;
//! - assignments into list-holding cells destroy the prior list;
//! - `COPY_LIST` materializes an owning deep copy from a `LIST_REF`;
//! - `POP_STRING` / `POP_LIST` release the discarded value of an
//!   expression statement;
//! - `EQUAL_SL` compares and then cleans up short-lived operands.
//!
//! Module lifecycle: top-level code runs for every module in dependency
//! order (main last); teardown code runs in exactly the reverse order.
//! Globals live on the value stack above their module frame's base for the
//! whole program.

use crate::chunk::{Chunk, Instruction, OPERAND_MASK, WIDE_OPERAND};
use crate::error::RuntimeError;
use crate::list::{ListHandle, ListHeap};
use crate::module::RuntimeModule;
use crate::natives::{self, Native};
use crate::string_cache::StringCache;
use crate::value::{FunctionTarget, RefTarget, Value};
use std::collections::HashMap;
use std::io::Write;
use tracing::debug;

pub const STACK_MAX: usize = 16384;
pub const FRAME_MAX: usize = 1024;
pub const MODULE_MAX: usize = 256;

/// Which chunk of which module is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkId {
    pub module: usize,
    pub kind: ChunkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    TopLevel,
    Teardown,
    Function(usize),
}

#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Absolute stack index of slot 0; the return value cell for functions
    pub base: usize,
    pub return_chunk: Option<ChunkId>,
    pub return_ip: usize,
    pub module_index: usize,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ModuleFrame {
    pub base: usize,
    pub name: String,
}

/// Runtime tracing toggles (`--trace-exec`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    pub stack: bool,
    pub frame: bool,
    pub module: bool,
    pub insn: bool,
    pub module_init: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionState {
    Running,
    Finished,
}

pub struct VirtualMachine {
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    module_frames: Vec<ModuleFrame>,
    modules: Vec<RuntimeModule>,
    /// Absolute module path -> module index, for LOAD_FUNCTION_MODULE_PATH
    module_paths: HashMap<String, usize>,
    current: ChunkId,
    ip: usize,
    pub(crate) cache: StringCache,
    pub(crate) heap: ListHeap,
    natives: HashMap<&'static str, Native>,
    output: Box<dyn Write>,
    trace: TraceOptions,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        VirtualMachine::new()
    }
}

impl VirtualMachine {
    pub fn new() -> Self {
        VirtualMachine {
            stack: vec![Value::Invalid; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAME_MAX),
            module_frames: Vec::with_capacity(MODULE_MAX),
            modules: Vec::new(),
            module_paths: HashMap::new(),
            current: ChunkId {
                module: 0,
                kind: ChunkKind::TopLevel,
            },
            ip: 0,
            cache: StringCache::new(),
            heap: ListHeap::new(),
            natives: natives::native_table(),
            output: Box::new(std::io::stdout()),
            trace: TraceOptions::default(),
        }
    }

    /// Redirect program output (used by tests and embedders).
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = VirtualMachine::new();
        vm.output = output;
        vm
    }

    pub fn set_trace(&mut self, trace: TraceOptions) {
        self.trace = trace;
    }

    /// Diagnostics for the testable invariants: cache entries and live
    /// heap lists remaining after execution.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn live_lists(&self) -> usize {
        self.heap.live_count()
    }

    /// Run a compiled program. `modules` is in dependency order (imports
    /// before importers) with the main module last. Initialization runs
    /// front to back, teardown back to front.
    pub fn run(&mut self, modules: Vec<RuntimeModule>) -> Result<(), RuntimeError> {
        self.modules = modules;
        self.module_paths = self
            .modules
            .iter()
            .enumerate()
            .map(|(index, module)| (module.path.clone(), index))
            .collect();

        for index in 0..self.modules.len() {
            self.init_module(index)?;
        }
        for index in (0..self.modules.len()).rev() {
            self.teardown_module(index)?;
        }
        Ok(())
    }

    fn init_module(&mut self, index: usize) -> Result<(), RuntimeError> {
        if self.module_frames.len() >= MODULE_MAX {
            return Err(self.error("Too many modules"));
        }
        let name = self.modules[index].name.clone();
        if self.trace.module_init {
            debug!(module = %name, "initializing module");
        }
        self.module_frames.push(ModuleFrame {
            base: self.stack_top,
            name: name.clone(),
        });
        self.frames.push(CallFrame {
            base: self.stack_top,
            return_chunk: None,
            return_ip: 0,
            module_index: index,
            name: format!("<{}:tlc>", name),
        });
        self.current = ChunkId {
            module: index,
            kind: ChunkKind::TopLevel,
        };
        self.ip = 0;
        self.execute()
    }

    fn teardown_module(&mut self, index: usize) -> Result<(), RuntimeError> {
        self.current = ChunkId {
            module: index,
            kind: ChunkKind::Teardown,
        };
        self.ip = 0;
        self.execute()?;
        self.frames.pop();
        self.module_frames.pop();
        Ok(())
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        while self.step()? == ExecutionState::Running {}
        Ok(())
    }

    fn chunk(&self) -> &Chunk {
        let module = &self.modules[self.current.module];
        match self.current.kind {
            ChunkKind::TopLevel => &module.top_level_code,
            ChunkKind::Teardown => &module.teardown_code,
            ChunkKind::Function(index) => &module.functions[index].code,
        }
    }

    fn read_word(&mut self) -> u32 {
        let word = self.chunk().bytes[self.ip];
        self.ip += 1;
        word
    }

    fn current_line(&self) -> u32 {
        self.chunk().line_for(self.ip.saturating_sub(1))
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(message, self.current_line())
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack_top >= STACK_MAX {
            return Err(self.error("Stack overflow"));
        }
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        std::mem::take(&mut self.stack[self.stack_top])
    }

    fn top(&self) -> &Value {
        &self.stack[self.stack_top - 1]
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn local_slot(&self, operand: u32) -> usize {
        self.frame().base + operand as usize
    }

    fn global_slot(&self, operand: u32) -> usize {
        self.module_frames[self.frame().module_index].base + operand as usize
    }

    pub(crate) fn stack_value(&self, index: usize) -> &Value {
        &self.stack[index]
    }

    /// Intern a string produced at runtime (used by native handlers).
    pub fn store_string(&mut self, text: &str) -> Value {
        Value::String(self.cache.insert(text))
    }

    pub(crate) fn write_output(&mut self, text: &str) -> Result<(), RuntimeError> {
        let line = self.current_line();
        self.output
            .write_all(text.as_bytes())
            .map_err(|e| RuntimeError::new(format!("Failed to write output: {}", e), line))
    }

    // ------------------------------------------------------------------
    // Cell and reference plumbing
    // ------------------------------------------------------------------

    pub(crate) fn read_ref(&self, target: RefTarget) -> Value {
        match target {
            RefTarget::Stack(index) => self.stack[index].clone(),
            RefTarget::ListElement(handle, index) => self.heap.get(handle)[index].clone(),
        }
    }

    fn write_ref(&mut self, target: RefTarget, value: Value) {
        match target {
            RefTarget::Stack(index) => self.stack[index] = value,
            RefTarget::ListElement(handle, index) => self.heap.get_mut(handle)[index] = value,
        }
    }

    /// Assign the top of stack into a cell, dereferencing one level and
    /// transferring string refcounts. The value stays on the stack; the
    /// statement's trailing pop releases it.
    fn assign_into_slot(&mut self, slot: usize) {
        let target = match self.stack[slot] {
            Value::Ref(target) => target,
            _ => RefTarget::Stack(slot),
        };
        self.store_assign(target);
    }

    fn store_assign(&mut self, target: RefTarget) {
        let new = self.stack[self.stack_top - 1].clone();
        let old = self.read_ref(target);
        let stored = if let Value::String(old_text) = old {
            self.cache.remove(&old_text);
            Value::String(self.cache.insert(new.as_string()))
        } else {
            new
        };
        self.write_ref(target, stored);
    }

    /// Recursively destroy an owned list: contained strings are released
    /// from the cache, contained lists destroyed, then the slot is freed.
    pub(crate) fn destroy_list(&mut self, handle: ListHandle) {
        let contents = self.heap.free(handle);
        for element in contents {
            self.release(element);
        }
    }

    /// Release whatever heap resources a discarded value owns.
    pub(crate) fn release(&mut self, value: Value) {
        match value {
            Value::String(text) => self.cache.remove(&text),
            Value::List(handle) => self.destroy_list(handle),
            _ => {}
        }
    }

    /// Deep-copy a list: nested lists are copied recursively (the copies
    /// own their buffers), contained strings gain a cache count.
    pub(crate) fn copy_list(&mut self, source: ListHandle) -> ListHandle {
        let elements = self.heap.get(source).clone();
        let mut copied = Vec::with_capacity(elements.len());
        for element in elements {
            let value = match element {
                Value::List(inner) | Value::ListRef(inner) => Value::List(self.copy_list(inner)),
                Value::String(text) => Value::String(self.cache.insert(&text)),
                other => other,
            };
            copied.push(value);
        }
        self.heap.alloc(copied)
    }

    // ------------------------------------------------------------------
    // Value semantics: truthiness, equality, ordering, rendering
    // ------------------------------------------------------------------

    pub(crate) fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(v) => *v,
            Value::Null | Value::Invalid => false,
            Value::String(s) => !s.is_empty(),
            Value::Ref(target) => self.truthy(&self.read_ref(*target)),
            Value::Function(_) => true,
            Value::List(h) | Value::ListRef(h) => !self.heap.get(*h).is_empty(),
        }
    }

    /// Structural equality with transparent dereferencing through one
    /// level of `Ref`. Lists compare by length then element-wise; the
    /// owning/alias distinction does not affect equality.
    pub(crate) fn values_equal(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Ref(a), Value::Ref(b)) => {
                a == b || self.values_equal(&self.read_ref(*a), &self.read_ref(*b))
            }
            (Value::Ref(a), _) => self.values_equal(&self.read_ref(*a), right),
            (_, Value::Ref(b)) => self.values_equal(left, &self.read_ref(*b)),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Invalid, Value::Invalid) => true,
            (Value::String(a), Value::String(b)) => std::rc::Rc::ptr_eq(a, b) || a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (
                Value::List(a) | Value::ListRef(a),
                Value::List(b) | Value::ListRef(b),
            ) => {
                let first = self.heap.get(*a);
                let second = self.heap.get(*b);
                first.len() == second.len()
                    && first
                        .iter()
                        .zip(second.iter())
                        .all(|(x, y)| self.values_equal(x, y))
            }
            _ => false,
        }
    }

    /// Strict ordering: numbers naturally, strings lexicographically,
    /// bools with false < true, lists by length then element-wise.
    pub(crate) fn value_less(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Ref(a), _) => self.value_less(&self.read_ref(*a), right),
            (_, Value::Ref(b)) => self.value_less(left, &self.read_ref(*b)),
            (Value::Int(a), Value::Int(b)) => a < b,
            (Value::Float(a), Value::Float(b)) => a < b,
            (Value::Bool(a), Value::Bool(b)) => !a && *b,
            (Value::String(a), Value::String(b)) => a < b,
            (
                Value::List(a) | Value::ListRef(a),
                Value::List(b) | Value::ListRef(b),
            ) => {
                let first = self.heap.get(*a);
                let second = self.heap.get(*b);
                if first.len() != second.len() {
                    first.len() < second.len()
                } else {
                    first
                        .iter()
                        .zip(second.iter())
                        .all(|(x, y)| self.value_less(x, y))
                }
            }
            _ => false,
        }
    }

    pub(crate) fn value_greater(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Ref(a), _) => self.value_greater(&self.read_ref(*a), right),
            (_, Value::Ref(b)) => self.value_greater(left, &self.read_ref(*b)),
            (Value::Int(a), Value::Int(b)) => a > b,
            (Value::Float(a), Value::Float(b)) => a > b,
            (Value::Bool(a), Value::Bool(b)) => *a && !b,
            (Value::String(a), Value::String(b)) => a > b,
            (
                Value::List(a) | Value::ListRef(a),
                Value::List(b) | Value::ListRef(b),
            ) => {
                let first = self.heap.get(*a);
                let second = self.heap.get(*b);
                if first.len() != second.len() {
                    first.len() > second.len()
                } else {
                    first
                        .iter()
                        .zip(second.iter())
                        .all(|(x, y)| self.value_greater(x, y))
                }
            }
            _ => false,
        }
    }

    /// Rendering used by `print`: strings are raw at every nesting
    /// depth, lists bracketed with comma-separated elements, references
    /// print their target.
    pub(crate) fn display_value(&self, value: &Value) -> String {
        match value {
            Value::String(s) => s.to_string(),
            Value::Ref(target) => self.display_value(&self.read_ref(*target)),
            Value::List(h) | Value::ListRef(h) => {
                let elements = self
                    .heap
                    .get(*h)
                    .iter()
                    .map(|element| self.display_value(element))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{}]", elements)
            }
            other => self.repr_value(other),
        }
    }

    /// Debug rendering: like `display_value` but strings are quoted with
    /// escapes, used by traces and by `string()` on lists.
    pub(crate) fn repr_value(&self, value: &Value) -> String {
        match value {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => if *v { "true" } else { "false" }.to_string(),
            Value::Null => "null".to_string(),
            Value::Invalid => "<invalid!>".to_string(),
            Value::String(s) => {
                let mut rendered = String::with_capacity(s.len() + 2);
                rendered.push('"');
                for ch in s.chars() {
                    match ch {
                        '\u{8}' => rendered.push_str("\\b"),
                        '\n' => rendered.push_str("\\n"),
                        '\r' => rendered.push_str("\\r"),
                        '\t' => rendered.push_str("\\t"),
                        '\'' => rendered.push_str("\\'"),
                        '"' => rendered.push_str("\\\""),
                        '\\' => rendered.push_str("\\\\"),
                        other => rendered.push(other),
                    }
                }
                rendered.push('"');
                rendered
            }
            Value::Ref(target) => format!("ref to {}", self.repr_value(&self.read_ref(*target))),
            Value::Function(target) => format!(
                "<function {} of module {}>",
                self.modules[target.module].functions[target.function].name,
                self.modules[target.module].name
            ),
            Value::List(h) | Value::ListRef(h) => {
                let prefix = if matches!(value, Value::ListRef(_)) {
                    "ref to ["
                } else {
                    "["
                };
                let elements = self
                    .heap
                    .get(*h)
                    .iter()
                    .map(|element| self.repr_value(element))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}{}]", prefix, elements)
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn trace_state(&self) {
        if self.trace.stack {
            let rendered = self.stack[..self.stack_top]
                .iter()
                .map(|value| format!("[ {} ]", self.repr_value(value)))
                .collect::<Vec<_>>()
                .join(" ");
            debug!(target: "rill::trace", "stack   : {}", rendered);
        }
        if self.trace.frame {
            let rendered = self
                .frames
                .iter()
                .map(|frame| format!("[ {} : {} ]", frame.name, frame.base))
                .collect::<Vec<_>>()
                .join(" ");
            debug!(target: "rill::trace", "frames  : {}", rendered);
        }
        if self.trace.module {
            let rendered = self
                .module_frames
                .iter()
                .map(|frame| format!("[ {} : {} ]", frame.name, frame.base))
                .collect::<Vec<_>>()
                .join(" ");
            debug!(target: "rill::trace", "modules : {}", rendered);
        }
    }

    fn step(&mut self) -> Result<ExecutionState, RuntimeError> {
        self.trace_state();

        let word = self.read_word();
        let opcode = (word >> 24) as u8;
        let mut operand = word & OPERAND_MASK;
        let instruction = match Instruction::from_byte(opcode) {
            Some(instruction) => instruction,
            None => return Err(self.error("Invalid instruction")),
        };
        if operand == WIDE_OPERAND {
            let high = self.read_word() & OPERAND_MASK;
            let low = self.read_word() & OPERAND_MASK;
            operand = (high << 24) | low;
        }
        if self.trace.insn {
            debug!(target: "rill::trace", "{:04} {} {}", self.ip - 1, instruction.name(), operand);
        }

        match instruction {
            Instruction::Halt => return Ok(ExecutionState::Finished),
            Instruction::Pop => {
                self.pop();
            }
            Instruction::Constant => {
                let constant = self.chunk().constants[operand as usize].clone();
                self.push(constant)?;
            }
            Instruction::ConstantString => {
                let text = self.chunk().constants[operand as usize]
                    .as_string()
                    .clone();
                let interned = self.cache.insert(&text);
                self.push(Value::String(interned))?;
            }
            Instruction::PushTrue => self.push(Value::Bool(true))?,
            Instruction::PushFalse => self.push(Value::Bool(false))?,
            Instruction::PushNull => self.push(Value::Null)?,

            Instruction::IAdd => self.int_binary(|a, b| a.wrapping_add(b)),
            Instruction::ISub => self.int_binary(|a, b| a.wrapping_sub(b)),
            Instruction::IMul => self.int_binary(|a, b| a.wrapping_mul(b)),
            Instruction::IDiv => {
                if self.top().as_int() == 0 {
                    return Err(self.error("Cannot divide by zero"));
                }
                self.int_binary(|a, b| a.wrapping_div(b));
            }
            Instruction::IMod => {
                if self.top().as_int() == 0 {
                    return Err(self.error("Cannot modulo by zero"));
                }
                self.int_binary(|a, b| a.wrapping_rem(b));
            }
            Instruction::INeg => {
                let value = self.top().as_int();
                self.stack[self.stack_top - 1] = Value::Int(value.wrapping_neg());
            }

            Instruction::FAdd => self.float_binary(|a, b| a + b),
            Instruction::FSub => self.float_binary(|a, b| a - b),
            Instruction::FMul => self.float_binary(|a, b| a * b),
            Instruction::FDiv => {
                if self.top().as_float() == 0.0 {
                    return Err(self.error("Cannot divide by zero"));
                }
                self.float_binary(|a, b| a / b);
            }
            Instruction::FMod => {
                if self.top().as_float() == 0.0 {
                    return Err(self.error("Cannot modulo by zero"));
                }
                self.float_binary(|a, b| a % b);
            }
            Instruction::FNeg => {
                let value = self.top().as_float();
                self.stack[self.stack_top - 1] = Value::Float(-value);
            }

            Instruction::FloatToInt => {
                let value = self.top().as_float();
                self.stack[self.stack_top - 1] = Value::Int(value as i32);
            }
            Instruction::IntToFloat => {
                let value = self.top().as_int();
                self.stack[self.stack_top - 1] = Value::Float(value as f64);
            }

            Instruction::ShiftLeft => {
                if self.top().as_int() < 0 {
                    return Err(self.error("Cannot bitshift with value less than zero"));
                }
                self.int_binary(|a, b| a.wrapping_shl(b as u32));
            }
            Instruction::ShiftRight => {
                if self.top().as_int() < 0 {
                    return Err(self.error("Cannot bitshift with value less than zero"));
                }
                self.int_binary(|a, b| a.wrapping_shr(b as u32));
            }
            Instruction::BitAnd => self.int_binary(|a, b| a & b),
            Instruction::BitOr => self.int_binary(|a, b| a | b),
            Instruction::BitNot => {
                let value = self.top().as_int();
                self.stack[self.stack_top - 1] = Value::Int(!value);
            }
            Instruction::BitXor => self.int_binary(|a, b| a ^ b),
            Instruction::Not => {
                let result = !self.truthy(self.top());
                self.stack[self.stack_top - 1] = Value::Bool(result);
            }
            Instruction::Equal => {
                let right = self.pop();
                let result = self.values_equal(&self.stack[self.stack_top - 1], &right);
                self.stack[self.stack_top - 1] = Value::Bool(result);
            }
            Instruction::Greater => {
                let right = self.pop();
                let result = self.value_greater(&self.stack[self.stack_top - 1], &right);
                self.stack[self.stack_top - 1] = Value::Bool(result);
            }
            Instruction::Lesser => {
                let right = self.pop();
                let result = self.value_less(&self.stack[self.stack_top - 1], &right);
                self.stack[self.stack_top - 1] = Value::Bool(result);
            }

            Instruction::JumpForward => {
                self.ip += operand as usize;
            }
            Instruction::JumpBackward => {
                self.ip -= operand as usize;
            }
            Instruction::JumpIfTrue => {
                if self.truthy(self.top()) {
                    self.ip += operand as usize;
                }
            }
            Instruction::JumpIfFalse => {
                if !self.truthy(self.top()) {
                    self.ip += operand as usize;
                }
            }
            Instruction::PopJumpIfFalse => {
                let condition = self.pop();
                if !self.truthy(&condition) {
                    self.ip += operand as usize;
                }
            }
            Instruction::PopJumpIfEqual => {
                let case = &self.stack[self.stack_top - 1];
                let subject = &self.stack[self.stack_top - 2];
                if self.values_equal(subject, case) {
                    self.ip += operand as usize;
                    self.stack_top -= 1;
                }
                self.stack_top -= 1;
            }
            Instruction::PopJumpBackIfTrue => {
                let condition = self.pop();
                if self.truthy(&condition) {
                    self.ip -= operand as usize;
                }
            }

            Instruction::AssignLocal => {
                let slot = self.local_slot(operand);
                self.assign_into_slot(slot);
            }
            Instruction::AccessLocal => {
                let value = self.stack[self.local_slot(operand)].clone();
                if let Value::String(text) = &value {
                    let _ = self.cache.insert(text);
                }
                self.push(value)?;
            }
            Instruction::MakeRefToLocal => {
                let slot = self.local_slot(operand);
                let reference = self.reference_to_cell(slot);
                self.push(reference)?;
            }
            Instruction::AssignGlobal => {
                let slot = self.global_slot(operand);
                self.assign_into_slot(slot);
            }
            Instruction::AccessGlobal => {
                let value = self.stack[self.global_slot(operand)].clone();
                if let Value::String(text) = &value {
                    let _ = self.cache.insert(text);
                }
                self.push(value)?;
            }
            Instruction::MakeRefToGlobal => {
                let slot = self.global_slot(operand);
                let reference = self.reference_to_cell(slot);
                self.push(reference)?;
            }
            Instruction::Deref => {
                if let Value::Ref(target) = self.stack[self.stack_top - 1] {
                    let value = self.read_ref(target);
                    // The dereferenced copy is a live cell of its own
                    if let Value::String(text) = &value {
                        let _ = self.cache.insert(text);
                    }
                    self.stack[self.stack_top - 1] = value;
                }
            }
            Instruction::AccessFromTop => {
                let value = self.stack[self.stack_top - operand as usize].clone();
                self.push(value)?;
            }
            Instruction::AssignFromTop => {
                let slot = self.stack_top - operand as usize;
                self.assign_into_slot(slot);
            }

            Instruction::LoadFunctionSameModule => {
                let module = self.frame().module_index;
                self.load_function(module)?;
            }
            Instruction::LoadFunctionModuleIndex => {
                self.load_function(operand as usize)?;
            }
            Instruction::LoadFunctionModulePath => {
                let path = self.pop();
                let module = match self.module_paths.get(&*path.as_string().clone()) {
                    Some(index) => *index,
                    None => return Err(self.error("Unknown module path")),
                };
                self.cache.remove(path.as_string());
                self.load_function(module)?;
            }
            Instruction::CallFunction => {
                if self.frames.len() >= FRAME_MAX {
                    return Err(self.error("Too many nested function calls"));
                }
                let target = self.pop().as_function();
                let function = &self.modules[target.module].functions[target.function];
                let arity = function.arity;
                let name = function.name.clone();
                self.frames.push(CallFrame {
                    base: self.stack_top - (arity + 1),
                    return_chunk: Some(self.current),
                    return_ip: self.ip,
                    module_index: target.module,
                    name,
                });
                self.current = ChunkId {
                    module: target.module,
                    kind: ChunkKind::Function(target.function),
                };
                self.ip = 0;
            }
            Instruction::CallNative => {
                let name = self.pop();
                let native = match self.natives.get(&*name.as_string().clone()) {
                    Some(native) => *native,
                    None => return Err(self.error("Unknown native function")),
                };
                self.cache.remove(name.as_string());
                let args_start = self.stack_top - native.arity;
                let line = self.current_line();
                // Handlers raise errors with no line context of their own
                let result = (native.handler)(self, args_start)
                    .map_err(|e| RuntimeError::new(e.message, line))?;
                for index in args_start..self.stack_top {
                    let argument = std::mem::take(&mut self.stack[index]);
                    self.release(argument);
                }
                self.stack[args_start] = result;
                self.stack_top = args_start + 1;
            }
            Instruction::Return => {
                self.stack_top -= operand as usize;
                let frame = match self.frames.pop() {
                    Some(frame) => frame,
                    None => return Err(self.error("Return outside a function")),
                };
                self.ip = frame.return_ip;
                if let Some(chunk) = frame.return_chunk {
                    self.current = chunk;
                }
            }
            Instruction::TrapReturn => {
                return Err(self.error("Reached end of non-null function"));
            }

            Instruction::IndexString => {
                let index = self.pop().as_int();
                let previous = self.stack[self.stack_top - 1].clone();
                let text = match &previous {
                    Value::Ref(target) => self.read_ref(*target).as_string().clone(),
                    other => other.as_string().clone(),
                };
                let byte = text.as_bytes()[index as usize];
                let single = self.cache.insert(&(byte as char).to_string());
                self.stack[self.stack_top - 1] = Value::String(single);
                if let Value::String(old) = previous {
                    self.cache.remove(&old);
                }
            }
            Instruction::CheckStringIndex => {
                let index = self.stack[self.stack_top - 1].as_int();
                let length = match &self.stack[self.stack_top - 2] {
                    Value::Ref(target) => self.read_ref(*target).as_string().len(),
                    other => other.as_string().len(),
                };
                if index < 0 || index as usize >= length {
                    return Err(self.error("String index out of range"));
                }
            }
            Instruction::PopString => {
                let value = self.pop();
                self.cache.remove(value.as_string());
            }
            Instruction::Concatenate => {
                let right = self.pop();
                let left = self.stack[self.stack_top - 1].clone();
                let joined = self.cache.concat(left.as_string(), right.as_string());
                self.cache.remove(left.as_string());
                self.cache.remove(right.as_string());
                self.stack[self.stack_top - 1] = Value::String(joined);
            }

            Instruction::MakeList => {
                let handle = self
                    .heap
                    .alloc(vec![Value::Invalid; operand as usize]);
                self.push(Value::List(handle))?;
            }
            Instruction::CopyList => {
                if let Value::ListRef(source) = self.stack[self.stack_top - 1] {
                    let copied = self.copy_list(source);
                    self.stack[self.stack_top - 1] = Value::List(copied);
                }
            }
            Instruction::AppendList => {
                let appended = self.pop();
                let list = self.stack[self.stack_top - 1].as_list();
                self.heap.get_mut(list).push(appended);
            }
            Instruction::PopFromList => {
                let how_many = self.pop().as_int();
                let list = self.stack[self.stack_top - 1].as_list();
                if (self.heap.get(list).len() as i32) < how_many {
                    return Err(self.error("Trying to pop from empty list"));
                }
                for _ in 0..how_many {
                    if let Some(element) = self.heap.get_mut(list).pop() {
                        self.release(element);
                    }
                }
            }
            Instruction::AssignList => {
                let assigned = self.pop();
                let index = self.pop().as_int() as usize;
                let list = self.stack[self.stack_top - 1].as_list();
                let old = self.heap.get(list)[index].clone();
                match &old {
                    Value::List(inner) => self.destroy_list(*inner),
                    Value::String(text) => {
                        self.cache.remove(text);
                        let _ = self.cache.insert(assigned.as_string());
                    }
                    _ => {}
                }
                if let Value::Ref(target) = old {
                    self.write_ref(target, assigned);
                } else {
                    self.heap.get_mut(list)[index] = assigned;
                }
                let mut result = self.heap.get(list)[index].clone();
                if let Value::List(inner) = result {
                    result = Value::ListRef(inner);
                }
                self.stack[self.stack_top - 1] = result;
            }
            Instruction::IndexList => {
                let index = self.pop().as_int() as usize;
                let list = self.stack[self.stack_top - 1].as_list();
                let element = match self.heap.get(list)[index].clone() {
                    Value::String(text) => {
                        let _ = self.cache.insert(&text);
                        Value::String(text)
                    }
                    Value::List(inner) => Value::ListRef(inner),
                    other => other,
                };
                self.stack[self.stack_top - 1] = element;
            }
            Instruction::MakeRefToIndex => {
                let index = self.pop().as_int() as usize;
                let list = self.stack[self.stack_top - 1].as_list();
                let element = self.heap.get(list)[index].clone();
                self.stack[self.stack_top - 1] = match element {
                    Value::List(inner) => Value::ListRef(inner),
                    _ => Value::Ref(RefTarget::ListElement(list, index)),
                };
            }
            Instruction::CheckListIndex => {
                let index = self.stack[self.stack_top - 1].as_int();
                let list = self.stack[self.stack_top - 2].as_list();
                if index < 0 || index as usize >= self.heap.get(list).len() {
                    return Err(self.error("List index out of range"));
                }
            }
            Instruction::AccessLocalList => {
                let value = self.stack[self.local_slot(operand)].clone();
                let alias = match value {
                    Value::List(handle) | Value::ListRef(handle) => Value::ListRef(handle),
                    other => other,
                };
                self.push(alias)?;
            }
            Instruction::AccessGlobalList => {
                let value = self.stack[self.global_slot(operand)].clone();
                let alias = match value {
                    Value::List(handle) | Value::ListRef(handle) => Value::ListRef(handle),
                    other => other,
                };
                self.push(alias)?;
            }
            Instruction::AssignLocalList => {
                let slot = self.local_slot(operand);
                self.assign_list_slot(slot);
            }
            Instruction::AssignGlobalList => {
                let slot = self.global_slot(operand);
                self.assign_list_slot(slot);
            }
            Instruction::PopList => {
                let value = self.pop();
                if let Value::List(handle) = value {
                    self.destroy_list(handle);
                }
            }

            Instruction::EqualSL => {
                let right = self.pop();
                let left = self.pop();
                let result = self.values_equal(&left, &right);
                for operand in [left, right] {
                    self.release(operand);
                }
                self.push(Value::Bool(result))?;
            }
            Instruction::MoveLocal => {
                let slot = self.local_slot(operand);
                let moved = std::mem::replace(&mut self.stack[slot], Value::Null);
                let pushed = match moved {
                    Value::List(handle) | Value::ListRef(handle) => Value::List(handle),
                    other => other,
                };
                self.push(pushed)?;
            }
            Instruction::MoveGlobal => {
                let slot = self.global_slot(operand);
                let moved = std::mem::replace(&mut self.stack[slot], Value::Null);
                self.push(moved)?;
            }
            Instruction::MoveIndex => {
                let index = self.pop().as_int() as usize;
                let list = self.stack[self.stack_top - 1].as_list();
                let moved =
                    std::mem::replace(&mut self.heap.get_mut(list)[index], Value::Null);
                self.stack[self.stack_top - 1] = moved;
            }
            Instruction::Swap => {
                let first = self.stack_top - operand as usize;
                self.stack.swap(first, first - 1);
            }
        }

        Ok(ExecutionState::Running)
    }

    fn int_binary(&mut self, apply: impl Fn(i32, i32) -> i32) {
        let right = self.pop().as_int();
        let left = self.stack[self.stack_top - 1].as_int();
        self.stack[self.stack_top - 1] = Value::Int(apply(left, right));
    }

    fn float_binary(&mut self, apply: impl Fn(f64, f64) -> f64) {
        let right = self.pop().as_float();
        let left = self.stack[self.stack_top - 1].as_float();
        self.stack[self.stack_top - 1] = Value::Float(apply(left, right));
    }

    /// Alias the cell at `slot`: lists alias as `ListRef`, refs collapse
    /// (a `Ref` never targets another `Ref`), everything else gets a
    /// direct cell reference.
    fn reference_to_cell(&self, slot: usize) -> Value {
        match self.stack[slot] {
            Value::List(handle) | Value::ListRef(handle) => Value::ListRef(handle),
            Value::Ref(target) => Value::Ref(target),
            _ => Value::Ref(RefTarget::Stack(slot)),
        }
    }

    /// Resolve the function name on top of stack against `module`,
    /// releasing the consumed name string.
    fn load_function(&mut self, module: usize) -> Result<(), RuntimeError> {
        let name = self.stack[self.stack_top - 1].as_string().clone();
        let function = match self.modules[module].function_index(&name) {
            Some(index) => index,
            None => return Err(self.error(format!("Unknown function '{}'", name))),
        };
        self.cache.remove(&name);
        self.stack[self.stack_top - 1] = Value::Function(FunctionTarget { module, function });
        Ok(())
    }

    /// Assignment into a list-typed variable slot: the prior list (if any)
    /// is destroyed before the new value takes over; the value left on the
    /// stack becomes a non-owning alias.
    fn assign_list_slot(&mut self, slot: usize) {
        let new = self.stack[self.stack_top - 1].clone();
        match self.stack[slot].clone() {
            Value::List(old) => {
                self.destroy_list(old);
                self.stack[slot] = new;
            }
            Value::Ref(target) => {
                if let Value::List(old) = self.read_ref(target) {
                    self.destroy_list(old);
                }
                self.write_ref(target, new);
            }
            _ => self.stack[slot] = new,
        }
        if let Value::List(handle) = self.stack[self.stack_top - 1] {
            self.stack[self.stack_top - 1] = Value::ListRef(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::module::RuntimeModule;

    fn module_with_top_level(build: impl FnOnce(&mut Chunk)) -> RuntimeModule {
        let mut module = RuntimeModule::new("main", "/main.rill");
        build(&mut module.top_level_code);
        module.top_level_code.emit(Instruction::Halt, 0, 1);
        module.teardown_code.emit(Instruction::Halt, 0, 1);
        module
    }

    #[test]
    fn test_integer_arithmetic() {
        let module = module_with_top_level(|chunk| {
            let two = chunk.add_constant(Value::Int(2));
            let three = chunk.add_constant(Value::Int(3));
            chunk.emit(Instruction::Constant, two, 1);
            chunk.emit(Instruction::Constant, three, 1);
            chunk.emit(Instruction::IAdd, 0, 1);
            chunk.emit(Instruction::Pop, 0, 1);
        });
        let mut vm = VirtualMachine::new();
        assert!(vm.run(vec![module]).is_ok());
        assert_eq!(vm.stack_top, 0);
    }

    #[test]
    fn test_divide_by_zero_reports_line() {
        let module = module_with_top_level(|chunk| {
            let ten = chunk.add_constant(Value::Int(10));
            let zero = chunk.add_constant(Value::Int(0));
            chunk.emit(Instruction::Constant, ten, 3);
            chunk.emit(Instruction::Constant, zero, 3);
            chunk.emit(Instruction::IDiv, 0, 3);
        });
        let mut vm = VirtualMachine::new();
        let err = vm.run(vec![module]).unwrap_err();
        assert_eq!(err.message, "Cannot divide by zero");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_negative_shift_is_an_error() {
        let module = module_with_top_level(|chunk| {
            let one = chunk.add_constant(Value::Int(1));
            let minus = chunk.add_constant(Value::Int(-2));
            chunk.emit(Instruction::Constant, one, 1);
            chunk.emit(Instruction::Constant, minus, 1);
            chunk.emit(Instruction::ShiftLeft, 0, 1);
        });
        let mut vm = VirtualMachine::new();
        let err = vm.run(vec![module]).unwrap_err();
        assert_eq!(err.message, "Cannot bitshift with value less than zero");
    }

    #[test]
    fn test_concatenate_releases_operands() {
        let module = module_with_top_level(|chunk| {
            let hello = chunk.add_constant(Value::String("hello, ".into()));
            let world = chunk.add_constant(Value::String("world".into()));
            chunk.emit(Instruction::ConstantString, hello, 1);
            chunk.emit(Instruction::ConstantString, world, 1);
            chunk.emit(Instruction::Concatenate, 0, 1);
            chunk.emit(Instruction::PopString, 0, 1);
        });
        let mut vm = VirtualMachine::new();
        assert!(vm.run(vec![module]).is_ok());
        assert_eq!(vm.cache_len(), 0, "cache must be empty after execution");
    }

    #[test]
    fn test_pop_list_destroys_owned_lists() {
        let module = module_with_top_level(|chunk| {
            let one = chunk.add_constant(Value::Int(1));
            chunk.emit(Instruction::MakeList, 0, 1);
            chunk.emit(Instruction::Constant, one, 1);
            chunk.emit(Instruction::AppendList, 0, 1);
            chunk.emit(Instruction::PopList, 0, 1);
        });
        let mut vm = VirtualMachine::new();
        assert!(vm.run(vec![module]).is_ok());
        assert_eq!(vm.live_lists(), 0);
    }

    #[test]
    fn test_copy_list_materializes_owner() {
        let mut vm = VirtualMachine::new();
        let source = vm.heap.alloc(vec![Value::Int(1), Value::Int(2)]);
        let copied = vm.copy_list(source);
        assert_ne!(source, copied);
        assert_eq!(vm.heap.get(copied), vm.heap.get(source));
    }

    #[test]
    fn test_int_float_round_trip() {
        let module = module_with_top_level(|chunk| {
            let n = chunk.add_constant(Value::Int(-123456));
            chunk.emit(Instruction::Constant, n, 1);
            chunk.emit(Instruction::IntToFloat, 0, 1);
            chunk.emit(Instruction::FloatToInt, 0, 1);
            // leave on stack as a module global so we can inspect it
        });
        let mut vm = VirtualMachine::new();
        // inspect before teardown by running init only
        vm.modules = vec![module];
        vm.init_module(0).unwrap();
        assert_eq!(vm.stack[0], Value::Int(-123456));
    }

    #[test]
    fn test_equality_dereferences_refs() {
        let mut vm = VirtualMachine::new();
        vm.stack[0] = Value::Int(42);
        let reference = Value::Ref(RefTarget::Stack(0));
        assert!(vm.values_equal(&reference, &Value::Int(42)));
        assert!(!vm.values_equal(&Value::Int(41), &reference));
    }

    #[test]
    fn test_bool_ordering_is_strict() {
        let vm = VirtualMachine::new();
        assert!(vm.value_less(&Value::Bool(false), &Value::Bool(true)));
        assert!(!vm.value_less(&Value::Bool(true), &Value::Bool(true)));
        assert!(vm.value_greater(&Value::Bool(true), &Value::Bool(false)));
    }

    #[test]
    fn test_list_equality_ignores_alias_tag() {
        let mut vm = VirtualMachine::new();
        let a = vm.heap.alloc(vec![Value::Int(1)]);
        let b = vm.heap.alloc(vec![Value::Int(1)]);
        assert!(vm.values_equal(&Value::List(a), &Value::ListRef(b)));
    }

    #[test]
    fn test_display_and_repr() {
        let mut vm = VirtualMachine::new();
        let h = vm.heap.alloc(vec![Value::Int(1), Value::Int(42)]);
        assert_eq!(vm.display_value(&Value::List(h)), "[1, 42]");
        let s = vm.cache.insert("a\nb");
        assert_eq!(vm.display_value(&Value::String(s.clone())), "a\nb");
        assert_eq!(vm.repr_value(&Value::String(s)), "\"a\\nb\"");
    }

    #[test]
    fn test_display_renders_list_strings_raw() {
        let mut vm = VirtualMachine::new();
        let a = vm.cache.insert("a");
        let b = vm.cache.insert("b");
        let inner = vm.heap.alloc(vec![Value::String(b)]);
        let h = vm
            .heap
            .alloc(vec![Value::String(a), Value::List(inner)]);
        // print-style rendering never quotes, at any depth
        assert_eq!(vm.display_value(&Value::List(h)), "[a, [b]]");
        // the debug repr does
        assert_eq!(vm.repr_value(&Value::List(h)), "[\"a\", [\"b\"]]");
    }
}
