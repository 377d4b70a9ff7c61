//! Native function table
//!
//! The fixed set of built-in functions available to every program. Each
//! native receives the VM and the stack index of its first argument; the
//! `CALL_NATIVE` instruction writes the returned value into that slot and
//! releases the remaining arguments.
//!
//! Handler contract: a returned string always carries a fresh cache count
//! (handlers go through [`VirtualMachine::store_string`] even when passing
//! an argument through), because the caller's argument window is released
//! wholesale after the handler returns.
//!
//! Handlers may touch the string cache and the list heap; they never touch
//! the frame stack.

use crate::error::RuntimeError;
use crate::value::Value;
use crate::vm::VirtualMachine;
use std::collections::HashMap;

pub type NativeFn = fn(&mut VirtualMachine, usize) -> Result<Value, RuntimeError>;

#[derive(Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub arity: usize,
    pub handler: NativeFn,
}

/// Build the registration table consumed by the VM at startup.
pub fn native_table() -> HashMap<&'static str, Native> {
    let natives = [
        Native { name: "print", arity: 1, handler: native_print },
        Native { name: "int", arity: 1, handler: native_int },
        Native { name: "float", arity: 1, handler: native_float },
        Native { name: "string", arity: 1, handler: native_string },
        Native { name: "readline", arity: 1, handler: native_readline },
        Native { name: "size", arity: 1, handler: native_size },
        Native { name: "fill_trivial", arity: 2, handler: native_fill_trivial },
        Native { name: "%resize_list_trivial", arity: 2, handler: native_resize_list_trivial },
    ];
    natives.iter().map(|native| (native.name, *native)).collect()
}

fn native_print(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    let rendered = vm.display_value(&vm.stack_value(args).clone());
    vm.write_output(&rendered)?;
    Ok(Value::Null)
}

fn native_int(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    convert_int(vm, vm.stack_value(args).clone())
}

fn convert_int(vm: &mut VirtualMachine, arg: Value) -> Result<Value, RuntimeError> {
    match arg {
        Value::Int(_) => Ok(arg),
        Value::Float(v) => Ok(Value::Int(v as i32)),
        Value::Bool(v) => Ok(Value::Int(v as i32)),
        Value::String(s) => s.trim().parse::<i32>().map(Value::Int).map_err(|_| {
            RuntimeError::new(format!("Cannot convert '{}' to int", s), 0)
        }),
        Value::Ref(target) => {
            let value = vm.read_ref(target);
            convert_int(vm, value)
        }
        Value::Invalid => Ok(Value::Int(0)),
        _ => Ok(Value::Int(0)),
    }
}

fn native_float(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    convert_float(vm, vm.stack_value(args).clone())
}

fn convert_float(vm: &mut VirtualMachine, arg: Value) -> Result<Value, RuntimeError> {
    match arg {
        Value::Float(_) => Ok(arg),
        Value::Int(v) => Ok(Value::Float(v as f64)),
        Value::Bool(v) => Ok(Value::Float(if v { 1.0 } else { 0.0 })),
        Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            RuntimeError::new(format!("Cannot convert '{}' to float", s), 0)
        }),
        // A reference dereferences and re-dispatches as float
        Value::Ref(target) => {
            let value = vm.read_ref(target);
            convert_float(vm, value)
        }
        _ => Ok(Value::Float(0.0)),
    }
}

fn native_string(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    convert_string(vm, vm.stack_value(args).clone())
}

fn convert_string(vm: &mut VirtualMachine, arg: Value) -> Result<Value, RuntimeError> {
    match arg {
        Value::Int(v) => Ok(vm.store_string(&v.to_string())),
        Value::Float(v) => Ok(vm.store_string(&v.to_string())),
        Value::Bool(v) => Ok(vm.store_string(if v { "true" } else { "false" })),
        // Pass-through still returns a fresh count; the argument's count
        // is released by CALL_NATIVE.
        Value::String(s) => Ok(vm.store_string(&s)),
        Value::Ref(target) => {
            let value = vm.read_ref(target);
            convert_string(vm, value)
        }
        Value::List(_) | Value::ListRef(_) => {
            let rendered = vm.repr_value(&arg);
            Ok(vm.store_string(&rendered))
        }
        Value::Invalid => Ok(vm.store_string("invalid")),
        _ => Ok(vm.store_string("null")),
    }
}

fn native_readline(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    let prompt = match vm.stack_value(args) {
        Value::Ref(target) => vm.read_ref(*target),
        other => other.clone(),
    };
    vm.write_output(&vm.display_value(&prompt))?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| RuntimeError::new(format!("Failed to read line: {}", e), 0))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(vm.store_string(&line))
}

fn native_size(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    let arg = match vm.stack_value(args) {
        Value::Ref(target) => vm.read_ref(*target),
        other => other.clone(),
    };
    match arg {
        Value::String(s) => Ok(Value::Int(s.len() as i32)),
        Value::List(h) | Value::ListRef(h) => Ok(Value::Int(vm.heap.get(h).len() as i32)),
        _ => Ok(Value::Int(0)),
    }
}

fn native_fill_trivial(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    let list = vm.stack_value(args).as_list();
    let fill = match vm.stack_value(args + 1) {
        Value::Ref(target) => vm.read_ref(*target),
        other => other.clone(),
    };
    if let Value::String(text) = &fill {
        let length = vm.heap.get(list).len();
        for index in 0..length {
            if let Value::String(old) = vm.heap.get(list)[index].clone() {
                vm.cache.remove(&old);
            }
            let fresh = vm.cache.insert(text);
            vm.heap.get_mut(list)[index] = Value::String(fresh);
        }
    } else {
        for element in vm.heap.get_mut(list).iter_mut() {
            *element = fill.clone();
        }
    }
    Ok(Value::Null)
}

fn native_resize_list_trivial(vm: &mut VirtualMachine, args: usize) -> Result<Value, RuntimeError> {
    let list = vm.stack_value(args).as_list();
    let size = match vm.stack_value(args + 1) {
        Value::Ref(target) => vm.read_ref(*target),
        other => other.clone(),
    }
    .as_int() as usize;
    let length = vm.heap.get(list).len();
    for index in size..length {
        if let Value::String(old) = vm.heap.get(list)[index].clone() {
            vm.cache.remove(&old);
        }
    }
    vm.heap.get_mut(list).resize(size, Value::Invalid);
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_contains_required_natives() {
        let table = native_table();
        for name in [
            "print",
            "int",
            "float",
            "string",
            "readline",
            "size",
            "fill_trivial",
            "%resize_list_trivial",
        ] {
            assert!(table.contains_key(name), "missing native '{}'", name);
        }
        assert_eq!(table["print"].arity, 1);
        assert_eq!(table["fill_trivial"].arity, 2);
    }
}
