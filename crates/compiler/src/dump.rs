//! Debug printers for `--dump-ast` and `--disassemble-code`
//!
//! Best-effort inspection aids, not round-trip tools.

use crate::driver::ParsedModule;
use rill_runtime::chunk::{Chunk, Instruction, OPERAND_MASK};
use rill_runtime::module::RuntimeModule;
use rill_runtime::value::Value;
use std::fmt::Write;

pub fn format_ast(module: &ParsedModule) -> String {
    let mut formatted = String::new();
    let _ = writeln!(formatted, "== AST of module '{}' ==", module.name);
    for statement in &module.statements {
        let _ = writeln!(formatted, "{:#?}", statement);
    }
    formatted
}

pub fn disassemble_module(module: &RuntimeModule) -> String {
    let mut formatted = String::new();
    let _ = writeln!(formatted, "== module '{}' ==", module.name);
    formatted.push_str(&disassemble_chunk(&module.top_level_code, "<top-level>"));
    for function in &module.functions {
        formatted.push_str(&disassemble_chunk(&function.code, &function.name));
    }
    formatted.push_str(&disassemble_chunk(&module.teardown_code, "<teardown>"));
    formatted
}

fn render_constant(constant: &Value) -> String {
    match constant {
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::String(s) => format!("\"{}\"", s),
        other => format!("{:?}", other),
    }
}

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut formatted = String::new();
    let _ = writeln!(formatted, "-- {} --", name);

    let mut index = 0;
    while index < chunk.bytes.len() {
        let word = chunk.bytes[index];
        let opcode = (word >> 24) as u8;
        let mut operand = word & OPERAND_MASK;
        let trailing = chunk.trailing_words(index);
        if trailing == 2 {
            let high = chunk.bytes[index + 1] & OPERAND_MASK;
            let low = chunk.bytes[index + 2] & OPERAND_MASK;
            operand = (high << 24) | low;
        }

        let line = chunk.line_for(index);
        match Instruction::from_byte(opcode) {
            Some(instruction) => {
                let _ = write!(
                    formatted,
                    "{:04} {:>4} {:<26} {}",
                    index,
                    line,
                    instruction.name(),
                    operand
                );
                if trailing == 2 {
                    let _ = write!(formatted, " (2 trailing bytes)");
                }
                if matches!(
                    instruction,
                    Instruction::Constant | Instruction::ConstantString
                ) {
                    if let Some(constant) = chunk.constants.get(operand as usize) {
                        let _ = write!(formatted, " ; {}", render_constant(constant));
                    }
                }
                formatted.push('\n');
            }
            None => {
                let _ = writeln!(formatted, "{:04} {:>4} <invalid {:#x}>", index, line, word);
            }
        }
        index += 1 + trailing;
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_renders_constants() {
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Int(42));
        chunk.emit(Instruction::Constant, index, 1);
        chunk.emit(Instruction::Halt, 0, 2);
        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("; 42"));
        assert!(text.contains("HALT"));
    }

    #[test]
    fn test_disassemble_wide_operand() {
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::JumpForward, 0x0100_0000, 1);
        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("trailing bytes"));
        assert!(text.contains(&0x0100_0000u32.to_string()));
    }
}
