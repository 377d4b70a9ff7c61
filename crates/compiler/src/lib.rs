//! Rill compiler library
//!
//! Compilation pipeline for the Rill language: scanner, Pratt parser
//! with constant folding, type resolver, bytecode code generator, and
//! the multi-module driver that feeds the `rill_runtime` VM.
//!
//! The usual entry points are [`driver::check_program`] (parse and
//! type-check only) and [`driver::run_program`] (the whole pipeline).

pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod dump;
pub mod folding;
pub mod parser;
pub mod resolver;
pub mod scanner;
pub mod types;

pub use config::{FlagLevel, Options, OptionsFile};
pub use diagnostics::{Diagnostic, DiagnosticReporter, Severity};
pub use driver::{
    check_program, compile_program, load_options_file, run_program, CompilerContext,
    ParsedModule, ProgramOutcome,
};
pub use parser::Parser;
pub use scanner::{Scanner, Token, TokenKind};
pub use types::{PrimitiveKind, TypeDesc};
