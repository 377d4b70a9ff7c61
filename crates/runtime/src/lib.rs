//! Rill runtime library
//!
//! The bytecode virtual machine for the Rill language and the data model
//! it executes: tagged values, the refcounting string cache, the list
//! heap, chunk encoding, the native function table and the dispatch loop.
//!
//! The compiler crate (`rillc`) produces [`module::RuntimeModule`]s and
//! hands them to [`vm::VirtualMachine::run`] in dependency order, main
//! module last.

pub mod chunk;
pub mod error;
pub mod list;
pub mod module;
pub mod natives;
pub mod string_cache;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, Instruction};
pub use error::RuntimeError;
pub use list::{ListHandle, ListHeap};
pub use module::{RuntimeFunction, RuntimeModule};
pub use natives::{Native, NativeFn};
pub use string_cache::{CachedString, StringCache};
pub use value::{FunctionTarget, IntType, FloatType, RefTarget, Value};
pub use vm::{TraceOptions, VirtualMachine, FRAME_MAX, MODULE_MAX, STACK_MAX};
