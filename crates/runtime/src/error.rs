//! Runtime error type
//!
//! A runtime error carries the source line it was raised at, looked up
//! through the current chunk's line table. The VM never recovers from one:
//! the dispatch loop stops and the error propagates to the driver, which
//! reports it and exits nonzero.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    /// Source line (1-indexed) the faulting instruction was compiled from
    pub line: u32,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        RuntimeError {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_line() {
        let err = RuntimeError::new("Cannot divide by zero", 7);
        assert_eq!(
            err.to_string(),
            "runtime error at line 7: Cannot divide by zero"
        );
    }
}
