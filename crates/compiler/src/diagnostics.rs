//! Diagnostics
//!
//! Errors, warnings and notes from the scanner, parser and resolver are
//! collected here with the module name, line and column range of the
//! offending token. The parser recovers and keeps going so a single pass
//! reports as many errors as possible; whether anything was an error
//! decides if compilation and execution are attempted at all.

use crate::scanner::Token;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub module: String,
    pub message: String,
    pub line: u32,
    pub start_column: usize,
    pub end_column: usize,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}: {}: {}",
            self.module, self.line, self.start_column, self.end_column, self.severity, self.message
        )
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticReporter {
    diagnostics: Vec<Diagnostic>,
    had_error: bool,
}

impl DiagnosticReporter {
    pub fn new() -> Self {
        DiagnosticReporter::default()
    }

    pub fn error(&mut self, module: &str, message: impl Into<String>, token: &Token) {
        self.had_error = true;
        self.report(Severity::Error, module, message.into(), token);
    }

    pub fn warning(&mut self, module: &str, message: impl Into<String>, token: &Token) {
        self.report(Severity::Warning, module, message.into(), token);
    }

    pub fn note(&mut self, module: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Note,
            module: module.to_string(),
            message: message.into(),
            line: 0,
            start_column: 0,
            end_column: 0,
        });
    }

    /// A fatal driver error with no source position (missing file etc.)
    pub fn fatal(&mut self, message: impl Into<String>) {
        self.had_error = true;
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            module: "<driver>".to_string(),
            message: message.into(),
            line: 0,
            start_column: 0,
            end_column: 0,
        });
    }

    fn report(&mut self, severity: Severity, module: &str, message: String, token: &Token) {
        self.diagnostics.push(Diagnostic {
            severity,
            module: module.to_string(),
            message,
            line: token.line,
            start_column: token.start_column,
            end_column: token.end_column,
        });
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn format_all(&self) -> String {
        let mut formatted = String::new();
        for diagnostic in &self.diagnostics {
            formatted.push_str(&diagnostic.to_string());
            formatted.push('\n');
        }
        formatted
    }

    pub fn print_to_stderr(&self) {
        eprint!("{}", self.format_all());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::TokenKind;

    #[test]
    fn test_error_sets_had_error() {
        let mut reporter = DiagnosticReporter::new();
        assert!(!reporter.had_error());
        let token = Token::new(TokenKind::Identifier, "x", 3, 4, 5);
        reporter.error("main", "something went wrong", &token);
        assert!(reporter.had_error());
        assert_eq!(reporter.diagnostics().len(), 1);
    }

    #[test]
    fn test_warning_does_not_set_had_error() {
        let mut reporter = DiagnosticReporter::new();
        let token = Token::new(TokenKind::Identifier, "x", 1, 0, 1);
        reporter.warning("main", "eh", &token);
        assert!(!reporter.had_error());
    }

    #[test]
    fn test_format_includes_position() {
        let mut reporter = DiagnosticReporter::new();
        let token = Token::new(TokenKind::Identifier, "x", 3, 4, 5);
        reporter.error("main", "bad token", &token);
        assert_eq!(reporter.format_all(), "main:3:4-5: error: bad token\n");
    }
}
