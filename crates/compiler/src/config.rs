//! Compiler options and feature flags
//!
//! Syntactic feature flags have three levels: `warn` logs a warning and
//! continues, `error` rejects the program, `none` stays silent. Defaults
//! follow the language's posture of discouraging C-isms: the comma
//! operator, the ternary operator and assignment-as-expression all
//! default to `error`; implicit int/float conversion defaults to `warn`.
//!
//! An optional `rill.toml` next to the main module can override the flag
//! levels and the folding toggle; command-line flags override the file.

use rill_runtime::TraceOptions;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagLevel {
    Warn,
    Error,
    None,
}

impl std::str::FromStr for FlagLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warn" => Ok(FlagLevel::Warn),
            "error" => Ok(FlagLevel::Error),
            "none" => Ok(FlagLevel::None),
            other => Err(format!(
                "incorrect argument '{}', permitted values are: 'warn,error,none'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub implicit_float_int: FlagLevel,
    pub comma_operator: FlagLevel,
    pub ternary_operator: FlagLevel,
    pub assignment_expr: FlagLevel,
    pub fold_constants: bool,
    pub check_only: bool,
    pub dump_ast: bool,
    pub disassemble_code: bool,
    pub trace: TraceOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            implicit_float_int: FlagLevel::Warn,
            comma_operator: FlagLevel::Error,
            ternary_operator: FlagLevel::Error,
            assignment_expr: FlagLevel::Error,
            fold_constants: true,
            check_only: false,
            dump_ast: false,
            disassemble_code: false,
            trace: TraceOptions::default(),
        }
    }
}

/// Subset of options that may come from a `rill.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsFile {
    pub implicit_float_int: Option<FlagLevel>,
    pub comma_operator: Option<FlagLevel>,
    pub ternary_operator: Option<FlagLevel>,
    pub assignment_expr: Option<FlagLevel>,
    pub fold_constants: Option<bool>,
}

impl OptionsFile {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("Failed to parse configuration: {}", e))
    }
}

impl Options {
    /// Apply file-level overrides; CLI flags are applied after this and
    /// therefore win.
    pub fn merge_file(&mut self, file: OptionsFile) {
        if let Some(level) = file.implicit_float_int {
            self.implicit_float_int = level;
        }
        if let Some(level) = file.comma_operator {
            self.comma_operator = level;
        }
        if let Some(level) = file.ternary_operator {
            self.ternary_operator = level;
        }
        if let Some(level) = file.assignment_expr {
            self.assignment_expr = level;
        }
        if let Some(fold) = file.fold_constants {
            self.fold_constants = fold;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.implicit_float_int, FlagLevel::Warn);
        assert_eq!(options.comma_operator, FlagLevel::Error);
        assert!(options.fold_constants);
    }

    #[test]
    fn test_toml_overlay() {
        let file = OptionsFile::from_toml(
            "comma-operator = \"none\"\nfold-constants = false\n"
                .replace('-', "_")
                .as_str(),
        )
        .unwrap();
        let mut options = Options::default();
        options.merge_file(file);
        assert_eq!(options.comma_operator, FlagLevel::None);
        assert!(!options.fold_constants);
        assert_eq!(options.ternary_operator, FlagLevel::Error);
    }

    #[test]
    fn test_flag_level_parse() {
        assert_eq!("warn".parse::<FlagLevel>(), Ok(FlagLevel::Warn));
        assert!("loud".parse::<FlagLevel>().is_err());
    }
}
