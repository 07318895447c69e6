use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::config;

/// Result type alias for operations that can produce an interpreter error.
pub type RunResult<T> = Result<T, LomdaError>;

/// The error categories the interpreter reports.
///
/// Categories are flat (no hierarchy). The string representation is the
/// lowercase tag that prefixes every reported message, e.g. `runtime error: ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorCategory {
    /// Syntactic failure; the message cites the offending fragment.
    Parser,
    /// Dynamic type mismatch, e.g. applying a non-lambda or indexing a non-list.
    Type,
    /// Semantic failure that is not strictly a type error (out-of-bounds, bad arity).
    Runtime,
    /// A differentiation attempt on a non-differentiable construct.
    Calculus,
    /// Module not found, file read failure.
    #[strum(serialize = "IO")]
    Io,
    /// Non-fatal by default; promoted to an error under `--werror`.
    Warning,
}

/// A categorized interpreter error.
///
/// Errors carry no source spans; the message cites the offending expression
/// in source form where one is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LomdaError {
    pub category: ErrorCategory,
    pub message: String,
}

impl LomdaError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn parser(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Parser, message)
    }

    pub fn type_err(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Type, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Runtime, message)
    }

    pub fn calculus(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Calculus, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Io, message)
    }

    /// Builds the conventional "expected such-and-such type" message.
    pub fn expected_type(fragment: impl fmt::Display, expected: &str) -> Self {
        Self::type_err(format!("expression '{fragment}' does not evaluate as {expected}"))
    }
}

impl fmt::Display for LomdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.message)
    }
}

impl std::error::Error for LomdaError {}

/// Reports a warning, or fails outright when warnings are promoted to errors.
///
/// Returns `Err` only under `--werror`; otherwise the warning goes to stderr
/// in yellow and execution continues.
pub(crate) fn warn(category: ErrorCategory, message: impl Into<String>) -> RunResult<()> {
    let message = message.into();
    if config::werror() {
        Err(LomdaError::new(category, message))
    } else {
        eprintln!("\x1b[33m{category} warning:\x1b[0m {message}");
        Ok(())
    }
}

/// Emits a blue debug line to stderr when verbose mode is on.
pub(crate) fn debug(tag: &str, message: impl AsRef<str>) {
    if config::verbosity() {
        eprintln!("\x1b[34m{tag}:\x1b[0m {}", message.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_tags_render_lowercase() {
        assert_eq!(ErrorCategory::Runtime.to_string(), "runtime");
        assert_eq!(ErrorCategory::Io.to_string(), "IO");
    }

    #[test]
    fn error_display_has_category_prefix() {
        let err = LomdaError::runtime("index 4 is out of bounds");
        assert_eq!(err.to_string(), "runtime error: index 4 is out of bounds");
    }
}
