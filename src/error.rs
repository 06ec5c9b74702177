//! Compiler error taxonomy.
//!
//! There are exactly two kinds of compile-time failure:
//!
//!   - [`CompileError::Syntax`]: the script author did something wrong
//!     (undeclared variable, arity mismatch, division by a literal zero,
//!     ...). Always carries the source line and aborts compilation of the
//!     current script with no partial output.
//!   - [`CompileError::Internal`]: a compiler invariant was violated
//!     (fixed-point pass overran its iteration cap, SSA verification failed,
//!     the register pool ran dry, ...). Never expected from valid input;
//!     if one fires the compiler itself has a bug.
//!
//! Runtime faults (division by a runtime zero, assertion failure, cycle
//! budget) are the VM's business; see [`crate::vm::Fault`].

use colored::Colorize;

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A script-level error, recoverable by fixing the script
    Syntax { line: u32, message: String },
    /// An internal invariant violation, i.e. a compiler defect
    Internal(String),
}

impl CompileError {
    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Syntax { line, message } => {
                write!(f, "{}: {} (line {})", "error".red(), message, line)
            }
            CompileError::Internal(message) => {
                write!(f, "{}: {}", "internal compiler error".red().bold(), message)
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_errors_carry_their_line() {
        let error = CompileError::syntax(12, "undeclared variable 'a'");
        assert_eq!(
            error,
            CompileError::Syntax {
                line: 12,
                message: "undeclared variable 'a'".into()
            }
        );
        assert!(!error.is_internal());
    }

    #[test]
    fn internal_errors_are_flagged() {
        assert!(CompileError::internal("phi cleanup exceeded iteration limit").is_internal());
    }
}
