use thiserror::Error;

use crate::lang::node::Span;

/// A problem found while generating code.
///
/// Generation continues after reporting one; the affected construct is
/// replaced by code of the right shape so later offsets stay meaningful.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(
        "type mismatch: expected '{expected}', found '{found}'\n  hint: the value is replaced by zero bytes"
    )]
    TypeMismatch { expected: String, found: String },

    #[error(
        "'{function}' takes {expected} argument(s) but {found} were supplied\n  hint: the call is skipped and a zero value used in its place"
    )]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("'break' outside of a loop\n  hint: 'break' may only appear inside 'while' or 'for'")]
    BreakOutsideLoop,

    #[error(
        "'continue' outside of a loop\n  hint: 'continue' may only appear inside 'while' or 'for'"
    )]
    ContinueOutsideLoop,

    #[error("{what} is not addressable\n  hint: only variables, dereferences, fields and elements have an address")]
    NotAddressable { what: String },

    #[error(
        "frame of '{function}' needs {size} bytes, above the limit of {limit}\n  hint: large values are better placed behind a pointer"
    )]
    LargeFrame {
        function: String,
        size: u64,
        limit: u64,
    },
}

impl CompileError {
    pub fn type_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        CompileError::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn not_addressable(what: impl Into<String>) -> Self {
        CompileError::NotAddressable { what: what.into() }
    }

    /// Severity this error is reported with.
    pub fn severity(&self) -> Severity {
        match self {
            CompileError::LargeFrame { .. } => Severity::Warning,
            CompileError::TypeMismatch { .. }
            | CompileError::ArgumentCount { .. }
            | CompileError::BreakOutsideLoop
            | CompileError::ContinueOutsideLoop
            | CompileError::NotAddressable { .. } => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub span: Span,
    pub error: CompileError,
}

impl Diagnostic {
    pub fn new(span: Span, error: CompileError) -> Self {
        Self {
            severity: error.severity(),
            span,
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.severity, self.span, self.error)
    }
}

/// Every diagnostic of a failed compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.is_error())
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.errors().count();
        write!(f, "compilation failed with {} error(s)", count)?;
        for diagnostic in &self.0 {
            write!(f, "\n{}", diagnostic)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display() {
        let err = CompileError::type_mismatch("i32", "bool");
        let msg = err.to_string();
        assert!(msg.contains("expected 'i32'"));
        assert!(msg.contains("found 'bool'"));
        assert!(msg.contains("hint"));
    }

    #[test]
    fn test_argument_count_display() {
        let err = CompileError::ArgumentCount {
            function: "add".to_string(),
            expected: 2,
            found: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("'add' takes 2"));
        assert!(msg.contains("3 were supplied"));
    }

    #[test]
    fn test_severity() {
        assert_eq!(CompileError::BreakOutsideLoop.severity(), Severity::Error);
        let warning = CompileError::LargeFrame {
            function: "main".to_string(),
            size: 1 << 20,
            limit: 1 << 16,
        };
        assert_eq!(warning.severity(), Severity::Warning);
    }

    #[test]
    fn test_diagnostic_display_has_position() {
        let d = Diagnostic::new(Span::new(3, 7), CompileError::ContinueOutsideLoop);
        let msg = d.to_string();
        assert!(msg.starts_with("error at 3:7"));
        assert!(msg.contains("'continue' outside of a loop"));
    }

    #[test]
    fn test_diagnostics_counts_only_errors() {
        let all = Diagnostics(vec![
            Diagnostic::new(Span::new(1, 1), CompileError::BreakOutsideLoop),
            Diagnostic::new(
                Span::new(2, 1),
                CompileError::LargeFrame {
                    function: "f".to_string(),
                    size: 10,
                    limit: 1,
                },
            ),
        ]);
        assert_eq!(all.errors().count(), 1);
        assert!(all.to_string().starts_with("compilation failed with 1 error(s)"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::not_addressable("call result");
        let _: &dyn std::error::Error = &err;
        assert!(err.to_string().contains("call result is not addressable"));
    }
}
