//! Structured compile log.
//!
//! Front-end errors never surface as `Result`s: they accumulate here and
//! flip the kernel's compile status. Each entry renders as
//! `<file>:<line>:<column>: <severity>: <message>`.

use std::fmt;

/// Classification of front-end diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    SyntaxError,
    UndeclaredIdentifier,
    OverloadNotFound,
    TypeMismatch,
    InvalidSwizzle,
    ParameterQualifierMisuse,
    NonConstStaticInitializer,
    DuplicateDefinition,
    BadKernelSignature,
    MissingReturn,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One diagnostic with its source location (1-based line and column).
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Accumulated diagnostics for one compilation.
#[derive(Clone, Debug, Default)]
pub struct CompileLog {
    file: String,
    entries: Vec<Diagnostic>,
}

impl CompileLog {
    pub fn new(file: impl Into<String>) -> CompileLog {
        CompileLog {
            file: file.into(),
            entries: Vec::new(),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.entries.push(diag);
    }

    pub fn error(&mut self, kind: DiagnosticKind, line: u32, column: u32, message: impl Into<String>) {
        self.push(Diagnostic {
            kind,
            severity: Severity::Error,
            line,
            column,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.entries.iter().filter(|d| d.severity == Severity::Error).count()
    }

    /// Render every entry as a `<file>:<line>:<column>: <severity>: <message>` line.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|d| format!("{}:{}:{}: {}: {}", self.file, d.line, d.column, d.severity, d.message))
            .collect()
    }
}

impl fmt::Display for CompileLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_location_and_severity() {
        let mut log = CompileLog::new("test.kernel");
        log.error(DiagnosticKind::TypeMismatch, 3, 7, "cannot add vec2 and vec3");
        assert_eq!(log.lines(), vec!["test.kernel:3:7: error: cannot add vec2 and vec3".to_string()]);
        assert!(log.has_errors());
    }
}
