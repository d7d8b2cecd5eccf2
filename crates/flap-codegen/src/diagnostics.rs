//! Source-level diagnostics
//!
//! User-facing errors (undefined variable, use after move, atomics inside a
//! parallel loop, ...) are collected rather than aborting on the first one:
//! up to `max_errors` are accumulated and reported together, railway style.
//! Emitter errors and I/O errors do not pass through here - they abort
//! immediately with their own error types.

use flap_ast::Span;
use std::fmt;

/// Default number of source errors collected before reporting.
pub const DEFAULT_MAX_ERRORS: usize = 10;

/// A single located source error.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Single-line message
    pub message: String,
    /// Optional fix suggestion
    pub suggestion: Option<String>,
    /// Optional source snippet of the offending line
    pub snippet: Option<String>,
}

impl Diagnostic {
    pub fn new(file: &str, span: Span, message: impl Into<String>) -> Self {
        Diagnostic {
            file: file.to_string(),
            line: span.line,
            column: span.column,
            message: message.into(),
            suggestion: None,
            snippet: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)?;
        if let Some(ref snippet) = self.snippet {
            write!(f, "\n    {}", snippet)?;
        }
        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n    hint: {}", suggestion)?;
        }
        Ok(())
    }
}

/// Accumulator for source errors.
///
/// Collection stops silently once `max_errors` is reached; the count of
/// suppressed errors is still tracked for the final report.
#[derive(Debug)]
pub struct Diagnostics {
    file: String,
    errors: Vec<Diagnostic>,
    suppressed: usize,
    max_errors: usize,
}

impl Diagnostics {
    pub fn new(file: impl Into<String>) -> Self {
        Diagnostics {
            file: file.into(),
            errors: Vec::new(),
            suppressed: 0,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }

    pub fn with_max_errors(mut self, max: usize) -> Self {
        self.max_errors = max;
        self
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Record an error at a source location.
    pub fn error(&mut self, span: Span, message: impl Into<String>) {
        let diag = Diagnostic::new(&self.file, span, message);
        self.push(diag);
    }

    pub fn push(&mut self, diag: Diagnostic) {
        if self.errors.len() < self.max_errors {
            self.errors.push(diag);
        } else {
            self.suppressed += 1;
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.errors.iter()
    }

    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// Render all collected errors as one report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for diag in &self.errors {
            out.push_str(&diag.to_string());
            out.push('\n');
        }
        if self.suppressed > 0 {
            out.push_str(&format!("... and {} more errors\n", self.suppressed));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_up_to_cap() {
        let mut diags = Diagnostics::new("t.flap").with_max_errors(2);
        diags.error(Span::new(1, 1), "first");
        diags.error(Span::new(2, 1), "second");
        diags.error(Span::new(3, 1), "third");
        assert_eq!(diags.len(), 2);
        assert_eq!(diags.suppressed(), 1);
        assert!(diags.report().contains("1 more"));
    }

    #[test]
    fn test_display_with_suggestion() {
        let d = Diagnostic::new("t.flap", Span::new(4, 7), "use after move: `x`")
            .with_suggestion("reassign `x` before reading it");
        let s = d.to_string();
        assert!(s.starts_with("t.flap:4:7:"));
        assert!(s.contains("hint:"));
    }
}
