//! Structured diagnostics and the sinks they are delivered to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        })
    }
}

/// Position in the model source: 1-based line, column range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub start_column: usize,
    pub end_column: usize,
}

impl Location {
    pub fn new(line: usize, start_column: usize, end_column: usize) -> Self {
        Self {
            line,
            start_column,
            end_column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end_column > self.start_column + 1 {
            write!(f, "line {}, cols {}-{}", self.line, self.start_column, self.end_column - 1)
        } else {
            write!(f, "line {}, col {}", self.line, self.start_column)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(err: &CompileError) -> Self {
        let message = match err {
            CompileError::Syntax { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Diagnostic {
            severity: Severity::Error,
            message,
            location: err.location(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}: {}", loc, self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Destination of diagnostics.
pub trait DiagnosticSink {
    fn emit(&mut self, diagnostic: &Diagnostic);

    /// Everything retained so far; sinks that forward immediately retain nothing.
    fn collected(&self) -> &[Diagnostic] {
        &[]
    }
}

/// Writes each diagnostic to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl DiagnosticSink for ConsoleSink {
    fn emit(&mut self, diagnostic: &Diagnostic) {
        eprintln!("{diagnostic}");
    }
}

/// Forwards diagnostics as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&mut self, diagnostic: &Diagnostic) {
        let location = diagnostic.location.map(|l| l.to_string());
        match diagnostic.severity {
            Severity::Error => tracing::error!(location = ?location, "{}", diagnostic.message),
            Severity::Warning => tracing::warn!(location = ?location, "{}", diagnostic.message),
            Severity::Note => tracing::info!(location = ?location, "{}", diagnostic.message),
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink for BufferSink {
    fn emit(&mut self, diagnostic: &Diagnostic) {
        self.diagnostics.push(diagnostic.clone());
    }

    fn collected(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// Hands each diagnostic to a host-supplied closure.
pub struct CallbackSink {
    callback: Box<dyn FnMut(&Diagnostic)>,
}

impl CallbackSink {
    pub fn new(callback: impl FnMut(&Diagnostic) + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl DiagnosticSink for CallbackSink {
    fn emit(&mut self, diagnostic: &Diagnostic) {
        (self.callback)(diagnostic);
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn display_includes_location_when_present() {
        let d = Diagnostic::error("unknown symbol: q").at(Location::new(3, 5, 6));
        assert_eq!(d.to_string(), "line 3, col 5: error: unknown symbol: q");
        let w = Diagnostic::warning("unused").at(Location::new(1, 2, 6));
        assert_eq!(w.to_string(), "line 1, cols 2-5: warning: unused");
        assert_eq!(Diagnostic::warning("plain").to_string(), "warning: plain");
    }

    #[test]
    fn syntax_errors_keep_their_location() {
        let err = CompileError::Syntax {
            message: "expected ')'".into(),
            location: Location::new(2, 7, 8),
        };
        let d = Diagnostic::from(&err);
        assert_eq!(d.message, "expected ')'");
        assert_eq!(d.location, Some(Location::new(2, 7, 8)));
    }

    #[test]
    fn buffer_and_callback_sinks_receive_everything() {
        let mut buffer = BufferSink::default();
        buffer.emit(&Diagnostic::warning("a"));
        buffer.emit(&Diagnostic::error("b"));
        assert_eq!(buffer.collected().len(), 2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = Rc::clone(&seen);
        let mut callback = CallbackSink::new(move |d| sink_seen.borrow_mut().push(d.message.clone()));
        callback.emit(&Diagnostic::error("c"));
        assert_eq!(*seen.borrow(), vec!["c".to_string()]);
        assert!(callback.collected().is_empty());
    }
}
