//! Compilation options.

use serde::{Deserialize, Serialize};

use crate::diagnostics::{BufferSink, ConsoleSink, DiagnosticSink, TracingSink};
use crate::render::Dialect;

/// Where diagnostics go when no custom sink is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Console,
    Tracing,
    #[default]
    Buffer,
}

impl SinkKind {
    pub fn build(self) -> Box<dyn DiagnosticSink> {
        match self {
            SinkKind::Console => Box::new(ConsoleSink),
            SinkKind::Tracing => Box::new(TracingSink),
            SinkKind::Buffer => Box::new(BufferSink::default()),
        }
    }
}

/// Settings controlling code generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Prefix of generated function names (`<basename>_static`, `<basename>_dynamic`).
    pub basename: String,
    pub dialect: Dialect,
    /// 1 emits residuals and Jacobian, 2 adds the Hessian.
    pub order: u8,
    /// Also emit the dynamic model.
    pub dynamic: bool,
    pub temporary_prefix: String,
    pub sink: SinkKind,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            basename: "model".to_string(),
            dialect: Dialect::Matlab,
            order: 1,
            dynamic: false,
            temporary_prefix: "T".to_string(),
            sink: SinkKind::Buffer,
        }
    }
}

impl CompileOptions {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn second_order(&self) -> bool {
        self.order >= 2
    }
}
