//! Error taxonomy shared by every stage of the compiler.

use thiserror::Error;

use crate::diagnostics::Location;

/// Failures raised by the symbolic core.
///
/// Each variant carries enough context (symbol names, equation index, source
/// location) for the caller to build a readable, location-annotated message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("symbol '{name}' declared twice{}", kind_suffix(.conflicting_kind))]
    AlreadyDeclared { name: String, conflicting_kind: bool },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("no value for '{name}' at lag {lag}")]
    UndefinedValue { name: String, lag: i32 },

    #[error("division by zero")]
    DivisionByZero,

    #[error("{operation} is undefined for argument {value}")]
    DomainError { operation: String, value: f64 },

    #[error("cannot differentiate through unknown function '{function}'{}", equation_suffix(.equation))]
    NonDifferentiable {
        function: String,
        equation: Option<usize>,
    },

    #[error("unknown function '{0}' has no numeric definition")]
    NonEvaluable(String),

    #[error("{function} expects {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("{message} at {location}")]
    Syntax { message: String, location: Location },

    #[error("{0}")]
    Mode(String),

    #[error("{0}")]
    Misuse(String),

    #[error("failed to write generated code")]
    Output(#[from] std::fmt::Error),
}

impl CompileError {
    /// Attaches the equation index to a `NonDifferentiable` failure.
    pub fn in_equation(self, index: usize) -> Self {
        match self {
            CompileError::NonDifferentiable { function, .. } => CompileError::NonDifferentiable {
                function,
                equation: Some(index),
            },
            other => other,
        }
    }

    /// Source location, when the failure came from the reader.
    pub fn location(&self) -> Option<Location> {
        match self {
            CompileError::Syntax { location, .. } => Some(*location),
            _ => None,
        }
    }
}

fn kind_suffix(conflicting_kind: &bool) -> &'static str {
    if *conflicting_kind {
        " with a different kind"
    } else {
        ""
    }
}

fn equation_suffix(equation: &Option<usize>) -> String {
    match equation {
        Some(index) => format!(" in equation {}", index + 1),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
