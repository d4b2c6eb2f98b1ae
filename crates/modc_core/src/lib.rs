//! The `modc_core` crate is the symbolic engine behind the modc model compiler.
//! It turns the equations of a nonlinear dynamic economic model into generated
//! residual and derivative routines.
//!
//! Key components:
//! - **Symbol table**: typed `(kind, ordinal)` identifiers for every declared name.
//! - **Data tree**: a hash-consed expression DAG with simplification at construction,
//!   numeric evaluation (generic over `Scalar`) and dialect-aware printing.
//! - **Derivatives**: memoized symbolic differentiation, composed into Jacobians and
//!   Hessians by the model container.
//! - **Code generation**: common-subexpression elimination and deterministic emission
//!   of Matlab-style or C-style code.
//! - **Session / reader**: the construction API a front end drives, plus a small
//!   reader for model-description text.
pub mod codegen;
pub mod config;
pub mod data_tree;
pub mod derivatives;
pub mod diagnostics;
pub mod error;
pub mod evaluate;
pub mod model_tree;
pub mod output;
pub mod reader;
pub mod render;
pub mod session;
pub mod symbol_table;
pub mod traits;

pub use config::CompileOptions;
pub use error::{CompileError, Result};
pub use output::CompiledModel;
pub use session::CompilationSession;
