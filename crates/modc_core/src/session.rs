//! Construction API driven by a front end, one call per grammar match.
//!
//! A [`CompilationSession`] exclusively owns everything one compilation
//! needs: the expression DAG with its symbol table, the model equations, the
//! temporary namer and the diagnostic sink. Nothing is shared between
//! sessions.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::codegen::TemporaryNamer;
use crate::config::CompileOptions;
use crate::data_tree::{BinaryOp, DataTree, Function, NodeId, UnaryOp};
use crate::derivatives::DerivationVariable;
use crate::diagnostics::{Diagnostic, DiagnosticSink, Location};
use crate::error::{CompileError, Result};
use crate::model_tree::{ModelExtension, PartialJacobian};
use crate::output::{assemble, CompiledModel, Derivatives};
use crate::symbol_table::{SymbolId, SymbolKind, SymbolTable};

/// Which tree new nodes are being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    /// Free-standing expressions outside the model block.
    Expressions,
    /// Inside `model; ... end;`: equations may be added.
    Model,
}

macro_rules! unary_builders {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(&mut self, arg: NodeId) -> NodeId {
                self.add_unary(UnaryOp::$op, arg)
            }
        )*
    };
}

macro_rules! binary_builders {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(&mut self, left: NodeId, right: NodeId) -> NodeId {
                self.add_binary(BinaryOp::$op, left, right)
            }
        )*
    };
}

pub struct CompilationSession {
    tree: DataTree,
    model: ModelExtension,
    mode: TreeMode,
    model_seen: bool,
    locals: HashMap<SymbolId, NodeId>,
    predetermined: HashSet<SymbolId>,
    options: CompileOptions,
    namer: TemporaryNamer,
    sink: Box<dyn DiagnosticSink>,
    location: Location,
}

impl Default for CompilationSession {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

impl CompilationSession {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            tree: DataTree::new(SymbolTable::new()),
            model: ModelExtension::new(),
            mode: TreeMode::Expressions,
            model_seen: false,
            locals: HashMap::new(),
            predetermined: HashSet::new(),
            namer: TemporaryNamer::new(options.temporary_prefix.clone()),
            sink: options.sink.build(),
            options,
            location: Location::new(1, 1, 1),
        }
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    pub fn model(&self) -> &ModelExtension {
        &self.model
    }

    pub fn symbols(&self) -> &SymbolTable {
        self.tree.symbols()
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn mode(&self) -> TreeMode {
        self.mode
    }

    // --- Diagnostics ---

    /// Position used for diagnostics raised by subsequent calls.
    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub fn set_sink(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.sink = sink;
    }

    /// Diagnostics retained by the current sink.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.sink.collected()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let diagnostic = Diagnostic::error(message).at(self.location);
        self.sink.emit(&diagnostic);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        let diagnostic = Diagnostic::warning(message).at(self.location);
        self.sink.emit(&diagnostic);
    }

    /// Emits `err` at its own location, or at the current one.
    pub fn report(&mut self, err: &CompileError) {
        let mut diagnostic = Diagnostic::from(err);
        if diagnostic.location.is_none() {
            diagnostic.location = Some(self.location);
        }
        self.sink.emit(&diagnostic);
    }

    // --- Declarations ---

    pub fn declare_endogenous(&mut self, name: &str, tex_name: &str) -> Result<SymbolId> {
        self.declare(name, SymbolKind::Endogenous, tex_name)
    }

    pub fn declare_exogenous(&mut self, name: &str, tex_name: &str) -> Result<SymbolId> {
        self.declare(name, SymbolKind::Exogenous, tex_name)
    }

    pub fn declare_exogenous_det(&mut self, name: &str, tex_name: &str) -> Result<SymbolId> {
        self.declare(name, SymbolKind::ExogenousDeterministic, tex_name)
    }

    pub fn declare_parameter(&mut self, name: &str, tex_name: &str) -> Result<SymbolId> {
        self.declare(name, SymbolKind::Parameter, tex_name)
    }

    pub fn declare_unknown_function(&mut self, name: &str) -> Result<SymbolId> {
        self.declare(name, SymbolKind::UnknownFunction, "")
    }

    fn declare(&mut self, name: &str, kind: SymbolKind, tex_name: &str) -> Result<SymbolId> {
        self.tree.symbols_mut().declare(name, kind, tex_name)
    }

    /// Declares a model-local variable (`# name = rhs;`). Later references
    /// to `name` inside the model are replaced by `rhs`.
    pub fn declare_and_init_model_local_variable(&mut self, name: &str, rhs: NodeId) -> Result<SymbolId> {
        self.require_model("model local variable")?;
        let id = self.declare(name, SymbolKind::ModelLocalVariable, "")?;
        self.locals.insert(id, rhs);
        Ok(id)
    }

    /// Marks an endogenous variable as predetermined: its value at `t` is
    /// known at `t - 1`, so it is differentiated one period earlier.
    ///
    /// Only allowed before the model block, whose variable nodes carry the
    /// shift from the moment they are built.
    pub fn mark_predetermined(&mut self, name: &str) -> Result<()> {
        if self.model_seen {
            return Err(CompileError::Mode(format!(
                "'{name}' must be marked predetermined before the model block"
            )));
        }
        let id = self.resolve(name)?;
        if id.kind != SymbolKind::Endogenous {
            return Err(CompileError::Misuse(format!(
                "'{name}' is a {}, only endogenous variables can be predetermined",
                id.kind
            )));
        }
        self.predetermined.insert(id);
        Ok(())
    }

    // --- Blocks ---

    pub fn begin_model(&mut self) -> Result<()> {
        if self.mode == TreeMode::Model {
            return Err(CompileError::Mode("model block already open".into()));
        }
        if self.model_seen {
            return Err(CompileError::Mode("only one model block is allowed".into()));
        }
        self.mode = TreeMode::Model;
        self.model_seen = true;
        debug!("entered model block");
        Ok(())
    }

    pub fn end_model(&mut self) -> Result<()> {
        if self.mode != TreeMode::Model {
            return Err(CompileError::Mode("no model block to close".into()));
        }
        self.mode = TreeMode::Expressions;
        debug!(equations = self.model.len(), "left model block");
        Ok(())
    }

    fn require_model(&self, what: &str) -> Result<()> {
        match self.mode {
            TreeMode::Model => Ok(()),
            TreeMode::Expressions => Err(CompileError::Mode(format!(
                "{what} is only allowed inside the model block"
            ))),
        }
    }

    // --- Leaves ---

    pub fn add_constant(&mut self, text: &str) -> Result<NodeId> {
        let value: f64 = text.trim().parse().map_err(|_| CompileError::Syntax {
            message: format!("invalid number '{text}'"),
            location: self.location,
        })?;
        Ok(self.tree.constant(value))
    }

    fn resolve(&self, name: &str) -> Result<SymbolId> {
        self.tree
            .symbols()
            .lookup(name)
            .ok_or_else(|| CompileError::UnknownSymbol(name.to_string()))
    }

    /// Reference to `name` at time offset `lag` inside the model block.
    pub fn add_model_variable(&mut self, name: &str, lag: i32) -> Result<NodeId> {
        self.require_model("model variable")?;
        let id = self.resolve(name)?;
        match id.kind {
            SymbolKind::ModelLocalVariable => {
                if lag != 0 {
                    return Err(CompileError::Misuse(format!(
                        "model local variable '{name}' cannot be given a lag"
                    )));
                }
                self.locals
                    .get(&id)
                    .copied()
                    .ok_or_else(|| CompileError::UndefinedValue {
                        name: name.to_string(),
                        lag,
                    })
            }
            SymbolKind::Parameter if lag != 0 => Err(CompileError::Misuse(format!(
                "parameter '{name}' cannot be given a lag"
            ))),
            SymbolKind::UnknownFunction => Err(CompileError::Misuse(format!(
                "function '{name}' used as a variable"
            ))),
            _ => {
                let predetermined = self.predetermined.contains(&id);
                Ok(self.tree.variable(id, lag, predetermined))
            }
        }
    }

    /// Reference to `name` in an expression outside the model block.
    pub fn add_expression_variable(&mut self, name: &str) -> Result<NodeId> {
        let id = self.resolve(name)?;
        match id.kind {
            SymbolKind::ModelLocalVariable => Err(CompileError::Mode(format!(
                "model local variable '{name}' used outside the model block"
            ))),
            SymbolKind::UnknownFunction => Err(CompileError::Misuse(format!(
                "function '{name}' used as a variable"
            ))),
            _ => Ok(self.tree.variable(id, 0, false)),
        }
    }

    // --- Operators ---

    pub fn add_unary(&mut self, op: UnaryOp, arg: NodeId) -> NodeId {
        self.tree.unary(op, arg)
    }

    pub fn add_binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.tree.binary(op, left, right)
    }

    binary_builders! {
        add_plus => Add,
        add_minus => Subtract,
        add_times => Multiply,
        add_divide => Divide,
        add_power => Power,
        add_less => Less,
        add_greater => Greater,
        add_less_equal => LessEqual,
        add_greater_equal => GreaterEqual,
        add_equal_equal => Equal,
        add_different => NotEqual,
        add_max => Max,
        add_min => Min,
    }

    unary_builders! {
        add_uminus => Negate,
        add_exp => Exp,
        add_log => Log,
        add_log10 => Log10,
        add_sqrt => Sqrt,
        add_sin => Sin,
        add_cos => Cos,
        add_tan => Tan,
        add_asin => Asin,
        add_acos => Acos,
        add_atan => Atan,
        add_sinh => Sinh,
        add_cosh => Cosh,
        add_tanh => Tanh,
        add_asinh => Asinh,
        add_acosh => Acosh,
        add_atanh => Atanh,
    }

    pub fn add_normcdf(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> Result<NodeId> {
        self.tree.call(Function::NormCdf, vec![x, mu, sigma])
    }

    /// Call of a user function with no known analytic form. An undeclared
    /// name is declared on first use.
    pub fn add_unknown_function(&mut self, name: &str, args: Vec<NodeId>) -> Result<NodeId> {
        let id = match self.tree.symbols().lookup(name) {
            Some(id) if id.kind == SymbolKind::UnknownFunction => id,
            Some(_) => {
                return Err(CompileError::AlreadyDeclared {
                    name: name.to_string(),
                    conflicting_kind: true,
                })
            }
            None => self.declare_unknown_function(name)?,
        };
        self.tree.call(Function::External(id), args)
    }

    // --- Equations ---

    /// Adds `lhs = rhs` to the model and returns its residual node.
    pub fn add_model_equal(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.require_model("an equation")?;
        let index = self.model.add_equation(&mut self.tree, lhs, rhs);
        Ok(self.model.equations()[index].residual)
    }

    /// Adds `arg = 0`.
    pub fn add_model_equal_with_zero_rhs(&mut self, arg: NodeId) -> Result<NodeId> {
        let zero = self.tree.constant(0.0);
        self.add_model_equal(arg, zero)
    }

    // --- Compilation ---

    /// Differentiates the model and generates code.
    ///
    /// Each equation that cannot be differentiated is reported to the sink;
    /// the remaining equations are still processed, then the first such
    /// failure is returned.
    pub fn compile(&mut self) -> Result<CompiledModel> {
        if self.mode == TreeMode::Model {
            return Err(CompileError::Mode("model block is not closed".into()));
        }
        let endogenous = self.symbols().count(SymbolKind::Endogenous);
        if self.model.len() != endogenous {
            self.warning(format!(
                "model has {} equations for {} endogenous variables",
                self.model.len(),
                endogenous
            ));
        }
        self.namer.reset();

        let columns: Vec<DerivationVariable> = self
            .symbols()
            .ids(SymbolKind::Endogenous)
            .map(DerivationVariable::Symbol)
            .collect();
        let partial = self.model.partial_jacobian(&mut self.tree, &columns)?;
        let mut failures = self.report_failures(&partial);
        let static_part = self.with_hessian(partial)?;

        let dynamic_part = if self.options.dynamic {
            let columns = self.model.dynamic_columns();
            let partial = self
                .model
                .partial_jacobian(&mut self.tree, &columns.derivation_variables())?;
            failures.extend(self.report_failures(&partial));
            Some((columns, self.with_hessian(partial)?))
        } else {
            None
        };

        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }

        let compiled = assemble(
            &self.tree,
            &self.model,
            &static_part,
            dynamic_part.as_ref().map(|(columns, d)| (columns, d)),
            &self.options,
            &mut self.namer,
        )?;
        info!(
            equations = compiled.equations,
            nodes = self.tree.len(),
            temporaries = compiled.temporaries,
            "compiled model"
        );
        Ok(compiled)
    }

    fn report_failures(&mut self, partial: &PartialJacobian) -> Vec<CompileError> {
        for failure in &partial.failures {
            self.report(failure);
        }
        partial.failures.clone()
    }

    fn with_hessian(&mut self, partial: PartialJacobian) -> Result<Derivatives> {
        let hessian = if self.options.second_order() && partial.failures.is_empty() {
            Some(self.model.hessian(&mut self.tree, &partial.jacobian)?)
        } else {
            None
        };
        Ok(Derivatives {
            jacobian: partial.jacobian,
            hessian,
        })
    }
}

impl std::fmt::Debug for CompilationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationSession")
            .field("mode", &self.mode)
            .field("nodes", &self.tree.len())
            .field("equations", &self.model.len())
            .field("options", &self.options)
            .finish()
    }
}
