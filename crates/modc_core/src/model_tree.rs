//! Model equations carried alongside a [`DataTree`], with incidence tracking
//! and derivative matrices.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CooMatrix;
use tracing::{debug, info};

use crate::data_tree::{DataTree, NodeId};
use crate::derivatives::DerivationVariable;
use crate::error::{CompileError, Result};
use crate::evaluate::Environment;
use crate::symbol_table::{SymbolId, SymbolKind};

/// `lhs = rhs`, stored with its normalized residual `lhs - rhs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equation {
    pub lhs: NodeId,
    pub rhs: NodeId,
    pub residual: NodeId,
}

/// Nonzero entry of a first-derivative matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JacobianEntry {
    pub row: usize,
    pub col: usize,
    pub node: NodeId,
}

/// Sparse Jacobian in row-major order; identically-zero entries are omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    pub rows: usize,
    pub columns: Vec<DerivationVariable>,
    pub entries: Vec<JacobianEntry>,
}

impl Jacobian {
    pub fn cols(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|e| e.row == row && e.col == col)
            .map(|e| e.node)
    }
}

/// Jacobian rows that could be built, plus the failures of the rows that could not.
#[derive(Debug, Clone)]
pub struct PartialJacobian {
    pub jacobian: Jacobian,
    pub failures: Vec<CompileError>,
}

/// Nonzero second derivative, stored once per symmetric pair (`col1 <= col2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HessianEntry {
    pub row: usize,
    pub col1: usize,
    pub col2: usize,
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hessian {
    pub rows: usize,
    pub cols: usize,
    pub entries: Vec<HessianEntry>,
}

/// Column layout of the dynamic model.
///
/// Endogenous `(symbol, lag)` pairs come first, lag-major then by ordinal;
/// exogenous and deterministic exogenous pairs follow in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicColumns {
    columns: Vec<(SymbolId, i32)>,
    index: HashMap<(SymbolId, i32), usize>,
}

impl DynamicColumns {
    fn from_pairs(pairs: Vec<(SymbolId, i32)>) -> Self {
        let index = pairs.iter().enumerate().map(|(i, &p)| (p, i)).collect();
        Self {
            columns: pairs,
            index,
        }
    }

    pub fn column_of(&self, symbol: SymbolId, lag: i32) -> Option<usize> {
        self.index.get(&(symbol, lag)).copied()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn pairs(&self) -> &[(SymbolId, i32)] {
        &self.columns
    }

    pub fn derivation_variables(&self) -> Vec<DerivationVariable> {
        self.columns
            .iter()
            .map(|&(symbol, lag)| DerivationVariable::Lagged(symbol, lag))
            .collect()
    }
}

/// Equation list and incidence for the model block.
#[derive(Debug, Clone, Default)]
pub struct ModelExtension {
    equations: Vec<Equation>,
    incidence: Vec<BTreeSet<(SymbolId, i32)>>,
}

impl ModelExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `lhs = rhs`; the returned index is the equation's Jacobian row.
    pub fn add_equation(&mut self, tree: &mut DataTree, lhs: NodeId, rhs: NodeId) -> usize {
        let residual = tree.sub(lhs, rhs);
        let index = self.equations.len();
        self.equations.push(Equation { lhs, rhs, residual });
        self.incidence.push(tree.occurrences(residual));
        debug!(equation = index, nodes = tree.len(), "added equation");
        index
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn len(&self) -> usize {
        self.equations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }

    /// `(equation, symbol, effective lag)` triples, sorted.
    pub fn incidence(&self) -> Vec<(usize, SymbolId, i32)> {
        self.incidence
            .iter()
            .enumerate()
            .flat_map(|(eq, set)| set.iter().map(move |&(symbol, lag)| (eq, symbol, lag)))
            .collect()
    }

    pub fn equation_incidence(&self, equation: usize) -> Option<&BTreeSet<(SymbolId, i32)>> {
        self.incidence.get(equation)
    }

    /// Jacobian with respect to `variables`, each taken at any lag.
    pub fn jacobian(&self, tree: &mut DataTree, variables: &[SymbolId]) -> Result<Jacobian> {
        let columns: Vec<_> = variables.iter().map(|&v| DerivationVariable::Symbol(v)).collect();
        self.jacobian_over(tree, &columns)
    }

    /// Static-model Jacobian: one column per endogenous variable, by ordinal.
    pub fn static_jacobian(&self, tree: &mut DataTree) -> Result<Jacobian> {
        let endogenous: Vec<_> = tree.symbols().ids(SymbolKind::Endogenous).collect();
        self.jacobian(tree, &endogenous)
    }

    pub fn dynamic_columns(&self) -> DynamicColumns {
        let mut endogenous = BTreeSet::new();
        let mut exogenous = BTreeSet::new();
        for set in &self.incidence {
            for &(symbol, lag) in set {
                match symbol.kind {
                    SymbolKind::Endogenous => {
                        endogenous.insert((lag, symbol));
                    }
                    SymbolKind::Exogenous | SymbolKind::ExogenousDeterministic => {
                        exogenous.insert((lag, symbol));
                    }
                    _ => {}
                }
            }
        }
        let pairs = endogenous
            .into_iter()
            .chain(exogenous)
            .map(|(lag, symbol)| (symbol, lag))
            .collect();
        DynamicColumns::from_pairs(pairs)
    }

    pub fn dynamic_jacobian(&self, tree: &mut DataTree, columns: &DynamicColumns) -> Result<Jacobian> {
        self.jacobian_over(tree, &columns.derivation_variables())
    }

    /// Jacobian over arbitrary columns; fails with the first equation that
    /// cannot be differentiated.
    pub fn jacobian_over(&self, tree: &mut DataTree, columns: &[DerivationVariable]) -> Result<Jacobian> {
        let partial = self.partial_jacobian(tree, columns)?;
        match partial.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(partial.jacobian),
        }
    }

    /// Builds every row it can. A `NonDifferentiable` failure abandons only
    /// its own equation and is returned in `failures`; other errors abort.
    pub fn partial_jacobian(
        &self,
        tree: &mut DataTree,
        columns: &[DerivationVariable],
    ) -> Result<PartialJacobian> {
        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for (row, equation) in self.equations.iter().enumerate() {
            match self.jacobian_row(tree, row, equation.residual, columns) {
                Ok(mut row_entries) => entries.append(&mut row_entries),
                Err(err @ CompileError::NonDifferentiable { .. }) => failures.push(err.in_equation(row)),
                Err(err) => return Err(err),
            }
        }
        info!(
            rows = self.equations.len(),
            cols = columns.len(),
            nonzeros = entries.len(),
            "computed jacobian"
        );
        Ok(PartialJacobian {
            jacobian: Jacobian {
                rows: self.equations.len(),
                columns: columns.to_vec(),
                entries,
            },
            failures,
        })
    }

    fn jacobian_row(
        &self,
        tree: &mut DataTree,
        row: usize,
        residual: NodeId,
        columns: &[DerivationVariable],
    ) -> Result<Vec<JacobianEntry>> {
        let mut entries = Vec::new();
        for (col, &wrt) in columns.iter().enumerate() {
            let node = tree.differentiate(residual, wrt)?;
            if !tree.is_zero(node) {
                entries.push(JacobianEntry { row, col, node });
            }
        }
        Ok(entries)
    }

    /// Second derivatives of every residual over the Jacobian's columns.
    pub fn hessian(&self, tree: &mut DataTree, jacobian: &Jacobian) -> Result<Hessian> {
        let mut entries = Vec::new();
        for entry in &jacobian.entries {
            for col2 in entry.col..jacobian.cols() {
                let node = tree
                    .differentiate(entry.node, jacobian.columns[col2])
                    .map_err(|e| e.in_equation(entry.row))?;
                if !tree.is_zero(node) {
                    entries.push(HessianEntry {
                        row: entry.row,
                        col1: entry.col,
                        col2,
                        node,
                    });
                }
            }
        }
        info!(nonzeros = entries.len(), "computed hessian");
        Ok(Hessian {
            rows: jacobian.rows,
            cols: jacobian.cols(),
            entries,
        })
    }

    pub fn evaluate_residuals(&self, tree: &DataTree, env: &Environment<f64>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.equations.len());
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = tree.evaluate(eq.residual, env)?;
        }
        Ok(out)
    }

    pub fn evaluate_jacobian(
        &self,
        tree: &DataTree,
        jacobian: &Jacobian,
        env: &Environment<f64>,
    ) -> Result<DMatrix<f64>> {
        let mut out = DMatrix::zeros(jacobian.rows, jacobian.cols());
        for entry in &jacobian.entries {
            out[(entry.row, entry.col)] = tree.evaluate(entry.node, env)?;
        }
        Ok(out)
    }

    pub fn evaluate_jacobian_sparse(
        &self,
        tree: &DataTree,
        jacobian: &Jacobian,
        env: &Environment<f64>,
    ) -> Result<CooMatrix<f64>> {
        let mut out = CooMatrix::new(jacobian.rows, jacobian.cols());
        for entry in &jacobian.entries {
            out.push(entry.row, entry.col, tree.evaluate(entry.node, env)?);
        }
        Ok(out)
    }
}
