//! Hash-consed expression DAG.
//!
//! Nodes live in an append-only arena and are addressed by [`NodeId`]. Every
//! factory simplifies first and then looks the resulting node up in a
//! structural index, so a structurally identical request always returns the
//! existing id. Children are created before their parents, which makes the
//! ids themselves a topological order of the DAG.

use std::collections::{BTreeSet, HashMap};

use crate::derivatives::DerivativeCache;
use crate::error::{CompileError, Result};
use crate::symbol_table::{SymbolId, SymbolTable};

/// Handle of a node in a [`DataTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Exp,
    Log,
    Log10,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
}

impl UnaryOp {
    /// Function name shared by both output dialects (`None` for negation).
    pub fn function_name(self) -> Option<&'static str> {
        Some(match self {
            UnaryOp::Negate => return None,
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Log10 => "log10",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Asin => "asin",
            UnaryOp::Acos => "acos",
            UnaryOp::Atan => "atan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Asinh => "asinh",
            UnaryOp::Acosh => "acosh",
            UnaryOp::Atanh => "atanh",
        })
    }

    /// Reverse of [`UnaryOp::function_name`]; `ln` is accepted as an alias of `log`.
    pub fn from_function_name(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => UnaryOp::Exp,
            "log" | "ln" => UnaryOp::Log,
            "log10" => UnaryOp::Log10,
            "sqrt" => UnaryOp::Sqrt,
            "sin" => UnaryOp::Sin,
            "cos" => UnaryOp::Cos,
            "tan" => UnaryOp::Tan,
            "asin" => UnaryOp::Asin,
            "acos" => UnaryOp::Acos,
            "atan" => UnaryOp::Atan,
            "sinh" => UnaryOp::Sinh,
            "cosh" => UnaryOp::Cosh,
            "tanh" => UnaryOp::Tanh,
            "asinh" => UnaryOp::Asinh,
            "acosh" => UnaryOp::Acosh,
            "atanh" => UnaryOp::Atanh,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Equal,
    NotEqual,
    Max,
    Min,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Less
                | BinaryOp::Greater
                | BinaryOp::LessEqual
                | BinaryOp::GreaterEqual
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }
}

/// Callee of an N-ary call node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    /// `normcdf(x, mu, sigma)`
    NormCdf,
    /// A declared unknown function, by symbol.
    External(SymbolId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    /// Bit pattern of the value, with `-0.0` folded into `0.0`.
    Constant(u64),
    Variable {
        symbol: SymbolId,
        lag: i32,
        predetermined: bool,
    },
    Unary {
        op: UnaryOp,
        arg: NodeId,
    },
    Binary {
        op: BinaryOp,
        left: NodeId,
        right: NodeId,
    },
    Call {
        function: Function,
        args: Vec<NodeId>,
    },
}

impl Node {
    fn constant(value: f64) -> Self {
        let value = if value == 0.0 { 0.0 } else { value };
        Node::Constant(value.to_bits())
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Node::Constant(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Child ids in argument order.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Node::Constant(_) | Node::Variable { .. } => Vec::new(),
            Node::Unary { arg, .. } => vec![*arg],
            Node::Binary { left, right, .. } => vec![*left, *right],
            Node::Call { args, .. } => args.clone(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Constant(_) | Node::Variable { .. })
    }
}

/// Arena of expression nodes plus the symbol table they refer to.
#[derive(Debug, Default)]
pub struct DataTree {
    symbols: SymbolTable,
    nodes: Vec<Node>,
    index: HashMap<Node, NodeId>,
    pub(crate) derivatives: DerivativeCache,
}

impl DataTree {
    pub fn new(symbols: SymbolTable) -> Self {
        Self {
            symbols,
            ..Self::default()
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Number of distinct nodes stored.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn constant_value(&self, id: NodeId) -> Option<f64> {
        self.node(id).as_constant()
    }

    pub fn is_constant(&self, id: NodeId, value: f64) -> bool {
        self.constant_value(id) == Some(value)
    }

    pub fn is_zero(&self, id: NodeId) -> bool {
        self.is_constant(id, 0.0)
    }

    fn intern(&mut self, node: Node) -> NodeId {
        if let Some(&id) = self.index.get(&node) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node.clone());
        self.index.insert(node, id);
        id
    }

    // --- Factories ---

    pub fn constant(&mut self, value: f64) -> NodeId {
        self.intern(Node::constant(value))
    }

    pub fn variable(&mut self, symbol: SymbolId, lag: i32, predetermined: bool) -> NodeId {
        self.intern(Node::Variable {
            symbol,
            lag,
            predetermined,
        })
    }

    pub fn unary(&mut self, op: UnaryOp, arg: NodeId) -> NodeId {
        if let Some(value) = self.constant_value(arg) {
            if let Ok(folded) = crate::evaluate::apply_unary(op, value) {
                if folded.is_finite() {
                    return self.constant(folded);
                }
            }
        }
        if op == UnaryOp::Negate {
            if let Node::Unary {
                op: UnaryOp::Negate,
                arg: inner,
            } = *self.node(arg)
            {
                return inner;
            }
        }
        self.intern(Node::Unary { op, arg })
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        if let Some(id) = self.simplify_binary(op, left, right) {
            return id;
        }
        self.intern(Node::Binary { op, left, right })
    }

    fn simplify_binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> Option<NodeId> {
        let l = self.constant_value(left);
        let r = self.constant_value(right);

        if let (Some(a), Some(b)) = (l, r) {
            if let Ok(folded) = crate::evaluate::apply_binary(op, a, b) {
                if folded.is_finite() {
                    return Some(self.constant(folded));
                }
            }
        }

        match op {
            BinaryOp::Add => {
                if l == Some(0.0) {
                    return Some(right);
                }
                if r == Some(0.0) {
                    return Some(left);
                }
            }
            BinaryOp::Subtract => {
                if r == Some(0.0) {
                    return Some(left);
                }
                if l == Some(0.0) {
                    return Some(self.unary(UnaryOp::Negate, right));
                }
                if left == right {
                    return Some(self.constant(0.0));
                }
            }
            BinaryOp::Multiply => {
                if l == Some(0.0) || r == Some(0.0) {
                    return Some(self.constant(0.0));
                }
                if l == Some(1.0) {
                    return Some(right);
                }
                if r == Some(1.0) {
                    return Some(left);
                }
            }
            BinaryOp::Divide => {
                if l == Some(0.0) && r != Some(0.0) {
                    return Some(self.constant(0.0));
                }
                if r == Some(1.0) {
                    return Some(left);
                }
            }
            BinaryOp::Power => {
                if r == Some(1.0) {
                    return Some(left);
                }
                if r == Some(0.0) || l == Some(1.0) {
                    return Some(self.constant(1.0));
                }
            }
            _ => {}
        }
        None
    }

    /// Builds a call node. `normcdf` must receive exactly three arguments.
    pub fn call(&mut self, function: Function, args: Vec<NodeId>) -> Result<NodeId> {
        if function == Function::NormCdf {
            if args.len() != 3 {
                return Err(CompileError::Arity {
                    function: "normcdf".to_string(),
                    expected: 3,
                    found: args.len(),
                });
            }
            let values: Option<Vec<f64>> = args.iter().map(|&a| self.constant_value(a)).collect();
            if let Some(v) = values {
                if let Ok(folded) = crate::evaluate::normcdf(v[0], v[1], v[2]) {
                    return Ok(self.constant(folded));
                }
            }
        }
        Ok(self.intern(Node::Call { function, args }))
    }

    // --- Convenience wrappers ---

    pub fn add(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Add, left, right)
    }

    pub fn sub(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Subtract, left, right)
    }

    pub fn mul(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Multiply, left, right)
    }

    pub fn div(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Divide, left, right)
    }

    pub fn pow(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Power, left, right)
    }

    pub fn neg(&mut self, arg: NodeId) -> NodeId {
        self.unary(UnaryOp::Negate, arg)
    }

    pub fn exp(&mut self, arg: NodeId) -> NodeId {
        self.unary(UnaryOp::Exp, arg)
    }

    pub fn log(&mut self, arg: NodeId) -> NodeId {
        self.unary(UnaryOp::Log, arg)
    }

    pub fn sqrt(&mut self, arg: NodeId) -> NodeId {
        self.unary(UnaryOp::Sqrt, arg)
    }

    // --- Queries ---

    /// Distinct variable symbols reachable from `id`.
    pub fn free_variables(&self, id: NodeId) -> BTreeSet<SymbolId> {
        self.occurrences(id).into_iter().map(|(symbol, _)| symbol).collect()
    }

    /// Distinct `(symbol, effective lag)` pairs reachable from `id`.
    ///
    /// A predetermined variable written at lag `l` is reported at `l - 1`.
    pub fn occurrences(&self, id: NodeId) -> BTreeSet<(SymbolId, i32)> {
        let mut found = BTreeSet::new();
        for node in self.reachable(&[id]) {
            if let Node::Variable {
                symbol,
                lag,
                predetermined,
            } = *self.node(node)
            {
                found.insert((symbol, effective_lag(lag, predetermined)));
            }
        }
        found
    }

    /// Every node reachable from `roots`, in ascending id order.
    pub fn reachable(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            stack.extend(self.node(id).children());
        }
        seen.iter()
            .enumerate()
            .filter(|&(_, &s)| s)
            .map(|(i, _)| NodeId(i))
            .collect()
    }
}

pub(crate) fn effective_lag(lag: i32, predetermined: bool) -> i32 {
    if predetermined {
        lag - 1
    } else {
        lag
    }
}
