//! Deterministic printing of DAG nodes in the supported output dialects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::data_tree::{BinaryOp, DataTree, Function, Node, NodeId, UnaryOp};
use crate::model_tree::DynamicColumns;
use crate::symbol_table::{SymbolId, SymbolKind};

/// Output syntax of generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Numerical scripting syntax, 1-based arrays.
    #[default]
    Matlab,
    /// C syntax, 0-based arrays.
    C,
}

impl Dialect {
    /// Index written for a 0-based position.
    pub fn index(self, zero_based: usize) -> usize {
        match self {
            Dialect::Matlab => zero_based + 1,
            Dialect::C => zero_based,
        }
    }

    pub fn comment(self, text: &str) -> String {
        match self {
            Dialect::Matlab => format!("% {text}"),
            Dialect::C => format!("/* {text} */"),
        }
    }
}

/// How variable references are spelled.
#[derive(Debug, Clone, Copy)]
pub enum VariableStyle<'a> {
    /// Model-language names, lags as `x(-1)`.
    Names,
    /// Static-model arrays: `y`, `x`, `params`.
    Static,
    /// Dynamic-model arrays: endogenous by dynamic column, exogenous by period.
    Dynamic(&'a DynamicColumns),
}

const PREC_EQUALITY: u8 = 1;
const PREC_RELATIONAL: u8 = 2;
const PREC_ADDITIVE: u8 = 3;
const PREC_MULTIPLICATIVE: u8 = 4;
const PREC_UNARY: u8 = 5;
const PREC_POWER: u8 = 6;
const PREC_ATOM: u8 = 100;

/// Formats a constant so that both dialects parse it back to the same value.
pub fn format_number(value: f64, dialect: Dialect) -> String {
    if value.is_nan() {
        return match dialect {
            Dialect::Matlab => "NaN".to_string(),
            Dialect::C => "NAN".to_string(),
        };
    }
    if value.is_infinite() {
        let inf = match dialect {
            Dialect::Matlab => "Inf",
            Dialect::C => "INFINITY",
        };
        return if value > 0.0 { inf.to_string() } else { format!("-{inf}") };
    }
    let magnitude = value.abs();
    if value.fract() == 0.0 && magnitude < 1e15 {
        format!("{}", value as i64)
    } else if magnitude >= 1e-4 && magnitude < 1e15 {
        format!("{value}")
    } else {
        format!("{value:e}")
    }
}

pub(crate) struct Printer<'a> {
    tree: &'a DataTree,
    dialect: Dialect,
    style: VariableStyle<'a>,
    temporaries: Option<&'a HashMap<NodeId, String>>,
}

impl<'a> Printer<'a> {
    pub(crate) fn new(tree: &'a DataTree, dialect: Dialect, style: VariableStyle<'a>) -> Self {
        Self {
            tree,
            dialect,
            style,
            temporaries: None,
        }
    }

    pub(crate) fn with_temporaries(mut self, temporaries: &'a HashMap<NodeId, String>) -> Self {
        self.temporaries = Some(temporaries);
        self
    }

    fn temporary(&self, id: NodeId) -> Option<&'a String> {
        self.temporaries.and_then(|t| t.get(&id))
    }

    fn precedence(&self, id: NodeId) -> u8 {
        if self.temporary(id).is_some() {
            return PREC_ATOM;
        }
        match self.tree.node(id) {
            Node::Constant(_) => match self.tree.constant_value(id) {
                Some(v) if v < 0.0 => PREC_UNARY,
                _ => PREC_ATOM,
            },
            Node::Variable { .. } | Node::Call { .. } => PREC_ATOM,
            Node::Unary { op: UnaryOp::Negate, .. } => PREC_UNARY,
            Node::Unary { .. } => PREC_ATOM,
            Node::Binary { op, .. } => binary_precedence(*op, self.dialect),
        }
    }

    fn is_negative(&self, id: NodeId) -> bool {
        self.temporary(id).is_none() && self.precedence(id) == PREC_UNARY
    }

    /// Prints `id`, substituting temporaries for its descendants but not for `id` itself.
    pub(crate) fn definition(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    /// Prints `id`, or its temporary name when it has one.
    pub(crate) fn reference(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_operand(id, &mut out);
        out
    }

    fn write_operand(&self, id: NodeId, out: &mut String) {
        match self.temporary(id) {
            Some(name) => out.push_str(name),
            None => self.write_node(id, out),
        }
    }

    fn write_wrapped(&self, id: NodeId, parens: bool, out: &mut String) {
        if parens {
            out.push('(');
            self.write_operand(id, out);
            out.push(')');
        } else {
            self.write_operand(id, out);
        }
    }

    fn write_args(&self, name: &str, args: &[NodeId], out: &mut String) {
        out.push_str(name);
        out.push('(');
        for (i, &arg) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.write_operand(arg, out);
        }
        out.push(')');
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match self.tree.node(id) {
            Node::Constant(_) => {
                let value = self.tree.constant_value(id).unwrap_or(f64::NAN);
                out.push_str(&format_number(value, self.dialect));
            }
            Node::Variable {
                symbol,
                lag,
                predetermined,
            } => out.push_str(&self.variable(*symbol, *lag, *predetermined)),
            Node::Unary { op: UnaryOp::Negate, arg } => {
                out.push('-');
                self.write_wrapped(*arg, self.precedence(*arg) <= PREC_UNARY, out);
            }
            Node::Unary { op, arg } => {
                let name = op.function_name().unwrap_or_default();
                self.write_args(name, &[*arg], out);
            }
            Node::Binary { op, left, right } => self.write_binary(*op, *left, *right, out),
            Node::Call { function, args } => {
                let name = match function {
                    Function::NormCdf => "normcdf",
                    Function::External(symbol) => self.tree.symbols().name_of(*symbol).unwrap_or("?"),
                };
                self.write_args(name, args, out);
            }
        }
    }

    fn write_binary(&self, op: BinaryOp, left: NodeId, right: NodeId, out: &mut String) {
        let infix = match (op, self.dialect) {
            (BinaryOp::Add, _) => " + ",
            (BinaryOp::Subtract, _) => " - ",
            (BinaryOp::Multiply, _) => "*",
            (BinaryOp::Divide, _) => "/",
            (BinaryOp::Power, Dialect::Matlab) => "^",
            (BinaryOp::Power, Dialect::C) => return self.write_args("pow", &[left, right], out),
            (BinaryOp::Less, _) => " < ",
            (BinaryOp::Greater, _) => " > ",
            (BinaryOp::LessEqual, _) => " <= ",
            (BinaryOp::GreaterEqual, _) => " >= ",
            (BinaryOp::Equal, _) => " == ",
            (BinaryOp::NotEqual, Dialect::Matlab) => " ~= ",
            (BinaryOp::NotEqual, Dialect::C) => " != ",
            (BinaryOp::Max, Dialect::Matlab) => return self.write_args("max", &[left, right], out),
            (BinaryOp::Max, Dialect::C) => return self.write_args("fmax", &[left, right], out),
            (BinaryOp::Min, Dialect::Matlab) => return self.write_args("min", &[left, right], out),
            (BinaryOp::Min, Dialect::C) => return self.write_args("fmin", &[left, right], out),
        };

        let prec = binary_precedence(op, self.dialect);
        let associative = matches!(op, BinaryOp::Add | BinaryOp::Multiply);
        let left_prec = self.precedence(left);
        let left_parens = if op == BinaryOp::Power {
            left_prec <= prec
        } else {
            left_prec < prec
        };
        let right_prec = self.precedence(right);
        let right_parens = self.is_negative(right)
            || right_prec < prec
            || (!associative && right_prec == prec);

        self.write_wrapped(left, left_parens, out);
        out.push_str(infix);
        self.write_wrapped(right, right_parens, out);
    }

    fn variable(&self, symbol: SymbolId, lag: i32, predetermined: bool) -> String {
        let symbols = self.tree.symbols();
        let name = symbols.name_of(symbol).unwrap_or("?");
        let d = self.dialect;
        let ord = symbol.ordinal;
        let exo_offset = match symbol.kind {
            SymbolKind::ExogenousDeterministic => symbols.count(SymbolKind::Exogenous),
            _ => 0,
        };
        let array = |array: &str, position: usize| match d {
            Dialect::Matlab => format!("{array}({})", d.index(position)),
            Dialect::C => format!("{array}[{}]", d.index(position)),
        };
        let named = || {
            if lag == 0 {
                name.to_string()
            } else {
                format!("{name}({lag})")
            }
        };

        match (self.style, symbol.kind) {
            (VariableStyle::Names, _) => named(),
            (_, SymbolKind::Parameter) => array("params", ord),
            (VariableStyle::Static, SymbolKind::Endogenous) => array("y", ord),
            (VariableStyle::Static, SymbolKind::Exogenous | SymbolKind::ExogenousDeterministic) => {
                array("x", exo_offset + ord)
            }
            (VariableStyle::Static, SymbolKind::RecursiveVariable) => array("recur", ord),
            (VariableStyle::Dynamic(columns), SymbolKind::Endogenous) => {
                let lag = crate::data_tree::effective_lag(lag, predetermined);
                match columns.column_of(symbol, lag) {
                    Some(col) => array("y", col),
                    None => named(),
                }
            }
            (VariableStyle::Dynamic(_), SymbolKind::Exogenous | SymbolKind::ExogenousDeterministic) => {
                let period = match lag {
                    0 => "it_".to_string(),
                    l if l > 0 => format!("it_+{l}"),
                    l => format!("it_{l}"),
                };
                match d {
                    Dialect::Matlab => format!("x({period}, {})", d.index(exo_offset + ord)),
                    Dialect::C => format!("x[{period}+nb_row_x*{}]", exo_offset + ord),
                }
            }
            _ => named(),
        }
    }
}

fn binary_precedence(op: BinaryOp, dialect: Dialect) -> u8 {
    match op {
        // Matlab puts every comparison on one left-associative level.
        BinaryOp::Equal | BinaryOp::NotEqual => match dialect {
            Dialect::Matlab => PREC_RELATIONAL,
            Dialect::C => PREC_EQUALITY,
        },
        BinaryOp::Less | BinaryOp::Greater | BinaryOp::LessEqual | BinaryOp::GreaterEqual => {
            PREC_RELATIONAL
        }
        BinaryOp::Add | BinaryOp::Subtract => PREC_ADDITIVE,
        BinaryOp::Multiply | BinaryOp::Divide => PREC_MULTIPLICATIVE,
        BinaryOp::Power => match dialect {
            Dialect::Matlab => PREC_POWER,
            Dialect::C => PREC_ATOM,
        },
        BinaryOp::Max | BinaryOp::Min => PREC_ATOM,
    }
}

impl DataTree {
    /// Prints `id` with symbol names, e.g. `alpha*k(-1) + c`.
    pub fn render(&self, id: NodeId, dialect: Dialect) -> String {
        self.render_with(id, dialect, VariableStyle::Names)
    }

    pub fn render_with(&self, id: NodeId, dialect: Dialect, style: VariableStyle<'_>) -> String {
        Printer::new(self, dialect, style).definition(id)
    }
}
