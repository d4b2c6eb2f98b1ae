//! Numeric evaluation of DAG nodes.
//!
//! Undefined operations are reported as errors instead of producing NaN, so a
//! bad value never slips silently into a Jacobian.

use std::collections::HashMap;

use crate::data_tree::{BinaryOp, DataTree, Function, Node, NodeId, UnaryOp};
use crate::error::{CompileError, Result};
use crate::symbol_table::SymbolId;
use crate::traits::Scalar;

/// Values of variables and parameters, keyed by symbol and written lag.
#[derive(Debug, Clone)]
pub struct Environment<T: Scalar> {
    values: HashMap<(SymbolId, i32), T>,
}

impl<T: Scalar> Default for Environment<T> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
        }
    }
}

impl<T: Scalar> Environment<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, symbol: SymbolId, lag: i32, value: T) {
        self.values.insert((symbol, lag), value);
    }

    /// Builder-style [`Environment::set`].
    pub fn with(mut self, symbol: SymbolId, lag: i32, value: T) -> Self {
        self.set(symbol, lag, value);
        self
    }

    pub fn get(&self, symbol: SymbolId, lag: i32) -> Option<T> {
        self.values.get(&(symbol, lag)).copied()
    }
}

fn lit<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap()
}

fn flag<T: Scalar>(condition: bool) -> T {
    if condition {
        T::one()
    } else {
        T::zero()
    }
}

fn domain_error<T: Scalar>(operation: &str, value: T) -> CompileError {
    CompileError::DomainError {
        operation: operation.to_string(),
        value: value.to_f64().unwrap_or(f64::NAN),
    }
}

/// Rejects overflow and NaN produced by `operation` on argument `arg`.
fn finite<T: Scalar>(operation: &str, arg: T, value: T) -> Result<T> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(domain_error(operation, arg))
    }
}

fn binary_operation_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "addition",
        BinaryOp::Subtract => "subtraction",
        BinaryOp::Multiply => "multiplication",
        BinaryOp::Divide => "division",
        BinaryOp::Power => "power",
        BinaryOp::Less
        | BinaryOp::Greater
        | BinaryOp::LessEqual
        | BinaryOp::GreaterEqual
        | BinaryOp::Equal
        | BinaryOp::NotEqual => "comparison",
        BinaryOp::Max => "max",
        BinaryOp::Min => "min",
    }
}

pub(crate) fn apply_unary<T: Scalar>(op: UnaryOp, a: T) -> Result<T> {
    let one = T::one();
    let value = match op {
        UnaryOp::Negate => -a,
        UnaryOp::Exp => a.exp(),
        UnaryOp::Log if a <= T::zero() => return Err(domain_error("log", a)),
        UnaryOp::Log => a.ln(),
        UnaryOp::Log10 if a <= T::zero() => return Err(domain_error("log10", a)),
        UnaryOp::Log10 => a.log10(),
        UnaryOp::Sqrt if a < T::zero() => return Err(domain_error("sqrt", a)),
        UnaryOp::Sqrt => a.sqrt(),
        UnaryOp::Sin => a.sin(),
        UnaryOp::Cos => a.cos(),
        UnaryOp::Tan => a.tan(),
        UnaryOp::Asin if a.abs() > one => return Err(domain_error("asin", a)),
        UnaryOp::Asin => a.asin(),
        UnaryOp::Acos if a.abs() > one => return Err(domain_error("acos", a)),
        UnaryOp::Acos => a.acos(),
        UnaryOp::Atan => a.atan(),
        UnaryOp::Sinh => a.sinh(),
        UnaryOp::Cosh => a.cosh(),
        UnaryOp::Tanh => a.tanh(),
        UnaryOp::Asinh => a.asinh(),
        UnaryOp::Acosh if a < one => return Err(domain_error("acosh", a)),
        UnaryOp::Acosh => a.acosh(),
        UnaryOp::Atanh if a.abs() >= one => return Err(domain_error("atanh", a)),
        UnaryOp::Atanh => a.atanh(),
    };
    finite(op.function_name().unwrap_or("negation"), a, value)
}

pub(crate) fn apply_binary<T: Scalar>(op: BinaryOp, a: T, b: T) -> Result<T> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if b == T::zero() => return Err(CompileError::DivisionByZero),
        BinaryOp::Divide => a / b,
        BinaryOp::Power => power(a, b)?,
        BinaryOp::Less => flag(a < b),
        BinaryOp::Greater => flag(a > b),
        BinaryOp::LessEqual => flag(a <= b),
        BinaryOp::GreaterEqual => flag(a >= b),
        BinaryOp::Equal => flag(a == b),
        BinaryOp::NotEqual => flag(a != b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Min => a.min(b),
    };
    finite(binary_operation_name(op), a, value)
}

fn power<T: Scalar>(base: T, exponent: T) -> Result<T> {
    if base == T::zero() && exponent < T::zero() {
        return Err(CompileError::DivisionByZero);
    }
    if base < T::zero() && exponent.fract() != T::zero() {
        return Err(domain_error("power of a negative base", base));
    }
    Ok(base.powf(exponent))
}

/// Cumulative normal distribution with mean `mu` and standard deviation `sigma`.
pub(crate) fn normcdf<T: Scalar>(x: T, mu: T, sigma: T) -> Result<T> {
    if sigma <= T::zero() {
        return Err(domain_error("normcdf", sigma));
    }
    let z = (x - mu) / (sigma * lit::<T>(std::f64::consts::SQRT_2));
    finite("normcdf", x, lit::<T>(0.5) * erfc(-z))
}

/// Complementary error function, Chebyshev fit with fractional error below 1.2e-7.
fn erfc<T: Scalar>(x: T) -> T {
    const COEFFS: [f64; 10] = [
        -1.26551223,
        1.00002368,
        0.37409196,
        0.09678418,
        -0.18628806,
        0.27886807,
        -1.13520398,
        1.48851587,
        -0.82215223,
        0.17087277,
    ];
    let z = x.abs();
    let t = T::one() / (T::one() + lit::<T>(0.5) * z);
    let mut poly = T::zero();
    for &c in COEFFS.iter().rev() {
        poly = lit::<T>(c) + t * poly;
    }
    let ans = t * (-z * z + poly).exp();
    if x >= T::zero() {
        ans
    } else {
        lit::<T>(2.0) - ans
    }
}

impl DataTree {
    /// Evaluates `id` given values for every variable and parameter it references.
    ///
    /// Shared subexpressions are computed once: nodes are visited in ascending
    /// id order, which puts every child before its parents.
    pub fn evaluate<T: Scalar>(&self, id: NodeId, env: &Environment<T>) -> Result<T> {
        let order = self.reachable(&[id]);
        let mut values: HashMap<NodeId, T> = HashMap::with_capacity(order.len());
        for node_id in order {
            let value = match self.node(node_id) {
                Node::Constant(_) => lit(self.constant_value(node_id).unwrap_or(f64::NAN)),
                Node::Variable { symbol, lag, .. } => match env.get(*symbol, *lag) {
                    Some(v) if v.is_finite() => v,
                    Some(v) => return Err(domain_error(self.symbols().name_of(*symbol)?, v)),
                    None => {
                        return Err(CompileError::UndefinedValue {
                            name: self.symbols().name_of(*symbol)?.to_string(),
                            lag: *lag,
                        })
                    }
                },
                Node::Unary { op, arg } => apply_unary(*op, values[arg])?,
                Node::Binary { op, left, right } => apply_binary(*op, values[left], values[right])?,
                Node::Call { function, args } => match function {
                    Function::NormCdf => normcdf(values[&args[0]], values[&args[1]], values[&args[2]])?,
                    Function::External(symbol) => {
                        return Err(CompileError::NonEvaluable(
                            self.symbols().name_of(*symbol)?.to_string(),
                        ))
                    }
                },
            };
            values.insert(node_id, value);
        }
        Ok(values[&id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_table::{SymbolKind, SymbolTable};
    use proptest::prelude::*;

    fn setup() -> (DataTree, SymbolId, NodeId) {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        (tree, x, xn)
    }

    #[test]
    fn evaluates_nested_expression() {
        let (mut tree, x, xn) = setup();
        let two = tree.constant(2.0);
        let sq = tree.pow(xn, two);
        let e = tree.exp(xn);
        let sum = tree.add(sq, e);
        let env = Environment::new().with(x, 0, 1.5);
        let value = tree.evaluate(sum, &env).unwrap();
        assert!((value - (2.25 + 1.5f64.exp())).abs() < 1e-12);
    }

    #[test]
    fn missing_value_names_the_variable_and_lag() {
        let mut symbols = SymbolTable::new();
        let k = symbols.declare("k", SymbolKind::Endogenous, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let lagged = tree.variable(k, -1, false);
        let env = Environment::new().with(k, 0, 1.0);
        assert_eq!(
            tree.evaluate(lagged, &env).unwrap_err(),
            CompileError::UndefinedValue {
                name: "k".into(),
                lag: -1
            }
        );
    }

    #[test]
    fn undefined_operations_are_reported() {
        let (mut tree, x, xn) = setup();
        let zero = tree.constant(0.0);
        let ratio = tree.div(xn, zero);
        let log = tree.log(xn);
        let root = tree.sqrt(xn);
        let half = tree.constant(0.5);
        let frac_pow = tree.pow(xn, half);

        let env = Environment::new().with(x, 0, -4.0);
        assert_eq!(tree.evaluate(ratio, &env).unwrap_err(), CompileError::DivisionByZero);
        assert!(matches!(
            tree.evaluate(log, &env),
            Err(CompileError::DomainError { ref operation, value }) if operation == "log" && value == -4.0
        ));
        assert!(matches!(tree.evaluate(root, &env), Err(CompileError::DomainError { .. })));
        assert!(matches!(tree.evaluate(frac_pow, &env), Err(CompileError::DomainError { .. })));

        let three = tree.constant(3.0);
        let int_pow = tree.pow(xn, three);
        assert_eq!(tree.evaluate(int_pow, &env).unwrap(), -64.0);

        let cases = [
            (UnaryOp::Asin, 1.5, "asin"),
            (UnaryOp::Acos, -1.5, "acos"),
            (UnaryOp::Acosh, 0.5, "acosh"),
            (UnaryOp::Atanh, 1.0, "atanh"),
            (UnaryOp::Atanh, -2.0, "atanh"),
        ];
        for (op, arg, name) in cases {
            let node = tree.unary(op, xn);
            let env = Environment::new().with(x, 0, arg);
            assert!(matches!(
                tree.evaluate(node, &env),
                Err(CompileError::DomainError { ref operation, value }) if operation == name && value == arg
            ));
        }
        let edge = tree.unary(UnaryOp::Acos, xn);
        let env = Environment::new().with(x, 0, 1.0);
        assert_eq!(tree.evaluate(edge, &env).unwrap(), 0.0);
    }

    #[test]
    fn overflow_is_reported_instead_of_returning_nan() {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let y = symbols.declare("y", SymbolKind::Endogenous, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        let yn = tree.variable(y, 0, false);
        let ex = tree.exp(xn);
        let ey = tree.exp(yn);
        let diff = tree.sub(ex, ey);

        let env = Environment::new().with(x, 0, 1000.0).with(y, 0, 1000.0);
        assert!(matches!(
            tree.evaluate(diff, &env),
            Err(CompileError::DomainError { ref operation, value }) if operation == "exp" && value == 1000.0
        ));

        let big = tree.constant(1e300);
        let product = tree.mul(xn, big);
        let env = Environment::new().with(x, 0, 1e300);
        assert!(matches!(
            tree.evaluate(product, &env),
            Err(CompileError::DomainError { ref operation, .. }) if operation == "multiplication"
        ));

        let env = Environment::new().with(x, 0, f64::NAN).with(y, 0, 0.0);
        assert!(matches!(
            tree.evaluate(diff, &env),
            Err(CompileError::DomainError { ref operation, .. }) if operation == "x"
        ));
    }

    #[test]
    fn comparisons_and_extrema() {
        let (mut tree, x, xn) = setup();
        let one = tree.constant(1.0);
        let less = tree.binary(BinaryOp::Less, xn, one);
        let max = tree.binary(BinaryOp::Max, xn, one);
        let env = Environment::new().with(x, 0, 0.25);
        assert_eq!(tree.evaluate(less, &env).unwrap(), 1.0);
        assert_eq!(tree.evaluate(max, &env).unwrap(), 1.0);
    }

    #[test]
    fn normcdf_matches_reference_values() {
        assert!((normcdf::<f64>(0.0, 0.0, 1.0).unwrap() - 0.5).abs() < 1e-7);
        assert!((normcdf::<f64>(1.96, 0.0, 1.0).unwrap() - 0.975_002_1).abs() < 1e-6);
        assert!((normcdf::<f64>(-1.0, 0.0, 2.0).unwrap() - 0.308_537_5).abs() < 1e-6);
        assert!(normcdf(0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn unknown_functions_cannot_be_evaluated() {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let f = symbols.declare("f", SymbolKind::UnknownFunction, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        let call = tree.call(Function::External(f), vec![xn]).unwrap();
        let env = Environment::new().with(x, 0, 1.0);
        assert_eq!(
            tree.evaluate(call, &env).unwrap_err(),
            CompileError::NonEvaluable("f".into())
        );
    }

    proptest! {
        #[test]
        fn adding_zero_preserves_value(a in -1e9f64..1e9) {
            let mut tree = DataTree::default();
            let ca = tree.constant(a);
            let zero = tree.constant(0.0);
            let sum = tree.add(ca, zero);
            let env = Environment::<f64>::new();
            prop_assert_eq!(tree.evaluate(sum, &env).unwrap(), tree.evaluate(ca, &env).unwrap());
        }
    }
}
