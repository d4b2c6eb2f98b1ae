//! Symbolic differentiation over the DAG.
//!
//! Results are built with the ordinary factories, so they are simplified and
//! hash-consed like any other node. Every `(node, variable)` pair is
//! differentiated at most once per tree.

use std::collections::HashMap;

use crate::data_tree::{effective_lag, BinaryOp, DataTree, Function, Node, NodeId, UnaryOp};
use crate::error::{CompileError, Result};
use crate::symbol_table::SymbolId;

/// Variable a derivative is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DerivationVariable {
    /// The symbol at any lag (static model).
    Symbol(SymbolId),
    /// The symbol at one effective lag (dynamic model).
    Lagged(SymbolId, i32),
}

impl DerivationVariable {
    fn matches(self, symbol: SymbolId, lag: i32, predetermined: bool) -> bool {
        match self {
            DerivationVariable::Symbol(s) => s == symbol,
            DerivationVariable::Lagged(s, l) => s == symbol && l == effective_lag(lag, predetermined),
        }
    }
}

/// Counters exposed for checking memoization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivativeStats {
    /// Rule applications (cache misses).
    pub visits: usize,
    pub cache_hits: usize,
}

#[derive(Debug, Default)]
pub(crate) struct DerivativeCache {
    entries: HashMap<(NodeId, DerivationVariable), NodeId>,
    stats: DerivativeStats,
}

impl DataTree {
    /// Partial derivative of `id` with respect to `wrt` at any lag.
    pub fn derivative(&mut self, id: NodeId, wrt: SymbolId) -> Result<NodeId> {
        self.differentiate(id, DerivationVariable::Symbol(wrt))
    }

    /// Partial derivative of `id` with respect to `wrt` at effective lag `lag`.
    pub fn derivative_lagged(&mut self, id: NodeId, wrt: SymbolId, lag: i32) -> Result<NodeId> {
        self.differentiate(id, DerivationVariable::Lagged(wrt, lag))
    }

    pub fn derivative_stats(&self) -> DerivativeStats {
        self.derivatives.stats
    }

    pub fn differentiate(&mut self, id: NodeId, wrt: DerivationVariable) -> Result<NodeId> {
        if let Some(&cached) = self.derivatives.entries.get(&(id, wrt)) {
            self.derivatives.stats.cache_hits += 1;
            return Ok(cached);
        }
        self.derivatives.stats.visits += 1;
        let result = self.apply_rule(id, wrt)?;
        self.derivatives.entries.insert((id, wrt), result);
        Ok(result)
    }

    fn apply_rule(&mut self, id: NodeId, wrt: DerivationVariable) -> Result<NodeId> {
        match self.node(id).clone() {
            Node::Constant(_) => Ok(self.constant(0.0)),
            Node::Variable {
                symbol,
                lag,
                predetermined,
            } => {
                let value = if wrt.matches(symbol, lag, predetermined) { 1.0 } else { 0.0 };
                Ok(self.constant(value))
            }
            Node::Unary { op, arg } => {
                let d = self.differentiate(arg, wrt)?;
                if self.is_zero(d) {
                    return Ok(d);
                }
                Ok(self.unary_rule(op, id, arg, d))
            }
            Node::Binary { op, left, right } => self.binary_rule(op, left, right, wrt),
            Node::Call { function, args } => self.call_rule(function, &args, wrt),
        }
    }

    /// `id` is the node `op(arg)` itself; `d` is the derivative of `arg`.
    fn unary_rule(&mut self, op: UnaryOp, id: NodeId, arg: NodeId, d: NodeId) -> NodeId {
        let one = self.constant(1.0);
        match op {
            UnaryOp::Negate => self.neg(d),
            UnaryOp::Exp => self.mul(id, d),
            UnaryOp::Log => self.div(d, arg),
            UnaryOp::Log10 => {
                let ln10 = self.constant(std::f64::consts::LN_10);
                let denom = self.mul(arg, ln10);
                self.div(d, denom)
            }
            UnaryOp::Sqrt => {
                let two = self.constant(2.0);
                let denom = self.mul(two, id);
                self.div(d, denom)
            }
            UnaryOp::Sin => {
                let cos = self.unary(UnaryOp::Cos, arg);
                self.mul(cos, d)
            }
            UnaryOp::Cos => {
                let sin = self.unary(UnaryOp::Sin, arg);
                let neg = self.neg(sin);
                self.mul(neg, d)
            }
            UnaryOp::Tan => {
                let two = self.constant(2.0);
                let sq = self.pow(id, two);
                let factor = self.add(one, sq);
                self.mul(d, factor)
            }
            UnaryOp::Asin | UnaryOp::Acos => {
                let two = self.constant(2.0);
                let sq = self.pow(arg, two);
                let diff = self.sub(one, sq);
                let root = self.sqrt(diff);
                let quotient = self.div(d, root);
                if op == UnaryOp::Acos {
                    self.neg(quotient)
                } else {
                    quotient
                }
            }
            UnaryOp::Atan => {
                let two = self.constant(2.0);
                let sq = self.pow(arg, two);
                let denom = self.add(one, sq);
                self.div(d, denom)
            }
            UnaryOp::Sinh => {
                let cosh = self.unary(UnaryOp::Cosh, arg);
                self.mul(cosh, d)
            }
            UnaryOp::Cosh => {
                let sinh = self.unary(UnaryOp::Sinh, arg);
                self.mul(sinh, d)
            }
            UnaryOp::Tanh => {
                let two = self.constant(2.0);
                let sq = self.pow(id, two);
                let factor = self.sub(one, sq);
                self.mul(d, factor)
            }
            UnaryOp::Asinh => {
                let two = self.constant(2.0);
                let sq = self.pow(arg, two);
                let sum = self.add(sq, one);
                let root = self.sqrt(sum);
                self.div(d, root)
            }
            UnaryOp::Acosh => {
                let two = self.constant(2.0);
                let sq = self.pow(arg, two);
                let diff = self.sub(sq, one);
                let root = self.sqrt(diff);
                self.div(d, root)
            }
            UnaryOp::Atanh => {
                let two = self.constant(2.0);
                let sq = self.pow(arg, two);
                let denom = self.sub(one, sq);
                self.div(d, denom)
            }
        }
    }

    fn binary_rule(
        &mut self,
        op: BinaryOp,
        f: NodeId,
        g: NodeId,
        wrt: DerivationVariable,
    ) -> Result<NodeId> {
        if op.is_comparison() {
            return Ok(self.constant(0.0));
        }
        let df = self.differentiate(f, wrt)?;
        let dg = self.differentiate(g, wrt)?;

        Ok(match op {
            BinaryOp::Add => self.add(df, dg),
            BinaryOp::Subtract => self.sub(df, dg),
            BinaryOp::Multiply => {
                let left = self.mul(df, g);
                let right = self.mul(f, dg);
                self.add(left, right)
            }
            BinaryOp::Divide => {
                let left = self.mul(df, g);
                let right = self.mul(f, dg);
                let num = self.sub(left, right);
                let two = self.constant(2.0);
                let denom = self.pow(g, two);
                self.div(num, denom)
            }
            BinaryOp::Power => {
                if let Some(n) = self.constant_value(g) {
                    // n * f^(n-1) * f'
                    let n_node = self.constant(n);
                    let reduced = self.constant(n - 1.0);
                    let pow = self.pow(f, reduced);
                    let scaled = self.mul(n_node, pow);
                    self.mul(scaled, df)
                } else {
                    // f^g * (g' * log(f) + g * f' / f)
                    let power = self.pow(f, g);
                    let log_f = self.log(f);
                    let first = self.mul(dg, log_f);
                    let ratio = self.div(df, f);
                    let second = self.mul(g, ratio);
                    let sum = self.add(first, second);
                    self.mul(power, sum)
                }
            }
            BinaryOp::Max | BinaryOp::Min => {
                let (pick_left, pick_right) = if op == BinaryOp::Max {
                    (BinaryOp::Greater, BinaryOp::LessEqual)
                } else {
                    (BinaryOp::Less, BinaryOp::GreaterEqual)
                };
                let left_active = self.binary(pick_left, f, g);
                let right_active = self.binary(pick_right, f, g);
                let left = self.mul(left_active, df);
                let right = self.mul(right_active, dg);
                self.add(left, right)
            }
            _ => self.constant(0.0),
        })
    }

    fn call_rule(&mut self, function: Function, args: &[NodeId], wrt: DerivationVariable) -> Result<NodeId> {
        match function {
            Function::NormCdf => {
                // pdf(z) * z' with z = (x - mu) / sigma
                let diff = self.sub(args[0], args[1]);
                let z = self.div(diff, args[2]);
                let dz = self.differentiate(z, wrt)?;
                if self.is_zero(dz) {
                    return Ok(dz);
                }
                let two = self.constant(2.0);
                let sq = self.pow(z, two);
                let half = self.div(sq, two);
                let minus_half = self.neg(half);
                let density = self.exp(minus_half);
                let norm = self.constant((2.0 * std::f64::consts::PI).sqrt());
                let pdf = self.div(density, norm);
                Ok(self.mul(pdf, dz))
            }
            Function::External(symbol) => {
                for &arg in args {
                    let d = self.differentiate(arg, wrt)?;
                    if !self.is_zero(d) {
                        return Err(CompileError::NonDifferentiable {
                            function: self.symbols().name_of(symbol)?.to_string(),
                            equation: None,
                        });
                    }
                }
                Ok(self.constant(0.0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::Environment;
    use crate::render::Dialect;
    use crate::symbol_table::{SymbolKind, SymbolTable};
    use proptest::prelude::*;

    struct Fixture {
        tree: DataTree,
        x: SymbolId,
        y: SymbolId,
        xn: NodeId,
        yn: NodeId,
    }

    fn fixture() -> Fixture {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let y = symbols.declare("y", SymbolKind::Endogenous, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        let yn = tree.variable(y, 0, false);
        Fixture { tree, x, y, xn, yn }
    }

    /// f = x^2 + 3*y
    fn quadratic(fx: &mut Fixture) -> NodeId {
        let two = fx.tree.constant(2.0);
        let three = fx.tree.constant(3.0);
        let sq = fx.tree.pow(fx.xn, two);
        let lin = fx.tree.mul(three, fx.yn);
        fx.tree.add(sq, lin)
    }

    #[test]
    fn polynomial_partials() {
        let mut fx = fixture();
        let f = quadratic(&mut fx);
        let dfx = fx.tree.derivative(f, fx.x).unwrap();
        let dfy = fx.tree.derivative(f, fx.y).unwrap();
        assert_eq!(fx.tree.render(dfx, Dialect::Matlab), "2*x");
        assert_eq!(fx.tree.constant_value(dfy), Some(3.0));

        for &(xv, yv) in &[(0.0, 1.0), (1.5, -2.0), (-3.0, 7.0)] {
            let env = Environment::new().with(fx.x, 0, xv).with(fx.y, 0, yv);
            assert_eq!(fx.tree.evaluate(dfx, &env).unwrap(), 2.0 * xv);
            assert_eq!(fx.tree.evaluate(dfy, &env).unwrap(), 3.0);
        }
    }

    #[test]
    fn constants_have_zero_derivative() {
        let mut fx = fixture();
        let five = fx.tree.constant(5.0);
        let d = fx.tree.derivative(five, fx.x).unwrap();
        assert!(fx.tree.is_zero(d));
    }

    #[test]
    fn memoization_returns_same_node_and_skips_work() {
        let mut fx = fixture();
        let f = quadratic(&mut fx);
        let first = fx.tree.derivative(f, fx.x).unwrap();
        let size = fx.tree.len();
        let visits = fx.tree.derivative_stats().visits;

        let second = fx.tree.derivative(f, fx.x).unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.tree.len(), size);
        assert_eq!(fx.tree.derivative_stats().visits, visits);
        assert!(fx.tree.derivative_stats().cache_hits >= 1);
    }

    #[test]
    fn shared_subgraphs_are_visited_once() {
        let mut fx = fixture();
        // Repeated squaring builds a chain of depth 30 whose tree expansion is exponential.
        let mut node = fx.tree.add(fx.xn, fx.yn);
        for _ in 0..30 {
            node = fx.tree.mul(node, node);
        }
        fx.tree.derivative(node, fx.x).unwrap();
        assert!(fx.tree.derivative_stats().visits < 200);
    }

    #[test]
    fn lagged_derivative_distinguishes_periods() {
        let mut fx = fixture();
        let x_lag = fx.tree.variable(fx.x, -1, false);
        let f = fx.tree.mul(fx.xn, x_lag);
        let d_now = fx.tree.derivative_lagged(f, fx.x, 0).unwrap();
        let d_lag = fx.tree.derivative_lagged(f, fx.x, -1).unwrap();
        let d_any = fx.tree.derivative(f, fx.x).unwrap();
        assert_eq!(d_now, x_lag);
        assert_eq!(d_lag, fx.xn);
        assert_eq!(fx.tree.render(d_any, Dialect::Matlab), "x(-1) + x");
    }

    #[test]
    fn predetermined_variables_shift_one_period() {
        let mut fx = fixture();
        let k = fx.tree.variable(fx.x, 0, true);
        let d = fx.tree.derivative_lagged(k, fx.x, -1).unwrap();
        assert_eq!(fx.tree.constant_value(d), Some(1.0));
        let d0 = fx.tree.derivative_lagged(k, fx.x, 0).unwrap();
        assert!(fx.tree.is_zero(d0));
    }

    #[test]
    fn unknown_functions_are_not_differentiable() {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let y = symbols.declare("y", SymbolKind::Endogenous, "").unwrap();
        let f = symbols.declare("f", SymbolKind::UnknownFunction, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        let call = tree.call(Function::External(f), vec![xn]).unwrap();
        assert_eq!(
            tree.derivative(call, x).unwrap_err(),
            CompileError::NonDifferentiable {
                function: "f".into(),
                equation: None
            }
        );
        let dy = tree.derivative(call, y).unwrap();
        assert!(tree.is_zero(dy));
    }

    fn numeric_slope(tree: &DataTree, f: NodeId, x: SymbolId, at: f64) -> f64 {
        let h = 1e-6;
        let up = tree.evaluate(f, &Environment::new().with(x, 0, at + h)).unwrap();
        let down = tree.evaluate(f, &Environment::new().with(x, 0, at - h)).unwrap();
        (up - down) / (2.0 * h)
    }

    #[test]
    fn transcendental_rules_match_finite_differences() {
        let ops = [
            UnaryOp::Exp,
            UnaryOp::Log,
            UnaryOp::Log10,
            UnaryOp::Sqrt,
            UnaryOp::Sin,
            UnaryOp::Cos,
            UnaryOp::Tan,
            UnaryOp::Asin,
            UnaryOp::Acos,
            UnaryOp::Atan,
            UnaryOp::Sinh,
            UnaryOp::Cosh,
            UnaryOp::Tanh,
            UnaryOp::Asinh,
            UnaryOp::Atanh,
        ];
        for op in ops {
            let mut fx = fixture();
            let half = fx.tree.constant(0.5);
            let inner = fx.tree.mul(half, fx.xn);
            let f = fx.tree.unary(op, inner);
            let d = fx.tree.derivative(f, fx.x).unwrap();
            let at = 0.7;
            let exact = fx.tree.evaluate(d, &Environment::new().with(fx.x, 0, at)).unwrap();
            let approx = numeric_slope(&fx.tree, f, fx.x, at);
            assert!((exact - approx).abs() < 1e-5, "{op:?}: {exact} vs {approx}");
        }

        let mut fx = fixture();
        let f = fx.tree.unary(UnaryOp::Acosh, fx.xn);
        let d = fx.tree.derivative(f, fx.x).unwrap();
        let exact = fx.tree.evaluate(d, &Environment::new().with(fx.x, 0, 2.0)).unwrap();
        assert!((exact - numeric_slope(&fx.tree, f, fx.x, 2.0)).abs() < 1e-5);
    }

    #[test]
    fn general_power_and_normcdf_rules() {
        let mut fx = fixture();
        let pw = fx.tree.pow(fx.xn, fx.xn);
        let d = fx.tree.derivative(pw, fx.x).unwrap();
        let exact = fx.tree.evaluate(d, &Environment::new().with(fx.x, 0, 1.3)).unwrap();
        assert!((exact - numeric_slope(&fx.tree, pw, fx.x, 1.3)).abs() < 1e-5);

        let zero = fx.tree.constant(0.0);
        let one = fx.tree.constant(1.0);
        let cdf = fx.tree.call(Function::NormCdf, vec![fx.xn, zero, one]).unwrap();
        let d = fx.tree.derivative(cdf, fx.x).unwrap();
        let exact = fx.tree.evaluate(d, &Environment::new().with(fx.x, 0, 0.0)).unwrap();
        assert!((exact - 1.0 / (2.0 * std::f64::consts::PI).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn max_selects_active_branch() {
        let mut fx = fixture();
        let two = fx.tree.constant(2.0);
        let scaled = fx.tree.mul(two, fx.xn);
        let m = fx.tree.binary(BinaryOp::Max, scaled, fx.yn);
        let d = fx.tree.derivative(m, fx.x).unwrap();
        let env = |xv: f64, yv: f64| Environment::new().with(fx.x, 0, xv).with(fx.y, 0, yv);
        assert_eq!(fx.tree.evaluate(d, &env(1.0, 0.0)).unwrap(), 2.0);
        assert_eq!(fx.tree.evaluate(d, &env(1.0, 5.0)).unwrap(), 0.0);
    }

    proptest! {
        #[test]
        fn product_rule_matches_finite_difference(a in 0.5f64..3.0, b in -2.0f64..2.0) {
            let mut fx = fixture();
            let cb = fx.tree.constant(b);
            let shifted = fx.tree.add(fx.xn, cb);
            let s = fx.tree.unary(UnaryOp::Sin, fx.xn);
            let f = fx.tree.mul(shifted, s);
            let d = fx.tree.derivative(f, fx.x).unwrap();
            let exact = fx.tree.evaluate(d, &Environment::new().with(fx.x, 0, a)).unwrap();
            let expected = a.sin() + (a + b) * a.cos();
            prop_assert!((exact - expected).abs() < 1e-9);
        }
    }
}
