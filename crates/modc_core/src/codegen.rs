//! Common-subexpression elimination and statement emission.
//!
//! Every non-leaf node used more than once across all targets is computed
//! once into a temporary. Temporaries are emitted in ascending node id order,
//! which is a topological order of the DAG, so output is reproducible.

use std::collections::HashMap;
use std::fmt::{self, Write};

use tracing::info;

use crate::data_tree::{DataTree, NodeId};
use crate::render::{Dialect, Printer, VariableStyle};

/// Output array slot a target expression is assigned to (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    Residual(usize),
    Jacobian { row: usize, col: usize },
    Hessian { row: usize, col1: usize, col2: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub slot: OutputSlot,
    pub node: NodeId,
}

impl Target {
    pub fn new(slot: OutputSlot, node: NodeId) -> Self {
        Self { slot, node }
    }
}

/// Dimensions needed to linearize matrix slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub equations: usize,
    pub columns: usize,
}

/// Hands out temporary names. Owned by a compilation session, so numbering
/// restarts at 1 for every new session.
#[derive(Debug, Clone)]
pub struct TemporaryNamer {
    prefix: String,
    next: usize,
}

impl TemporaryNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }

    pub fn next_name(&mut self) -> String {
        let name = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        name
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}

/// Temporaries to compute and the targets that use them.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub temporaries: Vec<(String, NodeId)>,
    pub targets: Vec<Target>,
    names: HashMap<NodeId, String>,
}

impl Program {
    pub fn temporary_name(&self, node: NodeId) -> Option<&str> {
        self.names.get(&node).map(String::as_str)
    }
}

/// Number of uses of every node reachable from `targets`: one per parent edge
/// among reachable nodes, plus one per target it is.
pub fn reference_counts(tree: &DataTree, targets: &[Target]) -> HashMap<NodeId, usize> {
    let roots: Vec<NodeId> = targets.iter().map(|t| t.node).collect();
    let mut counts: HashMap<NodeId, usize> = HashMap::new();
    for id in tree.reachable(&roots) {
        counts.entry(id).or_insert(0);
        for child in tree.node(id).children() {
            *counts.entry(child).or_insert(0) += 1;
        }
    }
    for root in roots {
        *counts.entry(root).or_insert(0) += 1;
    }
    counts
}

pub struct CodeGenerator<'a> {
    tree: &'a DataTree,
    dialect: Dialect,
    style: VariableStyle<'a>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(tree: &'a DataTree, dialect: Dialect, style: VariableStyle<'a>) -> Self {
        Self {
            tree,
            dialect,
            style,
        }
    }

    /// Selects temporaries for `targets`, naming them with `namer`.
    pub fn plan(&self, targets: &[Target], namer: &mut TemporaryNamer) -> Program {
        let counts = reference_counts(self.tree, targets);
        let mut shared: Vec<NodeId> = counts
            .iter()
            .filter(|&(id, &count)| count >= 2 && !self.tree.node(*id).is_leaf())
            .map(|(&id, _)| id)
            .collect();
        shared.sort();

        let mut program = Program {
            targets: targets.to_vec(),
            ..Program::default()
        };
        for id in shared {
            let name = namer.next_name();
            program.names.insert(id, name.clone());
            program.temporaries.push((name, id));
        }
        info!(
            targets = targets.len(),
            temporaries = program.temporaries.len(),
            "planned code generation"
        );
        program
    }

    /// Writes the temporary assignments, then one assignment per target.
    pub fn write(&self, program: &Program, layout: SlotLayout, indent: &str, out: &mut String) -> fmt::Result {
        let printer = Printer::new(self.tree, self.dialect, self.style).with_temporaries(&program.names);
        for (name, id) in &program.temporaries {
            let expr = printer.definition(*id);
            match self.dialect {
                Dialect::Matlab => writeln!(out, "{indent}{name} = {expr};")?,
                Dialect::C => writeln!(out, "{indent}double {name} = {expr};")?,
            }
        }
        for target in &program.targets {
            let expr = printer.reference(target.node);
            let slot = self.slot(target.slot, layout);
            writeln!(out, "{indent}{slot} = {expr};")?;
            if let OutputSlot::Hessian { row, col1, col2 } = target.slot {
                if col1 != col2 {
                    let mirror = self.slot(
                        OutputSlot::Hessian {
                            row,
                            col1: col2,
                            col2: col1,
                        },
                        layout,
                    );
                    writeln!(out, "{indent}{mirror} = {slot};")?;
                }
            }
        }
        Ok(())
    }

    /// Convenience: plan and write in one step.
    pub fn generate(&self, targets: &[Target], layout: SlotLayout, namer: &mut TemporaryNamer) -> String {
        let program = self.plan(targets, namer);
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write(&program, layout, "", &mut out);
        out
    }

    fn slot(&self, slot: OutputSlot, layout: SlotLayout) -> String {
        let d = self.dialect;
        match (slot, d) {
            (OutputSlot::Residual(row), Dialect::Matlab) => format!("residual({})", d.index(row)),
            (OutputSlot::Residual(row), Dialect::C) => format!("residual[{row}]"),
            (OutputSlot::Jacobian { row, col }, Dialect::Matlab) => {
                format!("g1({},{})", d.index(row), d.index(col))
            }
            (OutputSlot::Jacobian { row, col }, Dialect::C) => {
                format!("g1[{}]", row + col * layout.equations)
            }
            (OutputSlot::Hessian { row, col1, col2 }, Dialect::Matlab) => {
                format!("g2({},{})", d.index(row), d.index(col1 * layout.columns + col2))
            }
            (OutputSlot::Hessian { row, col1, col2 }, Dialect::C) => {
                format!("g2[{}]", row + (col1 * layout.columns + col2) * layout.equations)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_table::{SymbolKind, SymbolTable};

    fn tree() -> (DataTree, NodeId, NodeId) {
        let mut symbols = SymbolTable::new();
        let x = symbols.declare("x", SymbolKind::Endogenous, "").unwrap();
        let y = symbols.declare("y", SymbolKind::Endogenous, "").unwrap();
        let mut tree = DataTree::new(symbols);
        let xn = tree.variable(x, 0, false);
        let yn = tree.variable(y, 0, false);
        (tree, xn, yn)
    }

    const LAYOUT: SlotLayout = SlotLayout {
        equations: 2,
        columns: 2,
    };

    #[test]
    fn shared_subexpressions_become_temporaries() {
        let (mut tree, x, y) = tree();
        let shared = tree.mul(x, y);
        let e = tree.exp(shared);
        let r0 = tree.add(e, x);
        let r1 = tree.sub(e, y);
        let targets = [
            Target::new(OutputSlot::Residual(0), r0),
            Target::new(OutputSlot::Residual(1), r1),
        ];

        let counts = reference_counts(&tree, &targets);
        assert_eq!(counts[&e], 2);
        assert_eq!(counts[&shared], 1);
        assert_eq!(counts[&x], 2);

        let generator = CodeGenerator::new(&tree, Dialect::Matlab, VariableStyle::Names);
        let mut namer = TemporaryNamer::new("T");
        let code = generator.generate(&targets, LAYOUT, &mut namer);
        assert_eq!(
            code,
            "T1 = exp(x*y);\nresidual(1) = T1 + x;\nresidual(2) = T1 - y;\n"
        );
    }

    #[test]
    fn target_that_is_itself_shared_refers_to_its_temporary() {
        let (mut tree, x, y) = tree();
        let s = tree.add(x, y);
        let sq = tree.mul(s, s);
        let targets = [
            Target::new(OutputSlot::Residual(0), s),
            Target::new(OutputSlot::Jacobian { row: 1, col: 1 }, sq),
        ];
        // both operand edges of `s*s` count, plus the residual target
        assert_eq!(reference_counts(&tree, &targets)[&s], 3);
        let generator = CodeGenerator::new(&tree, Dialect::C, VariableStyle::Static);
        let mut namer = TemporaryNamer::new("T");
        let code = generator.generate(&targets, LAYOUT, &mut namer);
        assert_eq!(
            code,
            "double T1 = y[0] + y[1];\nresidual[0] = T1;\ng1[3] = T1*T1;\n"
        );
    }

    #[test]
    fn hessian_slots_are_mirrored() {
        let (tree, x, _) = tree();
        let targets = [Target::new(
            OutputSlot::Hessian {
                row: 0,
                col1: 0,
                col2: 1,
            },
            x,
        )];
        let generator = CodeGenerator::new(&tree, Dialect::Matlab, VariableStyle::Names);
        let mut namer = TemporaryNamer::new("T");
        let code = generator.generate(&targets, LAYOUT, &mut namer);
        assert_eq!(code, "g2(1,2) = x;\ng2(1,3) = g2(1,2);\n");
    }

    #[test]
    fn output_is_identical_across_runs() {
        let build = || {
            let (mut tree, x, y) = tree();
            let a = tree.mul(x, y);
            let b = tree.log(a);
            let c = tree.add(a, b);
            let d = tree.div(b, c);
            let targets = [
                Target::new(OutputSlot::Residual(0), c),
                Target::new(OutputSlot::Residual(1), d),
            ];
            let generator = CodeGenerator::new(&tree, Dialect::Matlab, VariableStyle::Static);
            let mut namer = TemporaryNamer::new("T");
            generator.generate(&targets, LAYOUT, &mut namer)
        };
        let first = build();
        assert_eq!(first, build());
        assert!(first.starts_with("T1 = y(1)*y(2);\nT2 = log(T1);\nT3 = T1 + T2;\n"));
    }

    #[test]
    fn namer_restarts_after_reset() {
        let mut namer = TemporaryNamer::new("tmp");
        assert_eq!(namer.next_name(), "tmp1");
        assert_eq!(namer.next_name(), "tmp2");
        namer.reset();
        assert_eq!(namer.next_name(), "tmp1");
    }
}
