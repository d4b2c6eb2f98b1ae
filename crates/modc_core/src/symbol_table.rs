use std::collections::HashMap;
use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CompileError, Result};
use crate::render::Dialect;

/// Category of a named model entity. Each kind has its own ordinal space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Endogenous,
    Exogenous,
    ExogenousDeterministic,
    Parameter,
    ModelLocalVariable,
    FileLocalVariable,
    RecursiveVariable,
    UnknownFunction,
}

impl SymbolKind {
    pub const ALL: [SymbolKind; 8] = [
        SymbolKind::Endogenous,
        SymbolKind::Exogenous,
        SymbolKind::ExogenousDeterministic,
        SymbolKind::Parameter,
        SymbolKind::ModelLocalVariable,
        SymbolKind::FileLocalVariable,
        SymbolKind::RecursiveVariable,
        SymbolKind::UnknownFunction,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Short tag used in generated identifiers (`endo_names`, `exo_nbr`, ...).
    pub fn tag(self) -> &'static str {
        match self {
            SymbolKind::Endogenous => "endo",
            SymbolKind::Exogenous => "exo",
            SymbolKind::ExogenousDeterministic => "exo_det",
            SymbolKind::Parameter => "param",
            SymbolKind::ModelLocalVariable => "model_local",
            SymbolKind::FileLocalVariable => "file_local",
            SymbolKind::RecursiveVariable => "recur",
            SymbolKind::UnknownFunction => "unknown_function",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SymbolKind::Endogenous => "endogenous variable",
            SymbolKind::Exogenous => "exogenous variable",
            SymbolKind::ExogenousDeterministic => "deterministic exogenous variable",
            SymbolKind::Parameter => "parameter",
            SymbolKind::ModelLocalVariable => "model local variable",
            SymbolKind::FileLocalVariable => "file local variable",
            SymbolKind::RecursiveVariable => "recursive variable",
            SymbolKind::UnknownFunction => "unknown function",
        };
        f.write_str(label)
    }
}

/// Stable typed identifier: the kind plus a dense ordinal within that kind.
///
/// Ordinals are the row/column indices of generated matrices, so they follow
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId {
    pub kind: SymbolKind,
    pub ordinal: usize,
}

impl SymbolId {
    pub fn new(kind: SymbolKind, ordinal: usize) -> Self {
        Self { kind, ordinal }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SymbolEntry {
    name: String,
    display_name: String,
}

/// Declaration-ordered listing of every kind's `(name, display_name)` pairs.
pub type SymbolExport = Vec<(SymbolKind, Vec<(String, String)>)>;

/// Assigns each declared name a unique `(kind, ordinal)` identifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolTable {
    #[serde(skip)]
    by_name: HashMap<String, SymbolId>,
    entries: [Vec<SymbolEntry>; 8],
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name` under `kind`. An empty `display_name` falls back to the name.
    pub fn declare(&mut self, name: &str, kind: SymbolKind, display_name: &str) -> Result<SymbolId> {
        if let Some(existing) = self.by_name.get(name) {
            return Err(CompileError::AlreadyDeclared {
                name: name.to_string(),
                conflicting_kind: existing.kind != kind,
            });
        }

        let list = &mut self.entries[kind.slot()];
        let id = SymbolId::new(kind, list.len());
        let display_name = if display_name.is_empty() {
            name
        } else {
            display_name
        };
        list.push(SymbolEntry {
            name: name.to_string(),
            display_name: display_name.to_string(),
        });
        self.by_name.insert(name.to_string(), id);
        debug!(name, %kind, ordinal = id.ordinal, "declared symbol");
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn name_of(&self, id: SymbolId) -> Result<&str> {
        self.entry(id).map(|e| e.name.as_str())
    }

    pub fn display_name_of(&self, id: SymbolId) -> Result<&str> {
        self.entry(id).map(|e| e.display_name.as_str())
    }

    pub fn count(&self, kind: SymbolKind) -> usize {
        self.entries[kind.slot()].len()
    }

    /// All ids of `kind`, in ordinal order.
    pub fn ids(&self, kind: SymbolKind) -> impl Iterator<Item = SymbolId> {
        (0..self.count(kind)).map(move |ordinal| SymbolId::new(kind, ordinal))
    }

    pub fn export(&self) -> SymbolExport {
        SymbolKind::ALL
            .iter()
            .map(|&kind| {
                let names = self.entries[kind.slot()]
                    .iter()
                    .map(|e| (e.name.clone(), e.display_name.clone()))
                    .collect();
                (kind, names)
            })
            .collect()
    }

    fn entry(&self, id: SymbolId) -> Result<&SymbolEntry> {
        self.entries[id.kind.slot()]
            .get(id.ordinal)
            .ok_or_else(|| CompileError::UnknownSymbol(format!("{} #{}", id.kind, id.ordinal)))
    }

    /// Writes the block announcing declared names and per-kind counts to the
    /// consuming numerical environment.
    pub fn write_name_table(&self, dialect: Dialect, out: &mut String) -> fmt::Result {
        match dialect {
            Dialect::Matlab => self.write_matlab_names(out),
            Dialect::C => self.write_c_names(out),
        }
    }

    fn write_matlab_names(&self, out: &mut String) -> fmt::Result {
        let announced = [
            (SymbolKind::Exogenous, "M_.exo_names", "M_.exo_names_tex"),
            (SymbolKind::ExogenousDeterministic, "lgxdet_", "lgxdet_tex_"),
            (SymbolKind::Endogenous, "M_.endo_names", "M_.endo_names_tex"),
            (SymbolKind::RecursiveVariable, "M_.recur_names", "M_.recur_names_tex"),
            (SymbolKind::Parameter, "M_.param_names", "M_.param_names_tex"),
        ];
        for (kind, names_var, tex_var) in announced {
            for (i, entry) in self.entries[kind.slot()].iter().enumerate() {
                let name = matlab_literal(&entry.name);
                let tex = matlab_literal(&entry.display_name);
                if i == 0 {
                    writeln!(out, "{names_var} = {name};")?;
                    writeln!(out, "{tex_var} = {tex};")?;
                } else {
                    writeln!(out, "{names_var} = strvcat({names_var}, {name});")?;
                    writeln!(out, "{tex_var} = strvcat({tex_var}, {tex});")?;
                }
            }
        }

        let exo_nbr = self.count(SymbolKind::Exogenous);
        writeln!(out, "M_.exo_det_nbr = {};", self.count(SymbolKind::ExogenousDeterministic))?;
        writeln!(out, "M_.exo_nbr = {exo_nbr};")?;
        writeln!(out, "M_.endo_nbr = {};", self.count(SymbolKind::Endogenous))?;
        writeln!(out, "M_.recur_nbr = {};", self.count(SymbolKind::RecursiveVariable))?;
        writeln!(out, "M_.param_nbr = {};", self.count(SymbolKind::Parameter))?;
        writeln!(out, "M_.Sigma_e = zeros({exo_nbr}, {exo_nbr});")
    }

    fn write_c_names(&self, out: &mut String) -> fmt::Result {
        let announced = [
            SymbolKind::Exogenous,
            SymbolKind::ExogenousDeterministic,
            SymbolKind::Endogenous,
            SymbolKind::RecursiveVariable,
            SymbolKind::Parameter,
        ];
        for kind in announced {
            let entries = &self.entries[kind.slot()];
            let tag = kind.tag();
            writeln!(out, "static const int {tag}_nbr = {};", entries.len())?;
            if entries.is_empty() {
                continue;
            }
            let names: Vec<String> = entries.iter().map(|e| c_literal(&e.name)).collect();
            let tex: Vec<String> = entries.iter().map(|e| c_literal(&e.display_name)).collect();
            writeln!(out, "static const char *const {tag}_names[] = {{{}}};", names.join(", "))?;
            writeln!(out, "static const char *const {tag}_names_tex[] = {{{}}};", tex.join(", "))?;
        }
        Ok(())
    }
}

/// Single-quoted string; quotes are doubled.
fn matlab_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Double-quoted string with backslashes and quotes escaped.
fn c_literal(text: &str) -> String {
    let mut literal = String::with_capacity(text.len() + 2);
    literal.push('"');
    for c in text.chars() {
        match c {
            '\\' => literal.push_str("\\\\"),
            '"' => literal.push_str("\\\""),
            '\n' => literal.push_str("\\n"),
            _ => literal.push(c),
        }
    }
    literal.push('"');
    literal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_dense_per_kind() {
        let mut table = SymbolTable::new();
        let k = table.declare("k", SymbolKind::Endogenous, "").unwrap();
        let alpha = table.declare("alpha", SymbolKind::Parameter, "\\alpha").unwrap();
        let c = table.declare("c", SymbolKind::Endogenous, "").unwrap();

        assert_eq!(k, SymbolId::new(SymbolKind::Endogenous, 0));
        assert_eq!(c, SymbolId::new(SymbolKind::Endogenous, 1));
        assert_eq!(alpha, SymbolId::new(SymbolKind::Parameter, 0));
        assert_eq!(table.count(SymbolKind::Endogenous), 2);
        assert_eq!(table.count(SymbolKind::Exogenous), 0);
        assert_eq!(table.name_of(c).unwrap(), "c");
        assert_eq!(table.display_name_of(alpha).unwrap(), "\\alpha");
        assert_eq!(table.display_name_of(k).unwrap(), "k");
    }

    #[test]
    fn redeclaration_reports_kind_conflict() {
        let mut table = SymbolTable::new();
        table.declare("x", SymbolKind::Endogenous, "").unwrap();

        let same = table.declare("x", SymbolKind::Endogenous, "").unwrap_err();
        assert_eq!(
            same,
            CompileError::AlreadyDeclared {
                name: "x".into(),
                conflicting_kind: false
            }
        );
        let other = table.declare("x", SymbolKind::Parameter, "").unwrap_err();
        assert_eq!(
            other,
            CompileError::AlreadyDeclared {
                name: "x".into(),
                conflicting_kind: true
            }
        );
        assert_eq!(table.count(SymbolKind::Parameter), 0);
    }

    #[test]
    fn lookups_and_unknown_ids() {
        let mut table = SymbolTable::new();
        let y = table.declare("y", SymbolKind::Exogenous, "").unwrap();
        assert_eq!(table.lookup("y"), Some(y));
        assert!(table.exists("y"));
        assert!(!table.exists("z"));
        assert_eq!(table.lookup("z"), None);

        let ghost = SymbolId::new(SymbolKind::Exogenous, 3);
        assert!(matches!(table.name_of(ghost), Err(CompileError::UnknownSymbol(_))));
        assert!(matches!(table.display_name_of(ghost), Err(CompileError::UnknownSymbol(_))));
    }

    #[test]
    fn export_lists_every_kind_in_declaration_order() {
        let mut table = SymbolTable::new();
        table.declare("b", SymbolKind::Parameter, "").unwrap();
        table.declare("a", SymbolKind::Parameter, "A").unwrap();
        let export = table.export();
        assert_eq!(export.len(), SymbolKind::ALL.len());
        let params = &export
            .iter()
            .find(|(kind, _)| *kind == SymbolKind::Parameter)
            .unwrap()
            .1;
        assert_eq!(
            params,
            &vec![("b".to_string(), "b".to_string()), ("a".to_string(), "A".to_string())]
        );
    }

    #[test]
    fn matlab_name_table_uses_strvcat_after_first_name() {
        let mut table = SymbolTable::new();
        table.declare("k", SymbolKind::Endogenous, "").unwrap();
        table.declare("c", SymbolKind::Endogenous, "C").unwrap();
        table.declare("e", SymbolKind::Exogenous, "").unwrap();
        let mut out = String::new();
        table.write_name_table(Dialect::Matlab, &mut out).unwrap();

        let expected = "\
M_.exo_names = 'e';
M_.exo_names_tex = 'e';
M_.endo_names = 'k';
M_.endo_names_tex = 'k';
M_.endo_names = strvcat(M_.endo_names, 'c');
M_.endo_names_tex = strvcat(M_.endo_names_tex, 'C');
M_.exo_det_nbr = 0;
M_.exo_nbr = 1;
M_.endo_nbr = 2;
M_.recur_nbr = 0;
M_.param_nbr = 0;
M_.Sigma_e = zeros(1, 1);
";
        assert_eq!(out, expected);
    }

    #[test]
    fn c_name_table_declares_arrays() {
        let mut table = SymbolTable::new();
        table.declare("alpha", SymbolKind::Parameter, "\\alpha").unwrap();
        let mut out = String::new();
        table.write_name_table(Dialect::C, &mut out).unwrap();
        assert!(out.contains("static const int param_nbr = 1;"));
        assert!(out.contains("static const char *const param_names[] = {\"alpha\"};"));
        assert!(out.contains("static const char *const param_names_tex[] = {\"\\\\alpha\"};"));
        assert!(out.contains("static const int endo_nbr = 0;"));
    }

    #[test]
    fn quotes_in_display_names_are_escaped() {
        let mut table = SymbolTable::new();
        table.declare("k", SymbolKind::Endogenous, "k'").unwrap();
        table.declare("c", SymbolKind::Endogenous, "\\text{\"c\"}").unwrap();

        let mut matlab = String::new();
        table.write_name_table(Dialect::Matlab, &mut matlab).unwrap();
        assert!(matlab.contains("M_.endo_names_tex = 'k''';"));
        assert!(matlab.contains("M_.endo_names_tex = strvcat(M_.endo_names_tex, '\\text{\"c\"}');"));

        let mut c = String::new();
        table.write_name_table(Dialect::C, &mut c).unwrap();
        assert!(c.contains(r#"static const char *const endo_names_tex[] = {"k'", "\\text{\"c\"}"};"#));
    }
}
