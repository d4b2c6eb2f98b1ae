//! Assembly of the complete generated source file.

use std::fmt::Write;

use serde::Serialize;
use tracing::info;

use crate::codegen::{CodeGenerator, OutputSlot, SlotLayout, Target, TemporaryNamer};
use crate::config::CompileOptions;
use crate::data_tree::DataTree;
use crate::error::Result;
use crate::model_tree::{DynamicColumns, Hessian, Jacobian, ModelExtension};
use crate::render::{Dialect, VariableStyle};

/// Derivative matrices of one model variant (static or dynamic).
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub jacobian: Jacobian,
    pub hessian: Option<Hessian>,
}

/// Generated source plus a summary of what it contains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledModel {
    pub dialect: Dialect,
    pub text: String,
    pub equations: usize,
    pub static_columns: usize,
    pub dynamic_columns: Option<usize>,
    pub temporaries: usize,
}

/// Residuals in equation order, then Jacobian and Hessian entries in stored order.
pub fn targets(model: &ModelExtension, derivatives: &Derivatives) -> Vec<Target> {
    let mut targets: Vec<Target> = model
        .equations()
        .iter()
        .enumerate()
        .map(|(row, eq)| Target::new(OutputSlot::Residual(row), eq.residual))
        .collect();
    targets.extend(
        derivatives
            .jacobian
            .entries
            .iter()
            .map(|e| Target::new(OutputSlot::Jacobian { row: e.row, col: e.col }, e.node)),
    );
    if let Some(hessian) = &derivatives.hessian {
        targets.extend(hessian.entries.iter().map(|e| {
            Target::new(
                OutputSlot::Hessian {
                    row: e.row,
                    col1: e.col1,
                    col2: e.col2,
                },
                e.node,
            )
        }));
    }
    targets
}

enum Variant {
    Static,
    Dynamic,
}

const C_PREAMBLE: &str = "#include <math.h>\n\n\
static inline double normcdf(double x, double mu, double sigma)\n\
{\n  return 0.5*erfc(-(x - mu)/(sigma*sqrt(2.0)));\n}\n";

/// Writes header, name table, the static function and, when given, the
/// dynamic function.
pub fn assemble(
    tree: &DataTree,
    model: &ModelExtension,
    static_part: &Derivatives,
    dynamic_part: Option<(&DynamicColumns, &Derivatives)>,
    options: &CompileOptions,
    namer: &mut TemporaryNamer,
) -> Result<CompiledModel> {
    let dialect = options.dialect;
    let mut text = String::new();
    writeln!(
        text,
        "{}",
        dialect.comment(&format!("{}: generated by modc, do not edit", options.basename))
    )?;
    writeln!(text)?;
    if dialect == Dialect::C {
        writeln!(text, "{C_PREAMBLE}")?;
    }
    tree.symbols().write_name_table(dialect, &mut text)?;

    let mut temporaries = write_function(
        &mut text,
        Variant::Static,
        tree,
        model,
        static_part,
        VariableStyle::Static,
        options,
        namer,
    )?;
    if let Some((columns, derivatives)) = dynamic_part {
        temporaries += write_function(
            &mut text,
            Variant::Dynamic,
            tree,
            model,
            derivatives,
            VariableStyle::Dynamic(columns),
            options,
            namer,
        )?;
    }

    info!(
        bytes = text.len(),
        temporaries,
        dialect = ?dialect,
        "assembled generated code"
    );
    Ok(CompiledModel {
        dialect,
        text,
        equations: model.len(),
        static_columns: static_part.jacobian.cols(),
        dynamic_columns: dynamic_part.map(|(columns, _)| columns.len()),
        temporaries,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_function(
    out: &mut String,
    variant: Variant,
    tree: &DataTree,
    model: &ModelExtension,
    derivatives: &Derivatives,
    style: VariableStyle<'_>,
    options: &CompileOptions,
    namer: &mut TemporaryNamer,
) -> Result<usize> {
    let dialect = options.dialect;
    let second_order = derivatives.hessian.is_some();
    let layout = SlotLayout {
        equations: model.len(),
        columns: derivatives.jacobian.cols(),
    };
    let (suffix, inputs_matlab, inputs_c) = match variant {
        Variant::Static => ("static", "y, x, params", "const double *y, const double *x, const double *params"),
        Variant::Dynamic => (
            "dynamic",
            "y, x, params, it_",
            "const double *y, const double *x, int nb_row_x, const double *params, int it_",
        ),
    };
    let name = format!("{}_{}", options.basename, suffix);

    writeln!(out)?;
    match dialect {
        Dialect::Matlab => {
            let outputs = if second_order {
                "residual, g1, g2"
            } else {
                "residual, g1"
            };
            writeln!(out, "function [{outputs}] = {name}({inputs_matlab})")?;
            writeln!(out, "  residual = zeros({}, 1);", layout.equations)?;
            writeln!(out, "  g1 = zeros({}, {});", layout.equations, layout.columns)?;
            if second_order {
                writeln!(
                    out,
                    "  g2 = zeros({}, {});",
                    layout.equations,
                    layout.columns * layout.columns
                )?;
            }
        }
        Dialect::C => {
            let outputs = if second_order {
                "double *residual, double *g1, double *g2"
            } else {
                "double *residual, double *g1"
            };
            writeln!(out, "void {name}({inputs_c}, {outputs})")?;
            writeln!(out, "{{")?;
        }
    }

    let generator = CodeGenerator::new(tree, dialect, style);
    let program = generator.plan(&targets(model, derivatives), namer);
    generator.write(&program, layout, "  ", out)?;

    match dialect {
        Dialect::Matlab => writeln!(out, "end")?,
        Dialect::C => writeln!(out, "}}")?,
    }
    Ok(program.temporaries.len())
}
