//! JavaScript-facing model builder.

use anyhow::{anyhow, Context};
use modc_core::diagnostics::CallbackSink;
use modc_core::reader::{read_equation, read_model};
use modc_core::session::TreeMode;
use modc_core::symbol_table::SymbolKind;
use modc_core::{CompilationSession, CompileOptions, CompiledModel};
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmModel {
    session: CompilationSession,
    last: Option<CompiledModel>,
}

#[derive(Serialize)]
struct SymbolView<'a> {
    kind: SymbolKind,
    name: &'a str,
    display_name: &'a str,
}

fn to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

#[wasm_bindgen]
impl WasmModel {
    /// `options` is a `CompileOptions` object; `undefined` selects the defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(options: JsValue) -> Result<WasmModel, JsValue> {
        console_error_panic_hook::set_once();

        let options: CompileOptions = if options.is_undefined() || options.is_null() {
            CompileOptions::default()
        } else {
            from_value(options)
                .map_err(|err| anyhow!("{err}"))
                .context("Invalid compile options")
                .map_err(to_js)?
        };
        Ok(WasmModel {
            session: CompilationSession::new(options),
            last: None,
        })
    }

    /// Declares `name`. `kind` is one of `endogenous`, `exogenous`,
    /// `exogenous_det`, `parameter`, `unknown_function` or `predetermined`.
    pub fn declare(&mut self, kind: &str, name: &str, tex_name: &str) -> Result<(), JsValue> {
        let session = &mut self.session;
        let result = match kind {
            "endogenous" => session.declare_endogenous(name, tex_name).map(drop),
            "exogenous" => session.declare_exogenous(name, tex_name).map(drop),
            "exogenous_det" => session.declare_exogenous_det(name, tex_name).map(drop),
            "parameter" => session.declare_parameter(name, tex_name).map(drop),
            "unknown_function" => session.declare_unknown_function(name).map(drop),
            "predetermined" => session.mark_predetermined(name),
            other => return Err(JsValue::from_str(&format!("Unknown symbol kind '{other}'"))),
        };
        result
            .with_context(|| format!("Failed to declare '{name}'"))
            .map_err(to_js)
    }

    /// Reads a whole model description (declarations plus model block).
    pub fn read(&mut self, source: &str) -> Result<(), JsValue> {
        read_model(&mut self.session, source)
            .context("Failed to read model")
            .map_err(to_js)
    }

    /// Adds one equation, opening the model block on first use.
    pub fn add_equation(&mut self, text: &str) -> Result<(), JsValue> {
        if self.session.mode() == TreeMode::Expressions && self.session.model().is_empty() {
            self.session
                .begin_model()
                .context("Cannot add equations")
                .map_err(to_js)?;
        }
        read_equation(&mut self.session, text)
            .with_context(|| format!("Invalid equation '{text}'"))
            .map_err(to_js)?;
        Ok(())
    }

    /// Generates code and returns its text.
    pub fn compile(&mut self) -> Result<String, JsValue> {
        if self.session.mode() == TreeMode::Model {
            self.session.end_model().map_err(|err| to_js(err.into()))?;
        }
        let compiled = self
            .session
            .compile()
            .context("Compilation failed")
            .map_err(to_js)?;
        let text = compiled.text.clone();
        self.last = Some(compiled);
        Ok(text)
    }

    /// Summary of the last successful compilation, or `null`.
    pub fn summary(&self) -> Result<JsValue, JsValue> {
        match &self.last {
            Some(compiled) => to_value(compiled)
                .map_err(|err| JsValue::from_str(&format!("Failed to serialize summary: {err}"))),
            None => Ok(JsValue::NULL),
        }
    }

    /// Diagnostics collected so far (empty once a callback is installed).
    pub fn diagnostics(&self) -> Result<JsValue, JsValue> {
        to_value(self.session.diagnostics())
            .map_err(|err| JsValue::from_str(&format!("Failed to serialize diagnostics: {err}")))
    }

    /// Sends every further diagnostic to `callback` instead of collecting it.
    pub fn set_diagnostic_callback(&mut self, callback: js_sys::Function) {
        self.session.set_sink(Box::new(CallbackSink::new(move |diagnostic| {
            if let Ok(value) = to_value(diagnostic) {
                let _ = callback.call1(&JsValue::NULL, &value);
            }
        })));
    }

    /// Declared names in ordinal order, grouped by kind.
    pub fn symbols(&self) -> Result<JsValue, JsValue> {
        let export = self.session.symbols().export();
        let views: Vec<SymbolView> = export
            .iter()
            .flat_map(|(kind, names)| {
                names.iter().map(move |(name, display_name)| SymbolView {
                    kind: *kind,
                    name,
                    display_name,
                })
            })
            .collect();
        to_value(&views).map_err(|err| JsValue::from_str(&format!("Failed to serialize symbols: {err}")))
    }
}
