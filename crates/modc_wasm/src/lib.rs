//! WASM bridge exposing the modc compiler to a JavaScript host.

mod model;

pub use model::WasmModel;
