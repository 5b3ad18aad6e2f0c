mod ensemble;

pub use ensemble::WasmEnsemble;

use clde_core::device::discover_platforms;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

/// Platforms and devices visible to the engine, as a JS array.
#[wasm_bindgen]
pub fn platforms() -> Result<JsValue, JsValue> {
    to_value(&discover_platforms())
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}
