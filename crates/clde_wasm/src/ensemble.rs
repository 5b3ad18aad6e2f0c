//! WASM-exported ensemble runner.

use anyhow::{anyhow, Result};
use clde_core::config::{ContextConfig, DeviceSelector};
use clde_core::output::OutputSnapshot;
use clde_core::simulation::{run_ensemble, EnsembleSpec};
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

/// Browsers get no thread pool, so the default is the serial host device.
fn default_config() -> ContextConfig {
    ContextConfig {
        selector: DeviceSelector::Index {
            platform: 0,
            device: 1,
        },
        threads: None,
    }
}

fn to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

/// Holds an ensemble description and the snapshots of its latest run.
#[wasm_bindgen]
pub struct WasmEnsemble {
    spec: EnsembleSpec,
    config: ContextConfig,
    snapshots: Vec<OutputSnapshot>,
}

#[wasm_bindgen]
impl WasmEnsemble {
    /// `spec_val` deserialises into an `EnsembleSpec`; `config_val` may be
    /// `undefined` to use the serial device.
    #[wasm_bindgen(constructor)]
    pub fn new(spec_val: JsValue, config_val: JsValue) -> Result<WasmEnsemble, JsValue> {
        #[cfg(target_arch = "wasm32")]
        console_error_panic_hook::set_once();

        let spec: EnsembleSpec = from_value(spec_val)
            .map_err(|e| JsValue::from_str(&format!("Invalid ensemble spec: {}", e)))?;
        let config = if config_val.is_undefined() || config_val.is_null() {
            default_config()
        } else {
            from_value(config_val)
                .map_err(|e| JsValue::from_str(&format!("Invalid device config: {}", e)))?
        };
        Ok(WasmEnsemble::from_parts(spec, config))
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.spec.seed = Some(seed);
    }

    pub fn set_trajectories(&mut self, trajectories: u32) {
        self.spec.trajectories = trajectories as usize;
    }

    /// Runs the ensemble and returns every snapshot as a JS array of
    /// `{ name, dimensions, data }`.
    pub fn run(&mut self) -> Result<JsValue, JsValue> {
        self.run_snapshots().map_err(to_js)?;
        to_value(&self.snapshots)
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Flat data of one output from the latest run.
    pub fn output_data(&self, name: &str) -> Result<js_sys::Float64Array, JsValue> {
        let snapshot = self.snapshot(name).map_err(to_js)?;
        Ok(js_sys::Float64Array::from(snapshot.data.as_slice()))
    }

    pub fn output_dimensions(&self, name: &str) -> Result<Vec<u32>, JsValue> {
        let snapshot = self.snapshot(name).map_err(to_js)?;
        Ok(snapshot.dimensions.iter().map(|&d| d as u32).collect())
    }

    pub fn output_names(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.name.clone()).collect()
    }
}

impl WasmEnsemble {
    pub fn from_parts(spec: EnsembleSpec, config: ContextConfig) -> Self {
        Self {
            spec,
            config,
            snapshots: Vec::new(),
        }
    }

    pub fn run_snapshots(&mut self) -> Result<&[OutputSnapshot]> {
        self.snapshots = run_ensemble(&self.config, &self.spec)?;
        Ok(&self.snapshots)
    }

    fn snapshot(&self, name: &str) -> Result<&OutputSnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow!("No output named `{}` in the latest run.", name))
    }
}
