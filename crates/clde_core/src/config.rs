//! Typed configuration handed to the engine by an external loader.
//!
//! Nothing here parses files; the structs derive `Deserialize` so whichever
//! front end owns the configuration document (YAML, JSON, a JS object) can
//! produce them directly.

use crate::device::Capability;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the context picks its compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSelector {
    /// Platform and device position as reported by `discover_platforms`.
    Index { platform: usize, device: usize },
    /// First device, in discovery order, that has every listed capability.
    Capability { require: Vec<Capability> },
}

impl Default for DeviceSelector {
    fn default() -> Self {
        DeviceSelector::Index {
            platform: 0,
            device: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub selector: DeviceSelector,
    /// Upper bound on compute units used by a parallel device.
    #[serde(default)]
    pub threads: Option<usize>,
}

/// The `properties` section of a run document: device selection plus where
/// the external writer should put its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub device: ContextConfig,
    pub output_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_defaults_to_first_device() {
        let config: ContextConfig = serde_json::from_str("{}").expect("empty config parses");
        assert_eq!(config.selector, DeviceSelector::Index { platform: 0, device: 0 });
        assert_eq!(config.threads, None);
    }

    #[test]
    fn run_config_reads_capability_selector() {
        let raw = r#"{
            "device": {
                "selector": {
                    "kind": "capability",
                    "require": ["f64_compute", "parallel_dispatch"]
                },
                "threads": 2
            },
            "output_path": "/tmp/clde"
        }"#;
        let config: RunConfig = serde_json::from_str(raw).expect("run config parses");
        assert_eq!(
            config.device.selector,
            DeviceSelector::Capability {
                require: vec![Capability::F64Compute, Capability::ParallelDispatch]
            }
        );
        assert_eq!(config.device.threads, Some(2));
        assert_eq!(config.output_path, PathBuf::from("/tmp/clde"));
    }
}
