//! One-call ensemble runs from a serialisable description.

use crate::config::ContextConfig;
use crate::device::DeviceContext;
use crate::forcing::{WienerForcing, DEFAULT_SEED};
use crate::operator::PolynomialOperator;
use crate::output::{OutputSnapshot, PolynomialOutput, TrajectoryOutput};
use crate::polynomial::{ComplexSystem, OperatorDimension};
use crate::solvers::{Integrator, IntegratorSettings};
use anyhow::{bail, Context, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// A named observable, given in complex form like the system itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservableSpec {
    pub name: String,
    pub system: ComplexSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSpec {
    /// Complex right-hand side.
    pub system: ComplexSystem,
    /// Starting point shared by every trajectory; fixes the state dimension.
    pub initial_state: Vec<Complex64>,
    #[serde(default)]
    pub observables: Vec<ObservableSpec>,
    #[serde(default = "default_trajectories")]
    pub trajectories: usize,
    #[serde(default)]
    pub settings: IntegratorSettings,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Also record the raw state of the first trajectory.
    #[serde(default)]
    pub record_trajectory: bool,
}

fn default_trajectories() -> usize {
    1
}

/// Name of the snapshot produced when `record_trajectory` is set.
pub const TRAJECTORY_OUTPUT: &str = "trajectory";

/// Builds a context from `config`, integrates the ensemble and returns one
/// snapshot per output, observables first.
pub fn run_ensemble(config: &ContextConfig, spec: &EnsembleSpec) -> Result<Vec<OutputSnapshot>> {
    if spec.trajectories == 0 {
        bail!("Ensemble must contain at least one trajectory.");
    }
    if spec.initial_state.is_empty() {
        bail!("Initial state must have positive dimension.");
    }
    spec.settings.validate().context("Invalid integrator settings")?;

    let reduced = spec.system.reduce_to_real();
    let inferred = reduced.dimension();
    let state_dim = 2 * spec.initial_state.len();
    if inferred.in_dim > state_dim || inferred.out_dim > state_dim {
        bail!(
            "System references {} real variables but the initial state only has {}.",
            inferred.in_dim.max(inferred.out_dim),
            state_dim
        );
    }

    let observables: Vec<_> = spec
        .observables
        .iter()
        .map(|observable| (observable.name.as_str(), observable.system.reduce_to_real()))
        .collect();
    let slots = observables
        .iter()
        .map(|(_, system)| system.forcing_slots())
        .fold(reduced.forcing_slots(), usize::max);

    let context = DeviceContext::new(config).context("Failed to create compute context")?;
    let operator = PolynomialOperator::with_dimension(
        &context,
        "ensemble_rhs",
        &reduced,
        OperatorDimension::new(state_dim, state_dim),
        spec.trajectories,
        slots,
    )
    .context("Failed to build the right-hand side")?;
    let forcing = WienerForcing::new(
        spec.trajectories,
        slots,
        spec.settings.time_step,
        spec.seed.unwrap_or(DEFAULT_SEED),
    )?;

    let mut integrator =
        Integrator::new(&context, Box::new(operator), Box::new(forcing), spec.settings)?;
    let records = spec.settings.record_count();
    for (name, system) in &observables {
        let output = PolynomialOutput::new(
            &context,
            name,
            system,
            spec.trajectories,
            state_dim,
            slots,
            records,
        )
        .with_context(|| format!("Failed to build observable `{name}`"))?;
        integrator.add_output(Box::new(output));
    }
    if spec.record_trajectory {
        let trajectory = TrajectoryOutput::new(TRAJECTORY_OUTPUT, 0, state_dim, records);
        integrator.add_output(Box::new(trajectory));
    }

    let row: Vec<f64> = spec.initial_state.iter().flat_map(|z| [z.re, z.im]).collect();
    integrator.broadcast_initial_state(&row)?;
    integrator.calculate().context("Integration failed")?;
    Ok(integrator.snapshots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSelector;
    use crate::polynomial::Monomial;

    fn serial() -> ContextConfig {
        ContextConfig {
            selector: DeviceSelector::Index { platform: 0, device: 1 },
            threads: None,
        }
    }

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn rotation_spec() -> EnsembleSpec {
        // dz/dt = i z, z(0) = 1: z(t) = cos t + i sin t
        EnsembleSpec {
            system: ComplexSystem::new(vec![Monomial::new(c(0.0, 1.0), vec![0], 0)]),
            initial_state: vec![c(1.0, 0.0)],
            observables: vec![ObservableSpec {
                name: "z".into(),
                system: ComplexSystem::new(vec![Monomial::new(c(1.0, 0.0), vec![0], 0)]),
            }],
            trajectories: 2,
            settings: IntegratorSettings {
                time_step: 0.01,
                step_count: 100,
                output_interval: 25,
            },
            seed: None,
            record_trajectory: true,
        }
    }

    #[test]
    fn deterministic_rotation_records_observables() {
        let snapshots = run_ensemble(&serial(), &rotation_spec()).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "z");
        assert_eq!(snapshots[0].dimensions, vec![4, 2]);
        assert_eq!(snapshots[1].name, TRAJECTORY_OUTPUT);
        for record in 0..4 {
            let t = 0.25 * (record + 1) as f64;
            let row = &snapshots[0].data[2 * record..2 * record + 2];
            assert!((row[0] - t.cos()).abs() < 1e-9);
            assert!((row[1] - t.sin()).abs() < 1e-9);
        }
        assert_eq!(snapshots[0].data, snapshots[1].data);
    }

    #[test]
    fn parallel_device_gives_same_result() {
        let serial_run = run_ensemble(&serial(), &rotation_spec()).unwrap();
        let parallel_run = run_ensemble(&ContextConfig::default(), &rotation_spec()).unwrap();
        assert_eq!(serial_run, parallel_run);
    }

    #[test]
    fn forced_runs_are_reproducible_per_seed() {
        let mut spec = rotation_spec();
        spec.system = ComplexSystem::new(vec![
            Monomial::new(c(-1.0, 0.0), vec![0], 0),
            Monomial::new(c(0.5, 0.0), vec![], 0).with_forcing(0),
        ]);
        spec.seed = Some(5);
        let first = run_ensemble(&serial(), &spec).unwrap();
        let second = run_ensemble(&serial(), &spec).unwrap();
        assert_eq!(first, second);
        spec.seed = Some(6);
        let third = run_ensemble(&serial(), &spec).unwrap();
        assert_ne!(first[0].data, third[0].data);
    }

    #[test]
    fn rejects_inconsistent_descriptions() {
        let mut spec = rotation_spec();
        spec.trajectories = 0;
        assert!(run_ensemble(&serial(), &spec).is_err());

        let mut spec = rotation_spec();
        spec.system = ComplexSystem::new(vec![Monomial::new(c(1.0, 0.0), vec![3], 0)]);
        let message = run_ensemble(&serial(), &spec).unwrap_err().to_string();
        assert!(message.contains("initial state"));

        let mut spec = rotation_spec();
        spec.settings.output_interval = 0;
        assert!(run_ensemble(&serial(), &spec).is_err());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let raw = r#"{
            "system": [{"coefficient": [-1.0, 0.0], "input_indices": [0], "output_index": 0}],
            "initial_state": [[1.0, 0.0]]
        }"#;
        let spec: EnsembleSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.trajectories, 1);
        assert_eq!(spec.settings, IntegratorSettings::default());
        assert!(spec.observables.is_empty());
        assert!(!spec.record_trajectory);
    }
}
