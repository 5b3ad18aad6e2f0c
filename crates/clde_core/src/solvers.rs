use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::output::OutputSnapshot;
use crate::traits::{EnsembleOperator, ForcingSource, OutputCollector};
use crate::vector::{DeviceVector, VectorAlgebra};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Fixed-step run parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub time_step: f64,
    pub step_count: usize,
    /// Steps between two output records.
    pub output_interval: usize,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            time_step: 1e-3,
            step_count: 1000,
            output_interval: 100,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(EngineError::InvalidSettings(format!(
                "time_step must be positive, got {}",
                self.time_step
            )));
        }
        if self.step_count == 0 {
            return Err(EngineError::InvalidSettings("step_count must be positive".into()));
        }
        if self.output_interval == 0 || self.output_interval > self.step_count {
            return Err(EngineError::InvalidSettings(format!(
                "output_interval must be in 1..={}, got {}",
                self.step_count, self.output_interval
            )));
        }
        Ok(())
    }

    /// Records produced by a run. A trailing partial interval is dropped.
    pub fn record_count(&self) -> usize {
        if self.output_interval == 0 {
            0
        } else {
            self.step_count / self.output_interval
        }
    }
}

/// Classic Runge-Kutta 4th order stepper over an ensemble state.
/// Stage vectors live on the device; stages are assembled with
/// `copy_from` + `accumulate`.
pub struct RK4<'ctx> {
    algebra: VectorAlgebra<'ctx>,
    k1: DeviceVector<'ctx, f64>,
    k2: DeviceVector<'ctx, f64>,
    k3: DeviceVector<'ctx, f64>,
    k4: DeviceVector<'ctx, f64>,
    tmp: DeviceVector<'ctx, f64>,
}

impl<'ctx> RK4<'ctx> {
    pub fn new(context: &'ctx DeviceContext, dim: usize) -> Result<Self, EngineError> {
        Ok(Self {
            algebra: VectorAlgebra::new(context)?,
            k1: DeviceVector::zeros(dim, context),
            k2: DeviceVector::zeros(dim, context),
            k3: DeviceVector::zeros(dim, context),
            k4: DeviceVector::zeros(dim, context),
            tmp: DeviceVector::zeros(dim, context),
        })
    }

    /// Advances `state` by `dt`. `forcing` is held fixed for all four stages.
    pub fn step(
        &mut self,
        operator: &dyn EnsembleOperator,
        state: &mut DeviceVector<'_, f64>,
        forcing: &DeviceVector<'_, f64>,
        dt: f64,
    ) -> Result<(), EngineError> {
        let half = 0.5 * dt;

        // k1 = f(y)
        operator.apply(state, &mut self.k1, forcing)?;

        // k2 = f(y + dt*k1/2)
        self.tmp.copy_from(state)?;
        self.algebra.accumulate(&mut self.tmp, &self.k1, half)?;
        operator.apply(&self.tmp, &mut self.k2, forcing)?;

        // k3 = f(y + dt*k2/2)
        self.tmp.copy_from(state)?;
        self.algebra.accumulate(&mut self.tmp, &self.k2, half)?;
        operator.apply(&self.tmp, &mut self.k3, forcing)?;

        // k4 = f(y + dt*k3)
        self.tmp.copy_from(state)?;
        self.algebra.accumulate(&mut self.tmp, &self.k3, dt)?;
        operator.apply(&self.tmp, &mut self.k4, forcing)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        self.algebra.accumulate(state, &self.k1, dt / 6.0)?;
        self.algebra.accumulate(state, &self.k2, dt / 3.0)?;
        self.algebra.accumulate(state, &self.k3, dt / 3.0)?;
        self.algebra.accumulate(state, &self.k4, dt / 6.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorPhase {
    Configured,
    Running,
    Complete,
}

/// Drives an ensemble operator through `step_count` RK4 steps, pulling one
/// set of forcing values per step and calling every registered output each
/// `output_interval` steps.
pub struct Integrator<'ctx> {
    context: &'ctx DeviceContext,
    operator: Box<dyn EnsembleOperator + 'ctx>,
    forcing_source: Box<dyn ForcingSource + 'ctx>,
    settings: IntegratorSettings,
    stepper: RK4<'ctx>,
    state: Option<DeviceVector<'ctx, f64>>,
    forcing: DeviceVector<'ctx, f64>,
    forcing_host: Vec<f64>,
    outputs: Vec<Box<dyn OutputCollector + 'ctx>>,
    phase: IntegratorPhase,
    steps_taken: usize,
}

impl<'ctx> Integrator<'ctx> {
    pub fn new(
        context: &'ctx DeviceContext,
        operator: Box<dyn EnsembleOperator + 'ctx>,
        forcing_source: Box<dyn ForcingSource + 'ctx>,
        settings: IntegratorSettings,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        let dimension = operator.dimension();
        if dimension.in_dim != dimension.out_dim {
            return Err(EngineError::InvalidSystem(format!(
                "integrated operator must be square, got {}x{}",
                dimension.in_dim, dimension.out_dim
            )));
        }
        if settings.step_count % settings.output_interval != 0 {
            warn!(
                step_count = settings.step_count,
                output_interval = settings.output_interval,
                "last partial output interval is not recorded"
            );
        }
        let state_len = forcing_source.trajectories() * dimension.in_dim;
        let forcing_len = forcing_source.trajectories() * forcing_source.slot_count();
        Ok(Self {
            context,
            operator,
            forcing_source,
            settings,
            stepper: RK4::new(context, state_len)?,
            state: None,
            forcing: DeviceVector::zeros(forcing_len, context),
            forcing_host: vec![0.0; forcing_len],
            outputs: Vec::new(),
            phase: IntegratorPhase::Configured,
            steps_taken: 0,
        })
    }

    fn state_len(&self) -> usize {
        self.forcing_source.trajectories() * self.operator.dimension().in_dim
    }

    fn ensure_configured(&self) -> Result<(), EngineError> {
        match self.phase {
            IntegratorPhase::Configured => Ok(()),
            phase => Err(EngineError::NotConfigured(format!(
                "integrator is {phase:?}, it can only be configured once"
            ))),
        }
    }

    /// Sets the full ensemble state, `trajectories * in_dim` values.
    pub fn set_initial_state(&mut self, values: &[f64]) -> Result<(), EngineError> {
        self.ensure_configured()?;
        let expected = self.state_len();
        if values.len() != expected {
            return Err(EngineError::size_mismatch("initial state", expected, values.len()));
        }
        self.state = Some(DeviceVector::from_host(values, self.context));
        Ok(())
    }

    /// Starts every trajectory from the same `in_dim` values.
    pub fn broadcast_initial_state(&mut self, row: &[f64]) -> Result<(), EngineError> {
        let in_dim = self.operator.dimension().in_dim;
        if row.len() != in_dim {
            return Err(EngineError::size_mismatch("initial state row", in_dim, row.len()));
        }
        let values = row.repeat(self.forcing_source.trajectories());
        self.set_initial_state(&values)
    }

    /// Registers a collector; collectors run in registration order.
    pub fn add_output(&mut self, output: Box<dyn OutputCollector + 'ctx>) {
        self.outputs.push(output);
    }

    /// Runs the whole integration. Can be called once.
    pub fn calculate(&mut self) -> Result<(), EngineError> {
        self.ensure_configured()?;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| EngineError::NotConfigured("initial state not set".into()))?;

        self.phase = IntegratorPhase::Running;
        let settings = self.settings;
        info!(
            steps = settings.step_count,
            dt = settings.time_step,
            interval = settings.output_interval,
            trajectories = self.forcing_source.trajectories(),
            outputs = self.outputs.len(),
            "integration started"
        );

        for step in 0..settings.step_count {
            self.forcing_source.fill_step(step, &mut self.forcing_host)?;
            self.forcing.upload(&self.forcing_host)?;
            self.stepper
                .step(self.operator.as_ref(), state, &self.forcing, settings.time_step)?;
            self.steps_taken = step + 1;

            if self.steps_taken % settings.output_interval == 0 {
                for output in self.outputs.iter_mut() {
                    output.apply(state, &self.forcing)?;
                }
                debug!(
                    step = self.steps_taken,
                    record = self.steps_taken / settings.output_interval,
                    "outputs recorded"
                );
            }
        }

        self.phase = IntegratorPhase::Complete;
        info!(
            steps = self.steps_taken,
            commands = self.context.queue().submitted(),
            "integration complete"
        );
        Ok(())
    }

    pub fn phase(&self) -> IntegratorPhase {
        self.phase
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn time(&self) -> f64 {
        self.steps_taken as f64 * self.settings.time_step
    }

    /// Current ensemble state, if one was set.
    pub fn state(&self) -> Option<Vec<f64>> {
        self.state.as_ref().map(DeviceVector::download)
    }

    pub fn outputs(&self) -> &[Box<dyn OutputCollector + 'ctx>] {
        &self.outputs
    }

    /// Copies every collector's data out for an external writer.
    pub fn snapshots(&self) -> Vec<OutputSnapshot> {
        self.outputs
            .iter()
            .map(|output| OutputSnapshot::capture(output.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, DeviceSelector};
    use crate::forcing::WienerForcing;
    use crate::operator::PolynomialOperator;
    use crate::polynomial::{ComplexSystem, Monomial, OperatorDimension};
    use num_complex::Complex64;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn context() -> DeviceContext {
        DeviceContext::new(&ContextConfig {
            selector: DeviceSelector::Index { platform: 0, device: 1 },
            threads: None,
        })
        .unwrap()
    }

    /// dy/dt = rate * y, element-wise.
    struct Linear {
        dim: usize,
        rate: f64,
    }

    impl EnsembleOperator for Linear {
        fn dimension(&self) -> OperatorDimension {
            OperatorDimension::new(self.dim, self.dim)
        }

        fn apply(
            &self,
            input: &DeviceVector<'_, f64>,
            output: &mut DeviceVector<'_, f64>,
            _forcing: &DeviceVector<'_, f64>,
        ) -> Result<(), EngineError> {
            let values: Vec<f64> = input.download().iter().map(|y| self.rate * y).collect();
            output.upload(&values)
        }
    }

    struct Recorder {
        name: String,
        log: Rc<RefCell<Vec<String>>>,
        data: Vec<f64>,
    }

    impl OutputCollector for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(
            &mut self,
            state: &DeviceVector<'_, f64>,
            _forcing: &DeviceVector<'_, f64>,
        ) -> Result<(), EngineError> {
            self.log.borrow_mut().push(self.name.clone());
            self.data.push(state.download()[0]);
            Ok(())
        }

        fn data(&self) -> &[f64] {
            &self.data
        }

        fn dimensions(&self) -> Vec<usize> {
            vec![self.data.len()]
        }
    }

    fn settings(time_step: f64, step_count: usize, output_interval: usize) -> IntegratorSettings {
        IntegratorSettings {
            time_step,
            step_count,
            output_interval,
        }
    }

    fn linear_integrator(
        context: &DeviceContext,
        rate: f64,
        settings: IntegratorSettings,
    ) -> Integrator<'_> {
        let forcing = WienerForcing::new(2, 0, settings.time_step, 0).unwrap();
        let operator = Box::new(Linear { dim: 3, rate });
        Integrator::new(context, operator, Box::new(forcing), settings).unwrap()
    }

    /// Zero right-hand side that logs the forcing it is handed on every stage.
    struct ForcingLog {
        seen: Rc<RefCell<Vec<Vec<f64>>>>,
    }

    impl EnsembleOperator for ForcingLog {
        fn dimension(&self) -> OperatorDimension {
            OperatorDimension::new(2, 2)
        }

        fn apply(
            &self,
            _input: &DeviceVector<'_, f64>,
            output: &mut DeviceVector<'_, f64>,
            forcing: &DeviceVector<'_, f64>,
        ) -> Result<(), EngineError> {
            self.seen.borrow_mut().push(forcing.download());
            output.fill(0.0);
            Ok(())
        }
    }

    struct ForcingRecorder {
        seen: Rc<RefCell<Vec<Vec<f64>>>>,
    }

    impl OutputCollector for ForcingRecorder {
        fn name(&self) -> &str {
            "forcing"
        }

        fn apply(
            &mut self,
            _state: &DeviceVector<'_, f64>,
            forcing: &DeviceVector<'_, f64>,
        ) -> Result<(), EngineError> {
            self.seen.borrow_mut().push(forcing.download());
            Ok(())
        }

        fn data(&self) -> &[f64] {
            &[]
        }

        fn dimensions(&self) -> Vec<usize> {
            vec![0]
        }
    }

    #[test]
    fn zero_operator_keeps_state() {
        let context = context();
        let mut integrator = linear_integrator(&context, 0.0, settings(0.1, 20, 5));
        let initial = [1.0, -2.0, 0.5, 3.0, 0.0, 7.25];
        integrator.set_initial_state(&initial).unwrap();
        integrator.calculate().unwrap();
        assert_eq!(integrator.state().unwrap(), initial.to_vec());
        assert_eq!(integrator.phase(), IntegratorPhase::Complete);
        assert_eq!(integrator.steps_taken(), 20);
        assert!((integrator.time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn identity_operator_reproduces_rk4_amplification() {
        let context = context();
        let h = 0.1;
        let steps = 7;
        let mut integrator = linear_integrator(&context, 1.0, settings(h, steps, 1));
        integrator.broadcast_initial_state(&[1.0, 2.0, -0.5]).unwrap();
        integrator.calculate().unwrap();
        let factor =
            (1.0 + h + h * h / 2.0 + h.powi(3) / 6.0 + h.powi(4) / 24.0).powi(steps as i32);
        let state = integrator.state().unwrap();
        for (value, start) in state.iter().zip([1.0, 2.0, -0.5].iter().cycle()) {
            assert!((value - start * factor).abs() < 1e-12 * factor);
        }
    }

    #[test]
    fn outputs_run_every_interval_in_registration_order() {
        let context = context();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut integrator = linear_integrator(&context, -1.0, settings(1e-3, 1000, 100));
        for name in ["first", "second"] {
            integrator.add_output(Box::new(Recorder {
                name: name.to_string(),
                log: Rc::clone(&log),
                data: Vec::new(),
            }));
        }
        integrator.broadcast_initial_state(&[1.0, 1.0, 1.0]).unwrap();
        integrator.calculate().unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 20);
        for pair in log.chunks(2) {
            assert_eq!(pair, ["first", "second"]);
        }
        let snapshots = integrator.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].dimensions, vec![10]);
        assert_eq!(integrator.settings().record_count(), 10);
    }

    #[test]
    fn calculate_requires_state_and_runs_once() {
        let context = context();
        let mut integrator = linear_integrator(&context, 1.0, settings(0.1, 2, 1));
        assert!(matches!(integrator.calculate(), Err(EngineError::NotConfigured(_))));
        integrator.broadcast_initial_state(&[0.0; 3]).unwrap();
        integrator.calculate().unwrap();
        assert!(matches!(integrator.calculate(), Err(EngineError::NotConfigured(_))));
        assert!(matches!(
            integrator.set_initial_state(&[0.0; 6]),
            Err(EngineError::NotConfigured(_))
        ));
    }

    #[test]
    fn initial_state_length_is_checked() {
        let context = context();
        let mut integrator = linear_integrator(&context, 1.0, settings(0.1, 2, 1));
        assert!(matches!(
            integrator.set_initial_state(&[0.0; 5]),
            Err(EngineError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn settings_are_validated() {
        assert!(settings(0.0, 10, 1).validate().is_err());
        assert!(settings(0.1, 0, 1).validate().is_err());
        assert!(settings(0.1, 10, 11).validate().is_err());
        assert!(settings(0.1, 10, 0).validate().is_err());
        let truncated = settings(0.1, 10, 3);
        assert!(truncated.validate().is_ok());
        assert_eq!(truncated.record_count(), 3);
        assert_eq!(IntegratorSettings::default().record_count(), 10);
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        let context = context();
        let system = ComplexSystem::new(vec![Monomial::new(Complex64::new(-1.0, 0.0), vec![0], 0)])
            .reduce_to_real();
        let operator = PolynomialOperator::new(&context, "decay", &system, 1, 0).unwrap();
        let settings = settings(0.01, 100, 10);
        let forcing = WienerForcing::new(1, 0, settings.time_step, 0).unwrap();
        let mut integrator =
            Integrator::new(&context, Box::new(operator), Box::new(forcing), settings).unwrap();
        integrator.set_initial_state(&[1.0, 0.0]).unwrap();
        integrator.calculate().unwrap();
        let state = integrator.state().unwrap();
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-9);
        assert!(state[1].abs() < 1e-15);
    }

    #[test]
    fn forcing_is_held_across_stages_and_shared_with_outputs() {
        let context = context();
        let stages = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::new(RefCell::new(Vec::new()));
        let forcing = WienerForcing::new(1, 1, 0.01, 42).unwrap();
        let operator = Box::new(ForcingLog {
            seen: Rc::clone(&stages),
        });
        let mut integrator =
            Integrator::new(&context, operator, Box::new(forcing), settings(0.01, 6, 2)).unwrap();
        integrator.add_output(Box::new(ForcingRecorder {
            seen: Rc::clone(&recorded),
        }));
        integrator.broadcast_initial_state(&[1.0, 0.0]).unwrap();
        integrator.calculate().unwrap();

        let stages = stages.borrow();
        assert_eq!(stages.len(), 4 * 6);
        let per_step: Vec<&Vec<f64>> = stages
            .chunks(4)
            .map(|step| {
                assert!(step.iter().all(|values| values == &step[0]));
                &step[0]
            })
            .collect();
        for pair in per_step.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 3);
        for (record, step) in recorded.iter().zip([1, 3, 5]) {
            assert_eq!(record, per_step[step]);
        }
    }
}
