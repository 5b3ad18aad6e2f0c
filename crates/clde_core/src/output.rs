//! Output collectors invoked by the integrator every output interval.

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::operator::PolynomialOperator;
use crate::polynomial::{OperatorDimension, RealSystem};
use crate::traits::{EnsembleOperator, OutputCollector};
use crate::vector::DeviceVector;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Owned copy of a collector's results, shaped for an external array writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub name: String,
    pub dimensions: Vec<usize>,
    pub data: Vec<f64>,
}

impl OutputSnapshot {
    pub fn capture(output: &dyn OutputCollector) -> Self {
        Self {
            name: output.name().to_string(),
            dimensions: output.dimensions(),
            data: output.data().to_vec(),
        }
    }
}

/// Fixed-capacity, append-only record buffer.
#[derive(Debug, Clone)]
struct Records {
    name: String,
    width: usize,
    capacity: usize,
    written: usize,
    data: Vec<f64>,
}

impl Records {
    fn new(name: &str, width: usize, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            width,
            capacity,
            written: 0,
            data: Vec::with_capacity(width * capacity),
        }
    }

    /// Counted separately from `data` so zero-width records still fill up.
    fn written(&self) -> usize {
        self.written
    }

    fn check_room(&self) -> Result<(), EngineError> {
        if self.written >= self.capacity {
            return Err(EngineError::BufferOverrun {
                name: self.name.clone(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn push(&mut self, row: &[f64]) {
        self.data.extend_from_slice(row);
        self.written += 1;
        trace!(output = %self.name, record = self.written(), "record stored");
    }
}

/// Projects the state onto a set of observables given as a reduced
/// polynomial system, recording the first trajectory's values.
pub struct PolynomialOutput<'ctx> {
    operator: PolynomialOperator<'ctx>,
    records: Records,
    row: Vec<f64>,
}

impl<'ctx> PolynomialOutput<'ctx> {
    /// `in_dim` is the full state width per trajectory; the observable count
    /// is inferred from the system.
    pub fn new(
        context: &'ctx DeviceContext,
        name: &str,
        system: &RealSystem,
        trajectories: usize,
        in_dim: usize,
        forcing_slots: usize,
        records: usize,
    ) -> Result<Self, EngineError> {
        if trajectories == 0 {
            return Err(EngineError::InvalidSettings(format!(
                "output `{name}` needs at least one trajectory"
            )));
        }
        let out_dim = system.dimension().out_dim;
        let dimension = OperatorDimension::new(in_dim, out_dim + out_dim % 2);
        let operator = PolynomialOperator::with_dimension(
            context,
            &format!("output_{name}"),
            system,
            dimension,
            trajectories,
            forcing_slots,
        )?;
        Ok(Self {
            operator,
            records: Records::new(name, dimension.out_dim, records),
            row: vec![0.0; dimension.out_dim],
        })
    }

    pub fn records_written(&self) -> usize {
        self.records.written()
    }

    pub fn capacity(&self) -> usize {
        self.records.capacity
    }
}

impl OutputCollector for PolynomialOutput<'_> {
    fn name(&self) -> &str {
        &self.records.name
    }

    fn apply(
        &mut self,
        state: &DeviceVector<'_, f64>,
        forcing: &DeviceVector<'_, f64>,
    ) -> Result<(), EngineError> {
        self.records.check_room()?;
        let dimension = self.operator.dimension();
        let trajectories = self.operator.trajectories();
        let expected_state = trajectories * dimension.in_dim;
        if state.len() != expected_state {
            return Err(EngineError::size_mismatch("output state", expected_state, state.len()));
        }
        let expected_forcing = trajectories * self.operator.forcing_slots();
        if forcing.len() != expected_forcing {
            return Err(EngineError::size_mismatch(
                "output forcing",
                expected_forcing,
                forcing.len(),
            ));
        }
        // Only the first trajectory is recorded.
        self.operator
            .evaluate_rows(1, state.as_slice(), forcing.as_slice(), &mut self.row)?;
        state.context().queue().finish();
        self.records.push(&self.row);
        Ok(())
    }

    fn data(&self) -> &[f64] {
        &self.records.data
    }

    fn dimensions(&self) -> Vec<usize> {
        vec![self.records.capacity, self.records.width]
    }
}

/// Records the raw state row of one trajectory.
pub struct TrajectoryOutput {
    trajectory: usize,
    records: Records,
}

impl TrajectoryOutput {
    pub fn new(name: &str, trajectory: usize, in_dim: usize, records: usize) -> Self {
        Self {
            trajectory,
            records: Records::new(name, in_dim, records),
        }
    }

    pub fn records_written(&self) -> usize {
        self.records.written()
    }
}

impl OutputCollector for TrajectoryOutput {
    fn name(&self) -> &str {
        &self.records.name
    }

    fn apply(
        &mut self,
        state: &DeviceVector<'_, f64>,
        _forcing: &DeviceVector<'_, f64>,
    ) -> Result<(), EngineError> {
        self.records.check_room()?;
        let width = self.records.width;
        let end = (self.trajectory + 1) * width;
        if state.len() < end {
            return Err(EngineError::size_mismatch(
                "trajectory output state",
                end,
                state.len(),
            ));
        }
        state.context().queue().finish();
        let row = &state.as_slice()[self.trajectory * width..end];
        self.records.push(row);
        Ok(())
    }

    fn data(&self) -> &[f64] {
        &self.records.data
    }

    fn dimensions(&self) -> Vec<usize> {
        vec![self.records.capacity, self.records.width]
    }
}
