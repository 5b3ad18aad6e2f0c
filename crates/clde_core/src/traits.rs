use crate::error::EngineError;
use crate::polynomial::OperatorDimension;
use crate::vector::DeviceVector;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can live in device buffers and flow through kernels.
/// Must support basic arithmetic, debug printing, conversion from f64, and be
/// shareable across the worker threads of a dispatch.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// A right-hand side that can be driven by the integrator.
pub trait EnsembleOperator {
    /// Scalar state variables consumed and produced per trajectory.
    fn dimension(&self) -> OperatorDimension;

    /// Evaluates d(state)/dt for every trajectory.
    /// input: ensemble state, `trajectories * in_dim` values
    /// output: buffer for the derivative, `trajectories * out_dim` values
    /// forcing: the current forcing values, trajectory-major
    fn apply(
        &self,
        input: &DeviceVector<'_, f64>,
        output: &mut DeviceVector<'_, f64>,
        forcing: &DeviceVector<'_, f64>,
    ) -> Result<(), EngineError>;
}

/// Supplies the time-varying scalars referenced by monomial forcing slots.
pub trait ForcingSource {
    fn trajectories(&self) -> usize;

    fn slot_count(&self) -> usize;

    /// Writes the values for `step` into `out`, laid out as
    /// `out[trajectory * slot_count + slot]`.
    fn fill_step(&mut self, step: usize, out: &mut [f64]) -> Result<(), EngineError>;
}

/// Something the integrator calls every output interval.
pub trait OutputCollector {
    fn name(&self) -> &str;

    fn apply(
        &mut self,
        state: &DeviceVector<'_, f64>,
        forcing: &DeviceVector<'_, f64>,
    ) -> Result<(), EngineError>;

    /// Collected values, row-major in the shape given by `dimensions`.
    fn data(&self) -> &[f64];

    fn dimensions(&self) -> Vec<usize>;
}
