//! Turns a reduced polynomial system into a kernel program and evaluates it
//! for every trajectory of an ensemble.

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::kernel_engine::{Binding, KernelSource, Program, WriteMode};
use crate::polynomial::{OperatorDimension, RealMonomial, RealSystem};
use crate::traits::EnsembleOperator;
use crate::vector::DeviceVector;
use std::rc::Rc;
use tracing::debug;

/// Right-hand side `f(x, w)` of a reduced system, evaluated on the device.
///
/// Only the paired real form produced by
/// [`ComplexSystem::reduce_to_real`](crate::polynomial::ComplexSystem::reduce_to_real)
/// is accepted. Every term's inputs are `(2k, 2k+1)` pairs read as the complex
/// value `x_2k + i x_2k+1`, and an odd output position multiplies the term by
/// `i`. A plain real system such as `-x0 -> 0` is therefore rejected with
/// `InvalidSystem`; write it as a complex system and reduce it instead.
pub struct PolynomialOperator<'ctx> {
    context: &'ctx DeviceContext,
    program: Rc<Program>,
    dimension: OperatorDimension,
    trajectories: usize,
    forcing_slots: usize,
}

impl<'ctx> PolynomialOperator<'ctx> {
    /// Operator whose dimensions are inferred from the system.
    pub fn new(
        context: &'ctx DeviceContext,
        name: &str,
        system: &RealSystem,
        trajectories: usize,
        forcing_slots: usize,
    ) -> Result<Self, EngineError> {
        Self::with_dimension(context, name, system, system.dimension(), trajectories, forcing_slots)
    }

    /// Operator with imposed dimensions, for systems that do not reference
    /// every state variable (observable projectors, for instance).
    pub fn with_dimension(
        context: &'ctx DeviceContext,
        name: &str,
        system: &RealSystem,
        dimension: OperatorDimension,
        trajectories: usize,
        forcing_slots: usize,
    ) -> Result<Self, EngineError> {
        system.validate_reduced()?;
        let inferred = system.dimension();
        if dimension.in_dim < inferred.in_dim || dimension.out_dim < inferred.out_dim {
            return Err(EngineError::InvalidSystem(format!(
                "operator `{name}` declared {}x{} but the system references {}x{}",
                dimension.in_dim, dimension.out_dim, inferred.in_dim, inferred.out_dim
            )));
        }
        if dimension.in_dim % 2 != 0 || dimension.out_dim % 2 != 0 {
            return Err(EngineError::InvalidSystem(format!(
                "operator `{name}` dimensions {}x{} are not (re, im) paired",
                dimension.in_dim, dimension.out_dim
            )));
        }
        let used_slots = system.forcing_slots();
        if used_slots > forcing_slots {
            return Err(EngineError::size_mismatch(
                format!("forcing slots of operator `{name}`"),
                used_slots,
                forcing_slots,
            ));
        }

        let source = kernel_source(name, system, dimension, forcing_slots);
        let program = context.build_program(&source)?;
        debug!(
            operator = name,
            terms = system.len(),
            in_dim = dimension.in_dim,
            out_dim = dimension.out_dim,
            trajectories,
            "polynomial operator ready"
        );
        Ok(Self {
            context,
            program,
            dimension,
            trajectories,
            forcing_slots,
        })
    }

    pub fn trajectories(&self) -> usize {
        self.trajectories
    }

    pub fn forcing_slots(&self) -> usize {
        self.forcing_slots
    }

    /// Evaluates the first `trajectories` rows of `state` into `output`,
    /// `output.len() == trajectories * out_dim`.
    pub(crate) fn evaluate_rows(
        &self,
        trajectories: usize,
        state: &[f64],
        forcing: &[f64],
        output: &mut [f64],
    ) -> Result<(), EngineError> {
        let in_dim = self.dimension.in_dim;
        let slots = self.forcing_slots;
        self.program.dispatch(
            self.context.queue(),
            trajectories,
            &[Binding::Rows {
                data: &state[..trajectories * in_dim],
                width: in_dim,
            }],
            &[Binding::Rows {
                data: &forcing[..trajectories * slots],
                width: slots,
            }],
            output,
            WriteMode::Store,
        )
    }
}

impl EnsembleOperator for PolynomialOperator<'_> {
    fn dimension(&self) -> OperatorDimension {
        self.dimension
    }

    fn apply(
        &self,
        input: &DeviceVector<'_, f64>,
        output: &mut DeviceVector<'_, f64>,
        forcing: &DeviceVector<'_, f64>,
    ) -> Result<(), EngineError> {
        let expected_in = self.trajectories * self.dimension.in_dim;
        if input.len() != expected_in {
            return Err(EngineError::size_mismatch("operator input", expected_in, input.len()));
        }
        let expected_out = self.trajectories * self.dimension.out_dim;
        if output.len() != expected_out {
            return Err(EngineError::size_mismatch("operator output", expected_out, output.len()));
        }
        let expected_forcing = self.trajectories * self.forcing_slots;
        if forcing.len() != expected_forcing {
            return Err(EngineError::size_mismatch(
                "operator forcing",
                expected_forcing,
                forcing.len(),
            ));
        }
        self.evaluate_rows(
            self.trajectories,
            input.as_slice(),
            forcing.as_slice(),
            output.as_mut_slice(),
        )
    }
}

/// Kernel source for a reduced system: variables `x0..`, parameters `w0..`
/// and one output expression per real output row. `dimension` must cover
/// every index the system references.
pub fn kernel_source(
    name: &str,
    system: &RealSystem,
    dimension: OperatorDimension,
    forcing_slots: usize,
) -> KernelSource {
    let mut rows: Vec<Vec<String>> = vec![Vec::new(); dimension.out_dim];
    for term in system.terms() {
        if term.coefficient == 0.0 {
            continue;
        }
        let (re, im) = term_product(term);
        let base = term.output_index - term.output_index % 2;
        // An odd output position carries a factor of i: i (re + i im) = -im + i re.
        let (first, second) = if term.output_index % 2 == 0 {
            (re, im)
        } else {
            (format!("-({im})"), re)
        };
        rows[base].push(first);
        rows[base + 1].push(second);
    }
    let outputs = rows.into_iter().map(|parts| {
        if parts.is_empty() {
            "0".to_string()
        } else {
            parts.join(" + ")
        }
    });
    KernelSource::new(
        name,
        (0..dimension.in_dim).map(|i| format!("x{i}")),
        (0..forcing_slots).map(|s| format!("w{s}")),
        outputs,
    )
}

/// `coefficient * w * Π (x_2k + i x_2k+1)` as a pair of (re, im) expressions.
fn term_product(term: &RealMonomial) -> (String, String) {
    let factors = term
        .input_indices
        .iter()
        .map(|i| format!("x{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut scale = format!("({:?})", term.coefficient);
    if let Some(slot) = term.time_func_slot {
        scale = format!("{scale} * w{slot}");
    }
    (
        format!("{scale} * cre({factors})"),
        format!("{scale} * cim({factors})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, DeviceSelector};
    use crate::polynomial::{ComplexSystem, Monomial};
    use num_complex::Complex64;

    fn context() -> DeviceContext {
        DeviceContext::new(&ContextConfig {
            selector: DeviceSelector::Index { platform: 0, device: 1 },
            threads: None,
        })
        .unwrap()
    }

    fn canonical() -> ComplexSystem {
        let c = Complex64::new;
        ComplexSystem::new(vec![
            Monomial::new(c(-1.0, 0.0), vec![0], 0),
            Monomial::new(c(0.0, -1.0), vec![0, 0, 1], 0),
            Monomial::new(c(1.0, 0.0), vec![], 0),
            Monomial::new(c(-1.0, 0.0), vec![1], 1),
            Monomial::new(c(0.0, -1.0), vec![1, 1, 0], 1),
            Monomial::new(c(1.0, 0.0), vec![], 1),
        ])
    }

    #[test]
    fn device_evaluation_matches_host_reference() {
        let context = context();
        let reduced = canonical().reduce_to_real();
        let operator = PolynomialOperator::new(&context, "rhs", &reduced, 3, 0).unwrap();
        assert_eq!(operator.dimension(), OperatorDimension::new(4, 4));

        let rows = [[1.0, 0.0, 0.0, 0.0], [0.3, -0.2, 0.7, 0.1], [-1.0, 0.5, 0.25, -0.75]];
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let input = DeviceVector::from_host(&flat, &context);
        let mut output = DeviceVector::zeros(12, &context);
        let forcing = DeviceVector::zeros(0, &context);
        operator.apply(&input, &mut output, &forcing).unwrap();
        let result = output.download();

        assert_eq!(result[0], 0.0);
        for (t, row) in rows.iter().enumerate() {
            let expected = reduced.evaluate_reduced(row, &[]).unwrap();
            for (k, value) in expected.iter().enumerate() {
                assert!((result[4 * t + k] - value).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn forcing_values_are_per_trajectory() {
        let context = context();
        // dz/dt = (2 - i) * w0 * z
        let system = ComplexSystem::new(vec![
            Monomial::new(Complex64::new(2.0, -1.0), vec![0], 0).with_forcing(0),
        ])
        .reduce_to_real();
        let operator = PolynomialOperator::new(&context, "forced", &system, 2, 1).unwrap();
        let input = DeviceVector::from_host(&[1.0, 1.0, 0.5, -2.0], &context);
        let forcing = DeviceVector::from_host(&[0.5, -3.0], &context);
        let mut output = DeviceVector::zeros(4, &context);
        operator.apply(&input, &mut output, &forcing).unwrap();
        let result = output.download();
        for t in 0..2 {
            let state = &input.download()[2 * t..2 * t + 2];
            let expected = system
                .evaluate_reduced(state, &forcing.download()[t..t + 1])
                .unwrap();
            assert!((result[2 * t] - expected[0]).abs() < 1e-12);
            assert!((result[2 * t + 1] - expected[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn imposed_dimension_leaves_unused_rows_zero() {
        let context = context();
        let system = RealSystem::new(vec![Monomial::new(3.0, vec![2, 3], 0)]);
        let operator = PolynomialOperator::with_dimension(
            &context,
            "projector",
            &system,
            OperatorDimension::new(6, 4),
            1,
            0,
        )
        .unwrap();
        let input = DeviceVector::from_host(&[9.0, 9.0, 2.0, 1.0, 9.0, 9.0], &context);
        let mut output = DeviceVector::zeros(4, &context);
        let forcing = DeviceVector::zeros(0, &context);
        operator.apply(&input, &mut output, &forcing).unwrap();
        assert_eq!(output.download(), vec![6.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn apply_enforces_dimensions() {
        let context = context();
        let reduced = canonical().reduce_to_real();
        let operator = PolynomialOperator::new(&context, "rhs", &reduced, 2, 0).unwrap();
        let input = DeviceVector::zeros(4, &context);
        let mut output = DeviceVector::zeros(8, &context);
        let forcing = DeviceVector::zeros(0, &context);
        assert!(matches!(
            operator.apply(&input, &mut output, &forcing),
            Err(EngineError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn construction_rejects_bad_systems() {
        let context = context();
        let reduced = canonical().reduce_to_real();
        let small = OperatorDimension::new(2, 4);
        assert!(matches!(
            PolynomialOperator::with_dimension(&context, "small", &reduced, small, 1, 0),
            Err(EngineError::InvalidSystem(_))
        ));
        let forced = RealSystem::new(vec![Monomial::new(1.0, vec![], 0).with_forcing(1)]);
        let square = OperatorDimension::new(2, 2);
        assert!(matches!(
            PolynomialOperator::with_dimension(&context, "forced", &forced, square, 1, 1),
            Err(EngineError::SizeMismatch { .. })
        ));
        let unpaired = RealSystem::new(vec![Monomial::new(1.0, vec![1], 0)]);
        assert!(PolynomialOperator::new(&context, "unpaired", &unpaired, 1, 0).is_err());
        let plain = RealSystem::new(vec![Monomial::new(-1.0, vec![0], 0)]);
        assert!(matches!(
            PolynomialOperator::new(&context, "plain", &plain, 1, 0),
            Err(EngineError::InvalidSystem(_))
        ));
    }

    #[test]
    fn kernel_source_grows_linearly_with_degree() {
        let power = |k: usize| {
            ComplexSystem::new(vec![Monomial::new(Complex64::new(0.5, -0.25), vec![0; k], 0)])
                .reduce_to_real()
        };
        let size = |k: usize| {
            let system = power(k);
            let source = kernel_source("power", &system, system.dimension(), 0);
            source.outputs.iter().map(String::len).sum::<usize>()
        };
        let step = size(5) - size(4);
        assert_eq!(size(18) - size(4), 14 * step);
        assert!(size(18) < 2_000, "{}", size(18));
    }

    #[test]
    fn high_degree_terms_match_host_reference() {
        let context = context();
        let system = ComplexSystem::new(vec![
            Monomial::new(Complex64::new(0.5, -0.25), vec![0; 18], 0),
            Monomial::new(Complex64::new(-1.0, 2.0), vec![0; 7], 0),
        ])
        .reduce_to_real();
        let operator = PolynomialOperator::new(&context, "high_degree", &system, 1, 0).unwrap();
        let state = [0.9, 0.3];
        let input = DeviceVector::from_host(&state, &context);
        let mut output = DeviceVector::zeros(2, &context);
        let forcing = DeviceVector::zeros(0, &context);
        operator.apply(&input, &mut output, &forcing).unwrap();
        let expected = system.evaluate_reduced(&state, &[]).unwrap();
        for (value, reference) in output.download().iter().zip(&expected) {
            assert!((value - reference).abs() < 1e-10 * reference.abs().max(1.0));
        }
    }
}
