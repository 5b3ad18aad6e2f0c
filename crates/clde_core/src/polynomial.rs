//! Sparse polynomial vector fields: monomial lists, complex-to-real
//! reduction, dimension inference and the symbolic derivative.
//!
//! A complex system is a list of [`ComplexMonomial`]s, each contributing
//! `coefficient * Π z[input_indices] * [w(slot)]` to `dz[output_index]/dt`.
//!
//! The reduced (real) form stores complex variable `z_k` as the pair
//! `(x_{2k}, x_{2k+1}) = (Re z_k, Im z_k)`. Each complex term becomes exactly
//! two real terms, the real part of its coefficient first:
//!
//! ```text
//! c * Π z_k -> dz_o     ==>   Re(c) * Π (x_2k, x_2k+1) -> x_{2o}
//!                             Im(c) * Π (x_2k, x_2k+1) -> x_{2o+1}
//! ```
//!
//! A real term with coefficient `a` whose output position has parity `p`
//! contributes `a * i^p * Π (x_2k + i x_2k+1)` to the pair containing its
//! output position, the product expanded with
//! `(a + ib)(c + id) = (ac - bd) + i(ad + bc)`.

use crate::error::EngineError;
use nalgebra::DMatrix;
use nalgebra_sparse::convert::serial::convert_csr_dense;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// One additive term of a polynomial vector field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monomial<C> {
    pub coefficient: C,
    /// Factors of the product; a repeated index is a power, empty is a constant.
    #[serde(default)]
    pub input_indices: Vec<usize>,
    pub output_index: usize,
    /// Forcing slot multiplied into the term, if any.
    #[serde(default)]
    pub time_func_slot: Option<usize>,
}

pub type ComplexMonomial = Monomial<Complex64>;
pub type RealMonomial = Monomial<f64>;

impl<C> Monomial<C> {
    pub fn new(coefficient: C, input_indices: Vec<usize>, output_index: usize) -> Self {
        Self {
            coefficient,
            input_indices,
            output_index,
            time_func_slot: None,
        }
    }

    pub fn with_forcing(mut self, slot: usize) -> Self {
        self.time_func_slot = Some(slot);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperatorDimension {
    pub in_dim: usize,
    pub out_dim: usize,
}

impl OperatorDimension {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self { in_dim, out_dim }
    }

    pub fn infer<C>(terms: &[Monomial<C>]) -> Self {
        Self {
            in_dim: infer_dimension(terms, true),
            out_dim: infer_dimension(terms, false),
        }
    }
}

/// Largest referenced input (or output) index plus one; 0 when nothing is referenced.
pub fn infer_dimension<C>(terms: &[Monomial<C>], is_input: bool) -> usize {
    terms
        .iter()
        .filter_map(|term| {
            if is_input {
                term.input_indices.iter().max().copied()
            } else {
                Some(term.output_index)
            }
        })
        .max()
        .map_or(0, |max| max + 1)
}

/// Number of forcing slots a term list needs.
pub fn forcing_slots<C>(terms: &[Monomial<C>]) -> usize {
    terms
        .iter()
        .filter_map(|term| term.time_func_slot)
        .max()
        .map_or(0, |max| max + 1)
}

/// Reduces complex terms to the paired real form. The output has exactly
/// twice as many terms, in source order, real part before imaginary part.
/// Zero coefficient parts are kept.
pub fn reduce_complex_to_real(terms: &[ComplexMonomial]) -> Vec<RealMonomial> {
    let mut reduced = Vec::with_capacity(terms.len() * 2);
    for term in terms {
        let inputs: Vec<usize> = term
            .input_indices
            .iter()
            .flat_map(|&k| [2 * k, 2 * k + 1])
            .collect();
        reduced.push(Monomial {
            coefficient: term.coefficient.re,
            input_indices: inputs.clone(),
            output_index: 2 * term.output_index,
            time_func_slot: term.time_func_slot,
        });
        reduced.push(Monomial {
            coefficient: term.coefficient.im,
            input_indices: inputs,
            output_index: 2 * term.output_index + 1,
            time_func_slot: term.time_func_slot,
        });
    }
    reduced
}

/// Product-rule expansion of every term. For each distinct input index `k`
/// of multiplicity `m` a term `m * coefficient * (inputs minus one k)` is
/// emitted with output `output_index * variable_count + k`, i.e. the
/// flattened Jacobian entry. Nothing is merged or simplified.
pub fn derivative<C>(terms: &[Monomial<C>], variable_count: usize) -> Vec<Monomial<C>>
where
    C: Copy + Mul<f64, Output = C>,
{
    let mut derived = Vec::new();
    for term in terms {
        let mut seen: Vec<usize> = Vec::with_capacity(term.input_indices.len());
        for (position, &k) in term.input_indices.iter().enumerate() {
            if seen.contains(&k) {
                continue;
            }
            seen.push(k);
            let multiplicity = term.input_indices.iter().filter(|&&i| i == k).count();
            let mut inputs = term.input_indices.clone();
            inputs.remove(position);
            derived.push(Monomial {
                coefficient: term.coefficient * multiplicity as f64,
                input_indices: inputs,
                output_index: term.output_index * variable_count + k,
                time_func_slot: term.time_func_slot,
            });
        }
    }
    derived
}

/// An immutable, ordered list of monomials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolynomialSystem<C> {
    terms: Vec<Monomial<C>>,
}

pub type ComplexSystem = PolynomialSystem<Complex64>;
pub type RealSystem = PolynomialSystem<f64>;

impl<C> PolynomialSystem<C> {
    pub fn new(terms: Vec<Monomial<C>>) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &[Monomial<C>] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn dimension(&self) -> OperatorDimension {
        OperatorDimension::infer(&self.terms)
    }

    pub fn forcing_slots(&self) -> usize {
        forcing_slots(&self.terms)
    }
}

impl<C: Copy + Mul<f64, Output = C>> PolynomialSystem<C> {
    pub fn derivative(&self, variable_count: usize) -> Self {
        Self::new(derivative(&self.terms, variable_count))
    }
}

impl ComplexSystem {
    pub fn reduce_to_real(&self) -> RealSystem {
        RealSystem::new(reduce_complex_to_real(&self.terms))
    }

    /// Host reference evaluation of dz/dt.
    pub fn evaluate(
        &self,
        state: &[Complex64],
        forcing: &[f64],
    ) -> Result<Vec<Complex64>, EngineError> {
        let dimension = self.dimension();
        check_operands(dimension.in_dim, self.forcing_slots(), state.len(), forcing.len())?;
        let mut out = vec![Complex64::new(0.0, 0.0); dimension.out_dim];
        for term in &self.terms {
            out[term.output_index] += complex_term(term, state, forcing);
        }
        Ok(out)
    }

    /// Sparse Jacobian `∂f_o/∂z_k` at `state`, assembled from the symbolic
    /// derivative. Shape is `out_dim × n` with `n = max(state.len(), in_dim)`.
    pub fn jacobian(
        &self,
        state: &[Complex64],
        forcing: &[f64],
    ) -> Result<CsrMatrix<Complex64>, EngineError> {
        let dimension = self.dimension();
        check_operands(dimension.in_dim, self.forcing_slots(), state.len(), forcing.len())?;
        let n = state.len();
        let mut coo = CooMatrix::new(dimension.out_dim, n);
        for term in derivative(&self.terms, n) {
            let value = complex_term(&term, state, forcing);
            coo.push(term.output_index / n, term.output_index % n, value);
        }
        Ok(CsrMatrix::from(&coo))
    }

    pub fn jacobian_dense(
        &self,
        state: &[Complex64],
        forcing: &[f64],
    ) -> Result<DMatrix<Complex64>, EngineError> {
        Ok(convert_csr_dense(&self.jacobian(state, forcing)?))
    }
}

impl RealSystem {
    /// Checks that every term's inputs are `(2k, 2k+1)` pairs.
    pub fn validate_reduced(&self) -> Result<(), EngineError> {
        for (position, term) in self.terms.iter().enumerate() {
            let paired = term.input_indices.len() % 2 == 0
                && term
                    .input_indices
                    .chunks_exact(2)
                    .all(|pair| pair[0] % 2 == 0 && pair[1] == pair[0] + 1);
            if !paired {
                return Err(EngineError::InvalidSystem(format!(
                    "term {position} has inputs {:?}, expected (re, im) index pairs",
                    term.input_indices
                )));
            }
        }
        Ok(())
    }

    /// Host reference evaluation of a reduced system.
    pub fn evaluate_reduced(
        &self,
        state: &[f64],
        forcing: &[f64],
    ) -> Result<Vec<f64>, EngineError> {
        self.validate_reduced()?;
        let dimension = self.dimension();
        check_operands(dimension.in_dim, self.forcing_slots(), state.len(), forcing.len())?;
        let rows = dimension.out_dim + dimension.out_dim % 2;
        let mut out = vec![0.0; rows];
        for term in &self.terms {
            let product = term
                .input_indices
                .chunks_exact(2)
                .fold(Complex64::new(1.0, 0.0), |acc, pair| {
                    acc * Complex64::new(state[pair[0]], state[pair[1]])
                });
            let rotation = if term.output_index % 2 == 0 {
                Complex64::new(1.0, 0.0)
            } else {
                Complex64::i()
            };
            let weight = term.time_func_slot.map_or(1.0, |slot| forcing[slot]);
            let value = product * rotation * (term.coefficient * weight);
            let base = term.output_index - term.output_index % 2;
            out[base] += value.re;
            out[base + 1] += value.im;
        }
        Ok(out)
    }
}

fn check_operands(
    in_dim: usize,
    slots: usize,
    state: usize,
    forcing: usize,
) -> Result<(), EngineError> {
    if state < in_dim {
        return Err(EngineError::size_mismatch("polynomial state", in_dim, state));
    }
    if forcing < slots {
        return Err(EngineError::size_mismatch("polynomial forcing", slots, forcing));
    }
    Ok(())
}

fn complex_term(term: &ComplexMonomial, state: &[Complex64], forcing: &[f64]) -> Complex64 {
    let product = term
        .input_indices
        .iter()
        .fold(term.coefficient, |acc, &k| acc * state[k]);
    match term.time_func_slot {
        Some(slot) => product * forcing[slot],
        None => product,
    }
}
