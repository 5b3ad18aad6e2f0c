//! The `clde_core` crate integrates ensembles of polynomial SDE/ODE systems on
//! a compute device.
//!
//! Key components:
//! - **Device**: context, in-order command queue and kernel program registry.
//! - **Vectors**: device-resident buffers and the fused `y += alpha * x` kernel.
//! - **Polynomials**: monomial systems, complex-to-real reduction, derivatives.
//! - **Forcing**: per-trajectory Wiener increments.
//! - **Solvers**: the RK4 ensemble integrator and its output collectors.
pub mod config;
pub mod device;
pub mod error;
pub mod forcing;
pub mod kernel_engine;
pub mod operator;
pub mod output;
pub mod polynomial;
pub mod simulation;
pub mod solvers;
pub mod traits;
pub mod vector;
