use crate::error::EngineError;
use crate::traits::ForcingSource;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

/// Seed used when the caller does not supply one.
pub const DEFAULT_SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Mixes the run seed with a trajectory index so every trajectory gets its
/// own stream, independent of how many trajectories the ensemble has.
pub fn derive_seed(seed: u64, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut z = (seed ^ trajectory.wrapping_mul(GOLDEN_GAMMA)).wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Wiener-process increments `sqrt(dt) * N(0, 1)`, one per trajectory, slot
/// and integration step.
///
/// Steps are produced in order. Asking for the most recent step again returns
/// the cached values; skipping ahead draws (and discards) the steps in
/// between; going back is an error.
#[derive(Debug, Clone)]
pub struct WienerForcing {
    trajectories: usize,
    slots: usize,
    scale: f64,
    seed: u64,
    streams: Vec<ChaCha8Rng>,
    current: Vec<f64>,
    drawn: usize,
}

impl WienerForcing {
    pub fn new(
        trajectories: usize,
        slots: usize,
        time_step: f64,
        seed: u64,
    ) -> Result<Self, EngineError> {
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(EngineError::InvalidSettings(format!(
                "forcing time step must be positive, got {time_step}"
            )));
        }
        let mut forcing = Self {
            trajectories,
            slots,
            scale: time_step.sqrt(),
            seed,
            streams: Vec::new(),
            current: vec![0.0; trajectories * slots],
            drawn: 0,
        };
        forcing.reseed(seed);
        Ok(forcing)
    }

    /// Resets every stream to the start. Only meaningful before a run.
    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.streams = (0..self.trajectories)
            .map(|t| ChaCha8Rng::seed_from_u64(derive_seed(seed, t as u64)))
            .collect();
        self.current.fill(0.0);
        self.drawn = 0;
        debug!(
            seed,
            trajectories = self.trajectories,
            slots = self.slots,
            "forcing streams seeded"
        );
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The most recently drawn step, if any.
    pub fn current_step(&self) -> Option<usize> {
        self.drawn.checked_sub(1)
    }

    /// Increment of slot 0 for `trajectory` at `step`.
    pub fn sample(&mut self, trajectory: usize, step: usize) -> Result<f64, EngineError> {
        self.sample_slot(trajectory, 0, step)
    }

    pub fn sample_slot(
        &mut self,
        trajectory: usize,
        slot: usize,
        step: usize,
    ) -> Result<f64, EngineError> {
        if trajectory >= self.trajectories {
            return Err(EngineError::size_mismatch(
                "forcing trajectory",
                self.trajectories,
                trajectory + 1,
            ));
        }
        if slot >= self.slots {
            return Err(EngineError::size_mismatch("forcing slot", self.slots, slot + 1));
        }
        self.advance_to(step)?;
        Ok(self.current[trajectory * self.slots + slot])
    }

    /// Makes `step` the current step.
    pub fn advance_to(&mut self, step: usize) -> Result<(), EngineError> {
        if let Some(current) = self.current_step() {
            if step < current {
                return Err(EngineError::StreamRewound { requested: step, current });
            }
        }
        while self.drawn <= step {
            self.draw();
        }
        Ok(())
    }

    /// Values of the current step, trajectory-major.
    pub fn current(&self) -> &[f64] {
        &self.current
    }

    fn draw(&mut self) {
        let scale = self.scale;
        for (stream, row) in self
            .streams
            .iter_mut()
            .zip(self.current.chunks_mut(self.slots.max(1)))
        {
            for value in row.iter_mut() {
                let z: f64 = StandardNormal.sample(stream);
                *value = scale * z;
            }
        }
        self.drawn += 1;
    }
}

impl ForcingSource for WienerForcing {
    fn trajectories(&self) -> usize {
        self.trajectories
    }

    fn slot_count(&self) -> usize {
        self.slots
    }

    fn fill_step(&mut self, step: usize, out: &mut [f64]) -> Result<(), EngineError> {
        if out.len() != self.current.len() {
            return Err(EngineError::size_mismatch("forcing buffer", self.current.len(), out.len()));
        }
        self.advance_to(step)?;
        out.copy_from_slice(&self.current);
        Ok(())
    }
}
