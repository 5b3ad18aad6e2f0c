use thiserror::Error;

/// Failures surfaced by the engine. None of these are retried internally;
/// they all indicate a configuration or programming error in the run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No compute device matched the selector at context creation.
    #[error("no compute device matches {selector}")]
    DeviceUnavailable { selector: String },

    /// A kernel program failed to compile.
    #[error("failed to build kernel program `{program}`: {diagnostic}")]
    KernelBuild { program: String, diagnostic: String },

    #[error("size mismatch in {context}: expected {expected}, got {actual}")]
    SizeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("integrator not configured: {0}")]
    NotConfigured(String),

    #[error("output `{name}` is full ({capacity} records)")]
    BufferOverrun { name: String, capacity: usize },

    #[error("invalid polynomial system: {0}")]
    InvalidSystem(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("forcing stream already advanced to step {current}, cannot return to step {requested}")]
    StreamRewound { requested: usize, current: usize },

    #[error("device error: {0}")]
    Device(String),
}

impl EngineError {
    pub(crate) fn size_mismatch(
        context: impl Into<String>,
        expected: usize,
        actual: usize,
    ) -> Self {
        EngineError::SizeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
