//! Crate-level error type.

use crate::tensor::TensorError;
use thiserror::Error;

/// Errors surfaced by the orchestration layer.
///
/// `Configuration` and `ResumeMismatch` are fatal: the driver returns them before anything
/// is written. Structural mismatches during lazy initialization are *not* errors; they are
/// logged and recovered by re-initialising the module.
#[derive(Error, Debug)]
pub enum Error {
    /// Inconsistent mesh sizes, unsupported dtype, out-of-range ratio or interval.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A restored training state does not match the freshly computed schedule.
    #[error("Resume mismatch: checkpoint has total_steps={saved}, current schedule has {expected}")]
    ResumeMismatch { saved: usize, expected: usize },

    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// A peer left a collective (channel closed). On a real fabric this would be a hang.
    #[error("Collective failure: {0}")]
    Collective(String),

    #[error("Safetensors error: {0}")]
    SafeTensors(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Error::SafeTensors(format!("{e:?}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for building a [`Error::Configuration`].
pub(crate) fn config_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}
