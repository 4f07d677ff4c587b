//! Error types for the domain-adaptation training step.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Masked mean over zero elements in `{term}`")]
    NumericDegeneracy { term: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Feature level {level} out of range for a pyramid of depth {depth}")]
    FeatureLevel { level: usize, depth: usize },

    #[error("Batch size mismatch: source has {source_len} samples, target has {target_len}")]
    BatchSize { source_len: usize, target_len: usize },

    #[error("Missing parameter `{0}` in the shadow model")]
    MissingParameter(String),

    #[error("Parameter map lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// `FeatureLevel`, `BatchSize` and `MissingParameter` are structural
    /// mismatches; this groups them with `ShapeMismatch`.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(
            self,
            Error::ShapeMismatch(_)
                | Error::FeatureLevel { .. }
                | Error::BatchSize { .. }
                | Error::MissingParameter(_)
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
