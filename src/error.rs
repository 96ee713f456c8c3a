use thiserror::Error;

/// Failures raised while assembling or evaluating a motion segmentation model.
///
/// Everything except a mismatched branch count at runtime is detected while the model is
/// being built, so a model that constructs successfully only fails on programmer error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown backbone name '{0}'")]
    UnknownBackbone(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("feature level {level} is not defined for {format} backbones")]
    InvalidLevel { level: usize, format: String },

    #[error("mean merge at level {level} needs equal channel counts, got {channels:?}")]
    ShapeMismatch { level: usize, channels: Vec<usize> },

    #[error("decoder expects features from {expected} branches, got {actual}")]
    BranchCount { expected: usize, actual: usize },
}

pub type Result<T, E = ModelError> = std::result::Result<T, E>;
