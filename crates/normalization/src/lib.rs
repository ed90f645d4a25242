//! Normalisation layers with running statistics built on Candle tensors.
//!
//! The crate hosts three layers that share one statistics toolkit:
//!
//! * [`batch_norm::BatchNorm`] normalises over every axis except the feature
//!   axes and tracks exponentially decayed moving statistics for inference,
//!   with optional batch renormalisation, ghost batches and a fused kernel.
//! * [`layer_norm::LayerNorm`] normalises each example over the feature axes.
//! * [`feature_norm::FeatureNormalization`] learns a fixed mean and variance
//!   by adapting over a dataset and standardises inputs with them.
//!
//! Statistics are always computed in at least `f32`; half precision inputs are
//! promoted for the reduction and cast back on output. Whether a call runs in
//! training or inference is passed explicitly as a [`mode::TrainingMode`].

pub mod axis;
pub mod batch_norm;
pub mod checks;
pub mod config;
pub mod dtypes;
pub mod feature_norm;
pub mod fused;
pub mod ghost;
pub mod layer_norm;
pub mod mode;
pub mod moments;
pub mod moving;
pub mod norm;
pub mod renorm;
pub mod transform;
pub mod variables;

use thiserror::Error;

pub use axis::{AxisSpec, ResolvedAxes};
pub use batch_norm::{BatchNorm, BatchNormConfig};
pub use config::NormLayerConfig;
pub use feature_norm::{FeatureNormConfig, FeatureNormalization};
pub use layer_norm::{LayerNorm, LayerNormConfig};
pub use mode::{LearningPhase, TrainingMode};
pub use norm::NormalizationLayer;
pub use variables::{Initializer, ParameterStore, VariableRegistry};

/// Errors raised while configuring, building or running a normalisation layer.
#[derive(Debug, Error)]
pub enum NormError {
    /// Invalid layer options, detected at construction or build time.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Input or parameter shapes that cannot be normalised.
    #[error("invalid shape: {0}")]
    Shape(String),
    /// The layer was called before its variables were created.
    #[error("layer `{0}` has not been built")]
    NotBuilt(&'static str),
    /// A shared variable lock was poisoned by a panicking writer.
    #[error("variable `{0}` is poisoned")]
    Poisoned(String),
    /// A configuration file could not be parsed.
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failure reported by the tensor engine.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl NormError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }
}

pub type Result<T> = std::result::Result<T, NormError>;
