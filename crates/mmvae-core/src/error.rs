//! Error types for the subset-fusion engine.
//!
//! Configuration errors are raised before any batch is processed. Numerical
//! errors carry the method and latent source that produced them. Adapter errors
//! pass through unchanged.

use thiserror::Error;

use crate::method::FusionMethod;

/// Errors raised by fusion, loss and configuration code.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Configuration value rejected during validation.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },

    /// Method name not in the supported table.
    #[error("Unknown fusion method '{0}' (expected one of: poe, moe, jsd, joint_elbo, planar_mixture, pfom)")]
    UnknownMethod(String),

    /// Experiment set up without any modality.
    #[error("At least one modality is required")]
    NoModalities,

    /// Two adapters registered under the same name.
    #[error("Duplicate modality name '{0}'")]
    DuplicateModality(String),

    /// Modality name that would break subset key uniqueness.
    #[error("Invalid modality name '{name}': {reason}")]
    InvalidModalityName {
        /// Offending name
        name: String,
        /// Why it is rejected
        reason: String,
    },

    /// Latent dimensionality disagreement between experts or adapters.
    #[error("Dimension mismatch for {context}: expected {expected}, actual {actual}")]
    DimensionMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected dimension
        expected: usize,
        /// Dimension found
        actual: usize,
    },

    /// Tensor shapes that must agree do not.
    #[error("Shape mismatch for {context}: expected {expected:?}, actual {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Shape found
        actual: Vec<usize>,
    },

    /// Fusion requested over an empty expert list.
    #[error("Cannot fuse an empty list of experts")]
    EmptyExperts,

    /// Batch without any registered modality.
    #[error("Batch contains none of the registered modalities")]
    EmptyBatch,

    /// Subset key not produced by the enumerator, or not fused for this batch.
    #[error("Unknown subset key '{0}'")]
    UnknownSubset(String),

    /// Modality requested but not available.
    #[error("Modality '{0}' is not available")]
    MissingModality(String),

    /// Batch entry for a modality without a registered adapter.
    #[error("Modality '{0}' has no registered adapter")]
    UnregisteredModality(String),

    /// NaN or infinite loss term.
    #[error("Non-finite {term} for method '{method}' at source '{source_label}': {value}")]
    NonFiniteLoss {
        /// Active fusion method
        method: FusionMethod,
        /// Subset key or `joint`
        source_label: String,
        /// Which term went non-finite
        term: String,
        /// Offending value
        value: f32,
    },

    /// Error raised by a modality encoder or decoder.
    #[error("Adapter '{modality}' failed: {message}")]
    Adapter {
        /// Modality whose adapter failed
        modality: String,
        /// Adapter-provided message
        message: String,
    },

    /// Tensor backend error.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON export of a summary failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FusionError {
    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a DimensionMismatch error.
    pub fn dimension_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create a ShapeMismatch error.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create an InvalidModalityName error.
    pub fn invalid_modality_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModalityName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an Adapter error.
    pub fn adapter(modality: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            modality: modality.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration class (raised before training).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::UnknownMethod(_)
                | Self::NoModalities
                | Self::DuplicateModality(_)
                | Self::InvalidModalityName { .. }
                | Self::DimensionMismatch { .. }
        )
    }
}

/// Result type for fusion operations.
pub type FusionResult<T> = Result<T, FusionError>;
