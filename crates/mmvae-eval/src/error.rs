//! Error types for evaluation bookkeeping.

use thiserror::Error;

use mmvae_core::FusionError;

/// Errors raised while evaluating a trained engine.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Could not draw a training sample containing both classes of every label.
    #[error(
        "Could not draw {num_train_samples} training labels containing both classes of '{label}' \
         from {num_samples} samples in {tries} tries; increase the dataset or num_training_samples_lr"
    )]
    LabelResampling {
        /// First label that stayed single-class in the last draw
        label: String,
        /// Draws attempted
        tries: usize,
        /// Rows available
        num_samples: usize,
        /// Rows requested per draw
        num_train_samples: usize,
    },

    /// No classifier trained for this (label, latent source) pair.
    #[error("No classifier for label '{label}' on source '{source_label}'")]
    MissingClassifier {
        /// Label name
        label: String,
        /// Subset key or `joint`
        source_label: String,
    },

    /// Input rejected before evaluation started.
    #[error("Invalid evaluation input: {0}")]
    InvalidInput(String),

    /// Error from the fusion engine or a modality adapter.
    #[error(transparent)]
    Fusion(#[from] FusionError),

    /// Tensor backend error.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Report serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvalError {
    /// Create an InvalidInput error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Result type for evaluation.
pub type EvalResult<T> = Result<T, EvalError>;
