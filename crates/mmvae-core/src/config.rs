//! Experiment configuration.
//!
//! # TOML Structure
//!
//! ```toml
//! method = "joint_elbo"
//! latent_dim = 32
//! batch_size = 256
//! seed = 42
//!
//! [beta]
//! max_beta = 2.0
//! warmup_epochs = 10
//!
//! [flow]
//! num_flows = 4
//! hidden_dim = 64
//!
//! [evaluation]
//! max_label_tries = 100
//!
//! [reconstruction_weights]
//! img = 1.0
//! text = 5.0
//! ```
//!
//! Invalid values are rejected by [`ExperimentConfig::validate`]; nothing is
//! silently replaced with a default.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FusionError, FusionResult};
use crate::method::FusionMethod;

// ============================================================================
// ROOT EXPERIMENT CONFIG
// ============================================================================

/// Root configuration of one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Fusion method.
    #[serde(default = "default_method")]
    pub method: FusionMethod,

    /// Shared content latent dimensionality.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Per-modality style latent dimensionality (factorized runs only).
    #[serde(default)]
    pub style_dim: usize,

    /// Split each modality's latent into shared content and private style.
    #[serde(default)]
    pub factorized_representation: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seeds parameter initialization and the training RNG.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub beta: BetaConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Per-modality reconstruction weight overrides.
    #[serde(default)]
    pub reconstruction_weights: BTreeMap<String, f64>,
}

fn default_method() -> FusionMethod {
    FusionMethod::JointElbo
}

fn default_latent_dim() -> usize {
    32
}

fn default_batch_size() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            latent_dim: default_latent_dim(),
            style_dim: 0,
            factorized_representation: false,
            batch_size: default_batch_size(),
            seed: default_seed(),
            beta: BetaConfig::default(),
            flow: FlowConfig::default(),
            evaluation: EvaluationConfig::default(),
            reconstruction_weights: BTreeMap::new(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `FusionError::Config` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> FusionResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            FusionError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&contents).map_err(|e| {
            FusionError::config(format!("Failed to parse TOML in '{}': {}", path.display(), e))
        })?;

        debug!(path = %path.display(), method = %config.method, "Loaded experiment config");
        Ok(config)
    }

    /// Create configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> FusionResult<Self> {
        toml::from_str(toml).map_err(|e| FusionError::config(format!("Failed to parse TOML: {}", e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> FusionResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FusionError::config(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Validate every value, returning the first error found.
    ///
    /// Nested section errors are prefixed with the section name, e.g.
    /// `[beta] max_beta must be finite and >= 0`.
    pub fn validate(&self) -> FusionResult<()> {
        if self.latent_dim == 0 {
            return Err(FusionError::config("latent_dim must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(FusionError::config("batch_size must be > 0"));
        }
        if self.factorized_representation && self.style_dim == 0 {
            return Err(FusionError::config(
                "style_dim must be > 0 when factorized_representation is enabled",
            ));
        }

        self.beta.validate().map_err(|e| in_section("beta", e))?;
        self.flow
            .validate(self.method)
            .map_err(|e| in_section("flow", e))?;
        self.evaluation
            .validate()
            .map_err(|e| in_section("evaluation", e))?;

        for (modality, weight) in &self.reconstruction_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(FusionError::config(format!(
                    "[reconstruction_weights] weight for '{}' must be finite and >= 0, got {}",
                    modality, weight
                )));
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `MMVAE_`
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `MMVAE_METHOD` | `method` | method name |
    /// | `MMVAE_LATENT_DIM` | `latent_dim` | usize |
    /// | `MMVAE_BATCH_SIZE` | `batch_size` | usize |
    /// | `MMVAE_SEED` | `seed` | u64 |
    /// | `MMVAE_MAX_BETA` | `beta.max_beta` | f64 |
    /// | `MMVAE_WARMUP_EPOCHS` | `beta.warmup_epochs` | usize |
    /// | `MMVAE_NUM_FLOWS` | `flow.num_flows` | usize |
    ///
    /// Unparseable values leave the field unchanged.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("MMVAE_METHOD") {
            if let Ok(method) = val.parse::<FusionMethod>() {
                self.method = method;
            }
        }
        if let Ok(val) = env::var("MMVAE_LATENT_DIM") {
            if let Ok(n) = val.parse::<usize>() {
                self.latent_dim = n;
            }
        }
        if let Ok(val) = env::var("MMVAE_BATCH_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                self.batch_size = n;
            }
        }
        if let Ok(val) = env::var("MMVAE_SEED") {
            if let Ok(n) = val.parse::<u64>() {
                self.seed = n;
            }
        }

        // Beta schedule
        if let Ok(val) = env::var("MMVAE_MAX_BETA") {
            if let Ok(b) = val.parse::<f64>() {
                self.beta.max_beta = b;
            }
        }
        if let Ok(val) = env::var("MMVAE_WARMUP_EPOCHS") {
            if let Ok(n) = val.parse::<usize>() {
                self.beta.warmup_epochs = n;
            }
        }

        if let Ok(val) = env::var("MMVAE_NUM_FLOWS") {
            if let Ok(n) = val.parse::<usize>() {
                self.flow.num_flows = n;
            }
        }

        self
    }

    /// Reconstruction weight for `modality`: the override if present, else
    /// `adapter_default`.
    pub fn reconstruction_weight(&self, modality: &str, adapter_default: f64) -> f64 {
        self.reconstruction_weights
            .get(modality)
            .copied()
            .unwrap_or(adapter_default)
    }
}

fn in_section(section: &str, err: FusionError) -> FusionError {
    match err {
        FusionError::Config { message } => FusionError::config(format!("[{}] {}", section, message)),
        other => other,
    }
}

// ============================================================================
// BETA SCHEDULE
// ============================================================================

/// Divergence weights and their warmup schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaConfig {
    /// Target beta reached at the end of warmup.
    #[serde(default = "default_max_beta")]
    pub max_beta: f64,

    /// Epochs of linear ramp; 0 disables warmup.
    #[serde(default)]
    pub warmup_epochs: usize,

    /// Beta at epoch 0. Strictly positive.
    #[serde(default = "default_beta_floor")]
    pub floor: f64,

    /// Multiplier on the content divergence.
    #[serde(default = "default_one")]
    pub beta_content: f64,

    /// Multiplier on the style divergence.
    #[serde(default = "default_one")]
    pub beta_style: f64,
}

fn default_max_beta() -> f64 {
    1.0
}

fn default_beta_floor() -> f64 {
    1e-4
}

fn default_one() -> f64 {
    1.0
}

impl Default for BetaConfig {
    fn default() -> Self {
        Self {
            max_beta: default_max_beta(),
            warmup_epochs: 0,
            floor: default_beta_floor(),
            beta_content: default_one(),
            beta_style: default_one(),
        }
    }
}

impl BetaConfig {
    pub fn validate(&self) -> FusionResult<()> {
        if !self.max_beta.is_finite() || self.max_beta < 0.0 {
            return Err(FusionError::config(format!(
                "max_beta must be finite and >= 0, got {}",
                self.max_beta
            )));
        }
        if !self.floor.is_finite() || self.floor <= 0.0 {
            return Err(FusionError::config(format!(
                "floor must be finite and > 0, got {}",
                self.floor
            )));
        }
        for (name, value) in [("beta_content", self.beta_content), ("beta_style", self.beta_style)] {
            if !value.is_finite() || value < 0.0 {
                return Err(FusionError::config(format!(
                    "{} must be finite and >= 0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Beta for `epoch` (0-based).
    ///
    /// During warmup: `min(floor + epoch · max_beta / warmup_epochs, max_beta)`.
    /// From `warmup_epochs` on: exactly `max_beta`.
    pub fn beta(&self, epoch: usize) -> f64 {
        if self.warmup_epochs == 0 || epoch >= self.warmup_epochs {
            return self.max_beta;
        }
        let ramp = self.floor + epoch as f64 * self.max_beta / self.warmup_epochs as f64;
        ramp.min(self.max_beta)
    }
}

// ============================================================================
// FLOW
// ============================================================================

/// Flow transform depth and width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Coupling layers; 0 makes the flow the identity.
    #[serde(default = "default_num_flows")]
    pub num_flows: usize,

    /// Hidden width of each coupling conditioner.
    #[serde(default = "default_flow_hidden_dim")]
    pub hidden_dim: usize,
}

fn default_num_flows() -> usize {
    4
}

fn default_flow_hidden_dim() -> usize {
    64
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            num_flows: default_num_flows(),
            hidden_dim: default_flow_hidden_dim(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self, method: FusionMethod) -> FusionResult<()> {
        if method.policy().uses_flow() && self.num_flows > 0 && self.hidden_dim == 0 {
            return Err(FusionError::config(format!(
                "hidden_dim must be > 0 for method '{}' with {} flows",
                method, self.num_flows
            )));
        }
        Ok(())
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Budgets for the evaluation routines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Training samples drawn for each latent classifier.
    #[serde(default = "default_num_training_samples_lr")]
    pub num_training_samples_lr: usize,

    /// Resampling attempts before a single-class label draw is fatal.
    #[serde(default = "default_max_label_tries")]
    pub max_label_tries: usize,

    #[serde(default = "default_classifier_epochs")]
    pub classifier_epochs: usize,

    #[serde(default = "default_classifier_learning_rate")]
    pub classifier_learning_rate: f64,

    /// Importance samples per data point for likelihood estimation.
    #[serde(default = "default_num_importance_samples")]
    pub num_importance_samples: usize,
}

fn default_num_training_samples_lr() -> usize {
    500
}

fn default_max_label_tries() -> usize {
    100
}

fn default_classifier_epochs() -> usize {
    200
}

fn default_classifier_learning_rate() -> f64 {
    0.5
}

fn default_num_importance_samples() -> usize {
    10
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            num_training_samples_lr: default_num_training_samples_lr(),
            max_label_tries: default_max_label_tries(),
            classifier_epochs: default_classifier_epochs(),
            classifier_learning_rate: default_classifier_learning_rate(),
            num_importance_samples: default_num_importance_samples(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> FusionResult<()> {
        for (name, value) in [
            ("num_training_samples_lr", self.num_training_samples_lr),
            ("max_label_tries", self.max_label_tries),
            ("classifier_epochs", self.classifier_epochs),
            ("num_importance_samples", self.num_importance_samples),
        ] {
            if value == 0 {
                return Err(FusionError::config(format!("{} must be > 0", name)));
            }
        }
        if !self.classifier_learning_rate.is_finite() || self.classifier_learning_rate <= 0.0 {
            return Err(FusionError::config(format!(
                "classifier_learning_rate must be finite and > 0, got {}",
                self.classifier_learning_rate
            )));
        }
        Ok(())
    }
}
