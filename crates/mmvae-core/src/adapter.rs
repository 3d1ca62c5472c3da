//! Modality adapter protocol.
//!
//! Concrete encoder and decoder networks live outside this crate. The engine
//! only sees them through [`ModalityAdapter`]: raw batch in, [`EncMod`] out;
//! latent sample in, [`Reconstruction`] out.

use candle_core::{Tensor, Var};

use crate::distribution::Distr;
use crate::error::FusionResult;
use crate::likelihood::{Likelihood, Reconstruction};

/// Encoded latents of one modality.
///
/// `content` takes part in subset fusion. `style` is present only with
/// factorized representations and is never fused.
#[derive(Debug, Clone)]
pub struct EncMod {
    pub content: Distr,
    pub style: Option<Distr>,
}

impl EncMod {
    pub fn content_only(content: Distr) -> Self {
        Self { content, style: None }
    }

    pub fn with_style(content: Distr, style: Distr) -> Self {
        Self {
            content,
            style: Some(style),
        }
    }
}

/// Encoder/decoder pair for one modality.
///
/// Errors returned by `encode` or `decode` abort the batch and reach the
/// caller unchanged.
pub trait ModalityAdapter: Send + Sync {
    /// Unique modality name.
    fn name(&self) -> &str;

    /// Width of the content distribution; must equal the experiment's latent dim.
    fn content_dim(&self) -> usize;

    /// Width of the style distribution, 0 when the adapter has no style head.
    fn style_dim(&self) -> usize {
        0
    }

    /// Map a raw batch to content (and style) distribution parameters.
    fn encode(&self, data: &Tensor) -> FusionResult<EncMod>;

    /// Map a content sample (and style sample) back to data space.
    fn decode(&self, z_content: &Tensor, z_style: Option<&Tensor>) -> FusionResult<Reconstruction>;

    /// Likelihood family of `decode` outputs.
    fn likelihood(&self) -> Likelihood;

    /// Default reconstruction weight; the experiment config may override it.
    fn reconstruction_weight(&self) -> f64 {
        1.0
    }

    /// Parameters the optimizer updates.
    fn trainable_vars(&self) -> Vec<Var> {
        Vec::new()
    }
}
