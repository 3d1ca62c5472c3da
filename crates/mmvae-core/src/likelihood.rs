//! Reconstruction likelihood families.
//!
//! A decoder returns a [`Reconstruction`]: the family tag plus one parameter
//! tensor shaped like the modality data. The decomposer only ever asks for
//! `log p(x | z)`; the parameter meaning depends on the family:
//!
//! | family | parameter | `log p(x)` per element |
//! |---|---|---|
//! | Laplace | location | `-|x - loc| / b - ln(2b)` |
//! | Normal | mean | `-(x - μ)² / 2σ² - ln σ - ln(2π)/2` |
//! | Bernoulli | logits | `x·l - softplus(l)` |
//! | Categorical | logits over the last axis | `Σ onehot · log_softmax(l)` |

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::distribution::LN_2PI;
use crate::error::{FusionError, FusionResult};

/// Likelihood family of a modality decoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Likelihood {
    /// Laplace with fixed scale (images).
    Laplace { scale: f64 },
    /// Gaussian with fixed standard deviation.
    Normal { scale: f64 },
    /// Independent Bernoulli on logits (binary images).
    Bernoulli,
    /// Categorical on logits over the last axis (text, labels).
    Categorical,
}

impl Likelihood {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Laplace { .. } => "laplace",
            Self::Normal { .. } => "normal",
            Self::Bernoulli => "bernoulli",
            Self::Categorical => "categorical",
        }
    }

    /// Reject non-positive scales.
    pub fn validate(&self) -> FusionResult<()> {
        match *self {
            Self::Laplace { scale } | Self::Normal { scale } if !(scale.is_finite() && scale > 0.0) => {
                Err(FusionError::config(format!(
                    "{} likelihood scale must be positive, got {}",
                    self.name(),
                    scale
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Decoder output in distribution form.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    likelihood: Likelihood,
    params: Tensor,
}

impl Reconstruction {
    pub fn new(likelihood: Likelihood, params: Tensor) -> Self {
        Self { likelihood, params }
    }

    pub fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    pub fn params(&self) -> &Tensor {
        &self.params
    }

    /// `log p(target)` summed over every non-batch dimension, shape `[batch]`.
    pub fn log_prob_per_sample(&self, target: &Tensor) -> FusionResult<Tensor> {
        if target.dims() != self.params.dims() {
            return Err(FusionError::shape_mismatch(
                format!("{} reconstruction target", self.likelihood.name()),
                self.params.dims(),
                target.dims(),
            ));
        }
        let target = target.to_dtype(self.params.dtype())?;
        let elementwise = match self.likelihood {
            Likelihood::Laplace { scale } => target
                .sub(&self.params)?
                .abs()?
                .affine(-1.0 / scale, -(2.0 * scale).ln())?,
            Likelihood::Normal { scale } => target
                .sub(&self.params)?
                .sqr()?
                .affine(-0.5 / (scale * scale), -scale.ln() - 0.5 * LN_2PI)?,
            Likelihood::Bernoulli => target.mul(&self.params)?.sub(&softplus(&self.params)?)?,
            Likelihood::Categorical => {
                let log_probs = candle_nn::ops::log_softmax(&self.params, D::Minus1)?;
                target.mul(&log_probs)?
            }
        };
        sum_per_sample(&elementwise)
    }

    /// `log p(target)` summed over the batch and divided by `norm_value`.
    pub fn log_prob(&self, target: &Tensor, norm_value: f64) -> FusionResult<Tensor> {
        let per_sample = self.log_prob_per_sample(target)?;
        Ok(per_sample.sum_all()?.affine(1.0 / norm_value, 0.0)?)
    }

    /// Expected value of the distribution, shaped like the data.
    pub fn mean(&self) -> FusionResult<Tensor> {
        Ok(match self.likelihood {
            Likelihood::Laplace { .. } | Likelihood::Normal { .. } => self.params.clone(),
            Likelihood::Bernoulli => candle_nn::ops::sigmoid(&self.params)?,
            Likelihood::Categorical => candle_nn::ops::softmax(&self.params, D::Minus1)?,
        })
    }
}

/// `ln(1 + exp(l))` without overflow: `max(l, 0) + ln(1 + exp(-|l|))`.
fn softplus(logits: &Tensor) -> FusionResult<Tensor> {
    let tail = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(logits.relu()?.add(&tail)?)
}

fn sum_per_sample(t: &Tensor) -> FusionResult<Tensor> {
    if t.rank() == 1 {
        return Ok(t.clone());
    }
    Ok(t.flatten_from(1)?.sum(1)?)
}
