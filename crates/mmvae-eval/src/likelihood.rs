//! Importance-sampled marginal log-likelihood.
//!
//! For a latent source `q` with `K` importance samples the joint estimate is
//!
//! ```text
//! log p(X) ≈ logsumexp_k [ Σ_m w_m log p(x_m | z_k, s_m,k) + log N(z_k; 0, I) − log q(z_k | X)
//!                          + Σ_m (log N(s_m,k; 0, I) − log q(s_m,k | x_m)) ] − log K
//! ```
//!
//! and the estimate for a single target modality `m` keeps only its own
//! unweighted reconstruction and style terms. Values are averaged over the
//! batch. Style terms appear on factorized runs only. Flow embeddings draw
//! `z0` from the base Gaussian and push it through the engine's flow, with
//! `log q(zk) = log q0(z0) − log|det J|`.

use std::collections::BTreeMap;

use candle_core::Tensor;
use mmvae_core::distribution::standard_normal_log_density;
use mmvae_core::subsets::JOINT_LABEL;
use mmvae_core::{EncMod, FusionError, LatentSource, ModalityBatch, MultimodalVae, SubsetEmbedding};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EvalError, EvalResult};

/// Estimates per target modality and `joint`.
pub type TargetLikelihoods = BTreeMap<String, f64>;

/// Log-likelihood estimates per latent source label (`joint` included), then
/// per target modality and `joint`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodReport {
    pub num_importance_samples: usize,
    pub log_likelihoods: BTreeMap<String, TargetLikelihoods>,
}

impl LikelihoodReport {
    pub fn get(&self, source: &str, target: &str) -> Option<f64> {
        self.log_likelihoods.get(source)?.get(target).copied()
    }

    pub fn to_json(&self) -> EvalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Estimate `log p(x_m)` per present modality and `log p(X)` (under `joint`)
/// of `batch` with samples from one source.
pub fn log_likelihood<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    batch: &ModalityBatch,
    source: &LatentSource,
    num_importance_samples: usize,
    rng: &mut R,
) -> EvalResult<TargetLikelihoods> {
    let enc_mods = vae.encode(batch)?;
    let latents = vae.inference(&enc_mods, rng)?;
    let embedding = latents.source(source)?;
    estimate(vae, batch, &enc_mods, embedding, num_importance_samples, rng)
}

/// Estimate every target under every fused subset and the joint.
pub fn subset_log_likelihoods<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    batch: &ModalityBatch,
    num_importance_samples: usize,
    rng: &mut R,
) -> EvalResult<LikelihoodReport> {
    let enc_mods = vae.encode(batch)?;
    let latents = vae.inference(&enc_mods, rng)?;

    let mut log_likelihoods = BTreeMap::new();
    for (key, embedding) in latents.fused() {
        let ll = estimate(vae, batch, &enc_mods, embedding, num_importance_samples, rng)?;
        log_likelihoods.insert(key.to_string(), ll);
    }
    let joint = LatentSource::Joint;
    let ll = estimate(vae, batch, &enc_mods, latents.source(&joint)?, num_importance_samples, rng)?;
    log_likelihoods.insert(joint.label().to_string(), ll);

    info!(num_importance_samples, results = ?log_likelihoods, "Estimated log-likelihoods");
    Ok(LikelihoodReport {
        num_importance_samples,
        log_likelihoods,
    })
}

fn estimate<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    batch: &ModalityBatch,
    enc_mods: &BTreeMap<String, EncMod>,
    embedding: &SubsetEmbedding,
    num_importance_samples: usize,
    rng: &mut R,
) -> EvalResult<TargetLikelihoods> {
    if num_importance_samples == 0 {
        return Err(EvalError::invalid_input("num_importance_samples must be > 0"));
    }

    let mut log_weights: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
    for _ in 0..num_importance_samples {
        let (z, log_q) = match embedding {
            SubsetEmbedding::Gaussian(q) => {
                let z = q.reparameterize(rng)?;
                let log_q = q.log_density(&z)?;
                (z, log_q)
            }
            SubsetEmbedding::Flow(sample) => {
                let flow = vae
                    .flow()
                    .ok_or_else(|| FusionError::config("flow embedding without a flow"))?;
                let z0 = sample.base.reparameterize(rng)?;
                let out = flow.forward(&z0)?;
                let log_q = sample.base.log_density(&z0)?.sub(&out.log_det_jacobian)?;
                (out.zk, log_q)
            }
        };

        let content = standard_normal_log_density(&z)?.sub(&log_q)?;
        let mut joint = content.clone();
        for (name, enc) in enc_mods {
            let adapter = vae.adapter(name)?;
            let (style, style_term) = match &enc.style {
                Some(q_style) => {
                    let s = q_style.reparameterize(rng)?;
                    let term = standard_normal_log_density(&s)?.sub(&q_style.log_density(&s)?)?;
                    (Some(s), Some(term))
                }
                None => (None, None),
            };
            let rec = adapter.decode(&z, style.as_ref())?;
            let weight = vae
                .config()
                .reconstruction_weight(name, adapter.reconstruction_weight());
            let log_p = rec.log_prob_per_sample(batch.require(name)?)?;

            let mut target = content.add(&log_p)?;
            joint = joint.add(&log_p.affine(weight, 0.0)?)?;
            if let Some(term) = style_term {
                target = target.add(&term)?;
                joint = joint.add(&term)?;
            }
            log_weights.entry(name.clone()).or_default().push(target.detach());
        }
        log_weights.entry(JOINT_LABEL.to_string()).or_default().push(joint.detach());
    }

    let mut results = TargetLikelihoods::new();
    for (target, weights) in log_weights {
        let stacked = Tensor::stack(&weights, 0)?;
        let per_row = log_sum_exp(&stacked)?.affine(1.0, -(num_importance_samples as f64).ln())?;
        let ll = per_row.mean_all()?.to_scalar::<f32>()? as f64;
        results.insert(target, ll);
    }
    debug!(num_importance_samples, results = ?results, "Importance-sampled log-likelihood");
    Ok(results)
}

/// `log Σ exp` over dim 0 of a `[K, batch]` tensor.
fn log_sum_exp(t: &Tensor) -> EvalResult<Tensor> {
    let max = t.max_keepdim(0)?;
    let summed = t.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()?;
    Ok(summed.add(&max)?.squeeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_log_sum_exp_matches_direct_form() {
        let t = Tensor::from_vec(vec![0.0f32, 1.0, 2.0, -3.0, 50.0, 0.5], (3, 2), &Device::Cpu).unwrap();
        let got = log_sum_exp(&t).unwrap().to_vec1::<f32>().unwrap();
        let col0 = (0f32.exp() + 2f32.exp() + 50f32.exp()).ln();
        let col1 = (1f32.exp() + (-3f32).exp() + 0.5f32.exp()).ln();
        assert!((got[0] - col0).abs() < 1e-4, "{} vs {}", got[0], col0);
        assert!((got[1] - col1).abs() < 1e-4, "{} vs {}", got[1], col1);
    }

    #[test]
    fn test_log_sum_exp_of_equal_rows() {
        let t = Tensor::zeros((4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let got = log_sum_exp(&t).unwrap().to_vec1::<f32>().unwrap();
        for v in got {
            assert!((v - 4f32.ln()).abs() < 1e-6);
        }
    }
}
