//! ELBO decomposition.
//!
//! Turns a [`ForwardResults`] bundle into the training objective and the
//! per-subset bookkeeping. The combination rule per method:
//!
//! | divergence policy | methods | total loss |
//! |---|---|---|
//! | per source | poe | `Σ_src rec(src→T_src) + β(βc·KL_src + βs·KLstyle(T_src))` |
//! | unimodal mixture | moe, planar_mixture | `Σ_m π_m rec(m→all) + β(βc·Σ_m π_m KL_m + βs·KLstyle)` |
//! | subset mixture | joint_elbo, pfom | `Σ_s π_s rec(s→all) + β(βc·Σ_s π_s KL_s + βs·KLstyle)` |
//! | Jensen-Shannon | jsd | `rec(joint→all) + β(βc·Σ_k π_k KL(q_k ‖ q_dyn) + βs·KLstyle)` |
//!
//! `rec` is the weighted negative log-likelihood normalized by batch size.
//! Flow embeddings use the flow-corrected single-sample KL. Any non-finite
//! term aborts with `NonFiniteLoss`.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::adapter::EncMod;
use crate::batch::ModalityBatch;
use crate::config::BetaConfig;
use crate::distribution::{uniform_weights, Distr};
use crate::engine::{dynamic_prior, ForwardResults, JointLatents, LatentSource, MultimodalVae};
use crate::error::{FusionError, FusionResult};
use crate::method::{DivergencePolicy, FusionMethod, MethodPolicy};
use crate::subsets::{SubsetKey, JOINT_LABEL};

/// Output of one training or evaluation step.
#[derive(Debug, Clone)]
pub struct BatchResults {
    /// Rank-0 objective to minimize; carries the autograd graph.
    pub total_loss: Tensor,
    /// Beta used for this batch.
    pub beta: f64,
    /// Content divergence per fused subset key.
    pub klds: BTreeMap<String, f32>,
    /// Style divergence per modality (factorized runs only).
    pub style_klds: BTreeMap<String, f32>,
    /// Normalized log-likelihood per source label, then per target modality.
    pub log_probs: BTreeMap<String, BTreeMap<String, f32>>,
    /// Divergence term of the method's joint.
    pub joint_divergence: f32,
    pub enc_mods: BTreeMap<String, EncMod>,
    pub joint_latents: JointLatents,
}

/// Mean of μ and logσ² over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatentStats {
    pub mu: f32,
    pub logvar: f32,
}

/// Plain-number view of [`BatchResults`] for logging and JSON export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_loss: f32,
    pub beta: f64,
    pub joint_divergence: f32,
    pub klds: BTreeMap<String, f32>,
    pub style_klds: BTreeMap<String, f32>,
    pub log_probs: BTreeMap<String, BTreeMap<String, f32>>,
    /// Content posterior statistics per modality.
    pub latents: BTreeMap<String, LatentStats>,
    /// Style posterior statistics per modality.
    pub style_latents: BTreeMap<String, LatentStats>,
    /// Posterior statistics per fused subset key, and `joint`.
    pub joint_latents: BTreeMap<String, LatentStats>,
}

impl BatchResults {
    pub fn total_loss_value(&self) -> FusionResult<f32> {
        Ok(self.total_loss.to_scalar::<f32>()?)
    }

    pub fn summary(&self) -> FusionResult<BatchSummary> {
        let stats = |d: &Distr| -> FusionResult<LatentStats> {
            let (mu, logvar) = d.mean_stats()?;
            Ok(LatentStats { mu, logvar })
        };

        let mut latents = BTreeMap::new();
        let mut style_latents = BTreeMap::new();
        for (name, enc) in &self.enc_mods {
            latents.insert(name.clone(), stats(&enc.content)?);
            if let Some(style) = &enc.style {
                style_latents.insert(name.clone(), stats(style)?);
            }
        }

        let mut joint_latents = BTreeMap::new();
        for (key, embedding) in self.joint_latents.fused() {
            joint_latents.insert(key.to_string(), stats(embedding.gaussian())?);
        }
        joint_latents.insert(JOINT_LABEL.to_string(), stats(self.joint_latents.joint().gaussian())?);

        Ok(BatchSummary {
            total_loss: self.total_loss_value()?,
            beta: self.beta,
            joint_divergence: self.joint_divergence,
            klds: self.klds.clone(),
            style_klds: self.style_klds.clone(),
            log_probs: self.log_probs.clone(),
            latents,
            style_latents,
            joint_latents,
        })
    }
}

impl BatchSummary {
    pub fn to_json(&self) -> FusionResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Combines reconstruction and divergence terms into the method's objective.
#[derive(Debug, Clone)]
pub struct ElboDecomposer {
    method: FusionMethod,
    policy: MethodPolicy,
    beta: BetaConfig,
    /// Reconstruction weight per registered modality.
    weights: BTreeMap<String, f64>,
}

impl ElboDecomposer {
    /// Resolve weights and beta schedule from the engine's configuration.
    pub fn new(vae: &MultimodalVae) -> Self {
        let config = vae.config();
        let weights = vae
            .adapters()
            .map(|a| {
                let w = config.reconstruction_weight(a.name(), a.reconstruction_weight());
                (a.name().to_string(), w)
            })
            .collect();
        Self {
            method: config.method,
            policy: *vae.policy(),
            beta: config.beta.clone(),
            weights,
        }
    }

    pub fn method(&self) -> FusionMethod {
        self.method
    }

    /// Warmup beta for `epoch`.
    pub fn beta(&self, epoch: usize) -> f64 {
        self.beta.beta(epoch)
    }

    pub fn reconstruction_weight(&self, modality: &str) -> f64 {
        self.weights.get(modality).copied().unwrap_or(1.0)
    }

    /// Compute the objective for one forward pass at `epoch`.
    pub fn compute(
        &self,
        results: ForwardResults,
        batch: &ModalityBatch,
        epoch: usize,
    ) -> FusionResult<BatchResults> {
        let ForwardResults {
            enc_mods,
            joint_latents,
            reconstructions,
        } = results;
        let norm = batch.batch_size()? as f64;
        let beta = self.beta(epoch);
        let (beta_content, beta_style) = (self.beta.beta_content, self.beta.beta_style);

        // Content KL per fused subset.
        let mut kl_terms: BTreeMap<SubsetKey, Tensor> = BTreeMap::new();
        let mut klds = BTreeMap::new();
        for (key, embedding) in joint_latents.fused() {
            let kl = embedding.kl_divergence(norm)?;
            let value = self.finite(&kl, key.as_str(), "kl divergence")?;
            klds.insert(key.to_string(), value);
            kl_terms.insert(key.clone(), kl);
        }

        // Style KL per modality.
        let mut style_terms: BTreeMap<String, Tensor> = BTreeMap::new();
        let mut style_klds = BTreeMap::new();
        for (name, enc) in &enc_mods {
            if let Some(style) = &enc.style {
                let kl = style.kl_divergence(norm)?;
                let value = self.finite(&kl, name, "style kl divergence")?;
                style_klds.insert(name.clone(), value);
                style_terms.insert(name.clone(), kl);
            }
        }

        // Weighted NLL per source, and the log-probs for bookkeeping.
        let mut rec_terms: BTreeMap<LatentSource, Tensor> = BTreeMap::new();
        let mut log_probs = BTreeMap::new();
        for (source, targets) in &reconstructions {
            let mut per_target = BTreeMap::new();
            let mut nll: Option<Tensor> = None;
            for (target, rec) in targets {
                let lp = rec.log_prob(batch.require(target)?, norm)?;
                let value = self.finite(&lp, source.label(), &format!("log-likelihood of '{}'", target))?;
                per_target.insert(target.clone(), value);
                let weighted = lp.affine(-self.reconstruction_weight(target), 0.0)?;
                nll = Some(match nll {
                    Some(acc) => acc.add(&weighted)?,
                    None => weighted,
                });
            }
            if let Some(nll) = nll {
                rec_terms.insert(source.clone(), nll);
            }
            log_probs.insert(source.label().to_string(), per_target);
        }

        let style_all = sum_tensors(style_terms.values())?;
        let (total, joint_divergence) = match self.policy.divergence {
            DivergencePolicy::PerSource => {
                let mut terms = Vec::new();
                for (source, nll) in &rec_terms {
                    let kl = kl_of_source(&kl_terms, source)?;
                    let style = match reconstructions.get(source) {
                        Some(targets) => sum_tensors(targets.keys().filter_map(|t| style_terms.get(t)))?,
                        None => None,
                    };
                    let div = weighted_divergence(kl, style.as_ref(), beta, beta_content, beta_style)?;
                    terms.push(nll.add(&div)?);
                }
                let full_key = joint_latents
                    .joint_subsets()
                    .first()
                    .cloned()
                    .unwrap_or_else(SubsetKey::empty);
                let joint_kl = kl_terms
                    .get(&full_key)
                    .ok_or_else(|| FusionError::UnknownSubset(full_key.to_string()))?;
                (sum_tensors(terms.iter())?, joint_kl.clone())
            }
            DivergencePolicy::UnimodalMixture | DivergencePolicy::SubsetMixture => {
                let (rec, div) = self.mixture_terms(&rec_terms, &kl_terms)?;
                let total = rec.add(&weighted_divergence(&div, style_all.as_ref(), beta, beta_content, beta_style)?)?;
                (Some(total), div)
            }
            DivergencePolicy::JensenShannon => {
                let div = jensen_shannon(&enc_mods, norm)?;
                let rec = rec_terms
                    .get(&LatentSource::Joint)
                    .ok_or_else(|| FusionError::UnknownSubset(JOINT_LABEL.to_string()))?;
                let total = rec.add(&weighted_divergence(&div, style_all.as_ref(), beta, beta_content, beta_style)?)?;
                (Some(total), div)
            }
        };

        let total_loss = total.ok_or(FusionError::EmptyBatch)?;
        let joint_divergence = self.finite(&joint_divergence, JOINT_LABEL, "joint divergence")?;
        let total_value = self.finite(&total_loss, JOINT_LABEL, "total loss")?;

        debug!(
            method = %self.method,
            beta,
            total_loss = total_value,
            joint_divergence,
            num_klds = klds.len(),
            "Decomposed ELBO"
        );

        Ok(BatchResults {
            total_loss,
            beta,
            klds,
            style_klds,
            log_probs,
            joint_divergence,
            enc_mods,
            joint_latents,
        })
    }

    /// Uniform mixture over the reconstructed sources: `(Σ π rec, Σ π KL)`.
    fn mixture_terms(
        &self,
        rec_terms: &BTreeMap<LatentSource, Tensor>,
        kl_terms: &BTreeMap<SubsetKey, Tensor>,
    ) -> FusionResult<(Tensor, Tensor)> {
        let weights = uniform_weights(rec_terms.len());
        let mut rec: Option<Tensor> = None;
        let mut div: Option<Tensor> = None;
        for ((source, nll), w) in rec_terms.iter().zip(weights) {
            let kl = kl_of_source(kl_terms, source)?;
            let (wr, wk) = (nll.affine(w, 0.0)?, kl.affine(w, 0.0)?);
            rec = Some(match rec {
                Some(acc) => acc.add(&wr)?,
                None => wr,
            });
            div = Some(match div {
                Some(acc) => acc.add(&wk)?,
                None => wk,
            });
        }
        match (rec, div) {
            (Some(rec), Some(div)) => Ok((rec, div)),
            _ => Err(FusionError::EmptyBatch),
        }
    }

    /// Scalar value of a rank-0 term, or `NonFiniteLoss`.
    fn finite(&self, t: &Tensor, source: &str, term: &str) -> FusionResult<f32> {
        let value = t.to_scalar::<f32>()?;
        if value.is_finite() {
            return Ok(value);
        }
        error!(method = %self.method, source, term, value, "Non-finite loss term");
        Err(FusionError::NonFiniteLoss {
            method: self.method,
            source_label: source.to_string(),
            term: term.to_string(),
            value,
        })
    }
}

/// `Σ_k π_k KL(q_k ‖ q_dyn)` over the standard prior and every unimodal
/// posterior, `π_k = 1 / (M + 1)`.
fn jensen_shannon(enc_mods: &BTreeMap<String, EncMod>, norm: f64) -> FusionResult<Tensor> {
    let dynamic = dynamic_prior(enc_mods)?;
    let prior = Distr::standard_normal(dynamic.batch_size(), dynamic.latent_dim(), dynamic.device())?;
    let mut experts: Vec<&Distr> = vec![&prior];
    experts.extend(enc_mods.values().map(|e| &e.content));
    let weights = uniform_weights(experts.len());

    let mut div: Option<Tensor> = None;
    for (expert, w) in experts.iter().zip(weights) {
        let kl = expert.kl_divergence_from(&dynamic, norm)?.affine(w, 0.0)?;
        div = Some(match div {
            Some(acc) => acc.add(&kl)?,
            None => kl,
        });
    }
    div.ok_or(FusionError::EmptyBatch)
}

fn kl_of_source<'a>(kl_terms: &'a BTreeMap<SubsetKey, Tensor>, source: &LatentSource) -> FusionResult<&'a Tensor> {
    match source {
        LatentSource::Subset(key) => kl_terms
            .get(key)
            .ok_or_else(|| FusionError::UnknownSubset(key.to_string())),
        LatentSource::Joint => Err(FusionError::UnknownSubset(JOINT_LABEL.to_string())),
    }
}

/// `β · (βc·kl + βs·style)`.
fn weighted_divergence(
    kl: &Tensor,
    style: Option<&Tensor>,
    beta: f64,
    beta_content: f64,
    beta_style: f64,
) -> FusionResult<Tensor> {
    let mut div = kl.affine(beta * beta_content, 0.0)?;
    if let Some(style) = style {
        div = div.add(&style.affine(beta * beta_style, 0.0)?)?;
    }
    Ok(div)
}

fn sum_tensors<'a>(terms: impl Iterator<Item = &'a Tensor>) -> FusionResult<Option<Tensor>> {
    let mut acc: Option<Tensor> = None;
    for t in terms {
        acc = Some(match acc {
            Some(a) => a.add(t)?,
            None => t.clone(),
        });
    }
    Ok(acc)
}
