//! Streaming averages over batch results.
//!
//! Batch results are discarded after each step; only these meters survive
//! until the end of the epoch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FusionResult;
use crate::loss::{BatchSummary, LatentStats};

/// Running mean of a scalar, weighted by sample count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the mean over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Mean so far, 0 before the first update.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One [`AverageMeter`] per key.
#[derive(Debug, Clone, Default)]
pub struct AverageMeterDict {
    meters: BTreeMap<String, AverageMeter>,
}

impl AverageMeterDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<'a>(&mut self, values: impl IntoIterator<Item = (&'a String, &'a f32)>, n: usize) {
        for (key, value) in values {
            self.meters
                .entry(key.clone())
                .or_default()
                .update(*value as f64, n);
        }
    }

    pub fn get(&self, key: &str) -> Option<&AverageMeter> {
        self.meters.get(key)
    }

    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.meters.iter().map(|(k, m)| (k.clone(), m.avg())).collect()
    }
}

/// Running means of posterior statistics per modality.
#[derive(Debug, Clone, Default)]
pub struct LatentMeter {
    mu: AverageMeterDict,
    logvar: AverageMeterDict,
}

impl LatentMeter {
    pub fn update(&mut self, stats: &BTreeMap<String, LatentStats>, n: usize) {
        for (key, s) in stats {
            self.mu.update([(key, &s.mu)], n);
            self.logvar.update([(key, &s.logvar)], n);
        }
    }

    pub fn averages(&self) -> BTreeMap<String, LatentAverages> {
        let logvar = self.logvar.averages();
        self.mu
            .averages()
            .into_iter()
            .map(|(k, mu)| {
                let lv = logvar.get(&k).copied().unwrap_or(0.0);
                (k, LatentAverages { mu, logvar: lv })
            })
            .collect()
    }
}

/// Running means of posterior statistics per subset key and `joint`.
#[derive(Debug, Clone, Default)]
pub struct JointLatentMeter {
    inner: LatentMeter,
}

impl JointLatentMeter {
    pub fn update(&mut self, stats: &BTreeMap<String, LatentStats>, n: usize) {
        self.inner.update(stats, n);
    }

    pub fn averages(&self) -> BTreeMap<String, LatentAverages> {
        self.inner.averages()
    }
}

/// Epoch mean of μ and logσ².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatentAverages {
    pub mu: f64,
    pub logvar: f64,
}

/// Epoch-level aggregate of every batch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub beta: f64,
    pub num_batches: usize,
    pub num_samples: usize,
    pub total_loss: f64,
    pub joint_divergence: f64,
    pub klds: BTreeMap<String, f64>,
    pub style_klds: BTreeMap<String, f64>,
    pub log_probs: BTreeMap<String, BTreeMap<String, f64>>,
    pub latents: BTreeMap<String, LatentAverages>,
    pub style_latents: BTreeMap<String, LatentAverages>,
    pub joint_latents: BTreeMap<String, LatentAverages>,
}

impl EpochSummary {
    pub fn to_json(&self) -> FusionResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// All meters of one epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMeters {
    total_loss: AverageMeter,
    joint_divergence: AverageMeter,
    klds: AverageMeterDict,
    style_klds: AverageMeterDict,
    log_probs: BTreeMap<String, AverageMeterDict>,
    latents: LatentMeter,
    style_latents: LatentMeter,
    joint_latents: JointLatentMeter,
    beta: f64,
    num_batches: usize,
}

impl EpochMeters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one batch of `batch_size` samples.
    pub fn update(&mut self, summary: &BatchSummary, batch_size: usize) {
        self.total_loss.update(summary.total_loss as f64, batch_size);
        self.joint_divergence
            .update(summary.joint_divergence as f64, batch_size);
        self.klds.update(&summary.klds, batch_size);
        self.style_klds.update(&summary.style_klds, batch_size);
        for (source, per_target) in &summary.log_probs {
            self.log_probs
                .entry(source.clone())
                .or_default()
                .update(per_target, batch_size);
        }
        self.latents.update(&summary.latents, batch_size);
        self.style_latents.update(&summary.style_latents, batch_size);
        self.joint_latents.update(&summary.joint_latents, batch_size);
        self.beta = summary.beta;
        self.num_batches += 1;
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn summary(&self, epoch: usize) -> EpochSummary {
        EpochSummary {
            epoch,
            beta: self.beta,
            num_batches: self.num_batches,
            num_samples: self.total_loss.count(),
            total_loss: self.total_loss.avg(),
            joint_divergence: self.joint_divergence.avg(),
            klds: self.klds.averages(),
            style_klds: self.style_klds.averages(),
            log_probs: self
                .log_probs
                .iter()
                .map(|(k, d)| (k.clone(), d.averages()))
                .collect(),
            latents: self.latents.averages(),
            style_latents: self.style_latents.averages(),
            joint_latents: self.joint_latents.averages(),
        }
    }
}
