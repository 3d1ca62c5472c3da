//! Joint latent bundle produced by one inference pass.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;
use rand::Rng;
use serde::{Serialize, Serializer};

use crate::distribution::{standard_normal_log_density, Distr};
use crate::error::{FusionError, FusionResult};
use crate::subsets::{SubsetKey, JOINT_LABEL};

/// Flow-transformed sample of a subset posterior.
#[derive(Debug, Clone)]
pub struct FlowSample {
    /// Base Gaussian the sample `z0` was drawn from.
    pub base: Distr,
    pub z0: Tensor,
    pub zk: Tensor,
    /// Shape `[batch]`.
    pub log_det_jacobian: Tensor,
}

impl FlowSample {
    /// Single-sample estimate of `KL(q_k ‖ N(0, I))`:
    /// `log q0(z0) - log|det J| - log N(zk; 0, I)`, summed over the batch and
    /// divided by `norm_value`.
    pub fn kl_divergence(&self, norm_value: f64) -> FusionResult<Tensor> {
        let log_q0 = self.base.log_density(&self.z0)?;
        let log_prior = standard_normal_log_density(&self.zk)?;
        let per_sample = log_q0.sub(&self.log_det_jacobian)?.sub(&log_prior)?;
        Ok(per_sample.sum_all()?.affine(1.0 / norm_value, 0.0)?)
    }
}

/// Latent of one subset: a Gaussian, or a flow sample for flow methods.
#[derive(Debug, Clone)]
pub enum SubsetEmbedding {
    Gaussian(Distr),
    Flow(FlowSample),
}

impl SubsetEmbedding {
    /// Draw a latent: reparameterized sample, or the stored `zk`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> FusionResult<Tensor> {
        match self {
            Self::Gaussian(d) => d.reparameterize(rng),
            Self::Flow(f) => Ok(f.zk.clone()),
        }
    }

    /// Deterministic representation: posterior mean, or `zk`.
    pub fn representation(&self) -> &Tensor {
        match self {
            Self::Gaussian(d) => d.mu(),
            Self::Flow(f) => &f.zk,
        }
    }

    /// Divergence from the standard prior, analytic or flow-corrected.
    pub fn kl_divergence(&self, norm_value: f64) -> FusionResult<Tensor> {
        match self {
            Self::Gaussian(d) => d.kl_divergence(norm_value),
            Self::Flow(f) => f.kl_divergence(norm_value),
        }
    }

    /// The Gaussian, or the flow's base Gaussian.
    pub fn gaussian(&self) -> &Distr {
        match self {
            Self::Gaussian(d) => d,
            Self::Flow(f) => &f.base,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.gaussian().batch_size()
    }

    pub fn latent_dim(&self) -> usize {
        self.gaussian().latent_dim()
    }
}

/// Where a decoded latent comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LatentSource {
    Joint,
    Subset(SubsetKey),
}

impl LatentSource {
    pub fn label(&self) -> &str {
        match self {
            Self::Joint => JOINT_LABEL,
            Self::Subset(key) => key.as_str(),
        }
    }
}

impl fmt::Display for LatentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for LatentSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Fused latents of every subset for one batch, plus the joint posterior.
#[derive(Debug, Clone)]
pub struct JointLatents {
    /// Every enumerated key. `None` for the empty subset and for subsets whose
    /// members are not all present in the batch.
    subsets: BTreeMap<SubsetKey, Option<SubsetEmbedding>>,
    joint: SubsetEmbedding,
    /// Subsets whose posteriors make up the joint.
    joint_subsets: Vec<SubsetKey>,
}

impl JointLatents {
    pub(crate) fn new(
        subsets: BTreeMap<SubsetKey, Option<SubsetEmbedding>>,
        joint: SubsetEmbedding,
        joint_subsets: Vec<SubsetKey>,
    ) -> Self {
        Self {
            subsets,
            joint,
            joint_subsets,
        }
    }

    /// Every enumerated key, the empty key included.
    pub fn keys(&self) -> impl Iterator<Item = &SubsetKey> {
        self.subsets.keys()
    }

    /// Fused subsets, in key order.
    pub fn fused(&self) -> impl Iterator<Item = (&SubsetKey, &SubsetEmbedding)> {
        self.subsets
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|e| (k, e)))
    }

    pub fn subset(&self, key: &SubsetKey) -> Option<&SubsetEmbedding> {
        self.subsets.get(key).and_then(Option::as_ref)
    }

    /// Look up a fused subset, failing with `UnknownSubset`.
    pub fn require(&self, key: &SubsetKey) -> FusionResult<&SubsetEmbedding> {
        self.subset(key)
            .ok_or_else(|| FusionError::UnknownSubset(key.to_string()))
    }

    pub fn joint(&self) -> &SubsetEmbedding {
        &self.joint
    }

    pub fn joint_subsets(&self) -> &[SubsetKey] {
        &self.joint_subsets
    }

    /// Sample of the joint posterior.
    pub fn joint_embedding<R: Rng + ?Sized>(&self, rng: &mut R) -> FusionResult<Tensor> {
        self.joint.sample(rng)
    }

    /// Sample of one subset's posterior.
    pub fn subset_embedding<R: Rng + ?Sized>(&self, key: &SubsetKey, rng: &mut R) -> FusionResult<Tensor> {
        self.require(key)?.sample(rng)
    }

    /// Embedding for `source`.
    pub fn source(&self, source: &LatentSource) -> FusionResult<&SubsetEmbedding> {
        match source {
            LatentSource::Joint => Ok(&self.joint),
            LatentSource::Subset(key) => self.require(key),
        }
    }

    /// Deterministic representation of one subset.
    pub fn representation(&self, key: &SubsetKey) -> FusionResult<&Tensor> {
        Ok(self.require(key)?.representation())
    }
}
