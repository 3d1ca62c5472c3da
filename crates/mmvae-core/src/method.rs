//! Fusion method tags and the per-method policy table.
//!
//! Every method-specific decision the engine and the ELBO decomposer make is
//! read from [`MethodPolicy`]. Adding a method means adding one row to
//! [`FusionMethod::policy`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FusionError;

/// Supported fusion methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    /// Product of experts over every subset.
    Poe,
    /// Mixture of unimodal experts.
    Moe,
    /// Jensen-Shannon divergence against a dynamic PoE prior.
    Jsd,
    /// Mixture of subset products of experts.
    JointElbo,
    /// Flow-transformed unimodal posteriors mixed per subset.
    PlanarMixture,
    /// Flow applied after the per-subset mixture.
    Pfom,
}

/// How member distributions of a subset are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsetFusion {
    /// Precision-weighted product with an implicit unit prior.
    ProductOfExperts,
    /// Per-row stochastic expert selection.
    MixtureOfExperts,
    /// Flow sample per modality, then per-row selection among members.
    FlowThenMixture,
    /// Per-row selection among members, then one flow sample.
    MixtureThenFlow,
}

/// Which distribution plays the role of the joint posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointPolicy {
    /// The fused subset of all present modalities.
    FullSet,
    /// Per-row selection over every fused subset.
    MixtureOfSubsets,
    /// Weighted PoE of the standard prior and all unimodal posteriors.
    DynamicPrior,
}

/// Which latent sources get decoded, and into which modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructionPolicy {
    /// The full set decodes every modality; each singleton decodes only itself.
    FullSetAndSingletons,
    /// Each singleton decodes every modality.
    SingletonsToAll,
    /// Every fused subset decodes every modality.
    AllSubsetsToAll,
    /// Only the joint decodes every modality.
    JointToAll,
}

/// How the content divergence entering the total loss is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergencePolicy {
    /// KL of each reconstructed source, added into that source's ELBO.
    PerSource,
    /// Uniform mixture of the unimodal KL terms.
    UnimodalMixture,
    /// Uniform mixture of the subset KL terms.
    SubsetMixture,
    /// Weighted KL of prior and unimodals against the dynamic prior.
    JensenShannon,
}

/// One row of the method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodPolicy {
    pub subset_fusion: SubsetFusion,
    pub joint: JointPolicy,
    pub reconstruction: ReconstructionPolicy,
    pub divergence: DivergencePolicy,
}

impl MethodPolicy {
    /// Whether subset embeddings come out of the flow transform.
    pub fn uses_flow(&self) -> bool {
        matches!(
            self.subset_fusion,
            SubsetFusion::FlowThenMixture | SubsetFusion::MixtureThenFlow
        )
    }
}

impl FusionMethod {
    /// All supported methods, in table order.
    pub const ALL: [FusionMethod; 6] = [
        FusionMethod::Poe,
        FusionMethod::Moe,
        FusionMethod::Jsd,
        FusionMethod::JointElbo,
        FusionMethod::PlanarMixture,
        FusionMethod::Pfom,
    ];

    /// The method table.
    pub fn policy(self) -> MethodPolicy {
        use DivergencePolicy as D;
        use JointPolicy as J;
        use ReconstructionPolicy as R;
        use SubsetFusion as F;

        match self {
            Self::Poe => MethodPolicy {
                subset_fusion: F::ProductOfExperts,
                joint: J::FullSet,
                reconstruction: R::FullSetAndSingletons,
                divergence: D::PerSource,
            },
            Self::Moe => MethodPolicy {
                subset_fusion: F::MixtureOfExperts,
                joint: J::FullSet,
                reconstruction: R::SingletonsToAll,
                divergence: D::UnimodalMixture,
            },
            Self::Jsd => MethodPolicy {
                subset_fusion: F::ProductOfExperts,
                joint: J::DynamicPrior,
                reconstruction: R::JointToAll,
                divergence: D::JensenShannon,
            },
            Self::JointElbo => MethodPolicy {
                subset_fusion: F::ProductOfExperts,
                joint: J::MixtureOfSubsets,
                reconstruction: R::AllSubsetsToAll,
                divergence: D::SubsetMixture,
            },
            Self::PlanarMixture => MethodPolicy {
                subset_fusion: F::FlowThenMixture,
                joint: J::FullSet,
                reconstruction: R::SingletonsToAll,
                divergence: D::UnimodalMixture,
            },
            Self::Pfom => MethodPolicy {
                subset_fusion: F::MixtureThenFlow,
                joint: J::FullSet,
                reconstruction: R::AllSubsetsToAll,
                divergence: D::SubsetMixture,
            },
        }
    }

    /// Canonical method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poe => "poe",
            Self::Moe => "moe",
            Self::Jsd => "jsd",
            Self::JointElbo => "joint_elbo",
            Self::PlanarMixture => "planar_mixture",
            Self::Pfom => "pfom",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionMethod {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| FusionError::UnknownMethod(s.to_string()))
    }
}
