//! Per-method subset fusion strategies.
//!
//! One entry point, [`fuse_subsets`], dispatching on the method policy. The
//! rest of the engine never matches on the method itself.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use tracing::debug;

use super::latents::{FlowSample, JointLatents, SubsetEmbedding};
use crate::adapter::EncMod;
use crate::distribution::{
    mixture_component_selection, mixture_with_assignment, product_of_experts, sample_row_assignment,
    select_rows, uniform_weights, weighted_product, Distr,
};
use crate::error::{FusionError, FusionResult};
use crate::flow::Flow;
use crate::method::{JointPolicy, MethodPolicy, SubsetFusion};
use crate::subsets::{Subset, SubsetIndex, SubsetKey};

/// Fuse the content posteriors of every subset covered by `enc_mods`.
pub(crate) fn fuse_subsets<R: Rng + ?Sized>(
    policy: &MethodPolicy,
    index: &SubsetIndex,
    enc_mods: &BTreeMap<String, EncMod>,
    flow: Option<&Flow>,
    rng: &mut R,
) -> FusionResult<JointLatents> {
    let present: BTreeSet<String> = enc_mods.keys().cloned().collect();
    if present.is_empty() {
        return Err(FusionError::EmptyBatch);
    }

    // Flow-then-mixture pushes every unimodal posterior through the flow once.
    let unimodal_flows = match policy.subset_fusion {
        SubsetFusion::FlowThenMixture => {
            let flow = require_flow(flow)?;
            let mut samples = BTreeMap::new();
            for (name, enc) in enc_mods {
                samples.insert(name.clone(), flow_sample(flow, &enc.content, rng)?);
            }
            samples
        }
        _ => BTreeMap::new(),
    };

    let mut subsets: BTreeMap<SubsetKey, Option<SubsetEmbedding>> = BTreeMap::new();
    for subset in index.iter() {
        let embedding = if subset.is_empty() || !subset.is_covered_by(&present) {
            None
        } else {
            Some(fuse_one(policy, subset, enc_mods, &unimodal_flows, flow, rng)?)
        };
        subsets.insert(subset.key().clone(), embedding);
    }

    let full_key = SubsetKey::from_names(&present.iter().collect::<Vec<_>>());
    let (joint, joint_subsets) = match policy.joint {
        JointPolicy::FullSet => {
            let full = subsets
                .get(&full_key)
                .and_then(|e| e.clone())
                .ok_or_else(|| FusionError::UnknownSubset(full_key.to_string()))?;
            (full, vec![full_key.clone()])
        }
        JointPolicy::MixtureOfSubsets => {
            let keys: Vec<SubsetKey> = subsets
                .iter()
                .filter(|(_, e)| e.is_some())
                .map(|(k, _)| k.clone())
                .collect();
            let experts: Vec<&Distr> = subsets
                .values()
                .filter_map(|e| e.as_ref().map(SubsetEmbedding::gaussian))
                .collect();
            let joint = mixture_component_selection(&experts, None, rng)?;
            (SubsetEmbedding::Gaussian(joint), keys)
        }
        JointPolicy::DynamicPrior => {
            let prior = dynamic_prior(enc_mods)?;
            let keys = present.iter().map(|m| SubsetKey::from_names(&[m])).collect();
            (SubsetEmbedding::Gaussian(prior), keys)
        }
    };

    debug!(
        present = present.len(),
        fused = subsets.values().filter(|e| e.is_some()).count(),
        joint = %full_key,
        "Fused subset posteriors"
    );

    Ok(JointLatents::new(subsets, joint, joint_subsets))
}

fn fuse_one<R: Rng + ?Sized>(
    policy: &MethodPolicy,
    subset: &Subset,
    enc_mods: &BTreeMap<String, EncMod>,
    unimodal_flows: &BTreeMap<String, FlowSample>,
    flow: Option<&Flow>,
    rng: &mut R,
) -> FusionResult<SubsetEmbedding> {
    let members = member_contents(subset, enc_mods)?;
    match policy.subset_fusion {
        SubsetFusion::ProductOfExperts => {
            Ok(SubsetEmbedding::Gaussian(product_of_experts(&members, None)?))
        }
        SubsetFusion::MixtureOfExperts => Ok(SubsetEmbedding::Gaussian(
            mixture_component_selection(&members, None, rng)?,
        )),
        SubsetFusion::FlowThenMixture => {
            let samples = subset
                .modalities()
                .iter()
                .map(|m| {
                    unimodal_flows
                        .get(m)
                        .ok_or_else(|| FusionError::MissingModality(m.clone()))
                })
                .collect::<FusionResult<Vec<_>>>()?;
            let assignment = sample_row_assignment(
                samples.len(),
                members[0].batch_size(),
                Some(&uniform_weights(samples.len())),
                rng,
            )?;
            let z0s: Vec<_> = samples.iter().map(|s| &s.z0).collect();
            let zks: Vec<_> = samples.iter().map(|s| &s.zk).collect();
            let log_dets: Vec<_> = samples.iter().map(|s| &s.log_det_jacobian).collect();
            Ok(SubsetEmbedding::Flow(FlowSample {
                base: mixture_with_assignment(&members, &assignment)?,
                z0: select_rows(&z0s, &assignment)?,
                zk: select_rows(&zks, &assignment)?,
                log_det_jacobian: select_rows(&log_dets, &assignment)?,
            }))
        }
        SubsetFusion::MixtureThenFlow => {
            let base = mixture_component_selection(&members, None, rng)?;
            Ok(SubsetEmbedding::Flow(flow_sample(require_flow(flow)?, &base, rng)?))
        }
    }
}

/// `z0 ~ base`, pushed through `flow`.
fn flow_sample<R: Rng + ?Sized>(flow: &Flow, base: &Distr, rng: &mut R) -> FusionResult<FlowSample> {
    let z0 = base.reparameterize(rng)?;
    let out = flow.forward(&z0)?;
    Ok(FlowSample {
        base: base.clone(),
        z0: out.z0,
        zk: out.zk,
        log_det_jacobian: out.log_det_jacobian,
    })
}

/// Weighted product of the standard prior and every unimodal posterior,
/// each with weight `1 / (M + 1)`.
pub(crate) fn dynamic_prior(enc_mods: &BTreeMap<String, EncMod>) -> FusionResult<Distr> {
    let first = enc_mods
        .values()
        .next()
        .ok_or(FusionError::EmptyBatch)?;
    let prior = Distr::standard_normal(
        first.content.batch_size(),
        first.content.latent_dim(),
        first.content.device(),
    )?;
    let mut experts: Vec<&Distr> = vec![&prior];
    experts.extend(enc_mods.values().map(|e| &e.content));
    weighted_product(&experts, &uniform_weights(experts.len()))
}

fn member_contents<'a>(
    subset: &Subset,
    enc_mods: &'a BTreeMap<String, EncMod>,
) -> FusionResult<Vec<&'a Distr>> {
    subset
        .modalities()
        .iter()
        .map(|m| {
            enc_mods
                .get(m)
                .map(|e| &e.content)
                .ok_or_else(|| FusionError::MissingModality(m.clone()))
        })
        .collect()
}

fn require_flow(flow: Option<&Flow>) -> FusionResult<&Flow> {
    flow.ok_or_else(|| FusionError::config("flow-based fusion requires a configured flow"))
}
