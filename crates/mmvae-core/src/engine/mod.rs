//! Multimodal fusion engine.
//!
//! [`MultimodalVae`] owns the modality adapters, the cached subset index and
//! the optional flow. One forward pass:
//!
//! ```text
//! ModalityBatch ──encode──> EncMod per present modality
//!               ──fuse────> JointLatents (one embedding per covered subset + joint)
//!               ──decode──> Reconstruction per (source, target) required by the method
//! ```
//!
//! The engine holds no per-batch state; every call is independent apart from
//! the parameters it owns.

mod fusion;
pub mod latents;

pub(crate) use fusion::dynamic_prior;
pub use latents::{FlowSample, JointLatents, LatentSource, SubsetEmbedding};

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};

use crate::adapter::{EncMod, ModalityAdapter};
use crate::batch::ModalityBatch;
use crate::config::ExperimentConfig;
use crate::distribution::standard_normal_noise;
use crate::error::{FusionError, FusionResult};
use crate::flow::Flow;
use crate::likelihood::Reconstruction;
use crate::method::{MethodPolicy, ReconstructionPolicy};
use crate::subsets::{SubsetIndex, SubsetKey};

/// Decoder outputs keyed by latent source, then by target modality.
pub type Reconstructions = BTreeMap<LatentSource, BTreeMap<String, Reconstruction>>;

/// Everything one forward pass produced.
#[derive(Debug, Clone)]
pub struct ForwardResults {
    /// Encoded latents per present modality.
    pub enc_mods: BTreeMap<String, EncMod>,
    pub joint_latents: JointLatents,
    pub reconstructions: Reconstructions,
}

/// Subset-fusion multimodal VAE.
pub struct MultimodalVae {
    config: ExperimentConfig,
    policy: MethodPolicy,
    /// Registration order.
    adapters: Vec<Box<dyn ModalityAdapter>>,
    subsets: SubsetIndex,
    flow: Option<Flow>,
    device: Device,
}

impl MultimodalVae {
    /// Validate the configuration and adapters, enumerate subsets, build the flow.
    ///
    /// # Errors
    ///
    /// Configuration errors only: invalid config, no adapters, bad or duplicate
    /// names, an adapter whose content (or style) width differs from the
    /// configured latent (or style) dimension, or a weight override for an
    /// unknown modality.
    pub fn new(
        config: ExperimentConfig,
        adapters: Vec<Box<dyn ModalityAdapter>>,
        device: Device,
    ) -> FusionResult<Self> {
        config.validate()?;

        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        let subsets = SubsetIndex::enumerate(&names)?;

        for adapter in &adapters {
            if adapter.content_dim() != config.latent_dim {
                return Err(FusionError::dimension_mismatch(
                    format!("content dimension of modality '{}'", adapter.name()),
                    config.latent_dim,
                    adapter.content_dim(),
                ));
            }
            if config.factorized_representation && adapter.style_dim() != config.style_dim {
                return Err(FusionError::dimension_mismatch(
                    format!("style dimension of modality '{}'", adapter.name()),
                    config.style_dim,
                    adapter.style_dim(),
                ));
            }
            adapter.likelihood().validate()?;
        }
        if let Some(unknown) = config
            .reconstruction_weights
            .keys()
            .find(|m| !names.contains(&m.as_str()))
        {
            return Err(FusionError::config(format!(
                "[reconstruction_weights] unknown modality '{}'",
                unknown
            )));
        }

        let policy = config.method.policy();
        let flow = if policy.uses_flow() {
            let mut init_rng = StdRng::seed_from_u64(config.seed);
            Some(Flow::new(
                config.latent_dim,
                config.flow.num_flows,
                config.flow.hidden_dim,
                &mut init_rng,
                &device,
            )?)
        } else {
            None
        };

        info!(
            method = %config.method,
            modalities = ?names,
            num_subsets = subsets.len(),
            latent_dim = config.latent_dim,
            factorized = config.factorized_representation,
            num_flows = flow.as_ref().map_or(0, Flow::num_layers),
            "Initialized multimodal VAE"
        );

        Ok(Self {
            config,
            policy,
            adapters,
            subsets,
            flow,
            device,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn policy(&self) -> &MethodPolicy {
        &self.policy
    }

    pub fn subsets(&self) -> &SubsetIndex {
        &self.subsets
    }

    pub fn flow(&self) -> Option<&Flow> {
        self.flow.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn adapters(&self) -> impl Iterator<Item = &dyn ModalityAdapter> {
        self.adapters.iter().map(|a| a.as_ref())
    }

    pub fn adapter(&self, modality: &str) -> FusionResult<&dyn ModalityAdapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == modality)
            .map(|a| a.as_ref())
            .ok_or_else(|| FusionError::UnregisteredModality(modality.to_string()))
    }

    /// Adapter parameters followed by flow parameters.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.adapters.iter().flat_map(|a| a.trainable_vars()).collect();
        if let Some(flow) = &self.flow {
            vars.extend(flow.trainable_vars());
        }
        vars
    }

    /// Run the encoder of every modality present in `batch`.
    ///
    /// Adapter errors abort the call and are returned unchanged.
    pub fn encode(&self, batch: &ModalityBatch) -> FusionResult<BTreeMap<String, EncMod>> {
        let batch_size = batch.batch_size()?;
        if let Some((name, _)) = batch.iter().find(|(name, _)| self.adapter(name).is_err()) {
            return Err(FusionError::UnregisteredModality(name.clone()));
        }

        let mut enc_mods = BTreeMap::new();
        for adapter in &self.adapters {
            let Some(data) = batch.get(adapter.name()) else {
                continue;
            };
            let mut enc = adapter.encode(data).inspect_err(|e| {
                error!(modality = adapter.name(), error = %e, "Encoder failed");
            })?;
            self.check_encoding(adapter.name(), &enc, batch_size)?;
            if !self.config.factorized_representation {
                enc.style = None;
            }
            enc_mods.insert(adapter.name().to_string(), enc);
        }
        Ok(enc_mods)
    }

    fn check_encoding(&self, modality: &str, enc: &EncMod, batch_size: usize) -> FusionResult<()> {
        let expected = [batch_size, self.config.latent_dim];
        if enc.content.mu().dims() != expected {
            return Err(FusionError::shape_mismatch(
                format!("content posterior of modality '{}'", modality),
                &expected,
                enc.content.mu().dims(),
            ));
        }
        match (&enc.style, self.config.factorized_representation) {
            (Some(style), true) => {
                let expected = [batch_size, self.config.style_dim];
                if style.mu().dims() != expected {
                    return Err(FusionError::shape_mismatch(
                        format!("style posterior of modality '{}'", modality),
                        &expected,
                        style.mu().dims(),
                    ));
                }
            }
            (None, true) => {
                return Err(FusionError::adapter(
                    modality,
                    "factorized representation enabled but encoder returned no style posterior",
                ));
            }
            (_, false) => {}
        }
        Ok(())
    }

    /// Fuse encoded latents into the joint latent bundle.
    pub fn inference<R: Rng + ?Sized>(
        &self,
        enc_mods: &BTreeMap<String, EncMod>,
        rng: &mut R,
    ) -> FusionResult<JointLatents> {
        fusion::fuse_subsets(&self.policy, &self.subsets, enc_mods, self.flow.as_ref(), rng)
    }

    /// Encode, fuse and decode one batch.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        batch: &ModalityBatch,
        rng: &mut R,
    ) -> FusionResult<ForwardResults> {
        let enc_mods = self.encode(batch)?;
        let joint_latents = self.inference(&enc_mods, rng)?;
        let styles = self.sample_styles(&enc_mods, rng)?;

        let present: Vec<String> = enc_mods.keys().cloned().collect();
        let mut reconstructions: Reconstructions = BTreeMap::new();
        for (source, targets) in self.reconstruction_plan(&joint_latents, &present) {
            let z = joint_latents.source(&source)?.sample(rng)?;
            let entry = reconstructions.entry(source).or_default();
            for target in targets {
                let rec = self.decode(&target, &z, styles.get(&target))?;
                entry.insert(target, rec);
            }
        }

        debug!(
            present = ?present,
            sources = reconstructions.len(),
            "Forward pass complete"
        );

        Ok(ForwardResults {
            enc_mods,
            joint_latents,
            reconstructions,
        })
    }

    /// Which sources get decoded into which present modalities.
    fn reconstruction_plan(
        &self,
        latents: &JointLatents,
        present: &[String],
    ) -> Vec<(LatentSource, Vec<String>)> {
        let singleton = |m: &String| LatentSource::Subset(SubsetKey::from_names(&[m]));
        match self.policy.reconstruction {
            ReconstructionPolicy::FullSetAndSingletons => {
                let mut plan = vec![(
                    LatentSource::Subset(SubsetKey::from_names(present)),
                    present.to_vec(),
                )];
                plan.extend(present.iter().map(|m| (singleton(m), vec![m.clone()])));
                plan
            }
            ReconstructionPolicy::SingletonsToAll => present
                .iter()
                .map(|m| (singleton(m), present.to_vec()))
                .collect(),
            ReconstructionPolicy::AllSubsetsToAll => latents
                .fused()
                .map(|(key, _)| (LatentSource::Subset(key.clone()), present.to_vec()))
                .collect(),
            ReconstructionPolicy::JointToAll => vec![(LatentSource::Joint, present.to_vec())],
        }
    }

    /// Reparameterized style sample per modality (empty without factorization).
    fn sample_styles<R: Rng + ?Sized>(
        &self,
        enc_mods: &BTreeMap<String, EncMod>,
        rng: &mut R,
    ) -> FusionResult<BTreeMap<String, Tensor>> {
        let mut styles = BTreeMap::new();
        if !self.config.factorized_representation {
            return Ok(styles);
        }
        for (name, enc) in enc_mods {
            if let Some(style) = &enc.style {
                styles.insert(name.clone(), style.reparameterize(rng)?);
            }
        }
        Ok(styles)
    }

    /// Prior style sample per registered modality (empty without factorization).
    fn prior_styles<R: Rng + ?Sized>(
        &self,
        num_samples: usize,
        rng: &mut R,
    ) -> FusionResult<BTreeMap<String, Tensor>> {
        let mut styles = BTreeMap::new();
        if !self.config.factorized_representation {
            return Ok(styles);
        }
        for adapter in &self.adapters {
            let z = standard_normal_noise(&[num_samples, self.config.style_dim], &self.device, rng)?;
            styles.insert(adapter.name().to_string(), z);
        }
        Ok(styles)
    }

    fn decode(
        &self,
        modality: &str,
        z_content: &Tensor,
        z_style: Option<&Tensor>,
    ) -> FusionResult<Reconstruction> {
        if self.config.factorized_representation && z_style.is_none() {
            return Err(FusionError::MissingModality(format!("{} (style sample)", modality)));
        }
        let adapter = self.adapter(modality)?;
        adapter.decode(z_content, z_style).inspect_err(|e| {
            error!(modality, error = %e, "Decoder failed");
        })
    }

    /// Decode `z_content` into every registered modality.
    ///
    /// With factorized representations `styles` must hold a sample for every
    /// modality.
    pub fn generate(
        &self,
        z_content: &Tensor,
        styles: &BTreeMap<String, Tensor>,
    ) -> FusionResult<BTreeMap<String, Reconstruction>> {
        if z_content.rank() != 2 || z_content.dims()[1] != self.config.latent_dim {
            return Err(FusionError::shape_mismatch(
                "generation latent [n, latent_dim]",
                &[z_content.dims().first().copied().unwrap_or(0), self.config.latent_dim],
                z_content.dims(),
            ));
        }
        let mut out = BTreeMap::new();
        for adapter in &self.adapters {
            let rec = self.decode(adapter.name(), z_content, styles.get(adapter.name()))?;
            out.insert(adapter.name().to_string(), rec);
        }
        Ok(out)
    }

    /// `num_samples` latents from the prior `N(0, I)`.
    pub fn sample_prior<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> FusionResult<Tensor> {
        standard_normal_noise(&[num_samples, self.config.latent_dim], &self.device, rng)
    }

    /// Decode prior samples into every modality.
    pub fn random_generation<R: Rng + ?Sized>(
        &self,
        num_samples: usize,
        rng: &mut R,
    ) -> FusionResult<BTreeMap<String, Reconstruction>> {
        let z = self.sample_prior(num_samples, rng)?;
        let styles = self.prior_styles(num_samples, rng)?;
        self.generate(&z, &styles)
    }

    /// Infer the latent of `subset` from `batch` and decode it into every
    /// modality. Styles come from the prior.
    ///
    /// # Errors
    ///
    /// `FusionError::UnknownSubset` if `subset` is empty, unknown, or has a
    /// member missing from `batch`.
    pub fn conditional_generation<R: Rng + ?Sized>(
        &self,
        batch: &ModalityBatch,
        subset: &SubsetKey,
        rng: &mut R,
    ) -> FusionResult<BTreeMap<String, Reconstruction>> {
        let members = self.subsets.require(subset)?;
        let present: BTreeSet<String> = batch.present();
        if members.is_empty() || !members.is_covered_by(&present) {
            return Err(FusionError::UnknownSubset(subset.to_string()));
        }
        let enc_mods = self.encode(batch)?;
        let latents = self.inference(&enc_mods, rng)?;
        let z = latents.subset_embedding(subset, rng)?;
        let styles = self.prior_styles(z.dims()[0], rng)?;
        self.generate(&z, &styles)
    }
}
