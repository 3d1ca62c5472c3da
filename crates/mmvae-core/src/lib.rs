//! Subset-fusion latent engine for multimodal variational autoencoders.
//!
//! Given per-modality encoders and decoders behind [`ModalityAdapter`], the
//! engine fuses the content posteriors of every modality subset, decodes the
//! subsets the active method requires, and decomposes the ELBO into per-subset
//! terms.
//!
//! # Modules
//!
//! - [`distribution`]: diagonal Gaussians, KL, product and mixture of experts
//! - [`subsets`]: cached powerset of modality names
//! - [`flow`]: invertible coupling flow for flow-based methods
//! - [`adapter`]: the modality encoder/decoder protocol
//! - [`likelihood`]: reconstruction likelihood families
//! - [`engine`]: [`MultimodalVae`] forward pass and generation
//! - [`loss`]: [`ElboDecomposer`] and batch results
//! - [`metrics`]: streaming averages per epoch
//! - [`training`]: train/eval step drivers
//! - [`config`]: TOML experiment configuration
//!
//! # Randomness
//!
//! Every stochastic operation takes a caller-owned `Rng`. Seed one `StdRng`
//! per run from [`ExperimentConfig::seed`] and pass it down.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod flow;
pub mod likelihood;
pub mod loss;
pub mod method;
pub mod metrics;
pub mod subsets;
pub mod training;

pub use adapter::{EncMod, ModalityAdapter};
pub use batch::ModalityBatch;
pub use config::{BetaConfig, EvaluationConfig, ExperimentConfig, FlowConfig};
pub use distribution::Distr;
pub use engine::{
    FlowSample, ForwardResults, JointLatents, LatentSource, MultimodalVae, SubsetEmbedding,
};
pub use error::{FusionError, FusionResult};
pub use flow::{Flow, FlowOutput};
pub use likelihood::{Likelihood, Reconstruction};
pub use loss::{BatchResults, BatchSummary, ElboDecomposer, LatentStats};
pub use method::{FusionMethod, MethodPolicy};
pub use metrics::{AverageMeter, AverageMeterDict, EpochMeters, EpochSummary, JointLatentMeter, LatentMeter};
pub use subsets::{Subset, SubsetIndex, SubsetKey};
pub use training::{eval_step, run_epoch, train_step};
