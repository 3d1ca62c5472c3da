//! Evaluation bookkeeping for a trained [`mmvae_core::MultimodalVae`].
//!
//! - [`representation`]: one linear classifier per (label, latent source) on
//!   the joint's and each subset's representation, and held-out accuracy
//! - [`coherence`]: label agreement of conditionally and randomly generated
//!   modalities
//! - [`likelihood`]: importance-sampled `log p(X)` and `log p(x_m)` per subset
//!   and joint
//! - [`labels`]: label columns and bounded resampling of training rows
//!
//! Every stochastic step takes the caller's `Rng`. Reports serialize to JSON
//! keyed by label, subset key, and modality name.

pub mod classifier;
pub mod coherence;
pub mod error;
pub mod labels;
pub mod likelihood;
pub mod representation;

pub use classifier::{accuracy, LogisticRegression};
pub use coherence::{
    conditional_coherence, random_coherence, ConditionalCoherence, LinearModalityClassifier,
    ModalityClassifier, RandomCoherence,
};
pub use error::{EvalError, EvalResult};
pub use labels::{has_both_classes, sample_training_indices, LabelTable};
pub use likelihood::{log_likelihood, subset_log_likelihoods, LikelihoodReport, TargetLikelihoods};
pub use representation::{
    collect_representations, test_subset_classifiers, train_subset_classifiers,
    RepresentationAccuracy, Representations, SubsetClassifiers,
};
