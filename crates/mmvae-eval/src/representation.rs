//! Linear classifiers on latent representations.
//!
//! For every label and every latent source (each fused subset, and the
//! method's joint) a [`LogisticRegression`] is trained on the source's
//! deterministic representation (posterior mean, or `zk` for flow methods) and
//! tested on held-out rows.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use mmvae_core::{EvaluationConfig, LatentSource, ModalityBatch, MultimodalVae};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::LogisticRegression;
use crate::error::{EvalError, EvalResult};
use crate::labels::{sample_training_indices, LabelTable};

/// Per-source representations stacked over a dataset, `[n, latent_dim]` each.
#[derive(Debug, Clone)]
pub struct Representations {
    sources: BTreeMap<LatentSource, Tensor>,
    num_rows: usize,
}

impl Representations {
    pub fn get(&self, source: &LatentSource) -> Option<&Tensor> {
        self.sources.get(source)
    }

    /// Sources in order: `joint` first, then subset keys.
    pub fn keys(&self) -> impl Iterator<Item = &LatentSource> {
        self.sources.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LatentSource, &Tensor)> {
        self.sources.iter()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Encode and fuse every batch, keeping the joint's and each subset's
/// representation.
///
/// Only subsets fused in every batch are kept; a batch missing one of a
/// subset's modalities drops that subset. The joint is kept for every batch.
/// Representations are detached from the engine's autograd graph.
pub fn collect_representations<'a, R, I>(vae: &MultimodalVae, batches: I, rng: &mut R) -> EvalResult<Representations>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = &'a ModalityBatch>,
{
    let mut parts: BTreeMap<LatentSource, Vec<Tensor>> = BTreeMap::new();
    let mut num_rows = 0;
    let mut num_batches = 0;

    for batch in batches {
        let enc_mods = vae.encode(batch)?;
        let latents = vae.inference(&enc_mods, rng)?;
        let mut fused: BTreeMap<LatentSource, Tensor> = latents
            .fused()
            .map(|(key, embedding)| (LatentSource::Subset(key.clone()), embedding.representation().detach()))
            .collect();
        fused.insert(LatentSource::Joint, latents.joint().representation().detach());

        if num_batches == 0 {
            for (source, rep) in fused {
                parts.insert(source, vec![rep]);
            }
        } else {
            parts.retain(|source, _| fused.contains_key(source));
            for (source, reps) in parts.iter_mut() {
                if let Some(rep) = fused.get(source) {
                    reps.push(rep.clone());
                }
            }
        }
        num_rows += batch.batch_size()?;
        num_batches += 1;
    }

    if num_batches == 0 {
        return Err(EvalError::invalid_input("no batches to collect representations from"));
    }

    let mut sources = BTreeMap::new();
    for (source, reps) in parts {
        sources.insert(source, Tensor::cat(&reps, 0)?);
    }
    debug!(num_batches, num_rows, num_sources = sources.len(), "Collected representations");

    Ok(Representations { sources, num_rows })
}

/// One classifier per label, then per latent source.
pub type SubsetClassifiers = BTreeMap<String, BTreeMap<LatentSource, LogisticRegression>>;

/// Train one classifier per (label, source) on a random draw of rows that
/// contains both classes of every label.
///
/// # Errors
///
/// `EvalError::LabelResampling` if no such draw is found within
/// `config.max_label_tries`, `EvalError::InvalidInput` if the label table and
/// the representations disagree on the number of rows.
pub fn train_subset_classifiers<R: Rng + ?Sized>(
    representations: &Representations,
    labels: &LabelTable,
    config: &EvaluationConfig,
    rng: &mut R,
) -> EvalResult<SubsetClassifiers> {
    check_rows(representations, labels)?;
    let indices = sample_training_indices(labels, config.num_training_samples_lr, config.max_label_tries, rng)?;
    let train_labels = labels.select(&indices)?;
    let index = index_tensor(&indices, &Device::Cpu)?;

    let mut classifiers = SubsetClassifiers::new();
    for (label, targets) in train_labels.iter() {
        let mut per_source = BTreeMap::new();
        for (source, rep) in representations.iter() {
            let features = rep.index_select(&index.to_device(rep.device())?, 0)?;
            let clf = LogisticRegression::fit(
                &features,
                targets,
                config.classifier_epochs,
                config.classifier_learning_rate,
            )?;
            per_source.insert(source.clone(), clf);
        }
        classifiers.insert(label.clone(), per_source);
    }

    info!(
        num_labels = classifiers.len(),
        num_sources = representations.sources.len(),
        num_training_samples = indices.len(),
        "Trained latent representation classifiers"
    );
    Ok(classifiers)
}

/// Held-out accuracy per label, then per source label (subset key or `joint`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepresentationAccuracy {
    pub accuracy: BTreeMap<String, BTreeMap<String, f64>>,
}

impl RepresentationAccuracy {
    /// Accuracy of one (label, source) pair.
    pub fn get(&self, label: &str, source: &str) -> Option<f64> {
        self.accuracy.get(label)?.get(source).copied()
    }

    pub fn to_json(&self) -> EvalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Accuracy of every trained classifier on `representations`.
///
/// # Errors
///
/// `EvalError::MissingClassifier` if a (label, source) pair present in the
/// test data has no trained classifier.
pub fn test_subset_classifiers(
    classifiers: &SubsetClassifiers,
    representations: &Representations,
    labels: &LabelTable,
) -> EvalResult<RepresentationAccuracy> {
    check_rows(representations, labels)?;

    let mut accuracy = BTreeMap::new();
    for (label, targets) in labels.iter() {
        let trained = classifiers.get(label).ok_or_else(|| EvalError::MissingClassifier {
            label: label.clone(),
            source_label: "*".to_string(),
        })?;
        let mut per_source = BTreeMap::new();
        for (source, rep) in representations.iter() {
            let clf = trained.get(source).ok_or_else(|| EvalError::MissingClassifier {
                label: label.clone(),
                source_label: source.to_string(),
            })?;
            per_source.insert(source.to_string(), clf.accuracy(rep, targets)?);
        }
        accuracy.insert(label.clone(), per_source);
    }

    info!(results = ?accuracy, "Latent representation accuracy");
    Ok(RepresentationAccuracy { accuracy })
}

fn check_rows(representations: &Representations, labels: &LabelTable) -> EvalResult<()> {
    if representations.num_rows != labels.len() {
        return Err(EvalError::invalid_input(format!(
            "{} representation rows but {} label rows",
            representations.num_rows,
            labels.len()
        )));
    }
    Ok(())
}

fn index_tensor(indices: &[usize], device: &Device) -> EvalResult<Tensor> {
    let data: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(data, indices.len(), device)?)
}
