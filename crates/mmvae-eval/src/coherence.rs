//! Coherence of generated modalities.
//!
//! A generated sample is coherent when a classifier trained on real data of
//! the target modality predicts the label the conditioning data carries
//! (conditional generation), or when every modality generated from one prior
//! sample is assigned the same label (random generation).

use std::collections::BTreeMap;

use candle_core::Tensor;
use mmvae_core::{ModalityBatch, MultimodalVae, SubsetKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::{accuracy, LogisticRegression};
use crate::error::{EvalError, EvalResult};
use crate::labels::LabelTable;

/// Predicts one label from data of one modality.
pub trait ModalityClassifier: Send + Sync {
    /// Modality the classifier reads.
    fn modality(&self) -> &str;

    /// Label it predicts.
    fn label(&self) -> &str;

    /// Class per row of `data`.
    fn predict(&self, data: &Tensor) -> EvalResult<Vec<u32>>;
}

/// [`ModalityClassifier`] backed by a logistic regression on raw data.
#[derive(Debug, Clone)]
pub struct LinearModalityClassifier {
    modality: String,
    label: String,
    clf: LogisticRegression,
}

impl LinearModalityClassifier {
    /// Fit on `[n, d]` data of `modality` against binary `targets`.
    pub fn fit(
        modality: impl Into<String>,
        label: impl Into<String>,
        data: &Tensor,
        targets: &[u32],
        epochs: usize,
        learning_rate: f64,
    ) -> EvalResult<Self> {
        Ok(Self {
            modality: modality.into(),
            label: label.into(),
            clf: LogisticRegression::fit(data, targets, epochs, learning_rate)?,
        })
    }
}

impl ModalityClassifier for LinearModalityClassifier {
    fn modality(&self) -> &str {
        &self.modality
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn predict(&self, data: &Tensor) -> EvalResult<Vec<u32>> {
        self.clf.predict(data)
    }
}

/// Conditional coherence per label, then conditioning subset, then target modality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalCoherence {
    pub coherence: BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>,
}

impl ConditionalCoherence {
    pub fn get(&self, label: &str, subset: &str, target: &str) -> Option<f64> {
        self.coherence.get(label)?.get(subset)?.get(target).copied()
    }

    /// Mean over target modalities for one (label, subset).
    pub fn subset_mean(&self, label: &str, subset: &str) -> Option<f64> {
        let targets = self.coherence.get(label)?.get(subset)?;
        if targets.is_empty() {
            return None;
        }
        Some(targets.values().sum::<f64>() / targets.len() as f64)
    }

    pub fn to_json(&self) -> EvalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Random-generation coherence per label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomCoherence {
    pub coherence: BTreeMap<String, f64>,
}

impl RandomCoherence {
    pub fn to_json(&self) -> EvalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Generate every modality from each subset covered by `batch` and score the
/// generated targets against `labels`.
///
/// # Errors
///
/// `EvalError::InvalidInput` if a classifier reads an unregistered modality or
/// predicts a label missing from `labels`; engine errors propagate unchanged.
pub fn conditional_coherence<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    batch: &ModalityBatch,
    labels: &LabelTable,
    classifiers: &[&dyn ModalityClassifier],
    rng: &mut R,
) -> EvalResult<ConditionalCoherence> {
    check_classifiers(vae, classifiers)?;
    if batch.batch_size()? != labels.len() {
        return Err(EvalError::invalid_input(format!(
            "{} batch rows but {} label rows",
            batch.batch_size()?,
            labels.len()
        )));
    }

    let present = batch.present();
    let keys: Vec<SubsetKey> = vae
        .subsets()
        .covered_by(&present)
        .map(|s| s.key().clone())
        .collect();

    let mut coherence: BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>> = BTreeMap::new();
    for key in &keys {
        let generated = vae.conditional_generation(batch, key, rng)?;
        for clf in classifiers {
            let rec = generated
                .get(clf.modality())
                .ok_or_else(|| EvalError::invalid_input(format!("no generation for '{}'", clf.modality())))?;
            let predictions = clf.predict(&rec.mean()?)?;
            let acc = accuracy(&predictions, labels.require(clf.label())?)?;
            coherence
                .entry(clf.label().to_string())
                .or_default()
                .entry(key.to_string())
                .or_default()
                .insert(clf.modality().to_string(), acc);
        }
    }

    info!(num_subsets = keys.len(), num_classifiers = classifiers.len(), "Computed conditional coherence");
    Ok(ConditionalCoherence { coherence })
}

/// Generate `num_samples` prior samples and, per label, report the fraction
/// of samples on which every classifier of that label agrees.
///
/// # Errors
///
/// `EvalError::InvalidInput` if a classifier returns a prediction count other
/// than `num_samples`.
pub fn random_coherence<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    num_samples: usize,
    classifiers: &[&dyn ModalityClassifier],
    rng: &mut R,
) -> EvalResult<RandomCoherence> {
    check_classifiers(vae, classifiers)?;
    if num_samples == 0 {
        return Err(EvalError::invalid_input("num_samples must be > 0"));
    }

    let generated = vae.random_generation(num_samples, rng)?;
    let mut predictions: BTreeMap<&str, Vec<Vec<u32>>> = BTreeMap::new();
    for clf in classifiers {
        let rec = generated
            .get(clf.modality())
            .ok_or_else(|| EvalError::invalid_input(format!("no generation for '{}'", clf.modality())))?;
        let predicted = clf.predict(&rec.mean()?)?;
        if predicted.len() != num_samples {
            return Err(EvalError::invalid_input(format!(
                "classifier for '{}' returned {} predictions for {} samples",
                clf.modality(),
                predicted.len(),
                num_samples
            )));
        }
        predictions.entry(clf.label()).or_default().push(predicted);
    }

    let coherence = predictions
        .into_iter()
        .map(|(label, per_modality)| {
            let agreeing = (0..num_samples)
                .filter(|&row| per_modality.iter().all(|p| p[row] == per_modality[0][row]))
                .count();
            (label.to_string(), agreeing as f64 / num_samples as f64)
        })
        .collect::<BTreeMap<_, _>>();

    info!(num_samples, results = ?coherence, "Computed random coherence");
    Ok(RandomCoherence { coherence })
}

fn check_classifiers(vae: &MultimodalVae, classifiers: &[&dyn ModalityClassifier]) -> EvalResult<()> {
    if classifiers.is_empty() {
        return Err(EvalError::invalid_input("at least one modality classifier is required"));
    }
    for clf in classifiers {
        vae.adapter(clf.modality())?;
    }
    Ok(())
}
