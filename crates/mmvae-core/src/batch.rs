//! Multimodal input batches.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::Tensor;

use crate::error::{FusionError, FusionResult};

/// Raw data per modality for one step. Modalities may be missing.
#[derive(Debug, Clone, Default)]
pub struct ModalityBatch {
    data: BTreeMap<String, Tensor>,
}

impl ModalityBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, modality: impl Into<String>, data: Tensor) -> Self {
        self.insert(modality, data);
        self
    }

    pub fn insert(&mut self, modality: impl Into<String>, data: Tensor) {
        self.data.insert(modality.into(), data);
    }

    pub fn get(&self, modality: &str) -> Option<&Tensor> {
        self.data.get(modality)
    }

    /// Look up a modality, failing with `MissingModality`.
    pub fn require(&self, modality: &str) -> FusionResult<&Tensor> {
        self.get(modality)
            .ok_or_else(|| FusionError::MissingModality(modality.to_string()))
    }

    pub fn contains(&self, modality: &str) -> bool {
        self.data.contains_key(modality)
    }

    pub fn present(&self) -> BTreeSet<String> {
        self.data.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.data.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Common leading dimension of every tensor.
    ///
    /// # Errors
    ///
    /// - `FusionError::EmptyBatch` if no modality is present
    /// - `FusionError::DimensionMismatch` if modalities disagree on batch size
    pub fn batch_size(&self) -> FusionResult<usize> {
        let mut sizes = self.data.iter().map(|(name, t)| (name, t.dims().first().copied().unwrap_or(0)));
        let (_, first) = sizes.next().ok_or(FusionError::EmptyBatch)?;
        for (name, size) in sizes {
            if size != first {
                return Err(FusionError::dimension_mismatch(
                    format!("batch size of modality '{}'", name),
                    first,
                    size,
                ));
            }
        }
        if first == 0 {
            return Err(FusionError::EmptyBatch);
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_batch_size_agreement() {
        let device = Device::Cpu;
        let batch = ModalityBatch::new()
            .with("a", Tensor::zeros((4, 3), DType::F32, &device).unwrap())
            .with("b", Tensor::zeros((4, 7), DType::F32, &device).unwrap());
        assert_eq!(batch.batch_size().unwrap(), 4);

        let bad = batch.with("c", Tensor::zeros((5, 2), DType::F32, &device).unwrap());
        assert!(matches!(bad.batch_size(), Err(FusionError::DimensionMismatch { .. })));
        assert!(matches!(ModalityBatch::new().batch_size(), Err(FusionError::EmptyBatch)));
    }

    #[test]
    fn test_require_missing_modality() {
        let batch = ModalityBatch::new();
        assert!(matches!(batch.require("img"), Err(FusionError::MissingModality(ref m)) if m == "img"));
    }
}
