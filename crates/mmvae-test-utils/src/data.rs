//! Synthetic multimodal data.

use candle_core::{Device, Tensor};
use mmvae_core::ModalityBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// `[rows, dim]` standard normal data.
pub fn gaussian_data(rows: usize, dim: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * dim).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(data, (rows, dim), &Device::Cpu).expect("gaussian data tensor")
}

/// Standard normal batch with one `[batch_size, dim]` tensor per `(name, dim)`.
pub fn synthetic_batch(modalities: &[(&str, usize)], batch_size: usize, seed: u64) -> ModalityBatch {
    modalities
        .iter()
        .enumerate()
        .fold(ModalityBatch::new(), |batch, (i, (name, dim))| {
            batch.with(*name, gaussian_data(batch_size, *dim, seed.wrapping_add(i as u64)))
        })
}

/// `[labels.len(), num_classes]` one-hot rows.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Tensor {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        data[row * num_classes + label] = 1.0;
    }
    Tensor::from_vec(data, (labels.len(), num_classes), &Device::Cpu).expect("one-hot tensor")
}

/// Modalities generated from a shared binary label.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    pub batch: ModalityBatch,
    /// `[n]` labels in {0, 1}, as f32.
    pub labels: Tensor,
    pub label_values: Vec<u32>,
}

/// Every modality is `±shift` in every coordinate, depending on the label,
/// plus unit Gaussian noise. Labels are drawn uniformly from {0, 1}.
pub fn labeled_dataset(modalities: &[(&str, usize)], rows: usize, shift: f32, seed: u64) -> LabeledDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let label_values: Vec<u32> = (0..rows).map(|_| rng.gen_range(0..2)).collect();

    let mut batch = ModalityBatch::new();
    for (name, dim) in modalities {
        let data: Vec<f32> = label_values
            .iter()
            .flat_map(|&label| {
                let sign = if label == 1 { shift } else { -shift };
                (0..*dim)
                    .map(|_| sign + rng.sample::<f32, _>(StandardNormal))
                    .collect::<Vec<_>>()
            })
            .collect();
        batch.insert(
            *name,
            Tensor::from_vec(data, (rows, *dim), &Device::Cpu).expect("modality tensor"),
        );
    }

    let labels = Tensor::from_vec(
        label_values.iter().map(|&l| l as f32).collect::<Vec<_>>(),
        rows,
        &Device::Cpu,
    )
    .expect("label tensor");

    LabeledDataset {
        batch,
        labels,
        label_values,
    }
}
