//! Deterministic toy modality adapters and synthetic batches for tests.
//!
//! Everything here is seeded: the same seed always produces the same adapter
//! weights and the same data.

pub mod adapters;
pub mod data;

pub use adapters::{ConstantAdapter, FailingAdapter, LinearGaussianAdapter};
pub use data::{gaussian_data, labeled_dataset, one_hot, synthetic_batch, LabeledDataset};
