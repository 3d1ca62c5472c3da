//! Train and evaluation step drivers.
//!
//! One step is: forward pass, ELBO decomposition, and (training only) exactly
//! one optimizer update after the whole loss graph is built. A failed step
//! leaves the parameters untouched.

use candle_nn::Optimizer;
use rand::Rng;
use tracing::{debug, info};

use crate::batch::ModalityBatch;
use crate::engine::MultimodalVae;
use crate::error::FusionResult;
use crate::loss::{BatchResults, ElboDecomposer};
use crate::metrics::{EpochMeters, EpochSummary};

/// Forward, loss, one optimizer step.
pub fn train_step<O: Optimizer, R: Rng + ?Sized>(
    vae: &MultimodalVae,
    decomposer: &ElboDecomposer,
    optimizer: &mut O,
    batch: &ModalityBatch,
    epoch: usize,
    rng: &mut R,
) -> FusionResult<BatchResults> {
    let forward = vae.forward(batch, rng)?;
    let results = decomposer.compute(forward, batch, epoch)?;
    optimizer.backward_step(&results.total_loss)?;
    Ok(results)
}

/// Forward and loss without a parameter update.
pub fn eval_step<R: Rng + ?Sized>(
    vae: &MultimodalVae,
    decomposer: &ElboDecomposer,
    batch: &ModalityBatch,
    epoch: usize,
    rng: &mut R,
) -> FusionResult<BatchResults> {
    let forward = vae.forward(batch, rng)?;
    decomposer.compute(forward, batch, epoch)
}

/// Run every batch of one epoch and aggregate the meters.
///
/// With an optimizer each batch is a training step, otherwise an evaluation
/// step. The first error aborts the epoch.
pub fn run_epoch<'a, O, R, I>(
    vae: &MultimodalVae,
    decomposer: &ElboDecomposer,
    mut optimizer: Option<&mut O>,
    batches: I,
    epoch: usize,
    rng: &mut R,
) -> FusionResult<EpochSummary>
where
    O: Optimizer,
    R: Rng + ?Sized,
    I: IntoIterator<Item = &'a ModalityBatch>,
{
    let mut meters = EpochMeters::new();
    let training = optimizer.is_some();

    for (step, batch) in batches.into_iter().enumerate() {
        let results = match optimizer.as_deref_mut() {
            Some(opt) => train_step(vae, decomposer, opt, batch, epoch, rng)?,
            None => eval_step(vae, decomposer, batch, epoch, rng)?,
        };
        let summary = results.summary()?;
        debug!(epoch, step, total_loss = summary.total_loss, "Step complete");
        meters.update(&summary, batch.batch_size()?);
    }

    let summary = meters.summary(epoch);
    info!(
        epoch,
        training,
        method = %decomposer.method(),
        beta = summary.beta,
        num_batches = summary.num_batches,
        total_loss = summary.total_loss,
        joint_divergence = summary.joint_divergence,
        "Epoch complete"
    );
    Ok(summary)
}
