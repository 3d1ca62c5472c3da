//! Fusion operators over per-modality Gaussian experts.
//!
//! # Operators
//!
//! - [`product_of_experts`]: precision-weighted product with an implicit
//!   `N(0, I)` expert, so a single modality still yields a proper product.
//! - [`weighted_product`]: the same product without the implicit prior, each
//!   expert's precision scaled by its weight. Used for the dynamic prior.
//! - [`mixture_component_selection`]: one expert per batch row, drawn with the
//!   caller's RNG according to the mixture weights.
//!
//! All operators fail fast with `DimensionMismatch` when experts disagree on
//! shape.

use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::Distr;
use crate::error::{FusionError, FusionResult};

/// Added to every variance before inversion.
pub const VARIANCE_EPS: f64 = 1e-8;

/// Product of experts with an implicit unit-variance prior expert.
///
/// `1/σ²* = 1 + Σ wᵢ/σᵢ²` and `μ* = σ²* · Σ wᵢ μᵢ/σᵢ²`. `weights` defaults to
/// all ones. The result does not depend on the order of `experts`.
///
/// # Errors
///
/// - `FusionError::EmptyExperts` if `experts` is empty
/// - `FusionError::DimensionMismatch` if shapes differ or `weights` has the
///   wrong length
pub fn product_of_experts(experts: &[&Distr], weights: Option<&[f64]>) -> FusionResult<Distr> {
    let weights = resolve_weights(experts, weights)?;
    precision_product(experts, &weights, true)
}

/// Product of experts without the implicit prior.
///
/// Callers that want a prior expert include it in `experts` with its own
/// weight.
pub fn weighted_product(experts: &[&Distr], weights: &[f64]) -> FusionResult<Distr> {
    let weights = resolve_weights(experts, Some(weights))?;
    precision_product(experts, &weights, false)
}

fn precision_product(experts: &[&Distr], weights: &[f64], with_prior: bool) -> FusionResult<Distr> {
    let first = experts[0];
    let mut precision_sum: Option<Tensor> = None;
    let mut weighted_mu_sum: Option<Tensor> = None;

    for (expert, &w) in experts.iter().zip(weights) {
        let precision = expert
            .logvar()
            .exp()?
            .affine(1.0, VARIANCE_EPS)?
            .recip()?
            .affine(w, 0.0)?;
        let weighted_mu = expert.mu().mul(&precision)?;

        precision_sum = Some(match precision_sum {
            Some(acc) => acc.add(&precision)?,
            None => precision,
        });
        weighted_mu_sum = Some(match weighted_mu_sum {
            Some(acc) => acc.add(&weighted_mu)?,
            None => weighted_mu,
        });
    }

    // resolve_weights guarantees at least one expert
    let (Some(mut precision_sum), Some(weighted_mu_sum)) = (precision_sum, weighted_mu_sum) else {
        return Err(FusionError::EmptyExperts);
    };
    if with_prior {
        // Prior expert: mean 0, precision 1.
        precision_sum = precision_sum.affine(1.0, 1.0)?;
    }

    let mu = weighted_mu_sum.div(&precision_sum)?;
    let logvar = precision_sum.log()?.neg()?;
    debug_assert_eq!(mu.dims(), first.mu().dims());
    Distr::new(mu, logvar)
}

fn resolve_weights(experts: &[&Distr], weights: Option<&[f64]>) -> FusionResult<Vec<f64>> {
    let first = experts.first().ok_or(FusionError::EmptyExperts)?;
    for (i, expert) in experts.iter().enumerate().skip(1) {
        if expert.latent_dim() != first.latent_dim() {
            return Err(FusionError::dimension_mismatch(
                format!("expert {} latent_dim", i),
                first.latent_dim(),
                expert.latent_dim(),
            ));
        }
        if expert.batch_size() != first.batch_size() {
            return Err(FusionError::dimension_mismatch(
                format!("expert {} batch size", i),
                first.batch_size(),
                expert.batch_size(),
            ));
        }
    }
    match weights {
        None => Ok(vec![1.0; experts.len()]),
        Some(w) if w.len() != experts.len() => Err(FusionError::dimension_mismatch(
            "expert weights",
            experts.len(),
            w.len(),
        )),
        Some(w) => {
            if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
                return Err(FusionError::config(format!(
                    "expert weights must be finite and non-negative, got {:?}",
                    w
                )));
            }
            Ok(w.to_vec())
        }
    }
}

/// Draw one expert index per batch row according to `weights`.
///
/// `weights` defaults to uniform over `num_experts`.
pub fn sample_row_assignment<R: Rng + ?Sized>(
    num_experts: usize,
    batch_size: usize,
    weights: Option<&[f64]>,
    rng: &mut R,
) -> FusionResult<Vec<usize>> {
    if num_experts == 0 {
        return Err(FusionError::EmptyExperts);
    }
    let uniform;
    let weights = match weights {
        Some(w) if w.len() != num_experts => {
            return Err(FusionError::dimension_mismatch("mixture weights", num_experts, w.len()))
        }
        Some(w) => w,
        None => {
            uniform = vec![1.0; num_experts];
            &uniform
        }
    };
    let dist = WeightedIndex::new(weights).map_err(|e| {
        FusionError::config(format!("invalid mixture weights {:?}: {}", weights, e))
    })?;
    Ok((0..batch_size).map(|_| dist.sample(rng)).collect())
}

/// Gather rows: row `i` of the output is row `i` of `tensors[assignment[i]]`.
///
/// Works for any tensor whose first dimension is the batch. Built from
/// one-hot row masks so gradients reach every selected expert.
pub fn select_rows(tensors: &[&Tensor], assignment: &[usize]) -> FusionResult<Tensor> {
    let first = tensors.first().ok_or(FusionError::EmptyExperts)?;
    let batch_size = first.dims()[0];
    if assignment.len() != batch_size {
        return Err(FusionError::dimension_mismatch(
            "row assignment length",
            batch_size,
            assignment.len(),
        ));
    }
    if let Some(&bad) = assignment.iter().find(|&&k| k >= tensors.len()) {
        return Err(FusionError::dimension_mismatch(
            "row assignment expert index",
            tensors.len() - 1,
            bad,
        ));
    }

    // Mask shape [batch, 1, 1, ...] broadcasts over the trailing dims.
    let mut mask_dims = vec![batch_size];
    mask_dims.extend(std::iter::repeat(1).take(first.rank().saturating_sub(1)));

    let mut out: Option<Tensor> = None;
    for (k, tensor) in tensors.iter().enumerate() {
        if tensor.dims() != first.dims() {
            return Err(FusionError::shape_mismatch("mixture expert", first.dims(), tensor.dims()));
        }
        let mask: Vec<f32> = assignment
            .iter()
            .map(|&a| if a == k { 1.0 } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, mask_dims.as_slice(), tensor.device())?
            .to_dtype(tensor.dtype())?;
        let part = tensor.broadcast_mul(&mask)?;
        out = Some(match out {
            Some(acc) => acc.add(&part)?,
            None => part,
        });
    }
    out.ok_or(FusionError::EmptyExperts)
}

/// Mixture of experts by per-row component selection.
///
/// Each batch row takes the mean and log-variance of one expert drawn from
/// `weights` (uniform by default), so the result is again a diagonal
/// Gaussian per row.
pub fn mixture_component_selection<R: Rng + ?Sized>(
    experts: &[&Distr],
    weights: Option<&[f64]>,
    rng: &mut R,
) -> FusionResult<Distr> {
    let weights = resolve_weights(experts, weights)?;
    let assignment = sample_row_assignment(experts.len(), experts[0].batch_size(), Some(&weights), rng)?;
    mixture_with_assignment(experts, &assignment)
}

/// Mixture selection with a precomputed row assignment.
pub fn mixture_with_assignment(experts: &[&Distr], assignment: &[usize]) -> FusionResult<Distr> {
    let mus: Vec<&Tensor> = experts.iter().map(|e| e.mu()).collect();
    let logvars: Vec<&Tensor> = experts.iter().map(|e| e.logvar()).collect();
    Distr::new(select_rows(&mus, assignment)?, select_rows(&logvars, assignment)?)
}

/// Uniform weights `1/n` as `f64`.
pub fn uniform_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn distr(mu: &[f32], logvar: &[f32], rows: usize) -> Distr {
        let dim = mu.len() / rows;
        let device = Device::Cpu;
        Distr::new(
            Tensor::from_slice(mu, (rows, dim), &device).unwrap(),
            Tensor::from_slice(logvar, (rows, dim), &device).unwrap(),
        )
        .unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_poe_is_order_invariant() {
        let d1 = distr(&[0.5, -1.0, 2.0, 0.0], &[0.1, -0.3, 0.7, 1.2], 2);
        let d2 = distr(&[-0.2, 0.4, 1.0, -3.0], &[-1.0, 0.5, 0.0, -0.2], 2);
        let a = product_of_experts(&[&d1, &d2], None).unwrap();
        let b = product_of_experts(&[&d2, &d1], None).unwrap();
        assert_close(&flat(a.mu()), &flat(b.mu()), 1e-6);
        assert_close(&flat(a.logvar()), &flat(b.logvar()), 1e-6);
    }

    #[test]
    fn test_poe_single_expert_shrinks_variance() {
        let d = distr(&[1.0, -2.0, 0.0], &[0.5, -1.0, 3.0], 1);
        let fused = product_of_experts(&[&d], None).unwrap();
        for (before, after) in flat(d.logvar()).iter().zip(flat(fused.logvar())) {
            assert!(after < *before, "variance must shrink: {} -> {}", before, after);
        }
    }

    #[test]
    fn test_poe_of_two_unit_experts() {
        // Two N(μ, 1) experts plus the N(0, 1) prior: precision 3, mean 2μ/3.
        let d = distr(&[3.0], &[0.0], 1);
        let fused = product_of_experts(&[&d, &d], None).unwrap();
        assert_close(&flat(fused.mu()), &[2.0], 1e-5);
        assert_close(&flat(fused.logvar()), &[-(3.0f32).ln()], 1e-5);
    }

    #[test]
    fn test_poe_stable_for_tiny_variance() {
        let d = distr(&[1.0], &[-80.0], 1);
        let fused = product_of_experts(&[&d], None).unwrap();
        assert!(fused.is_finite().unwrap());
        assert_close(&flat(fused.mu()), &[1.0], 1e-4);
    }

    #[test]
    fn test_poe_dimension_mismatch_fails_fast() {
        let d1 = distr(&[0.0, 0.0], &[0.0, 0.0], 1);
        let d2 = distr(&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0], 1);
        let err = product_of_experts(&[&d1, &d2], None).unwrap_err();
        assert!(matches!(err, FusionError::DimensionMismatch { expected: 2, actual: 3, .. }));
        assert!(matches!(product_of_experts(&[], None), Err(FusionError::EmptyExperts)));
    }

    #[test]
    fn test_weighted_product_without_prior_of_one_expert_is_identity() {
        let d = distr(&[0.3, -0.7], &[0.2, -0.4], 1);
        let fused = weighted_product(&[&d], &[1.0]).unwrap();
        assert_close(&flat(fused.mu()), &flat(d.mu()), 1e-5);
        assert_close(&flat(fused.logvar()), &flat(d.logvar()), 1e-5);
    }

    #[test]
    fn test_mixture_rows_come_from_experts() {
        let a = distr(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &[0.0; 6], 3);
        let b = distr(&[-1.0, -1.0, -1.0, -1.0, -1.0, -1.0], &[2.0; 6], 3);
        let mut rng = StdRng::seed_from_u64(3);
        let mixed = mixture_component_selection(&[&a, &b], None, &mut rng).unwrap();

        let mu = mixed.mu().to_vec2::<f32>().unwrap();
        let logvar = mixed.logvar().to_vec2::<f32>().unwrap();
        for (row_mu, row_lv) in mu.iter().zip(&logvar) {
            let from_a = row_mu.iter().all(|&v| v == 1.0) && row_lv.iter().all(|&v| v == 0.0);
            let from_b = row_mu.iter().all(|&v| v == -1.0) && row_lv.iter().all(|&v| v == 2.0);
            assert!(from_a || from_b, "row must be copied from one expert: {:?}", row_mu);
        }
    }

    #[test]
    fn test_mixture_respects_zero_weight() {
        let a = distr(&[1.0; 8], &[0.0; 8], 8);
        let b = distr(&[-1.0; 8], &[0.0; 8], 8);
        let mut rng = StdRng::seed_from_u64(11);
        let mixed = mixture_component_selection(&[&a, &b], Some(&[0.0, 1.0]), &mut rng).unwrap();
        assert!(flat(mixed.mu()).iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_select_rows_on_rank_one() {
        let device = Device::Cpu;
        let x = Tensor::from_slice(&[1.0f32, 2.0, 3.0], 3, &device).unwrap();
        let y = Tensor::from_slice(&[10.0f32, 20.0, 30.0], 3, &device).unwrap();
        let out = select_rows(&[&x, &y], &[1, 0, 1]).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![10.0, 2.0, 30.0]);
        assert!(select_rows(&[&x, &y], &[0, 2, 1]).is_err());
    }

    #[test]
    fn test_uniform_weights() {
        assert_eq!(uniform_weights(4), vec![0.25; 4]);
        assert!(uniform_weights(0).is_empty());
    }
}
