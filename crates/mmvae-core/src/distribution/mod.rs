//! Diagonal Gaussian distributions and the fusion operators over them.
//!
//! # Components
//!
//! - [`Distr`]: mean and log-variance tensors of shape `[batch, latent_dim]`
//! - [`experts`]: product-of-experts, weighted product and per-row mixture
//!   selection
//!
//! # Randomness
//!
//! Every sampling routine takes the caller's RNG. Nothing here seeds or
//! reseeds a generator; reproducibility comes from seeding the RNG once per run.

pub mod experts;

pub use experts::{
    mixture_component_selection, mixture_with_assignment, product_of_experts,
    sample_row_assignment, select_rows, uniform_weights, weighted_product,
};

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{FusionError, FusionResult};

/// `ln(2π)`.
pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Diagonal-covariance Gaussian over a batch of latent vectors.
#[derive(Debug, Clone)]
pub struct Distr {
    mu: Tensor,
    logvar: Tensor,
}

impl Distr {
    /// Create a distribution from mean and log-variance.
    ///
    /// # Errors
    ///
    /// `FusionError::ShapeMismatch` unless both are rank 2 with equal shapes.
    pub fn new(mu: Tensor, logvar: Tensor) -> FusionResult<Self> {
        if mu.rank() != 2 {
            return Err(FusionError::shape_mismatch(
                "distribution mean must be [batch, latent_dim]",
                &[0, 0],
                mu.dims(),
            ));
        }
        if mu.dims() != logvar.dims() {
            return Err(FusionError::shape_mismatch(
                "distribution log-variance",
                mu.dims(),
                logvar.dims(),
            ));
        }
        Ok(Self { mu, logvar })
    }

    /// `N(0, I)` for `batch_size` rows.
    pub fn standard_normal(batch_size: usize, latent_dim: usize, device: &Device) -> FusionResult<Self> {
        let mu = Tensor::zeros((batch_size, latent_dim), DType::F32, device)?;
        let logvar = Tensor::zeros((batch_size, latent_dim), DType::F32, device)?;
        Ok(Self { mu, logvar })
    }

    pub fn mu(&self) -> &Tensor {
        &self.mu
    }

    pub fn logvar(&self) -> &Tensor {
        &self.logvar
    }

    pub fn batch_size(&self) -> usize {
        self.mu.dims()[0]
    }

    pub fn latent_dim(&self) -> usize {
        self.mu.dims()[1]
    }

    pub fn device(&self) -> &Device {
        self.mu.device()
    }

    /// Draw `z = μ + ε·exp(0.5·logσ²)` with `ε ~ N(0, I)` from `rng`.
    ///
    /// Gradients flow into `mu` and `logvar`; `ε` enters as a constant.
    pub fn reparameterize<R: Rng + ?Sized>(&self, rng: &mut R) -> FusionResult<Tensor> {
        let eps = standard_normal_noise(self.mu.dims(), self.device(), rng)?;
        let std = self.logvar.affine(0.5, 0.0)?.exp()?;
        Ok(eps.mul(&std)?.add(&self.mu)?)
    }

    /// Analytic `KL(N(μ, σ²) ‖ N(0, I))`.
    ///
    /// Summed over latent dimensions and batch rows, then divided by
    /// `norm_value`; with `norm_value == batch_size` this is the batch mean.
    /// Returns a rank-0 tensor.
    pub fn kl_divergence(&self, norm_value: f64) -> FusionResult<Tensor> {
        // -0.5 * Σ (1 + logvar - mu² - exp(logvar))
        let inner = self
            .logvar
            .affine(1.0, 1.0)?
            .sub(&self.mu.sqr()?)?
            .sub(&self.logvar.exp()?)?;
        Ok(inner.sum_all()?.affine(-0.5 / norm_value, 0.0)?)
    }

    /// Analytic `KL(self ‖ other)` between two diagonal Gaussians.
    ///
    /// Same normalization as [`Distr::kl_divergence`].
    pub fn kl_divergence_from(&self, other: &Distr, norm_value: f64) -> FusionResult<Tensor> {
        if self.mu.dims() != other.mu.dims() {
            return Err(FusionError::shape_mismatch(
                "kl divergence operands",
                self.mu.dims(),
                other.mu.dims(),
            ));
        }
        // 0.5 * Σ (logvar_p - logvar_q + (σ_q² + (μ_q - μ_p)²) / σ_p² - 1)
        let var_q = self.logvar.exp()?;
        let var_p = other.logvar.exp()?;
        let mean_sq = self.mu.sub(&other.mu)?.sqr()?;
        let ratio = var_q.add(&mean_sq)?.div(&var_p)?;
        let inner = other
            .logvar
            .sub(&self.logvar)?
            .add(&ratio)?
            .affine(1.0, -1.0)?;
        Ok(inner.sum_all()?.affine(0.5 / norm_value, 0.0)?)
    }

    /// `log N(z; μ, σ²)` per batch row, shape `[batch]`.
    pub fn log_density(&self, z: &Tensor) -> FusionResult<Tensor> {
        if z.dims() != self.mu.dims() {
            return Err(FusionError::shape_mismatch("log density sample", self.mu.dims(), z.dims()));
        }
        let sq = z.sub(&self.mu)?.sqr()?.div(&self.logvar.exp()?)?;
        let inner = sq.add(&self.logvar)?.affine(1.0, LN_2PI)?;
        Ok(inner.sum(1)?.affine(-0.5, 0.0)?)
    }

    /// Batch-mean of μ and of logσ², for logging.
    pub fn mean_stats(&self) -> FusionResult<(f32, f32)> {
        let mu = self.mu.mean_all()?.to_scalar::<f32>()?;
        let logvar = self.logvar.mean_all()?.to_scalar::<f32>()?;
        Ok((mu, logvar))
    }

    /// Check that every parameter is finite.
    pub fn is_finite(&self) -> FusionResult<bool> {
        Ok(all_finite(&self.mu)? && all_finite(&self.logvar)?)
    }
}

/// `log N(z; 0, I)` per batch row, shape `[batch]`.
pub fn standard_normal_log_density(z: &Tensor) -> FusionResult<Tensor> {
    let inner = z.sqr()?.affine(1.0, LN_2PI)?;
    Ok(inner.sum(1)?.affine(-0.5, 0.0)?)
}

/// `ε ~ N(0, I)` of the given shape, drawn from `rng`.
pub fn standard_normal_noise<R: Rng + ?Sized>(
    dims: &[usize],
    device: &Device,
    rng: &mut R,
) -> FusionResult<Tensor> {
    let count: usize = dims.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

pub(crate) fn all_finite(t: &Tensor) -> FusionResult<bool> {
    let values = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_kl_of_standard_normal_is_zero() {
        for batch in [1, 4, 33] {
            let d = Distr::standard_normal(batch, 8, &Device::Cpu).unwrap();
            let kl = scalar(&d.kl_divergence(batch as f64).unwrap());
            assert!(kl.abs() < 1e-6, "KL(N(0,I)||N(0,I)) should be 0, got {}", kl);
        }
    }

    #[test]
    fn test_kl_known_value() {
        // mu = 1, logvar = 0 in one dim: KL = 0.5 * mu² = 0.5
        let d = distr(&[1.0, 1.0], &[0.0, 0.0], 2);
        let kl = scalar(&d.kl_divergence(2.0).unwrap());
        assert!((kl - 0.5).abs() < 1e-6, "expected 0.5, got {}", kl);
    }

    #[test]
    fn test_kl_from_matches_standard_prior() {
        let d = distr(&[0.3, -1.2, 0.7, 0.1], &[0.2, -0.5, 0.0, 1.0], 2);
        let prior = Distr::standard_normal(2, 2, &Device::Cpu).unwrap();
        let a = scalar(&d.kl_divergence(2.0).unwrap());
        let b = scalar(&d.kl_divergence_from(&prior, 2.0).unwrap());
        assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
    }

    #[test]
    fn test_reparameterize_shape_and_rng_progression() {
        let d = Distr::standard_normal(4, 8, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let z1 = d.reparameterize(&mut rng).unwrap();
        let z2 = d.reparameterize(&mut rng).unwrap();
        assert_eq!(z1.dims(), &[4, 8]);

        let v1 = z1.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let v2 = z2.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(v1, v2, "successive draws must not repeat the same noise");

        let mut rng_again = StdRng::seed_from_u64(7);
        let z1_again = d.reparameterize(&mut rng_again).unwrap();
        assert_eq!(v1, z1_again.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_reparameterize_zero_variance_returns_mean() {
        let d = distr(&[2.0, -3.0], &[-60.0, -60.0], 1);
        let mut rng = StdRng::seed_from_u64(1);
        let z = d.reparameterize(&mut rng).unwrap().to_vec2::<f32>().unwrap();
        assert!((z[0][0] - 2.0).abs() < 1e-6);
        assert!((z[0][1] + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_log_density_standard_normal_at_zero() {
        let z = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let lp = standard_normal_log_density(&z).unwrap().to_vec1::<f32>().unwrap();
        let expected = -(LN_2PI as f32);
        for v in lp {
            assert!((v - expected).abs() < 1e-5);
        }

        let d = Distr::standard_normal(3, 2, &Device::Cpu).unwrap();
        let lq = d.log_density(&z).unwrap().to_vec1::<f32>().unwrap();
        assert!((lq[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_new_rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let mu = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let logvar = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            Distr::new(mu, logvar),
            Err(FusionError::ShapeMismatch { .. })
        ));
    }
}
