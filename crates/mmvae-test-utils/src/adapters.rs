//! Toy modality adapters.

use candle_core::{DType, Device, Tensor, Var};
use mmvae_core::distribution::Distr;
use mmvae_core::{EncMod, FusionError, FusionResult, Likelihood, ModalityAdapter, Reconstruction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// One affine map `x @ W + b`.
struct Linear {
    w: Var,
    b: Var,
}

impl Linear {
    fn new(rng: &mut StdRng, input: usize, output: usize, device: &Device) -> Self {
        let std = 1.0 / (input.max(1) as f64).sqrt();
        let data: Vec<f32> = (0..input * output)
            .map(|_| (rng.sample::<f64, _>(StandardNormal) * std) as f32)
            .collect();
        let w = Var::from_tensor(
            &Tensor::from_vec(data, (input, output), device).expect("weight tensor"),
        )
        .expect("weight var");
        let b = Var::zeros(output, DType::F32, device).expect("bias var");
        Self { w, b }
    }

    fn forward(&self, x: &Tensor) -> FusionResult<Tensor> {
        Ok(x.matmul(self.w.as_tensor())?.broadcast_add(self.b.as_tensor())?)
    }

    fn vars(&self) -> [Var; 2] {
        [self.w.clone(), self.b.clone()]
    }
}

/// Linear encoder/decoder pair with seeded trainable weights.
///
/// Log-variances go through `tanh` so they stay in `[-1, 1]`.
pub struct LinearGaussianAdapter {
    name: String,
    data_dim: usize,
    latent_dim: usize,
    style_dim: usize,
    likelihood: Likelihood,
    weight: f64,
    enc_mu: Linear,
    enc_logvar: Linear,
    style_heads: Option<(Linear, Linear)>,
    decoder: Linear,
}

impl LinearGaussianAdapter {
    pub fn new(name: &str, data_dim: usize, latent_dim: usize, seed: u64) -> Self {
        Self::build(name, data_dim, latent_dim, 0, Likelihood::Laplace { scale: 0.75 }, seed)
    }

    /// Adapter with a style head of width `style_dim`.
    pub fn with_style(name: &str, data_dim: usize, latent_dim: usize, style_dim: usize, seed: u64) -> Self {
        Self::build(name, data_dim, latent_dim, style_dim, Likelihood::Laplace { scale: 0.75 }, seed)
    }

    pub fn build(
        name: &str,
        data_dim: usize,
        latent_dim: usize,
        style_dim: usize,
        likelihood: Likelihood,
        seed: u64,
    ) -> Self {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(seed);
        let enc_mu = Linear::new(&mut rng, data_dim, latent_dim, &device);
        let enc_logvar = Linear::new(&mut rng, data_dim, latent_dim, &device);
        let style_heads = (style_dim > 0).then(|| {
            (
                Linear::new(&mut rng, data_dim, style_dim, &device),
                Linear::new(&mut rng, data_dim, style_dim, &device),
            )
        });
        let decoder = Linear::new(&mut rng, latent_dim + style_dim, data_dim, &device);
        Self {
            name: name.to_string(),
            data_dim,
            latent_dim,
            style_dim,
            likelihood,
            weight: 1.0,
            enc_mu,
            enc_logvar,
            style_heads,
            decoder,
        }
    }

    #[must_use]
    pub fn with_likelihood(mut self, likelihood: Likelihood) -> Self {
        self.likelihood = likelihood;
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    fn gaussian(mu: &Linear, logvar: &Linear, data: &Tensor) -> FusionResult<Distr> {
        Distr::new(mu.forward(data)?, logvar.forward(data)?.tanh()?)
    }
}

impl ModalityAdapter for LinearGaussianAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_dim(&self) -> usize {
        self.latent_dim
    }

    fn style_dim(&self) -> usize {
        self.style_dim
    }

    fn encode(&self, data: &Tensor) -> FusionResult<EncMod> {
        if data.rank() != 2 || data.dims()[1] != self.data_dim {
            return Err(FusionError::adapter(
                &self.name,
                format!("expected [batch, {}] input, got {:?}", self.data_dim, data.dims()),
            ));
        }
        let content = Self::gaussian(&self.enc_mu, &self.enc_logvar, data)?;
        match &self.style_heads {
            Some((mu, logvar)) => Ok(EncMod::with_style(content, Self::gaussian(mu, logvar, data)?)),
            None => Ok(EncMod::content_only(content)),
        }
    }

    fn decode(&self, z_content: &Tensor, z_style: Option<&Tensor>) -> FusionResult<Reconstruction> {
        let input = match (z_style, self.style_dim > 0) {
            (Some(style), true) => Tensor::cat(&[z_content, style], 1)?,
            (None, true) => {
                return Err(FusionError::adapter(&self.name, "style sample required"));
            }
            (_, false) => z_content.clone(),
        };
        Ok(Reconstruction::new(self.likelihood, self.decoder.forward(&input)?))
    }

    fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    fn reconstruction_weight(&self) -> f64 {
        self.weight
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = Vec::new();
        vars.extend(self.enc_mu.vars());
        vars.extend(self.enc_logvar.vars());
        if let Some((mu, logvar)) = &self.style_heads {
            vars.extend(mu.vars());
            vars.extend(logvar.vars());
        }
        vars.extend(self.decoder.vars());
        vars
    }
}

/// Encoder that ignores its input and returns `N(0, I)`; decoder returns zeros.
pub struct ConstantAdapter {
    name: String,
    data_dim: usize,
    latent_dim: usize,
}

impl ConstantAdapter {
    pub fn new(name: &str, data_dim: usize, latent_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            data_dim,
            latent_dim,
        }
    }
}

impl ModalityAdapter for ConstantAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_dim(&self) -> usize {
        self.latent_dim
    }

    fn encode(&self, data: &Tensor) -> FusionResult<EncMod> {
        let batch = data.dims()[0];
        Ok(EncMod::content_only(Distr::standard_normal(
            batch,
            self.latent_dim,
            data.device(),
        )?))
    }

    fn decode(&self, z_content: &Tensor, _z_style: Option<&Tensor>) -> FusionResult<Reconstruction> {
        let batch = z_content.dims()[0];
        let params = Tensor::zeros((batch, self.data_dim), DType::F32, z_content.device())?;
        Ok(Reconstruction::new(self.likelihood(), params))
    }

    fn likelihood(&self) -> Likelihood {
        Likelihood::Laplace { scale: 0.75 }
    }
}

/// Adapter whose encoder always fails.
pub struct FailingAdapter {
    name: String,
    latent_dim: usize,
}

impl FailingAdapter {
    pub fn new(name: &str, latent_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            latent_dim,
        }
    }
}

impl ModalityAdapter for FailingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_dim(&self) -> usize {
        self.latent_dim
    }

    fn encode(&self, _data: &Tensor) -> FusionResult<EncMod> {
        Err(FusionError::adapter(&self.name, "malformed input batch"))
    }

    fn decode(&self, _z_content: &Tensor, _z_style: Option<&Tensor>) -> FusionResult<Reconstruction> {
        Err(FusionError::adapter(&self.name, "decoder unavailable"))
    }

    fn likelihood(&self) -> Likelihood {
        Likelihood::Bernoulli
    }
}
