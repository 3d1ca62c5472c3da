//! Invertible latent transform built from affine coupling layers.
//!
//! Each layer splits the latent vector into a conditioning half and a
//! transformed half. The transformed half is scaled and shifted by functions
//! of the conditioning half:
//!
//! ```text
//! y_cond  = x_cond
//! y_trans = x_trans * exp(s(x_cond)) + t(x_cond)
//! log|det J| = Σ s(x_cond)
//! ```
//!
//! Layers alternate which half conditions, so every coordinate gets
//! transformed after two layers. `s` is bounded by `tanh`, which keeps the
//! Jacobian well conditioned at initialization. A flow with zero layers is the
//! identity with zero log-determinant.

use candle_core::{DType, Device, Tensor, Var};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::{FusionError, FusionResult};

/// Scale applied to the random initialization of every layer weight.
const INIT_SCALE: f64 = 0.1;

/// Result of pushing a base sample through the flow.
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// Base sample, unchanged.
    pub z0: Tensor,
    /// Transformed sample.
    pub zk: Tensor,
    /// Sum of per-layer log-determinants, shape `[batch]`.
    pub log_det_jacobian: Tensor,
}

/// One affine coupling layer.
#[derive(Debug)]
struct AffineCoupling {
    /// Column range `(start, len)` that conditions the transform.
    cond: (usize, usize),
    /// Column range `(start, len)` that gets transformed.
    trans: (usize, usize),
    /// Conditioner hidden layer [cond_len, hidden] (absent when cond_len == 0).
    w_hidden: Option<Var>,
    b_hidden: Var,
    /// Log-scale head [hidden, trans_len].
    w_scale: Var,
    b_scale: Var,
    /// Shift head [hidden, trans_len].
    w_shift: Var,
    b_shift: Var,
}

impl AffineCoupling {
    fn new<R: Rng + ?Sized>(
        latent_dim: usize,
        hidden_dim: usize,
        flip: bool,
        rng: &mut R,
        device: &Device,
    ) -> FusionResult<Self> {
        let half = latent_dim / 2;
        let (cond, trans) = if flip {
            ((half, latent_dim - half), (0, half))
        } else {
            ((0, half), (half, latent_dim - half))
        };

        let w_hidden = if cond.1 > 0 {
            Some(random_var(cond.1, hidden_dim, rng, device)?)
        } else {
            None
        };

        Ok(Self {
            cond,
            trans,
            w_hidden,
            b_hidden: zeros_var(hidden_dim, device)?,
            w_scale: random_var(hidden_dim, trans.1, rng, device)?,
            b_scale: zeros_var(trans.1, device)?,
            w_shift: random_var(hidden_dim, trans.1, rng, device)?,
            b_shift: zeros_var(trans.1, device)?,
        })
    }

    /// Conditioner output `(s, t)`, each `[batch, trans_len]`.
    fn scale_and_shift(&self, x_cond: &Tensor, batch_size: usize) -> FusionResult<(Tensor, Tensor)> {
        let pre = match &self.w_hidden {
            Some(w) => x_cond.matmul(w.as_tensor())?.broadcast_add(self.b_hidden.as_tensor())?,
            None => self
                .b_hidden
                .as_tensor()
                .unsqueeze(0)?
                .broadcast_as((batch_size, self.b_hidden.dims()[0]))?
                .contiguous()?,
        };
        let hidden = pre.tanh()?;
        let s = hidden
            .matmul(self.w_scale.as_tensor())?
            .broadcast_add(self.b_scale.as_tensor())?
            .tanh()?;
        let t = hidden
            .matmul(self.w_shift.as_tensor())?
            .broadcast_add(self.b_shift.as_tensor())?;
        Ok((s, t))
    }

    fn forward(&self, x: &Tensor) -> FusionResult<(Tensor, Tensor)> {
        let batch_size = x.dims()[0];
        if self.trans.1 == 0 {
            return Ok((x.clone(), Tensor::zeros(batch_size, x.dtype(), x.device())?));
        }
        let x_cond = x.narrow(1, self.cond.0, self.cond.1)?;
        let x_trans = x.narrow(1, self.trans.0, self.trans.1)?;
        let (s, t) = self.scale_and_shift(&x_cond, batch_size)?;
        let y_trans = x_trans.mul(&s.exp()?)?.add(&t)?;
        let log_det = s.sum(1)?;
        Ok((self.assemble(&x_cond, &y_trans)?, log_det))
    }

    fn inverse(&self, y: &Tensor) -> FusionResult<Tensor> {
        if self.trans.1 == 0 {
            return Ok(y.clone());
        }
        let batch_size = y.dims()[0];
        let y_cond = y.narrow(1, self.cond.0, self.cond.1)?;
        let y_trans = y.narrow(1, self.trans.0, self.trans.1)?;
        let (s, t) = self.scale_and_shift(&y_cond, batch_size)?;
        let x_trans = y_trans.sub(&t)?.mul(&s.neg()?.exp()?)?;
        self.assemble(&y_cond, &x_trans)
    }

    /// Put the two halves back in column order.
    fn assemble(&self, cond: &Tensor, trans: &Tensor) -> FusionResult<Tensor> {
        if self.cond.1 == 0 {
            return Ok(trans.clone());
        }
        let parts = if self.cond.0 < self.trans.0 {
            [cond, trans]
        } else {
            [trans, cond]
        };
        Ok(Tensor::cat(&parts, 1)?)
    }

    fn vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.w_hidden.iter().cloned().collect();
        vars.extend([
            self.b_hidden.clone(),
            self.w_scale.clone(),
            self.b_scale.clone(),
            self.w_shift.clone(),
            self.b_shift.clone(),
        ]);
        vars
    }
}

/// Stack of affine coupling layers over a fixed latent dimension.
#[derive(Debug)]
pub struct Flow {
    latent_dim: usize,
    layers: Vec<AffineCoupling>,
}

impl Flow {
    /// Create a flow with `num_layers` coupling layers.
    ///
    /// Weights are drawn from `rng`; biases start at zero.
    ///
    /// # Errors
    ///
    /// `FusionError::Config` if `latent_dim` is zero, or if `hidden_dim` is zero
    /// while `num_layers > 0`.
    pub fn new<R: Rng + ?Sized>(
        latent_dim: usize,
        num_layers: usize,
        hidden_dim: usize,
        rng: &mut R,
        device: &Device,
    ) -> FusionResult<Self> {
        if latent_dim == 0 {
            return Err(FusionError::config("flow latent_dim must be > 0"));
        }
        if num_layers > 0 && hidden_dim == 0 {
            return Err(FusionError::config("flow hidden_dim must be > 0"));
        }
        let layers = (0..num_layers)
            .map(|i| AffineCoupling::new(latent_dim, hidden_dim, i % 2 == 1, rng, device))
            .collect::<FusionResult<Vec<_>>>()?;

        debug!(latent_dim, num_layers, hidden_dim, "Built coupling flow");
        Ok(Self { latent_dim, layers })
    }

    /// The identity flow.
    pub fn identity(latent_dim: usize) -> Self {
        Self {
            latent_dim,
            layers: Vec::new(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Push `z0` through every layer.
    pub fn forward(&self, z0: &Tensor) -> FusionResult<FlowOutput> {
        self.check_input(z0)?;
        let mut z = z0.clone();
        let mut log_det = Tensor::zeros(z0.dims()[0], z0.dtype(), z0.device())?;
        for layer in &self.layers {
            let (next, layer_log_det) = layer.forward(&z)?;
            z = next;
            log_det = log_det.add(&layer_log_det)?;
        }
        Ok(FlowOutput {
            z0: z0.clone(),
            zk: z,
            log_det_jacobian: log_det,
        })
    }

    /// Exact inverse of [`Flow::forward`].
    pub fn inverse(&self, zk: &Tensor) -> FusionResult<Tensor> {
        self.check_input(zk)?;
        let mut z = zk.clone();
        for layer in self.layers.iter().rev() {
            z = layer.inverse(&z)?;
        }
        Ok(z)
    }

    /// All trainable parameters, layer by layer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.layers.iter().flat_map(AffineCoupling::vars).collect()
    }

    fn check_input(&self, z: &Tensor) -> FusionResult<()> {
        if z.rank() != 2 || z.dims()[1] != self.latent_dim {
            return Err(FusionError::shape_mismatch(
                "flow input [batch, latent_dim]",
                &[z.dims().first().copied().unwrap_or(0), self.latent_dim],
                z.dims(),
            ));
        }
        Ok(())
    }
}

fn random_var<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
    device: &Device,
) -> FusionResult<Var> {
    let std = INIT_SCALE / (rows.max(1) as f64).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| (rng.sample::<f64, _>(StandardNormal) * std) as f32)
        .collect();
    Ok(Var::from_tensor(&Tensor::from_vec(data, (rows, cols), device)?)?)
}

fn zeros_var(len: usize, device: &Device) -> FusionResult<Var> {
    Ok(Var::from_tensor(&Tensor::zeros(len, DType::F32, device)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(batch: usize, dim: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        crate::distribution::standard_normal_noise(&[batch, dim], &Device::Cpu, &mut rng).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_zero_layers_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let flow = Flow::new(8, 0, 16, &mut rng, &Device::Cpu).unwrap();
        let z0 = sample(4, 8, 1);
        let out = flow.forward(&z0).unwrap();
        assert_eq!(max_abs_diff(&out.z0, &z0), 0.0);
        assert_eq!(max_abs_diff(&out.zk, &z0), 0.0);
        assert_eq!(out.log_det_jacobian.to_vec1::<f32>().unwrap(), vec![0.0; 4]);
        assert!(flow.trainable_vars().is_empty());
    }

    #[test]
    fn test_inverse_round_trip() {
        for (dim, layers) in [(8, 1), (8, 4), (5, 3), (1, 2)] {
            let mut rng = StdRng::seed_from_u64(42);
            let flow = Flow::new(dim, layers, 16, &mut rng, &Device::Cpu).unwrap();
            let z0 = sample(6, dim, 2);
            let out = flow.forward(&z0).unwrap();
            let back = flow.inverse(&out.zk).unwrap();
            let err = max_abs_diff(&back, &z0);
            assert!(err < 1e-4, "dim={} layers={} round trip error {}", dim, layers, err);
        }
    }

    #[test]
    fn test_layers_change_the_sample() {
        let mut rng = StdRng::seed_from_u64(9);
        let flow = Flow::new(6, 2, 8, &mut rng, &Device::Cpu).unwrap();
        let z0 = sample(3, 6, 3);
        let out = flow.forward(&z0).unwrap();
        assert!(max_abs_diff(&out.zk, &z0) > 0.0);
        assert_eq!(out.log_det_jacobian.dims(), &[3]);
        // Two layers: w_hidden, b_hidden, w_scale, b_scale, w_shift, b_shift each.
        assert_eq!(flow.trainable_vars().len(), 12);
    }

    #[test]
    fn test_log_det_matches_layer_sum() {
        let mut rng = StdRng::seed_from_u64(5);
        let flow = Flow::new(4, 3, 8, &mut rng, &Device::Cpu).unwrap();
        let z0 = sample(2, 4, 4);

        let mut z = z0.clone();
        let mut expected = vec![0.0f32; 2];
        for layer in &flow.layers {
            let (next, ld) = layer.forward(&z).unwrap();
            for (e, v) in expected.iter_mut().zip(ld.to_vec1::<f32>().unwrap()) {
                *e += v;
            }
            z = next;
        }
        let total = flow.forward(&z0).unwrap().log_det_jacobian.to_vec1::<f32>().unwrap();
        for (a, b) in total.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_wrong_input_width_rejected() {
        let flow = Flow::identity(4);
        let z = sample(2, 3, 0);
        assert!(matches!(flow.forward(&z), Err(FusionError::ShapeMismatch { .. })));
    }
}
