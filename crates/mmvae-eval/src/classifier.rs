//! Binary logistic regression on latent representations.
//!
//! Features are standardized with the training mean and standard deviation;
//! weights are fitted by full-batch gradient descent on the mean binary
//! cross-entropy, starting from zero, so a fit is deterministic.

use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use tracing::debug;

use crate::error::{EvalError, EvalResult};

const STD_EPS: f64 = 1e-6;

/// Fitted binary classifier.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    weights: Var,
    bias: Var,
    mean: Tensor,
    std: Tensor,
}

impl LogisticRegression {
    /// Fit on `[n, d]` features and `n` targets in `{0, 1}`.
    ///
    /// # Errors
    ///
    /// `EvalError::InvalidInput` for a non-matrix input, a row count that
    /// differs from `targets`, an empty input, or a target outside `{0, 1}`.
    pub fn fit(features: &Tensor, targets: &[u32], epochs: usize, learning_rate: f64) -> EvalResult<Self> {
        let (rows, dim) = features
            .dims2()
            .map_err(|_| EvalError::invalid_input(format!("features must be [n, d], got {:?}", features.dims())))?;
        if rows == 0 || dim == 0 {
            return Err(EvalError::invalid_input("cannot fit a classifier on empty features"));
        }
        if rows != targets.len() {
            return Err(EvalError::invalid_input(format!(
                "{} feature rows but {} targets",
                rows,
                targets.len()
            )));
        }
        if let Some(bad) = targets.iter().find(|&&t| t > 1) {
            return Err(EvalError::invalid_input(format!("binary target expected, got {}", bad)));
        }

        let device = features.device();
        let features = features.to_dtype(DType::F32)?.detach();
        let mean = features.mean_keepdim(0)?;
        let centered = features.broadcast_sub(&mean)?;
        let std = centered.sqr()?.mean_keepdim(0)?.affine(1.0, STD_EPS)?.sqrt()?;
        let x = centered.broadcast_div(&std)?;
        let y = Tensor::from_vec(
            targets.iter().map(|&t| t as f32).collect::<Vec<_>>(),
            rows,
            device,
        )?;

        let weights = Var::zeros((dim, 1), DType::F32, device)?;
        let bias = Var::zeros(1, DType::F32, device)?;
        let mut optimizer = SGD::new(vec![weights.clone(), bias.clone()], learning_rate)?;

        let mut loss_value = f32::NAN;
        for _ in 0..epochs {
            let logits = x
                .matmul(weights.as_tensor())?
                .squeeze(1)?
                .broadcast_add(bias.as_tensor())?;
            let loss = binary_cross_entropy(&logits, &y)?;
            optimizer.backward_step(&loss)?;
            loss_value = loss.to_scalar::<f32>()?;
        }
        debug!(rows, dim, epochs, final_loss = loss_value, "Fitted logistic regression");

        Ok(Self {
            weights,
            bias,
            mean,
            std,
        })
    }

    /// Feature width the classifier was fitted on.
    pub fn input_dim(&self) -> usize {
        self.weights.dims()[0]
    }

    /// Logits, shape `[n]`.
    pub fn logits(&self, features: &Tensor) -> EvalResult<Tensor> {
        let (_, dim) = features
            .dims2()
            .map_err(|_| EvalError::invalid_input(format!("features must be [n, d], got {:?}", features.dims())))?;
        if dim != self.input_dim() {
            return Err(EvalError::invalid_input(format!(
                "classifier fitted on width {}, got {}",
                self.input_dim(),
                dim
            )));
        }
        let x = features
            .to_dtype(DType::F32)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&self.std)?;
        Ok(x.matmul(self.weights.as_tensor())?
            .squeeze(1)?
            .broadcast_add(self.bias.as_tensor())?)
    }

    /// `P(y = 1)`, shape `[n]`.
    pub fn predict_proba(&self, features: &Tensor) -> EvalResult<Tensor> {
        Ok(candle_nn::ops::sigmoid(&self.logits(features)?)?)
    }

    pub fn predict(&self, features: &Tensor) -> EvalResult<Vec<u32>> {
        let logits = self.logits(features)?.to_vec1::<f32>()?;
        Ok(logits.iter().map(|&l| u32::from(l > 0.0)).collect())
    }

    /// Fraction of rows predicted correctly.
    pub fn accuracy(&self, features: &Tensor, targets: &[u32]) -> EvalResult<f64> {
        let predictions = self.predict(features)?;
        accuracy(&predictions, targets)
    }
}

/// Fraction of positions where `predictions` equals `targets`.
pub fn accuracy(predictions: &[u32], targets: &[u32]) -> EvalResult<f64> {
    if predictions.len() != targets.len() {
        return Err(EvalError::invalid_input(format!(
            "{} predictions but {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    if targets.is_empty() {
        return Err(EvalError::invalid_input("accuracy of an empty set"));
    }
    let correct = predictions.iter().zip(targets).filter(|(p, t)| p == t).count();
    Ok(correct as f64 / targets.len() as f64)
}

/// Mean of `softplus(l) - y·l`, stable for large logits.
fn binary_cross_entropy(logits: &Tensor, targets: &Tensor) -> EvalResult<Tensor> {
    let softplus = logits
        .relu()?
        .add(&logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?)?;
    Ok(softplus.sub(&logits.mul(targets)?)?.mean_all()?)
}
