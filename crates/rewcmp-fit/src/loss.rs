//! Regression losses between a transformed source and a fixed target

use ndarray::{Array1, ArrayView1};
use rewcmp_core::{Result, RewardError};
use serde::{Deserialize, Serialize};

/// Floor on `|residual|` in the gradient of the Lp loss
pub const ELLP_GRAD_EPS: f64 = 1e-8;

/// Loss selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossKind {
    /// Mean squared error
    #[default]
    Squared,
    /// Mean `|residual|^p`, typically with `0 < p < 2`
    Ellp {
        /// Exponent
        p: f64,
    },
}

impl LossKind {
    /// Fails unless the exponent is a positive finite number
    pub fn validate(self) -> Result<()> {
        match self {
            Self::Squared => Ok(()),
            Self::Ellp { p } if p.is_finite() && p > 0.0 => Ok(()),
            Self::Ellp { p } => Err(RewardError::invalid_config("loss.p", format!("{p} is not a positive number"))),
        }
    }

    /// Loss value and its gradient with respect to `output`.
    ///
    /// `weights` are normalized to sum to one; `None` weighs every row equally.
    pub fn loss_and_grad(
        self,
        output: ArrayView1<'_, f64>,
        target: ArrayView1<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(f64, Array1<f64>)> {
        if output.len() != target.len() {
            return Err(RewardError::DimensionMismatch {
                expected: target.len(),
                actual: output.len(),
            });
        }
        if output.is_empty() {
            return Err(RewardError::Computation("loss over an empty batch".to_string()));
        }
        let w = match weights {
            None => Array1::from_elem(output.len(), 1.0 / output.len() as f64),
            Some(w) if w.len() != output.len() => {
                return Err(RewardError::DimensionMismatch {
                    expected: output.len(),
                    actual: w.len(),
                })
            }
            Some(w) => {
                let total = w.sum();
                if !(total > 0.0 && total.is_finite()) {
                    return Err(RewardError::InvalidDistribution("loss weights must have positive mass".to_string()));
                }
                &w / total
            }
        };

        let residual = &output - &target;
        let (loss, grad) = match self {
            Self::Squared => {
                let loss = (&residual * &residual * &w).sum();
                (loss, &residual * &w * 2.0)
            }
            Self::Ellp { p } => {
                let loss: f64 = residual.iter().zip(&w).map(|(d, w)| w * d.abs().powf(p)).sum();
                let grad = Array1::from_iter(
                    residual
                        .iter()
                        .zip(&w)
                        .map(|(d, w)| w * p * d.abs().max(ELLP_GRAD_EPS).powf(p - 1.0) * d.signum()),
                );
                (loss, grad)
            }
        };
        Ok((loss, grad))
    }
}
