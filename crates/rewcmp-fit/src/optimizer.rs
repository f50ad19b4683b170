//! First-order optimizers over a flat parameter vector

use rewcmp_core::{RewardError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Optimizer selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with the usual (0.9, 0.999) moment decay
    #[default]
    Adam,
    /// Plain gradient descent
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            other => Err(RewardError::unknown_kind("optimizer", other)),
        }
    }
}

/// Optimizer state (Adam moments are allocated on the first step)
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    momentum: Vec<f64>,
    velocity: Vec<f64>,
    t: usize,
}

impl Optimizer {
    const BETA1: f64 = 0.9;
    const BETA2: f64 = 0.999;
    const EPSILON: f64 = 1e-8;

    /// Create a new optimizer
    #[must_use]
    pub fn new(kind: OptimizerKind) -> Self {
        Self {
            kind,
            momentum: Vec::new(),
            velocity: Vec::new(),
            t: 0,
        }
    }

    /// Steps taken so far
    #[must_use]
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Descend one step along `gradients`
    pub fn step(&mut self, params: &mut [f64], gradients: &[f64], learning_rate: f64) -> Result<()> {
        if params.len() != gradients.len() {
            return Err(RewardError::DimensionMismatch {
                expected: params.len(),
                actual: gradients.len(),
            });
        }
        if gradients.iter().any(|g| !g.is_finite()) {
            return Err(RewardError::NonFinite {
                context: "gradient".to_string(),
            });
        }
        self.t += 1;
        match self.kind {
            OptimizerKind::Sgd => {
                for (p, g) in params.iter_mut().zip(gradients) {
                    *p -= learning_rate * g;
                }
            }
            OptimizerKind::Adam => {
                if self.momentum.len() != params.len() {
                    self.momentum = vec![0.0; params.len()];
                    self.velocity = vec![0.0; params.len()];
                }
                let t = i32::try_from(self.t).unwrap_or(i32::MAX);
                let bias1 = 1.0 - Self::BETA1.powi(t);
                let bias2 = 1.0 - Self::BETA2.powi(t);
                for i in 0..params.len() {
                    self.momentum[i] = Self::BETA1 * self.momentum[i] + (1.0 - Self::BETA1) * gradients[i];
                    self.velocity[i] = Self::BETA2 * self.velocity[i] + (1.0 - Self::BETA2) * gradients[i].powi(2);

                    let m_hat = self.momentum[i] / bias1;
                    let v_hat = self.velocity[i] / bias2;
                    params[i] -= learning_rate * m_hat / (v_hat.sqrt() + Self::EPSILON);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimize(kind: OptimizerKind, lr: f64) -> f64 {
        // f(x) = (x - 3)^2
        let mut opt = Optimizer::new(kind);
        let mut x = [0.0];
        for _ in 0..2000 {
            let grad = [2.0 * (x[0] - 3.0)];
            opt.step(&mut x, &grad, lr).unwrap();
        }
        x[0]
    }

    #[test]
    fn test_adam_converges() {
        assert!((minimize(OptimizerKind::Adam, 0.05) - 3.0).abs() < 1e-2);
    }

    #[test]
    fn test_sgd_converges() {
        assert!((minimize(OptimizerKind::Sgd, 0.1) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut opt = Optimizer::new(OptimizerKind::Adam);
        assert!(opt.step(&mut [0.0, 1.0], &[1.0], 0.1).is_err());
    }
}
