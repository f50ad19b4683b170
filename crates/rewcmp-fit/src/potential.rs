//! Trainable state potentials used by the shaping part of an equivalence model

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rewcmp_core::{Potential, Result, RewardError, Space, TabularPotential};
use std::sync::Arc;

use crate::mlp::{MlpConfig, MlpPotential};

/// Potential whose parameters can be read, written and differentiated
pub trait TrainablePotential: Send + Sync {
    /// Observation space the potential is defined on
    fn observation_space(&self) -> &Space;

    /// Length of the flat parameter vector
    fn num_parameters(&self) -> usize;

    /// Flat parameter vector
    fn parameters(&self) -> Vec<f64>;

    /// Overwrite the flat parameter vector
    fn set_parameters(&mut self, params: &[f64]) -> Result<()>;

    /// Potential of each observation row
    fn forward(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>>;

    /// Gradient of `sum_i grad_out[i] * phi(obs_i)` with respect to the parameters
    fn backward(&self, obs: ArrayView2<'_, f64>, grad_out: ArrayView1<'_, f64>) -> Result<Vec<f64>>;

    /// Snapshot of the current potential, detached from training
    fn freeze(&self) -> Result<Arc<dyn Potential>>;
}

/// One free value per discrete state
#[derive(Debug, Clone)]
pub struct TabularPotentialParams {
    values: Array1<f64>,
    obs_space: Space,
}

impl TabularPotentialParams {
    /// Create a new tabular potential with small random values
    pub fn new<R: Rng + ?Sized>(n_states: usize, rng: &mut R) -> Result<Self> {
        let normal = Normal::new(0.0, 0.01).map_err(|e| RewardError::Computation(e.to_string()))?;
        Ok(Self {
            values: Array1::from_shape_fn(n_states, |_| normal.sample(rng)),
            obs_space: Space::discrete(n_states)?,
        })
    }

    /// Current value of each state
    #[must_use]
    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    fn index(&self, s: f64) -> Result<usize> {
        if s >= 0.0 && s.fract() == 0.0 && (s as usize) < self.values.len() {
            Ok(s as usize)
        } else {
            Err(RewardError::Computation(format!(
                "state {s} outside tabular potential of {} states",
                self.values.len()
            )))
        }
    }
}

impl TrainablePotential for TabularPotentialParams {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn num_parameters(&self) -> usize {
        self.values.len()
    }

    fn parameters(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.values.len() {
            return Err(RewardError::DimensionMismatch {
                expected: self.values.len(),
                actual: params.len(),
            });
        }
        self.values = Array1::from(params.to_vec());
        Ok(())
    }

    fn forward(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        if obs.ncols() != 1 {
            return Err(RewardError::DimensionMismatch {
                expected: 1,
                actual: obs.ncols(),
            });
        }
        obs.column(0).iter().map(|&s| Ok(self.values[self.index(s)?])).collect()
    }

    fn backward(&self, obs: ArrayView2<'_, f64>, grad_out: ArrayView1<'_, f64>) -> Result<Vec<f64>> {
        if obs.ncols() != 1 || obs.nrows() != grad_out.len() {
            return Err(RewardError::DimensionMismatch {
                expected: obs.nrows(),
                actual: grad_out.len(),
            });
        }
        let mut grads = vec![0.0; self.values.len()];
        for (&s, g) in obs.column(0).iter().zip(grad_out) {
            grads[self.index(s)?] += g;
        }
        Ok(grads)
    }

    fn freeze(&self) -> Result<Arc<dyn Potential>> {
        Ok(Arc::new(TabularPotential::new(self.values.clone())?))
    }
}

impl TrainablePotential for MlpPotential {
    fn observation_space(&self) -> &Space {
        Potential::observation_space(self)
    }

    fn num_parameters(&self) -> usize {
        MlpPotential::num_parameters(self)
    }

    fn parameters(&self) -> Vec<f64> {
        self.get_parameters()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        MlpPotential::set_parameters(self, params)
    }

    fn forward(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        MlpPotential::forward(self, obs)
    }

    fn backward(&self, obs: ArrayView2<'_, f64>, grad_out: ArrayView1<'_, f64>) -> Result<Vec<f64>> {
        MlpPotential::backward(self, obs, grad_out)
    }

    fn freeze(&self) -> Result<Arc<dyn Potential>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Tabular parameters on discrete spaces, an MLP on continuous ones
pub fn build_potential<R: Rng + ?Sized>(
    obs_space: &Space,
    hidden_sizes: &[usize],
    rng: &mut R,
) -> Result<Box<dyn TrainablePotential>> {
    match obs_space {
        Space::Discrete { n } => Ok(Box::new(TabularPotentialParams::new(*n, rng)?)),
        Space::Box { .. } => {
            let config = MlpConfig {
                hidden_dims: hidden_sizes.to_vec(),
                ..MlpConfig::default()
            };
            Ok(Box::new(MlpPotential::new(obs_space.clone(), config, rng)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_tabular_backward_accumulates() {
        let mut potential = TabularPotentialParams::new(3, &mut StdRng::seed_from_u64(0)).unwrap();
        potential.set_parameters(&[1.0, 2.0, 3.0]).unwrap();
        let obs = array![[0.0], [2.0], [2.0]];
        assert_eq!(potential.forward(obs.view()).unwrap(), array![1.0, 3.0, 3.0]);
        let grads = potential.backward(obs.view(), array![1.0, 0.5, 0.25].view()).unwrap();
        assert_eq!(grads, vec![1.0, 0.0, 0.75]);
        assert!(potential.forward(array![[3.0]].view()).is_err());
    }

    #[test]
    fn test_freeze_detaches() {
        let mut potential = TabularPotentialParams::new(2, &mut StdRng::seed_from_u64(0)).unwrap();
        potential.set_parameters(&[4.0, -1.0]).unwrap();
        let frozen = potential.freeze().unwrap();
        potential.set_parameters(&[0.0, 0.0]).unwrap();
        assert_eq!(frozen.potential(array![[0.0], [1.0]].view()).unwrap(), array![4.0, -1.0]);
    }

    #[test]
    fn test_build_potential_by_space() {
        let mut rng = StdRng::seed_from_u64(1);
        let tabular = build_potential(&Space::discrete(5).unwrap(), &[8], &mut rng).unwrap();
        assert_eq!(tabular.num_parameters(), 5);
        let boxed = Space::uniform_box(-1.0, 1.0, 3).unwrap();
        let mlp = build_potential(&boxed, &[4], &mut rng).unwrap();
        assert_eq!(mlp.num_parameters(), 3 * 4 + 4 + 4 + 1);
    }
}
