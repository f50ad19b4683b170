//! Feed-forward potential network
//!
//! Pure ndarray MLP mapping an observation row to a scalar potential. The
//! gradient is computed by hand so the fitter needs no autodiff backend.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rewcmp_core::{Potential, Result, RewardError, Space};
use serde::{Deserialize, Serialize};

/// Hidden-layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Hyperbolic tangent
    #[default]
    Tanh,
    /// Rectified linear unit
    Relu,
    /// Logistic sigmoid
    Sigmoid,
    /// No activation
    Identity,
}

impl Activation {
    fn apply(self, x: &Array2<f64>) -> Array2<f64> {
        match self {
            Self::Relu => x.mapv(|v| v.max(0.0)),
            Self::Tanh => x.mapv(f64::tanh),
            Self::Sigmoid => x.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            Self::Identity => x.clone(),
        }
    }

    /// Derivative expressed through the activation's output
    fn derivative(self, out: &Array2<f64>) -> Array2<f64> {
        match self {
            Self::Relu => out.mapv(|h| if h > 0.0 { 1.0 } else { 0.0 }),
            Self::Tanh => out.mapv(|h| 1.0 - h * h),
            Self::Sigmoid => out.mapv(|h| h * (1.0 - h)),
            Self::Identity => Array2::ones(out.raw_dim()),
        }
    }
}

/// MLP potential configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Hidden layer sizes
    pub hidden_dims: Vec<usize>,
    /// Activation function
    pub activation: Activation,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![32, 32],
            activation: Activation::Tanh,
        }
    }
}

/// MLP with a single linear output unit
#[derive(Debug, Clone)]
pub struct MlpPotential {
    config: MlpConfig,
    obs_space: Space,
    /// Weights for each layer, shape `(in, out)`
    weights: Vec<Array2<f64>>,
    /// Biases for each layer
    biases: Vec<Array1<f64>>,
}

impl MlpPotential {
    /// Create a new MLP potential with Xavier-initialized weights
    pub fn new<R: Rng + ?Sized>(obs_space: Space, config: MlpConfig, rng: &mut R) -> Self {
        let mut weights = Vec::new();
        let mut biases = Vec::new();

        let mut prev_dim = obs_space.flat_dim();
        for &hidden_dim in &config.hidden_dims {
            weights.push(Self::xavier_init(prev_dim, hidden_dim, rng));
            biases.push(Array1::zeros(hidden_dim));
            prev_dim = hidden_dim;
        }

        // Output layer
        weights.push(Self::xavier_init(prev_dim, 1, rng));
        biases.push(Array1::zeros(1));

        Self {
            config,
            obs_space,
            weights,
            biases,
        }
    }

    /// Xavier initialization for weights
    fn xavier_init<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Array2<f64> {
        let limit = (6.0 / (in_dim + out_dim) as f64).sqrt();
        Array2::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-limit..limit))
    }

    /// Layer outputs, starting with the input itself
    fn activations(&self, obs: ArrayView2<'_, f64>) -> Result<Vec<Array2<f64>>> {
        if obs.ncols() != self.obs_space.flat_dim() {
            return Err(RewardError::DimensionMismatch {
                expected: self.obs_space.flat_dim(),
                actual: obs.ncols(),
            });
        }
        let n_hidden = self.config.hidden_dims.len();
        let mut acts = Vec::with_capacity(n_hidden + 2);
        acts.push(obs.to_owned());
        for i in 0..=n_hidden {
            let z = acts[i].dot(&self.weights[i]) + &self.biases[i];
            // no activation on the output unit
            let h = if i < n_hidden { self.config.activation.apply(&z) } else { z };
            acts.push(h);
        }
        Ok(acts)
    }

    /// Potential of each observation row
    pub fn forward(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        let mut acts = self.activations(obs)?;
        let out = acts
            .pop()
            .ok_or_else(|| RewardError::Computation("empty network".to_string()))?;
        Ok(out.column(0).to_owned())
    }

    /// Gradient of `sum_i grad_out[i] * phi(obs_i)` with respect to the flat parameters
    pub fn backward(&self, obs: ArrayView2<'_, f64>, grad_out: ArrayView1<'_, f64>) -> Result<Vec<f64>> {
        if grad_out.len() != obs.nrows() {
            return Err(RewardError::DimensionMismatch {
                expected: obs.nrows(),
                actual: grad_out.len(),
            });
        }
        let acts = self.activations(obs)?;
        let n_layers = self.weights.len();
        let mut weight_grads = vec![Array2::zeros((0, 0)); n_layers];
        let mut bias_grads = vec![Array1::zeros(0); n_layers];

        let mut delta = grad_out.to_owned().insert_axis(Axis(1));
        for layer in (0..n_layers).rev() {
            weight_grads[layer] = acts[layer].t().dot(&delta);
            bias_grads[layer] = delta.sum_axis(Axis(0));
            if layer > 0 {
                let back = delta.dot(&self.weights[layer].t());
                delta = back * self.config.activation.derivative(&acts[layer]);
            }
        }

        let mut grads = Vec::with_capacity(self.num_parameters());
        for (w, b) in weight_grads.iter().zip(&bias_grads) {
            grads.extend(w.iter());
            grads.extend(b.iter());
        }
        Ok(grads)
    }

    /// Total number of weights and biases
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weights.iter().map(Array2::len).sum::<usize>() + self.biases.iter().map(Array1::len).sum::<usize>()
    }

    /// Get current parameters, layer by layer (weights then bias)
    #[must_use]
    pub fn get_parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.num_parameters());
        for (w, b) in self.weights.iter().zip(&self.biases) {
            params.extend(w.iter());
            params.extend(b.iter());
        }
        params
    }

    /// Set parameters in the order of [`Self::get_parameters`]
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(RewardError::DimensionMismatch {
                expected: self.num_parameters(),
                actual: params.len(),
            });
        }
        let mut idx = 0;
        for (w, b) in self.weights.iter_mut().zip(self.biases.iter_mut()) {
            let (rows, cols) = w.dim();
            *w = Array2::from_shape_vec((rows, cols), params[idx..idx + rows * cols].to_vec())
                .map_err(|e| RewardError::Computation(e.to_string()))?;
            idx += rows * cols;
            let size = b.len();
            *b = Array1::from(params[idx..idx + size].to_vec());
            idx += size;
        }
        Ok(())
    }
}

impl Potential for MlpPotential {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn potential(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        self.forward(obs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(activation: Activation) -> MlpPotential {
        let space = Space::uniform_box(-1.0, 1.0, 2).unwrap();
        let config = MlpConfig {
            hidden_dims: vec![5, 3],
            activation,
        };
        MlpPotential::new(space, config, &mut StdRng::seed_from_u64(11))
    }

    #[test]
    fn test_forward_shape() {
        let net = network(Activation::Tanh);
        let out = net.forward(array![[0.1, 0.2], [0.3, -0.4], [0.0, 0.0]].view()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(net.num_parameters(), 2 * 5 + 5 + 5 * 3 + 3 + 3 + 1);
    }

    #[test]
    fn test_parameters_round_trip() {
        let net = network(Activation::Relu);
        let mut other = network(Activation::Relu);
        let params: Vec<f64> = net.get_parameters().iter().map(|p| p + 0.5).collect();
        other.set_parameters(&params).unwrap();
        assert_eq!(other.get_parameters(), params);
        assert!(other.set_parameters(&params[1..]).is_err());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        for activation in [Activation::Tanh, Activation::Sigmoid, Activation::Identity] {
            let mut net = network(activation);
            let obs = array![[0.3, -0.2], [-0.7, 0.5]];
            let grad_out = array![1.5, -0.5];
            let analytic = net.backward(obs.view(), grad_out.view()).unwrap();

            let objective = |net: &MlpPotential| net.forward(obs.view()).unwrap().dot(&grad_out);
            let params = net.get_parameters();
            let eps = 1e-6;
            for i in 0..params.len() {
                let mut plus = params.clone();
                plus[i] += eps;
                net.set_parameters(&plus).unwrap();
                let f_plus = objective(&net);
                let mut minus = params.clone();
                minus[i] -= eps;
                net.set_parameters(&minus).unwrap();
                let f_minus = objective(&net);
                let numeric = (f_plus - f_minus) / (2.0 * eps);
                assert!((numeric - analytic[i]).abs() < 1e-5, "{activation:?} param {i}");
            }
            net.set_parameters(&params).unwrap();
        }
    }
}
