//! Dense reward tensors R[s, a, s'] over finite MDPs

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::batch::TransitionBatch;
use crate::reward::{ensure_finite, RewardModel};
use crate::space::Space;
use crate::{RewardError, Result};

/// Reward over a finite state set S and action set A, indexed `[s, a, s']`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTensor(Array3<f64>);

impl RewardTensor {
    /// Wrap an array, checking it is square in states and finite
    pub fn new(values: Array3<f64>) -> Result<Self> {
        let (ns, na, ns2) = values.dim();
        if ns != ns2 {
            return Err(RewardError::DimensionMismatch {
                expected: ns,
                actual: ns2,
            });
        }
        if ns == 0 || na == 0 {
            return Err(RewardError::invalid_config("reward", "state and action sets must be non-empty"));
        }
        if let Some(v) = values.iter().find(|v| !v.is_finite()) {
            return Err(RewardError::NonFinite {
                context: format!("reward tensor contains {v}"),
            });
        }
        Ok(Self(values))
    }

    /// Tensor of zeros with the given sizes
    pub fn zeros(n_states: usize, n_actions: usize) -> Result<Self> {
        Self::new(Array3::zeros((n_states, n_actions, n_states)))
    }

    /// Number of states
    #[must_use]
    pub fn n_states(&self) -> usize {
        self.0.dim().0
    }

    /// Number of actions
    #[must_use]
    pub fn n_actions(&self) -> usize {
        self.0.dim().1
    }

    /// Underlying array
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.0.view()
    }

    /// Consume into the underlying array
    #[must_use]
    pub fn into_inner(self) -> Array3<f64> {
        self.0
    }

    /// Affine transform `scale * R + shift`
    #[must_use]
    pub fn affine(&self, scale: f64, shift: f64) -> Self {
        Self(self.0.mapv(|r| scale * r + shift))
    }

    /// Check that `other` is defined over the same state and action sets
    pub fn ensure_same_shape(&self, other: &Self) -> Result<()> {
        if self.0.dim() != other.0.dim() {
            return Err(RewardError::DimensionMismatch {
                expected: self.0.len(),
                actual: other.0.len(),
            });
        }
        Ok(())
    }
}

/// Add potential shaping: `shaped[s, a, s'] = R[s, a, s'] + discount * phi[s'] - phi[s]`
pub fn shape(reward: &RewardTensor, potential: ArrayView1<'_, f64>, discount: f64) -> Result<RewardTensor> {
    let ns = reward.n_states();
    if potential.len() != ns {
        return Err(RewardError::DimensionMismatch {
            expected: ns,
            actual: potential.len(),
        });
    }
    let mut shaped = reward.0.clone();
    Zip::indexed(&mut shaped).for_each(|(s, _, s2), r| {
        *r += discount * potential[s2] - potential[s];
    });
    RewardTensor::new(shaped)
}

/// Reference distribution over transitions (s, a, s'), normalized to sum to one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDistribution(Array3<f64>);

impl TransitionDistribution {
    /// Normalize non-negative weights into a distribution
    pub fn from_weights(weights: Array3<f64>) -> Result<Self> {
        let (ns, _, ns2) = weights.dim();
        if ns != ns2 {
            return Err(RewardError::DimensionMismatch {
                expected: ns,
                actual: ns2,
            });
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RewardError::InvalidDistribution(
                "weights must be finite and non-negative".to_string(),
            ));
        }
        let total = weights.sum();
        if total <= 0.0 {
            return Err(RewardError::InvalidDistribution("weights sum to zero".to_string()));
        }
        Ok(Self(weights / total))
    }

    /// Uniform distribution over every (s, a, s')
    #[must_use]
    pub fn uniform(n_states: usize, n_actions: usize) -> Self {
        let n = (n_states * n_actions * n_states) as f64;
        Self(Array3::from_elem((n_states, n_actions, n_states), 1.0 / n))
    }

    /// Product distribution `mu_S(s) * mu_A(a) * mu_S(s')`
    pub fn product(state_dist: ArrayView1<'_, f64>, action_dist: ArrayView1<'_, f64>) -> Result<Self> {
        let (ns, na) = (state_dist.len(), action_dist.len());
        let weights = Array3::from_shape_fn((ns, na, ns), |(s, a, s2)| {
            state_dist[s] * action_dist[a] * state_dist[s2]
        });
        Self::from_weights(weights)
    }

    /// Probabilities, indexed `[s, a, s']`
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.0.view()
    }

    /// Flattened probabilities, matching the row order of [`enumerate_transitions`]
    #[must_use]
    pub fn flat_weights(&self) -> Array1<f64> {
        self.0.iter().copied().collect()
    }

    /// Number of states
    #[must_use]
    pub fn n_states(&self) -> usize {
        self.0.dim().0
    }

    /// Number of actions
    #[must_use]
    pub fn n_actions(&self) -> usize {
        self.0.dim().1
    }

    /// Marginal over states, averaging the source and destination marginals
    #[must_use]
    pub fn state_marginal(&self) -> Array1<f64> {
        let src = self.0.sum_axis(Axis(2)).sum_axis(Axis(1));
        let dst = self.0.sum_axis(Axis(1)).sum_axis(Axis(0));
        (src + dst) * 0.5
    }

    /// Marginal over actions
    #[must_use]
    pub fn action_marginal(&self) -> Array1<f64> {
        self.0.sum_axis(Axis(2)).sum_axis(Axis(0))
    }

    /// Check the distribution matches the shape of `reward`
    pub fn ensure_matches(&self, reward: &RewardTensor) -> Result<()> {
        if self.0.dim() != reward.0.dim() {
            return Err(RewardError::DimensionMismatch {
                expected: reward.0.len(),
                actual: self.0.len(),
            });
        }
        Ok(())
    }
}

/// Batch enumerating every (s, a, s') in row-major order, as discrete indices
pub fn enumerate_transitions(n_states: usize, n_actions: usize) -> Result<TransitionBatch> {
    let n = n_states * n_actions * n_states;
    let mut obs = Array2::zeros((n, 1));
    let mut acts = Array2::zeros((n, 1));
    let mut next_obs = Array2::zeros((n, 1));
    let mut row = 0;
    for s in 0..n_states {
        for a in 0..n_actions {
            for s2 in 0..n_states {
                obs[[row, 0]] = s as f64;
                acts[[row, 0]] = a as f64;
                next_obs[[row, 0]] = s2 as f64;
                row += 1;
            }
        }
    }
    TransitionBatch::new(obs, acts, next_obs)
}

/// Evaluate a reward model over every transition of a finite MDP
pub fn tabulate(model: &dyn RewardModel) -> Result<RewardTensor> {
    let ns = model.observation_space().cardinality().ok_or_else(|| {
        RewardError::invalid_config("observation_space", "tabular mode requires a finite state set")
    })?;
    let na = model.action_space().cardinality().ok_or_else(|| {
        RewardError::invalid_config("action_space", "tabular mode requires a finite action set")
    })?;
    let values = model.evaluate(&enumerate_transitions(ns, na)?)?;
    ensure_finite(values.view(), "tabulated reward")?;
    let values = values
        .into_shape((ns, na, ns))
        .map_err(|e| RewardError::Computation(e.to_string()))?;
    RewardTensor::new(values)
}

/// Optimal action values of `reward` under the transition kernel
/// `kernel[s, a, s'] = P(s' | s, a)`, by value iteration.
pub fn optimal_q_values(
    reward: &RewardTensor,
    kernel: ArrayView3<'_, f64>,
    discount: f64,
    n_iter: usize,
    tolerance: f64,
) -> Result<Array2<f64>> {
    if kernel.dim() != reward.0.dim() {
        return Err(RewardError::DimensionMismatch {
            expected: reward.0.len(),
            actual: kernel.len(),
        });
    }
    if !(0.0..1.0).contains(&discount) {
        return Err(RewardError::invalid_config("discount", "value iteration requires discount in [0, 1)"));
    }
    for row in kernel.lanes(Axis(2)) {
        if (row.sum() - 1.0).abs() > 1e-6 {
            return Err(RewardError::InvalidDistribution(
                "transition kernel rows must sum to one".to_string(),
            ));
        }
    }
    let (ns, na, _) = reward.0.dim();
    // expected immediate reward of (s, a)
    let immediate = (&reward.0 * &kernel).sum_axis(Axis(2));
    let mut values = Array1::<f64>::zeros(ns);
    let mut q = immediate.clone();
    for _ in 0..n_iter {
        q = Array2::from_shape_fn((ns, na), |(s, a)| {
            immediate[[s, a]] + discount * kernel.slice(ndarray::s![s, a, ..]).dot(&values)
        });
        let next = q.map_axis(Axis(1), |row| row.fold(f64::NEG_INFINITY, |m, v| m.max(*v)));
        let delta = (&next - &values).fold(0.0_f64, |m, v| m.max(v.abs()));
        values = next;
        if delta < tolerance {
            break;
        }
    }
    Ok(q)
}

/// Greedy policy from action values; ties go to the lowest action
#[must_use]
pub fn greedy_policy(q: &Array2<f64>) -> Vec<usize> {
    q.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (a, v)| if *v > best.1 { (a, *v) } else { best })
                .0
        })
        .collect()
}

/// Optimal deterministic policy of `reward` under `kernel`
pub fn optimal_policy(reward: &RewardTensor, kernel: ArrayView3<'_, f64>, discount: f64) -> Result<Vec<usize>> {
    Ok(greedy_policy(&optimal_q_values(reward, kernel, discount, 10_000, 1e-10)?))
}

/// Reward model that looks up R[s, a, s'] for discrete states and actions
#[derive(Debug, Clone)]
pub struct TabularReward {
    tensor: RewardTensor,
    obs_space: Space,
    act_space: Space,
}

impl TabularReward {
    /// Wrap a reward tensor as a model
    #[must_use]
    pub fn new(tensor: RewardTensor) -> Self {
        // a checked tensor has at least one state and one action
        let obs_space = Space::Discrete { n: tensor.n_states() };
        let act_space = Space::Discrete { n: tensor.n_actions() };
        Self {
            tensor,
            obs_space,
            act_space,
        }
    }

    /// The wrapped tensor
    #[must_use]
    pub fn tensor(&self) -> &RewardTensor {
        &self.tensor
    }
}

impl RewardModel for TabularReward {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn action_space(&self) -> &Space {
        &self.act_space
    }

    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        batch.check_spaces(&self.obs_space, &self.act_space)?;
        let (ns, na) = (self.tensor.n_states(), self.tensor.n_actions());
        let index = |x: f64, n: usize, what: &str| -> Result<usize> {
            if x >= 0.0 && x.fract() == 0.0 && (x as usize) < n {
                Ok(x as usize)
            } else {
                Err(RewardError::Computation(format!("{what} index {x} outside 0..{n}")))
            }
        };
        let obs = batch.obs();
        let acts = batch.actions();
        let next_obs = batch.next_obs();
        (0..batch.len())
            .map(|i| {
                let s = index(obs[[i, 0]], ns, "state")?;
                let a = index(acts[[i, 0]], na, "action")?;
                let s2 = index(next_obs[[i, 0]], ns, "next state")?;
                Ok(self.tensor.0[[s, a, s2]])
            })
            .collect()
    }
}
