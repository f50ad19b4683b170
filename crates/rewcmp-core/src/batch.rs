//! Transition batches and the sources that produce them

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::space::Space;
use crate::{RewardError, Result};

/// Batch of (observation, action, next observation) transitions.
///
/// Each row is one transition; observations and actions are flattened.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionBatch {
    obs: Array2<f64>,
    actions: Array2<f64>,
    next_obs: Array2<f64>,
}

impl TransitionBatch {
    /// Create a batch, checking that `obs` and `next_obs` have equal shapes and
    /// that there is one action per observation.
    pub fn new(obs: Array2<f64>, actions: Array2<f64>, next_obs: Array2<f64>) -> Result<Self> {
        if obs.dim() != next_obs.dim() {
            return Err(RewardError::DimensionMismatch {
                expected: obs.ncols(),
                actual: next_obs.ncols(),
            });
        }
        if obs.nrows() != next_obs.nrows() {
            return Err(RewardError::DimensionMismatch {
                expected: obs.nrows(),
                actual: next_obs.nrows(),
            });
        }
        if actions.nrows() != obs.nrows() {
            return Err(RewardError::DimensionMismatch {
                expected: obs.nrows(),
                actual: actions.nrows(),
            });
        }
        Ok(Self {
            obs,
            actions,
            next_obs,
        })
    }

    /// Observations, shape `(n, obs_dim)`
    #[must_use]
    pub fn obs(&self) -> ArrayView2<'_, f64> {
        self.obs.view()
    }

    /// Actions, shape `(n, act_dim)`
    #[must_use]
    pub fn actions(&self) -> ArrayView2<'_, f64> {
        self.actions.view()
    }

    /// Next observations, shape `(n, obs_dim)`
    #[must_use]
    pub fn next_obs(&self) -> ArrayView2<'_, f64> {
        self.next_obs.view()
    }

    /// Number of transitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.obs.nrows()
    }

    /// Check if the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.obs.nrows() == 0
    }

    /// Check rows against an observation and action space
    pub fn check_spaces(&self, obs_space: &Space, act_space: &Space) -> Result<()> {
        if self.obs.ncols() != obs_space.flat_dim() {
            return Err(RewardError::SpaceMismatch {
                what: "batch observations".to_string(),
                expected: obs_space.to_string(),
                actual: format!("{} columns", self.obs.ncols()),
            });
        }
        if self.actions.ncols() != act_space.flat_dim() {
            return Err(RewardError::SpaceMismatch {
                what: "batch actions".to_string(),
                expected: act_space.to_string(),
                actual: format!("{} columns", self.actions.ncols()),
            });
        }
        Ok(())
    }

    /// Rows at `indices`, in order
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            obs: self.obs.select(Axis(0), indices),
            actions: self.actions.select(Axis(0), indices),
            next_obs: self.next_obs.select(Axis(0), indices),
        }
    }

    /// Concatenate batches along the transition axis
    pub fn concat(batches: &[Self]) -> Result<Self> {
        let first = batches
            .first()
            .ok_or_else(|| RewardError::Computation("cannot concatenate zero batches".to_string()))?;
        for b in batches {
            if b.obs.ncols() != first.obs.ncols() {
                return Err(RewardError::DimensionMismatch {
                    expected: first.obs.ncols(),
                    actual: b.obs.ncols(),
                });
            }
            if b.actions.ncols() != first.actions.ncols() {
                return Err(RewardError::DimensionMismatch {
                    expected: first.actions.ncols(),
                    actual: b.actions.ncols(),
                });
            }
        }
        let stack = |f: fn(&Self) -> ArrayView2<'_, f64>| -> Result<Array2<f64>> {
            let views: Vec<_> = batches.iter().map(f).collect();
            concatenate(Axis(0), &views).map_err(|e| RewardError::Computation(e.to_string()))
        };
        Self::new(stack(Self::obs)?, stack(Self::actions)?, stack(Self::next_obs)?)
    }
}

/// Source of transition batches, e.g. policy rollouts or an i.i.d. sampler.
///
/// Calls may block. Exhaustible sources return an error once drained; the
/// error is propagated unchanged to the caller.
pub trait BatchSource: Send {
    /// Produce exactly `n` transitions
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch>;
}

impl<F> BatchSource for F
where
    F: FnMut(usize) -> Result<TransitionBatch> + Send,
{
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch> {
        self(n)
    }
}

/// Distribution over observations or actions, sampled as flat rows
pub trait SampleDist: Send {
    /// Draw `n` samples, shape `(n, dim)`
    fn sample_rows(&mut self, n: usize) -> Result<Array2<f64>>;
}

impl<F> SampleDist for F
where
    F: FnMut(usize) -> Result<Array2<f64>> + Send,
{
    fn sample_rows(&mut self, n: usize) -> Result<Array2<f64>> {
        self(n)
    }
}
