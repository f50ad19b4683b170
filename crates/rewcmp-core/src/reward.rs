//! Reward models and the tagged reward transformation tree

use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::batch::TransitionBatch;
use crate::space::{ensure_same_space, Space};
use crate::{RewardError, Result};

/// Reward function r(s, a, s') evaluated on batches of transitions
pub trait RewardModel: Send + Sync {
    /// Space of observations
    fn observation_space(&self) -> &Space;

    /// Space of actions
    fn action_space(&self) -> &Space;

    /// Reward of every transition in `batch`, one value per row
    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>>;
}

/// State-only potential function phi(s)
pub trait Potential: Send + Sync {
    /// Space of observations the potential is defined over
    fn observation_space(&self) -> &Space;

    /// Potential of each observation row
    fn potential(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>>;
}

/// Fail with [`RewardError::NonFinite`] if any value is NaN or infinite
pub fn ensure_finite(values: ArrayView1<'_, f64>, context: &str) -> Result<()> {
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(RewardError::NonFinite {
            context: format!("{context}: value {} at index {idx}", values[idx]),
        });
    }
    Ok(())
}

/// Check that two reward sources share observation and action spaces
pub fn ensure_compatible(a: &dyn RewardModel, b: &dyn RewardModel) -> Result<()> {
    ensure_same_space("observation space", a.observation_space(), b.observation_space())?;
    ensure_same_space("action space", a.action_space(), b.action_space())
}

/// Evaluate a keyed collection of models on the same batch.
///
/// All models must share spaces with the first one, and every output must be
/// finite.
pub fn evaluate_models<K>(
    models: &IndexMap<K, Arc<dyn RewardModel>>,
    batch: &TransitionBatch,
) -> Result<IndexMap<K, Array1<f64>>>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    let Some((_, first)) = models.first() else {
        return Ok(IndexMap::new());
    };
    batch.check_spaces(first.observation_space(), first.action_space())?;

    let mut out = IndexMap::with_capacity(models.len());
    for (key, model) in models {
        ensure_compatible(first.as_ref(), model.as_ref())?;
        let values = model.evaluate(batch)?;
        if values.len() != batch.len() {
            return Err(RewardError::DimensionMismatch {
                expected: batch.len(),
                actual: values.len(),
            });
        }
        ensure_finite(values.view(), &format!("reward model {key:?}"))?;
        out.insert(key.clone(), values);
    }
    Ok(out)
}

/// Reward that is zero everywhere
#[derive(Debug, Clone)]
pub struct ZeroReward {
    obs_space: Space,
    act_space: Space,
}

impl ZeroReward {
    /// Create a zero reward over the given spaces
    #[must_use]
    pub fn new(obs_space: Space, act_space: Space) -> Self {
        Self {
            obs_space,
            act_space,
        }
    }
}

impl RewardModel for ZeroReward {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn action_space(&self) -> &Space {
        &self.act_space
    }

    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        batch.check_spaces(&self.obs_space, &self.act_space)?;
        Ok(Array1::zeros(batch.len()))
    }
}

/// Reward that outputs the same value for every transition
#[derive(Debug, Clone)]
pub struct ConstantReward {
    value: f64,
    obs_space: Space,
    act_space: Space,
}

impl ConstantReward {
    /// Create a constant reward
    #[must_use]
    pub fn new(value: f64, obs_space: Space, act_space: Space) -> Self {
        Self {
            value,
            obs_space,
            act_space,
        }
    }
}

impl RewardModel for ConstantReward {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn action_space(&self) -> &Space {
        &self.act_space
    }

    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        batch.check_spaces(&self.obs_space, &self.act_space)?;
        Ok(Array1::from_elem(batch.len(), self.value))
    }
}

/// Reward computed row by row from a closure over (obs, act, next_obs)
pub struct FnReward<F> {
    reward_fn: F,
    obs_space: Space,
    act_space: Space,
}

impl<F> FnReward<F>
where
    F: Fn(ArrayView1<'_, f64>, ArrayView1<'_, f64>, ArrayView1<'_, f64>) -> f64 + Send + Sync,
{
    /// Wrap a closure as a reward model
    pub fn new(obs_space: Space, act_space: Space, reward_fn: F) -> Self {
        Self {
            reward_fn,
            obs_space,
            act_space,
        }
    }
}

impl<F> RewardModel for FnReward<F>
where
    F: Fn(ArrayView1<'_, f64>, ArrayView1<'_, f64>, ArrayView1<'_, f64>) -> f64 + Send + Sync,
{
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn action_space(&self) -> &Space {
        &self.act_space
    }

    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        batch.check_spaces(&self.obs_space, &self.act_space)?;
        let mut out = Array1::zeros(batch.len());
        Zip::from(&mut out)
            .and(batch.obs().rows())
            .and(batch.actions().rows())
            .and(batch.next_obs().rows())
            .for_each(|r, o, a, n| *r = (self.reward_fn)(o, a, n));
        Ok(out)
    }
}

/// Potential computed row by row from a closure
pub struct FnPotential<F> {
    potential_fn: F,
    obs_space: Space,
}

impl<F> FnPotential<F>
where
    F: Fn(ArrayView1<'_, f64>) -> f64 + Send + Sync,
{
    /// Wrap a closure as a potential
    pub fn new(obs_space: Space, potential_fn: F) -> Self {
        Self {
            potential_fn,
            obs_space,
        }
    }
}

impl<F> Potential for FnPotential<F>
where
    F: Fn(ArrayView1<'_, f64>) -> f64 + Send + Sync,
{
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn potential(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        Ok(obs.rows().into_iter().map(|row| (self.potential_fn)(row)).collect())
    }
}

/// Potential over a discrete state space, one value per state
#[derive(Debug, Clone)]
pub struct TabularPotential {
    values: Array1<f64>,
    obs_space: Space,
}

impl TabularPotential {
    /// Create a tabular potential over `values.len()` states
    pub fn new(values: Array1<f64>) -> Result<Self> {
        let obs_space = Space::discrete(values.len())?;
        Ok(Self { values, obs_space })
    }

    /// Potential of each state
    #[must_use]
    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }
}

impl Potential for TabularPotential {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn potential(&self, obs: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        if obs.ncols() != 1 {
            return Err(RewardError::DimensionMismatch {
                expected: 1,
                actual: obs.ncols(),
            });
        }
        obs.column(0)
            .iter()
            .map(|&s| {
                let valid = s >= 0.0 && s.fract() == 0.0;
                valid.then(|| self.values.get(s as usize).copied()).flatten().ok_or_else(|| {
                    RewardError::Computation(format!(
                        "state {s} outside tabular potential of {} states",
                        self.values.len()
                    ))
                })
            })
            .collect()
    }
}

/// Weighted sum of reward trees sharing observation and action spaces
#[derive(Clone)]
pub struct LinearCombination {
    terms: Vec<(f64, RewardNode)>,
}

impl LinearCombination {
    /// Combine `terms`; fails on an empty list or mismatched spaces
    pub fn new(terms: Vec<(f64, RewardNode)>) -> Result<Self> {
        let (_, first) = terms.first().ok_or_else(|| {
            RewardError::invalid_config("linear_combination", "at least one term is required")
        })?;
        for (_, node) in &terms[1..] {
            ensure_compatible(first, node)?;
        }
        Ok(Self { terms })
    }

    /// Weights and sub-trees
    #[must_use]
    pub fn terms(&self) -> &[(f64, RewardNode)] {
        &self.terms
    }
}

/// Closed set of reward transformations composed as an explicit tree.
///
/// Leaves wrap a frozen base model; inner nodes scale, shift, add potential
/// shaping or linearly combine their children.
#[derive(Clone)]
pub enum RewardNode {
    /// Base reward model, passed through unchanged
    Identity(Arc<dyn RewardModel>),
    /// `factor * inner`
    Scale {
        /// Multiplicative factor
        factor: f64,
        /// Wrapped tree
        inner: Box<RewardNode>,
    },
    /// `inner + constant`
    Shift {
        /// Additive constant
        constant: f64,
        /// Wrapped tree
        inner: Box<RewardNode>,
    },
    /// `inner + discount * phi(s') - phi(s)`
    PotentialAdd {
        /// State-only potential
        potential: Arc<dyn Potential>,
        /// Discount used in the shaping term
        discount: f64,
        /// Wrapped tree
        inner: Box<RewardNode>,
    },
    /// Weighted sum of sub-trees
    LinearCombination(LinearCombination),
}

impl RewardNode {
    /// Leaf around a base model
    pub fn identity(model: Arc<dyn RewardModel>) -> Self {
        Self::Identity(model)
    }

    /// Scale this tree
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self::Scale {
            factor,
            inner: Box::new(self),
        }
    }

    /// Shift this tree
    #[must_use]
    pub fn shifted(self, constant: f64) -> Self {
        Self::Shift {
            constant,
            inner: Box::new(self),
        }
    }

    /// Add potential shaping to this tree
    pub fn shaped(self, potential: Arc<dyn Potential>, discount: f64) -> Result<Self> {
        ensure_same_space("potential observation space", self.observation_space(), potential.observation_space())?;
        Ok(Self::PotentialAdd {
            potential,
            discount,
            inner: Box::new(self),
        })
    }

    /// Number of nodes in the tree
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Identity(_) => 1,
            Self::Scale { inner, .. } | Self::Shift { inner, .. } | Self::PotentialAdd { inner, .. } => {
                1 + inner.size()
            }
            Self::LinearCombination(lc) => 1 + lc.terms.iter().map(|(_, n)| n.size()).sum::<usize>(),
        }
    }

    fn first_leaf(&self) -> &Arc<dyn RewardModel> {
        match self {
            Self::Identity(model) => model,
            Self::Scale { inner, .. } | Self::Shift { inner, .. } | Self::PotentialAdd { inner, .. } => {
                inner.first_leaf()
            }
            Self::LinearCombination(lc) => lc.terms[0].1.first_leaf(),
        }
    }
}

impl RewardModel for RewardNode {
    fn observation_space(&self) -> &Space {
        self.first_leaf().observation_space()
    }

    fn action_space(&self) -> &Space {
        self.first_leaf().action_space()
    }

    fn evaluate(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        match self {
            Self::Identity(model) => model.evaluate(batch),
            Self::Scale { factor, inner } => Ok(inner.evaluate(batch)? * *factor),
            Self::Shift { constant, inner } => Ok(inner.evaluate(batch)? + *constant),
            Self::PotentialAdd {
                potential,
                discount,
                inner,
            } => {
                let base = inner.evaluate(batch)?;
                let old = potential.potential(batch.obs())?;
                let new = potential.potential(batch.next_obs())?;
                Ok(base + new * *discount - old)
            }
            Self::LinearCombination(lc) => {
                let mut total = Array1::zeros(batch.len());
                for (weight, node) in &lc.terms {
                    total.scaled_add(*weight, &node.evaluate(batch)?);
                }
                Ok(total)
            }
        }
    }
}

impl fmt::Debug for RewardNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity(model) => write!(f, "Identity({} -> {})", model.observation_space(), model.action_space()),
            Self::Scale { factor, inner } => write!(f, "Scale({factor}, {inner:?})"),
            Self::Shift { constant, inner } => write!(f, "Shift({constant}, {inner:?})"),
            Self::PotentialAdd { discount, inner, .. } => write!(f, "PotentialAdd(discount={discount}, {inner:?})"),
            Self::LinearCombination(lc) => f.debug_list().entries(lc.terms.iter()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn discrete_batch() -> TransitionBatch {
        TransitionBatch::new(array![[0.0], [1.0], [2.0]], array![[0.0], [1.0], [0.0]], array![[1.0], [2.0], [0.0]]).unwrap()
    }

    fn state_reward() -> Arc<dyn RewardModel> {
        Arc::new(FnReward::new(Space::discrete(3).unwrap(), Space::discrete(2).unwrap(), |o, a, _| o[0] + 10.0 * a[0]))
    }

    #[test]
    fn test_tree_evaluation() {
        let phi: Arc<dyn Potential> = Arc::new(TabularPotential::new(array![0.0, 1.0, 4.0]).unwrap());
        let node = RewardNode::identity(state_reward())
            .scaled(2.0)
            .shifted(-1.0)
            .shaped(phi, 0.5)
            .unwrap();
        let out = node.evaluate(&discrete_batch()).unwrap();
        // 2 * r - 1 + 0.5 * phi(s') - phi(s)
        assert_abs_diff_eq!(out[0], 2.0 * 0.0 - 1.0 + 0.5 * 1.0 - 0.0);
        assert_abs_diff_eq!(out[1], 2.0 * 11.0 - 1.0 + 0.5 * 4.0 - 1.0);
        assert_abs_diff_eq!(out[2], 2.0 * 2.0 - 1.0 + 0.5 * 0.0 - 4.0);
        assert_eq!(node.size(), 4);
    }

    #[test]
    fn test_linear_combination_rejects_mismatched_spaces() {
        let other: Arc<dyn RewardModel> = Arc::new(ZeroReward::new(Space::discrete(4).unwrap(), Space::discrete(2).unwrap()));
        let result = LinearCombination::new(vec![
            (1.0, RewardNode::identity(state_reward())),
            (1.0, RewardNode::identity(other)),
        ]);
        assert!(matches!(result, Err(RewardError::SpaceMismatch { .. })));
    }

    #[test]
    fn test_evaluate_models_rejects_nan() {
        let nan: Arc<dyn RewardModel> =
            Arc::new(FnReward::new(Space::discrete(3).unwrap(), Space::discrete(2).unwrap(), |_, _, _| f64::NAN));
        let mut models = IndexMap::new();
        models.insert("ok", state_reward());
        models.insert("nan", nan);
        let err = evaluate_models(&models, &discrete_batch()).unwrap_err();
        assert!(matches!(err, RewardError::NonFinite { .. }));
    }
}
