//! Batch sources and sample distributions
//!
//! Factories for the transition batches consumed by canonicalization and
//! fitting. Every stochastic source owns a seeded `StdRng`.

use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rewcmp_core::{BatchSource, Result, RewardError, SampleDist, Space, TransitionBatch};
use std::sync::Arc;
use tracing::debug;

/// Deterministic or stochastic environment dynamics over flat rows
pub trait Dynamics: Send + Sync {
    /// Observation space
    fn observation_space(&self) -> &Space;

    /// Action space
    fn action_space(&self) -> &Space;

    /// Next observation for each `(obs, act)` row pair
    fn step(&self, obs: ArrayView2<'_, f64>, actions: ArrayView2<'_, f64>) -> Result<Array2<f64>>;
}

/// Dynamics with a start distribution and terminal states
pub trait EpisodicDynamics: Dynamics {
    /// Observation at the start of an episode
    fn initial_state(&self, rng: &mut dyn RngCore) -> Array1<f64>;

    /// Whether an episode ends on reaching `obs`
    fn terminal(&self, obs: ArrayView1<'_, f64>) -> bool;
}

/// Maps an observation to an action
pub trait Policy: Send + Sync {
    /// Action taken in `obs`
    fn act(&self, obs: ArrayView1<'_, f64>, rng: &mut dyn RngCore) -> Result<Array1<f64>>;
}

/// Uniformly random actions from a space
#[derive(Debug, Clone)]
pub struct RandomPolicy {
    space: Space,
}

impl RandomPolicy {
    /// Create a new random policy over `space`
    #[must_use]
    pub fn new(space: Space) -> Self {
        Self { space }
    }
}

impl Policy for RandomPolicy {
    fn act(&self, _obs: ArrayView1<'_, f64>, rng: &mut dyn RngCore) -> Result<Array1<f64>> {
        Ok(self.space.sample(1, rng).row(0).to_owned())
    }
}

/// Samples elements of a [`Space`]
#[derive(Debug, Clone)]
pub struct SpaceSampler {
    space: Space,
    rng: StdRng,
}

impl SpaceSampler {
    /// Create a new sampler over `space`
    #[must_use]
    pub fn new(space: Space, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SampleDist for SpaceSampler {
    fn sample_rows(&mut self, n: usize) -> Result<Array2<f64>> {
        Ok(self.space.sample(n, &mut self.rng))
    }
}

/// Transitions with observation, action and next observation drawn independently
pub struct IidSource {
    obs_dist: Box<dyn SampleDist>,
    act_dist: Box<dyn SampleDist>,
}

impl IidSource {
    /// Create a new i.i.d. source from two sample distributions
    pub fn new(obs_dist: Box<dyn SampleDist>, act_dist: Box<dyn SampleDist>) -> Self {
        Self { obs_dist, act_dist }
    }

    /// i.i.d. source sampling directly from spaces
    #[must_use]
    pub fn from_spaces(obs_space: &Space, act_space: &Space, seed: u64) -> Self {
        Self::new(
            Box::new(SpaceSampler::new(obs_space.clone(), seed)),
            Box::new(SpaceSampler::new(act_space.clone(), seed.wrapping_add(1))),
        )
    }
}

impl BatchSource for IidSource {
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch> {
        let obs = self.obs_dist.sample_rows(n)?;
        let actions = self.act_dist.sample_rows(n)?;
        let next_obs = self.obs_dist.sample_rows(n)?;
        TransitionBatch::new(obs, actions, next_obs)
    }
}

/// Random observations and actions pushed through the dynamics
pub struct RandomTransitions {
    dynamics: Arc<dyn Dynamics>,
    obs_dist: Box<dyn SampleDist>,
    act_dist: Box<dyn SampleDist>,
}

impl RandomTransitions {
    /// Create a new source of one-step transitions
    pub fn new(dynamics: Arc<dyn Dynamics>, obs_dist: Box<dyn SampleDist>, act_dist: Box<dyn SampleDist>) -> Self {
        Self {
            dynamics,
            obs_dist,
            act_dist,
        }
    }

    /// Observations and actions drawn from the dynamics' own spaces
    #[must_use]
    pub fn from_spaces(dynamics: Arc<dyn Dynamics>, seed: u64) -> Self {
        let obs_dist = Box::new(SpaceSampler::new(dynamics.observation_space().clone(), seed));
        let act_dist = Box::new(SpaceSampler::new(dynamics.action_space().clone(), seed.wrapping_add(1)));
        Self::new(dynamics, obs_dist, act_dist)
    }
}

impl BatchSource for RandomTransitions {
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch> {
        let obs = self.obs_dist.sample_rows(n)?;
        let actions = self.act_dist.sample_rows(n)?;
        let next_obs = self.dynamics.step(obs.view(), actions.view())?;
        TransitionBatch::new(obs, actions, next_obs)
    }
}

/// Consecutive transitions of a policy acting in episodic dynamics.
///
/// An episode restarts from a fresh initial state once it reaches a terminal
/// observation or runs for `horizon` steps. Episodes carry over between batches.
pub struct PolicyRollouts {
    dynamics: Arc<dyn EpisodicDynamics>,
    policy: Arc<dyn Policy>,
    horizon: usize,
    rng: StdRng,
    obs: Option<Array1<f64>>,
    t: usize,
    episodes: usize,
}

impl PolicyRollouts {
    /// Create a new rollout source; fails on a zero horizon
    pub fn new(dynamics: Arc<dyn EpisodicDynamics>, policy: Arc<dyn Policy>, horizon: usize, seed: u64) -> Result<Self> {
        if horizon == 0 {
            return Err(RewardError::invalid_config("horizon", "must be positive"));
        }
        Ok(Self {
            dynamics,
            policy,
            horizon,
            rng: StdRng::seed_from_u64(seed),
            obs: None,
            t: 0,
            episodes: 0,
        })
    }

    /// Episodes started so far
    #[must_use]
    pub fn episodes(&self) -> usize {
        self.episodes
    }

    fn current(&mut self) -> Array1<f64> {
        match self.obs.take() {
            Some(obs) => obs,
            None => {
                self.t = 0;
                self.episodes += 1;
                self.dynamics.initial_state(&mut self.rng)
            }
        }
    }
}

impl BatchSource for PolicyRollouts {
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch> {
        let obs_dim = self.dynamics.observation_space().flat_dim();
        let act_dim = self.dynamics.action_space().flat_dim();
        let mut obs = Array2::zeros((n, obs_dim));
        let mut actions = Array2::zeros((n, act_dim));
        let mut next_obs = Array2::zeros((n, obs_dim));
        for i in 0..n {
            let current = self.current();
            let action = self.policy.act(current.view(), &mut self.rng)?;
            let next = self
                .dynamics
                .step(current.view().insert_axis(Axis(0)), action.view().insert_axis(Axis(0)))?;
            let next = next.row(0).to_owned();
            obs.row_mut(i).assign(&current);
            actions.row_mut(i).assign(&action);
            next_obs.row_mut(i).assign(&next);
            self.t += 1;
            if self.t < self.horizon && !self.dynamics.terminal(next.view()) {
                self.obs = Some(next);
            }
        }
        debug!(transitions = n, episodes = self.episodes, "policy rollouts");
        TransitionBatch::new(obs, actions, next_obs)
    }
}

/// Fixed dataset served in order; drained once every transition has been served
#[derive(Debug, Clone)]
pub struct FiniteDataset {
    data: TransitionBatch,
    cursor: usize,
}

impl FiniteDataset {
    /// Create a new dataset source
    #[must_use]
    pub fn new(data: TransitionBatch) -> Self {
        Self { data, cursor: 0 }
    }

    /// Transitions not yet served
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }
}

impl BatchSource for FiniteDataset {
    fn sample_batch(&mut self, n: usize) -> Result<TransitionBatch> {
        if n > self.remaining() {
            return Err(RewardError::Other(anyhow!(
                "dataset exhausted: requested {n} transitions, {} remaining",
                self.remaining()
            )));
        }
        let indices: Vec<usize> = (self.cursor..self.cursor + n).collect();
        self.cursor += n;
        debug!(served = n, remaining = self.remaining(), "dataset batch");
        Ok(self.data.select(&indices))
    }
}

/// Which column block of a transition batch to expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionField {
    /// Observations
    Obs,
    /// Actions
    Actions,
}

/// Observations or actions of a batch source, as a sample distribution
pub struct TransitionSampleDist {
    source: Box<dyn BatchSource>,
    field: TransitionField,
}

impl TransitionSampleDist {
    /// Create a new sample distribution over one field of `source`
    pub fn new(source: Box<dyn BatchSource>, field: TransitionField) -> Self {
        Self { source, field }
    }
}

impl SampleDist for TransitionSampleDist {
    fn sample_rows(&mut self, n: usize) -> Result<Array2<f64>> {
        let batch = self.source.sample_batch(n)?;
        Ok(match self.field {
            TransitionField::Obs => batch.obs().to_owned(),
            TransitionField::Actions => batch.actions().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Drift(Space);

    impl Dynamics for Drift {
        fn observation_space(&self) -> &Space {
            &self.0
        }

        fn action_space(&self) -> &Space {
            &self.0
        }

        fn step(&self, obs: ArrayView2<'_, f64>, actions: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
            Ok(&obs + &actions)
        }
    }

    impl EpisodicDynamics for Drift {
        fn initial_state(&self, _rng: &mut dyn RngCore) -> Array1<f64> {
            Array1::zeros(1)
        }

        fn terminal(&self, obs: ArrayView1<'_, f64>) -> bool {
            obs[0] >= 3.0
        }
    }

    struct Forward;

    impl Policy for Forward {
        fn act(&self, _obs: ArrayView1<'_, f64>, _rng: &mut dyn RngCore) -> Result<Array1<f64>> {
            Ok(ndarray::array![1.0])
        }
    }

    fn drift() -> Arc<Drift> {
        Arc::new(Drift(Space::uniform_box(-10.0, 10.0, 1).unwrap()))
    }

    #[test]
    fn test_rollouts_restart_at_terminal_states() {
        let mut source = PolicyRollouts::new(drift(), Arc::new(Forward), 100, 0).unwrap();
        let first = source.sample_batch(4).unwrap();
        assert_eq!(first.obs().column(0).to_vec(), vec![0.0, 1.0, 2.0, 0.0]);
        // the open episode continues into the next batch
        let second = source.sample_batch(3).unwrap();
        assert_eq!(second.obs().column(0).to_vec(), vec![1.0, 2.0, 0.0]);
        assert_eq!(second.next_obs().column(0).to_vec(), vec![2.0, 3.0, 1.0]);
        assert_eq!(source.episodes(), 3);
    }

    #[test]
    fn test_rollouts_truncate_at_horizon() {
        let mut source = PolicyRollouts::new(drift(), Arc::new(Forward), 2, 0).unwrap();
        let batch = source.sample_batch(5).unwrap();
        assert_eq!(batch.obs().column(0).to_vec(), vec![0.0, 1.0, 0.0, 1.0, 0.0]);
        assert!(PolicyRollouts::new(drift(), Arc::new(Forward), 0, 0).is_err());
    }

    #[test]
    fn test_random_policy_stays_in_space() {
        let space = Space::uniform_box(-1.0, 1.0, 3).unwrap();
        let policy = RandomPolicy::new(space.clone());
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let action = policy.act(Array1::zeros(1).view(), &mut rng).unwrap();
            assert!(space.contains(action.as_slice().unwrap()));
        }
    }

    #[test]
    fn test_iid_source_shapes() {
        let obs = Space::uniform_box(-1.0, 1.0, 3).unwrap();
        let act = Space::discrete(4).unwrap();
        let mut source = IidSource::from_spaces(&obs, &act, 0);
        let batch = source.sample_batch(10).unwrap();
        assert_eq!(batch.len(), 10);
        batch.check_spaces(&obs, &act).unwrap();
    }

    #[test]
    fn test_random_transitions_follow_dynamics() {
        let mut source = RandomTransitions::from_spaces(Arc::new(Drift(Space::uniform_box(-1.0, 1.0, 1).unwrap())), 5);
        let batch = source.sample_batch(8).unwrap();
        let expected = &batch.obs() + &batch.actions();
        assert_eq!(batch.next_obs(), expected);
    }

    #[test]
    fn test_finite_dataset_drains() {
        let data = IidSource::from_spaces(&Space::discrete(3).unwrap(), &Space::discrete(2).unwrap(), 1)
            .sample_batch(5)
            .unwrap();
        let mut dataset = FiniteDataset::new(data.clone());
        let first = dataset.sample_batch(3).unwrap();
        assert_eq!(first.obs(), data.obs().slice(ndarray::s![0..3, ..]));
        assert_eq!(dataset.remaining(), 2);
        assert!(matches!(dataset.sample_batch(3), Err(RewardError::Other(_))));
        assert_eq!(dataset.sample_batch(2).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_sample_dist_uses_field() {
        let obs = Space::uniform_box(0.0, 1.0, 2).unwrap();
        let source = Box::new(IidSource::from_spaces(&obs, &Space::discrete(7).unwrap(), 2));
        let mut actions = TransitionSampleDist::new(source, TransitionField::Actions);
        let rows = actions.sample_rows(6).unwrap();
        assert_eq!(rows.dim(), (6, 1));
        assert!(rows.iter().all(|&a| (0.0..7.0).contains(&a)));
    }
}
