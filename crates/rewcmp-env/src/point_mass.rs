//! Point mass in N dimensions
//!
//! Observations concatenate position, velocity and goal, each `ndim` wide.
//! Actions are accelerations clipped to `[-1, 1]`.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use rewcmp_core::{FnReward, LinearCombination, Result, RewardError, RewardModel, RewardNode, Space};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::sources::{Dynamics, EpisodicDynamics, Policy};

/// Point mass parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointMassConfig {
    /// Number of spatial dimensions
    pub ndim: usize,
    /// Integration timestep
    pub dt: f64,
    /// Weight of the control cost in the built-in rewards
    pub ctrl_coef: f64,
    /// Distance to goal counted as reaching it
    pub threshold: f64,
}

impl Default for PointMassConfig {
    fn default() -> Self {
        Self {
            ndim: 2,
            dt: 0.1,
            ctrl_coef: 1.0,
            threshold: 0.05,
        }
    }
}

/// Point mass dynamics
#[derive(Debug, Clone)]
pub struct PointMass {
    config: PointMassConfig,
    obs_space: Space,
    act_space: Space,
}

fn distance_to_goal(obs: ArrayView1<'_, f64>, ndim: usize) -> f64 {
    let pos = obs.slice(s![0..ndim]);
    let goal = obs.slice(s![2 * ndim..3 * ndim]);
    pos.iter().zip(goal).map(|(p, g)| (p - g).powi(2)).sum::<f64>().sqrt()
}

impl PointMass {
    /// Create a new point mass
    pub fn new(config: PointMassConfig) -> Result<Self> {
        if config.ndim == 0 {
            return Err(RewardError::invalid_config("ndim", "must be positive"));
        }
        if !(config.dt > 0.0 && config.dt.is_finite()) {
            return Err(RewardError::invalid_config("dt", "must be positive and finite"));
        }
        let obs_space = Space::uniform_box(f64::NEG_INFINITY, f64::INFINITY, 3 * config.ndim)?;
        let act_space = Space::uniform_box(-1.0, 1.0, config.ndim)?;
        Ok(Self {
            config,
            obs_space,
            act_space,
        })
    }

    /// Point mass whose observation space is `obs_space`, inferring `ndim`
    pub fn from_spaces(obs_space: &Space, act_space: &Space) -> Result<Self> {
        let dim = obs_space.flat_dim();
        if dim == 0 || dim % 3 != 0 {
            return Err(RewardError::invalid_config(
                "observation_space",
                format!("point mass observations are 3 * ndim wide, got {dim}"),
            ));
        }
        let env = Self::new(PointMassConfig {
            ndim: dim / 3,
            ..PointMassConfig::default()
        })?;
        rewcmp_core::space::ensure_same_space("action space", env.action_space(), act_space)?;
        Ok(env)
    }

    /// Parameters
    #[must_use]
    pub fn config(&self) -> &PointMassConfig {
        &self.config
    }

    /// Initial observation at least one step away from the goal
    pub fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let ndim = self.config.ndim;
        loop {
            let obs: Array1<f64> = Array1::from_shape_fn(3 * ndim, |_| rng.sample(StandardNormal));
            let speed = obs.slice(s![ndim..2 * ndim]).iter().map(|v| v * v).sum::<f64>().sqrt();
            if distance_to_goal(obs.view(), ndim) - self.config.dt * speed > self.config.threshold {
                return obs;
            }
        }
    }

    /// Whether the mass is within `threshold` of the goal
    #[must_use]
    pub fn terminal(&self, obs: ArrayView1<'_, f64>) -> bool {
        distance_to_goal(obs, self.config.ndim) < self.config.threshold
    }

    /// Acceleration towards the goal, saturated to the action bounds
    #[must_use]
    pub fn goal_seeking_action(&self, obs: ArrayView1<'_, f64>) -> Array1<f64> {
        let ndim = self.config.ndim;
        let pos = obs.slice(s![0..ndim]);
        let vel = obs.slice(s![ndim..2 * ndim]);
        let goal = obs.slice(s![2 * ndim..3 * ndim]);
        let direction = &goal - &pos;
        let norm = direction.iter().map(|d| d * d).sum::<f64>().sqrt().max(1e-4);
        let delta = direction / norm - vel;
        let inf_norm = delta.iter().fold(0.0f64, |m, d| m.max(d.abs())).max(1e-4);
        (delta / inf_norm).mapv(|a| a.clamp(-1.0, 1.0))
    }
}

impl Dynamics for PointMass {
    fn observation_space(&self) -> &Space {
        &self.obs_space
    }

    fn action_space(&self) -> &Space {
        &self.act_space
    }

    fn step(&self, obs: ArrayView2<'_, f64>, actions: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let ndim = self.config.ndim;
        if obs.ncols() != 3 * ndim || actions.ncols() != ndim || obs.nrows() != actions.nrows() {
            return Err(RewardError::DimensionMismatch {
                expected: 3 * ndim,
                actual: obs.ncols(),
            });
        }
        let dt = self.config.dt;
        let mut next = obs.to_owned();
        for (mut row, act) in next.axis_iter_mut(Axis(0)).zip(actions.axis_iter(Axis(0))) {
            for k in 0..ndim {
                let vel = row[ndim + k];
                row[k] += dt * vel;
                row[ndim + k] = vel + dt * act[k].clamp(-1.0, 1.0);
            }
        }
        Ok(next)
    }
}

impl EpisodicDynamics for PointMass {
    fn initial_state(&self, rng: &mut dyn RngCore) -> Array1<f64> {
        PointMass::initial_state(self, rng)
    }

    fn terminal(&self, obs: ArrayView1<'_, f64>) -> bool {
        PointMass::terminal(self, obs)
    }
}

/// Accelerates towards the goal, optionally with Gaussian action noise
#[derive(Debug, Clone)]
pub struct GoalSeekingPolicy {
    env: PointMass,
    noise: f64,
}

impl GoalSeekingPolicy {
    /// Create a new policy for `env`; `noise` is the action noise standard deviation
    pub fn new(env: PointMass, noise: f64) -> Result<Self> {
        if !(noise >= 0.0 && noise.is_finite()) {
            return Err(RewardError::invalid_config("noise", "must be non-negative and finite"));
        }
        Ok(Self { env, noise })
    }
}

impl Policy for GoalSeekingPolicy {
    fn act(&self, obs: ArrayView1<'_, f64>, rng: &mut dyn RngCore) -> Result<Array1<f64>> {
        let ndim = self.env.config.ndim;
        if obs.len() != 3 * ndim {
            return Err(RewardError::DimensionMismatch {
                expected: 3 * ndim,
                actual: obs.len(),
            });
        }
        let action = self.env.goal_seeking_action(obs);
        if self.noise == 0.0 {
            return Ok(action);
        }
        Ok(action.mapv(|a| {
            let z: f64 = rng.sample(StandardNormal);
            (a + self.noise * z).clamp(-1.0, 1.0)
        }))
    }
}

fn control_cost(act: ArrayView1<'_, f64>) -> f64 {
    act.dot(&act)
}

/// Negative distance to goal minus the control cost
#[must_use]
pub fn ground_truth_reward(env: &PointMass, ctrl_coef: f64) -> Arc<dyn RewardModel> {
    let ndim = env.config.ndim;
    Arc::new(FnReward::new(
        env.obs_space.clone(),
        env.act_space.clone(),
        move |obs: ArrayView1<'_, f64>, act: ArrayView1<'_, f64>, _next: ArrayView1<'_, f64>| {
            -distance_to_goal(obs, ndim) - ctrl_coef * control_cost(act)
        },
    ))
}

/// One inside the goal region, minus the control cost
#[must_use]
pub fn sparse_reward(env: &PointMass, ctrl_coef: f64, threshold: f64) -> Arc<dyn RewardModel> {
    let ndim = env.config.ndim;
    Arc::new(FnReward::new(
        env.obs_space.clone(),
        env.act_space.clone(),
        move |obs: ArrayView1<'_, f64>, act: ArrayView1<'_, f64>, _next: ArrayView1<'_, f64>| {
            let goal = if distance_to_goal(obs, ndim) < threshold { 1.0 } else { 0.0 };
            goal - ctrl_coef * control_cost(act)
        },
    ))
}

/// Shaping by the potential `-distance to goal`: `distance(s) - discount * distance(s')`.
///
/// At discount 1 this is the decrease in distance to goal.
#[must_use]
pub fn shaping_reward(env: &PointMass, discount: f64) -> Arc<dyn RewardModel> {
    let ndim = env.config.ndim;
    Arc::new(FnReward::new(
        env.obs_space.clone(),
        env.act_space.clone(),
        move |obs: ArrayView1<'_, f64>, _act: ArrayView1<'_, f64>, next: ArrayView1<'_, f64>| {
            distance_to_goal(obs, ndim) - discount * distance_to_goal(next, ndim)
        },
    ))
}

/// Sparse reward plus ten times the shaping term at `discount`
pub fn dense_reward(env: &PointMass, ctrl_coef: f64, discount: f64) -> Result<RewardNode> {
    let sparse = RewardNode::identity(sparse_reward(env, ctrl_coef, env.config.threshold));
    let shaping = RewardNode::identity(shaping_reward(env, discount));
    Ok(RewardNode::LinearCombination(LinearCombination::new(vec![
        (1.0, sparse),
        (10.0, shaping),
    ])?))
}
