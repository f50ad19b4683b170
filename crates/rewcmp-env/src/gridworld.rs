//! Small deterministic gridworlds
//!
//! A gridworld reward is a state-only reward and a potential over an
//! `xlen x ylen` grid. Both are flattened row-major into states, tiled into a
//! full `R[s, a, s']` tensor over five actions and shaped by the potential.

use indexmap::IndexMap;
use ndarray::{array, Array2, Array3, ArrayView1, ArrayView2};
use rewcmp_core::dissimilarity::DissimilarityMatrix;
use rewcmp_core::{
    canonical_reward_distance, cross_distance, deshape_pearson_distance, shape, DeshapeKind, DirectDistance,
    FixedPointConfig, Result, RewardCfg, RewardError, RewardTensor, SymmetricAggregation, TransitionDistribution,
};
use rewcmp_fit::{asymmetric_distance, npec_distance, symmetric_distance, NpecConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Stay, up, down, left, right
pub const N_ACTIONS: usize = 5;

/// Library key of the all-zero reward
pub const ZERO_KEY: &str = "zero";

/// Path recorded for gridworld entries in a dissimilarity matrix
const GRIDWORLD_PATH: &str = "dummy";

/// State-only reward and potential over a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridworldReward {
    /// Reward for leaving each cell
    pub state_reward: Array2<f64>,
    /// Shaping potential of each cell
    pub potential: Array2<f64>,
}

impl GridworldReward {
    /// Create a new gridworld reward, checking both grids share a shape
    pub fn new(state_reward: Array2<f64>, potential: Array2<f64>) -> Result<Self> {
        if state_reward.dim() != potential.dim() {
            return Err(RewardError::DimensionMismatch {
                expected: state_reward.len(),
                actual: potential.len(),
            });
        }
        Ok(Self {
            state_reward,
            potential,
        })
    }

    /// Unshaped reward
    pub fn unshaped(state_reward: Array2<f64>) -> Self {
        let potential = Array2::zeros(state_reward.raw_dim());
        Self {
            state_reward,
            potential,
        }
    }

    /// Grid size `(xlen, ylen)`
    #[must_use]
    pub fn dims(&self) -> (usize, usize) {
        self.state_reward.dim()
    }
}

/// Tile a state-only reward `R[s]` into `R[s, a, s']`
pub fn state_to_3d(reward: ArrayView1<'_, f64>, n_states: usize, n_actions: usize) -> Result<Array3<f64>> {
    if reward.len() != n_states {
        return Err(RewardError::DimensionMismatch {
            expected: n_states,
            actual: reward.len(),
        });
    }
    Ok(Array3::from_shape_fn((n_states, n_actions, n_states), |(s, _, _)| reward[s]))
}

/// Tile a grid reward `R[i, j]` into `R[s, a, s']` over [`N_ACTIONS`] actions
pub fn grid_to_3d(reward: ArrayView2<'_, f64>) -> Result<Array3<f64>> {
    let flat: Vec<f64> = reward.iter().copied().collect();
    let n_states = flat.len();
    state_to_3d(ArrayView1::from(&flat), n_states, N_ACTIONS)
}

/// Shaped reward tensor of a gridworld reward
pub fn make_reward(cfg: &GridworldReward, discount: f64) -> Result<RewardTensor> {
    if cfg.state_reward.dim() != cfg.potential.dim() {
        return Err(RewardError::DimensionMismatch {
            expected: cfg.state_reward.len(),
            actual: cfg.potential.len(),
        });
    }
    let state_reward = RewardTensor::new(grid_to_3d(cfg.state_reward.view())?)?;
    let potential: Vec<f64> = cfg.potential.iter().copied().collect();
    shape(&state_reward, ArrayView1::from(&potential), discount)
}

/// Deterministic dynamics as an indicator tensor `T[s, a, s']`.
///
/// Moves off the grid leave the agent in place.
pub fn build_transitions(xlen: usize, ylen: usize, n_actions: usize) -> Result<Array3<f64>> {
    if n_actions != N_ACTIONS {
        return Err(RewardError::invalid_config(
            "n_actions",
            format!("gridworlds have {N_ACTIONS} actions, got {n_actions}"),
        ));
    }
    if xlen == 0 || ylen == 0 {
        return Err(RewardError::invalid_config("grid", "both dimensions must be positive"));
    }
    let n_states = xlen * ylen;
    let mut transitions = Array3::zeros((n_states, n_actions, n_states));
    for i in 0..xlen {
        for j in 0..ylen {
            let moves = [
                (i, j),
                (i.saturating_sub(1), j),
                ((i + 1).min(xlen - 1), j),
                (i, j.saturating_sub(1)),
                (i, (j + 1).min(ylen - 1)),
            ];
            for (a, (ni, nj)) in moves.into_iter().enumerate() {
                transitions[[i * ylen + j, a, ni * ylen + nj]] = 1.0;
            }
        }
    }
    Ok(transitions)
}

/// Uniform distribution over the transitions the gridworld dynamics allow
pub fn build_dist(reward: &RewardTensor, xlen: usize, ylen: usize) -> Result<TransitionDistribution> {
    if reward.n_states() != xlen * ylen {
        return Err(RewardError::DimensionMismatch {
            expected: xlen * ylen,
            actual: reward.n_states(),
        });
    }
    TransitionDistribution::from_weights(build_transitions(xlen, ylen, reward.n_actions())?)
}

/// Built-in 3x3 rewards; the goal sits in the bottom-right corner
#[must_use]
pub fn gridworld_rewards() -> IndexMap<String, GridworldReward> {
    let sparse_goal = array![[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    let goal_distance = array![[-4.0, -3.0, -2.0], [-3.0, -2.0, -1.0], [-2.0, -1.0, 0.0]];

    let mut rewards = IndexMap::new();
    rewards.insert("sparse_goal".to_string(), GridworldReward::unshaped(sparse_goal.clone()));
    rewards.insert(
        "dense_goal".to_string(),
        GridworldReward {
            state_reward: sparse_goal.clone(),
            potential: goal_distance.clone(),
        },
    );
    rewards.insert(
        "transformed_goal".to_string(),
        GridworldReward {
            state_reward: sparse_goal.mapv(|r| 10.0 * r - 1.0),
            potential: goal_distance.mapv(|p| 5.0 * p),
        },
    );
    rewards.insert(
        "center_goal".to_string(),
        GridworldReward::unshaped(array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]),
    );
    rewards.insert(
        "sparse_penalty".to_string(),
        GridworldReward::unshaped(array![[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, -1.0]]),
    );
    rewards.insert(
        "dirt_path".to_string(),
        GridworldReward::unshaped(array![[0.0, 0.0, 0.0], [0.2, 0.2, 0.2], [0.0, 0.0, 1.0]]),
    );
    rewards.insert(
        "cliff_walk".to_string(),
        GridworldReward::unshaped(array![[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [-10.0, -10.0, 1.0]]),
    );
    rewards.insert(ZERO_KEY.to_string(), GridworldReward::unshaped(Array2::zeros((3, 3))));
    rewards
}

/// Distance computed between gridworld rewards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridDivergence {
    /// Raw NPEC residual
    Npec,
    /// NPEC normalized by the target's distance from zero
    Asymmetric,
    /// Both asymmetric directions combined
    Symmetric(SymmetricAggregation),
    /// Direct distance between canonical rewards
    Direct(DeshapeKind),
    /// Pearson distance between canonical rewards
    Pearson(DeshapeKind),
}

impl fmt::Display for GridDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Npec => f.write_str("npec"),
            Self::Asymmetric => f.write_str("asymmetric"),
            Self::Symmetric(SymmetricAggregation::Mean) => f.write_str("symmetric"),
            Self::Symmetric(SymmetricAggregation::Min) => f.write_str("symmetric_min"),
            Self::Direct(kind) => write!(f, "{kind}_direct"),
            Self::Pearson(kind) => write!(f, "{kind}_pearson"),
        }
    }
}

impl FromStr for GridDivergence {
    type Err = RewardError;

    /// Accepts `npec`, `asymmetric`, `symmetric`, `symmetric_min` and
    /// `<canonical kind>[_canonical]_direct|_pearson`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "npec" => return Ok(Self::Npec),
            "asymmetric" => return Ok(Self::Asymmetric),
            "symmetric" => return Ok(Self::Symmetric(SymmetricAggregation::Mean)),
            "symmetric_min" => return Ok(Self::Symmetric(SymmetricAggregation::Min)),
            _ => {}
        }
        let (canon, direct) = if let Some(canon) = s.strip_suffix("_direct") {
            (canon, true)
        } else if let Some(canon) = s.strip_suffix("_pearson") {
            (canon, false)
        } else {
            return Err(RewardError::unknown_kind("divergence_kind", s));
        };
        let canon = canon.strip_suffix("_canonical").unwrap_or(canon);
        let kind = canon
            .parse::<DeshapeKind>()
            .map_err(|_| RewardError::unknown_kind("divergence_kind", s))?;
        Ok(if direct { Self::Direct(kind) } else { Self::Pearson(kind) })
    }
}

/// Options for [`compute_divergence`] beyond the divergence kind
#[derive(Debug, Clone, Default)]
pub struct DivergenceOptions {
    /// Fitter settings for the NPEC kinds
    pub npec: NpecConfig,
    /// Fixed-point settings for canonicalization
    pub fixed_point: FixedPointConfig,
    /// Direct distance exponent and scale
    pub direct: DirectDistance,
}

impl DivergenceOptions {
    /// Budget used for gridworld heatmaps
    #[must_use]
    pub fn gridworld() -> Self {
        Self {
            npec: NpecConfig {
                n_iter: 1000,
                ..NpecConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Divergence between every pair of rewards, skipping the zero reward as a target
#[instrument(skip(rewards, options, kind), fields(n_rewards = rewards.len(), kind = %kind))]
pub fn compute_divergence(
    rewards: &IndexMap<String, GridworldReward>,
    discount: f64,
    kind: GridDivergence,
    options: &DivergenceOptions,
) -> Result<DissimilarityMatrix> {
    let tensors = rewards
        .iter()
        .map(|(name, cfg)| {
            let (xlen, ylen) = cfg.dims();
            let reward = make_reward(cfg, discount)?;
            let dist = build_dist(&reward, xlen, ylen)?;
            Ok((RewardCfg::new(name.as_str(), GRIDWORLD_PATH), (reward, dist)))
        })
        .collect::<Result<IndexMap<_, _>>>()?;
    let targets: IndexMap<_, _> = tensors
        .iter()
        .filter(|(cfg, _)| cfg.kind != ZERO_KEY)
        .map(|(cfg, v)| (cfg.clone(), v.clone()))
        .collect();

    let entries = cross_distance(&tensors, &targets, |(src, dist), (target, _)| {
        let value = match kind {
            GridDivergence::Npec => npec_distance(src, target, dist, discount, &options.npec)?,
            GridDivergence::Asymmetric => asymmetric_distance(src, target, dist, discount, &options.npec)?,
            GridDivergence::Symmetric(aggregation) => {
                let npec = NpecConfig {
                    symmetric_aggregation: aggregation,
                    ..options.npec.clone()
                };
                symmetric_distance(src, target, dist, discount, &npec)?
            }
            GridDivergence::Direct(canon) => {
                canonical_reward_distance(src, target, dist, discount, canon, &options.fixed_point, &options.direct)?
            }
            GridDivergence::Pearson(canon) => {
                deshape_pearson_distance(src, target, dist, discount, canon, &options.fixed_point)?
            }
        };
        debug!(value, "gridworld divergence");
        Ok(value)
    })?;
    info!(pairs = entries.len(), "computed gridworld divergence");
    DissimilarityMatrix::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_state_to_3d_tiles() {
        let tiled = state_to_3d(array![1.0, 2.0].view(), 2, 3).unwrap();
        assert_eq!(tiled.dim(), (2, 3, 2));
        assert!(tiled.index_axis(ndarray::Axis(0), 1).iter().all(|&r| r == 2.0));
        assert!(state_to_3d(array![1.0].view(), 2, 3).is_err());
    }

    #[test]
    fn test_transitions_are_deterministic() {
        let t = build_transitions(2, 3, N_ACTIONS).unwrap();
        for s in 0..6 {
            for a in 0..N_ACTIONS {
                assert_abs_diff_eq!(t.slice(ndarray::s![s, a, ..]).sum(), 1.0);
            }
        }
        // right from the top-left corner
        assert_eq!(t[[0, 4, 1]], 1.0);
        // up from the top row stays put
        assert_eq!(t[[2, 1, 2]], 1.0);
        assert!(build_transitions(2, 2, 4).is_err());
    }

    #[test]
    fn test_make_reward_applies_potential() {
        let rewards = gridworld_rewards();
        let dense = make_reward(&rewards["dense_goal"], 0.9).unwrap();
        // from state 7 (2, 1) moving right into the goal (state 8)
        assert_abs_diff_eq!(dense.view()[[7, 4, 8]], 0.0 + 0.9 * 0.0 - (-1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_divergence_kind_parsing() {
        assert_eq!("npec".parse::<GridDivergence>().unwrap(), GridDivergence::Npec);
        assert_eq!(
            "symmetric_min".parse::<GridDivergence>().unwrap(),
            GridDivergence::Symmetric(SymmetricAggregation::Min)
        );
        assert_eq!(
            "fully_connected_random_canonical_direct".parse::<GridDivergence>().unwrap(),
            GridDivergence::Direct(DeshapeKind::FullyConnectedRandom)
        );
        assert_eq!(
            "singleton_pearson".parse::<GridDivergence>().unwrap(),
            GridDivergence::Pearson(DeshapeKind::Singleton)
        );
        assert!("bogus_direct".parse::<GridDivergence>().is_err());
        assert!("euclid".parse::<GridDivergence>().is_err());
    }

    #[test]
    fn test_shaped_rewards_have_zero_pearson_divergence() {
        let mut rewards = gridworld_rewards();
        rewards.retain(|k, _| ["sparse_goal", "dense_goal", "transformed_goal", ZERO_KEY].contains(&k.as_str()));
        let kind = GridDivergence::Pearson(DeshapeKind::FullyConnectedRandom);
        let matrix = compute_divergence(&rewards, 0.99, kind, &DivergenceOptions::default()).unwrap();
        // zero is a source but never a target
        assert_eq!(matrix.len(), 4 * 3);
        let sparse = RewardCfg::new("sparse_goal", GRIDWORLD_PATH);
        for other in ["dense_goal", "transformed_goal"] {
            let d = matrix.get(&sparse, &RewardCfg::new(other, GRIDWORLD_PATH)).unwrap();
            assert_abs_diff_eq!(d.value, 0.0, epsilon = 1e-6);
        }
        let center = RewardCfg::new("center_goal", GRIDWORLD_PATH);
        assert!(matrix.get(&center, &sparse).is_none());
    }
}
