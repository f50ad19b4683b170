//! Canonicalization: removing potential shaping from a reward
//!
//! The tabular canonicalizers are exact on finite MDPs. The sampled
//! canonicalizer estimates the same quantity by Monte Carlo and the mesh
//! variant discretizes a continuous problem before applying the tabular one.

mod sample;
mod tabular;

pub use sample::{discrete_iid_evaluate_models, mesh_canonicalize, sample_canon_shaping, MeshEvaluation};
pub use tabular::{canonicalize, direct_potential, fixed_point_potential, CanonicalReward};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{RewardError, Result};

/// Policy choosing the per-state baseline removed during canonicalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeshapeKind {
    /// Pin each state's potential to a single anchor transition `(s, a*, s*)`
    Singleton,
    /// Average the reward over actions and next states under the reference distribution
    FullyConnectedRandom,
    /// Take the best action's expected reward as each state's baseline
    FullyConnectedGreedy,
}

impl DeshapeKind {
    /// All policies, in a fixed order
    pub const ALL: [Self; 3] = [Self::Singleton, Self::FullyConnectedRandom, Self::FullyConnectedGreedy];

    /// Configuration string for this policy
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Singleton => "singleton",
            Self::FullyConnectedRandom => "fully_connected_random",
            Self::FullyConnectedGreedy => "fully_connected_greedy",
        }
    }
}

impl fmt::Display for DeshapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeshapeKind {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RewardError::unknown_kind("canonical_kind", s))
    }
}

/// Controls for the fixed-point potential solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPointConfig {
    /// Iteration cap
    pub n_iter: usize,
    /// Stop once the sup-norm of an update falls below this
    pub tolerance: f64,
    /// Anchor action `a*` for the singleton policy
    #[serde(default)]
    pub anchor_action: usize,
    /// Anchor next state `s*` for the singleton policy
    #[serde(default)]
    pub anchor_next_state: usize,
}

impl Default for FixedPointConfig {
    fn default() -> Self {
        Self {
            n_iter: 10_000,
            tolerance: 1e-12,
            anchor_action: 0,
            anchor_next_state: 0,
        }
    }
}

impl FixedPointConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.n_iter == 0 {
            return Err(RewardError::invalid_config("fixed_point.n_iter", "must be positive"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(RewardError::invalid_config(
                "fixed_point.tolerance",
                "must be a positive finite number",
            ));
        }
        Ok(())
    }

    /// Iterations a contraction with rate `discount` needs to shrink an update below `tolerance`
    #[must_use]
    pub fn iterations_needed(&self, discount: f64) -> usize {
        if discount <= 0.0 {
            return 1;
        }
        if discount >= 1.0 {
            return usize::MAX;
        }
        let needed = (self.tolerance.ln() / discount.ln()).ceil();
        if needed >= usize::MAX as f64 {
            usize::MAX
        } else {
            (needed as usize).max(1)
        }
    }
}

/// Check a discount factor lies in `[0, 1]`
pub fn validate_discount(discount: f64) -> Result<()> {
    if (0.0..=1.0).contains(&discount) {
        Ok(())
    } else {
        Err(RewardError::invalid_config("discount", format!("{discount} is outside [0, 1]")))
    }
}
