//! Comparison configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::canon::{validate_discount, DeshapeKind, FixedPointConfig};
use crate::distance::{DirectDistance, DistanceKind};
use crate::{RewardError, Result};

/// How shaping is removed for continuous or large spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationKind {
    /// Monte Carlo estimate on a sampled batch
    Sample,
    /// Tabulate on a sampled mesh, then canonicalize exactly
    Mesh,
}

impl fmt::Display for ComputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sample => "sample",
            Self::Mesh => "mesh",
        })
    }
}

impl FromStr for ComputationKind {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sample" => Ok(Self::Sample),
            "mesh" => Ok(Self::Mesh),
            other => Err(RewardError::unknown_kind("computation_kind", other)),
        }
    }
}

/// Configuration for a canonicalized comparison run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Discount rate for shaping, in `[0, 1]`
    pub discount: f64,
    /// Distance applied after canonicalization
    pub distance_kind: DistanceKind,
    /// Deshaping policy for tabular and mesh canonicalization
    pub canonical_kind: DeshapeKind,
    /// Sample or mesh canonicalization
    pub computation_kind: ComputationKind,
    /// Norm exponent for direct distance
    pub direct_p: f64,
    /// Scale factor for direct distance
    pub direct_scale: f64,
    /// Transitions in the evaluation batch (sample)
    pub n_samples: usize,
    /// Draws used to estimate each conditional mean (sample)
    pub n_mean_samples: usize,
    /// Mesh observations (mesh)
    pub n_obs: usize,
    /// Mesh actions (mesh)
    pub n_act: usize,
    /// Seed for every sampler in the run
    pub seed: u64,
    /// Fixed-point solve controls
    pub fixed_point: FixedPointConfig,
    /// Leave out pairs whose target is the zero reward
    pub skip_zero_target: bool,
    /// Upper bound on concurrently computed pairs
    pub max_workers: usize,
    /// Prefix joined onto reward paths other than `dummy`
    pub data_root: Option<PathBuf>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            discount: 0.99,
            distance_kind: DistanceKind::Pearson,
            canonical_kind: DeshapeKind::FullyConnectedRandom,
            computation_kind: ComputationKind::Sample,
            direct_p: 1.0,
            direct_scale: 0.5,
            n_samples: 4096,
            n_mean_samples: 4096,
            n_obs: 256,
            n_act: 256,
            seed: 0,
            fixed_point: FixedPointConfig::default(),
            skip_zero_target: true,
            max_workers: 4,
            data_root: None,
        }
    }
}

impl ComparisonConfig {
    /// Small sample counts for tests and smoke runs
    #[must_use]
    pub fn quick() -> Self {
        Self {
            n_samples: 64,
            n_mean_samples: 64,
            n_obs: 16,
            n_act: 16,
            ..Self::default()
        }
    }

    /// Check every field, naming the first invalid one
    pub fn validate(&self) -> Result<()> {
        validate_discount(self.discount)?;
        self.direct()?;
        self.fixed_point.validate()?;
        if !self.distance_kind.requires_fit() {
            let counts = match self.computation_kind {
                ComputationKind::Sample => [("n_samples", self.n_samples), ("n_mean_samples", self.n_mean_samples)],
                ComputationKind::Mesh => [("n_obs", self.n_obs), ("n_act", self.n_act)],
            };
            for (field, value) in counts {
                if value == 0 {
                    return Err(RewardError::invalid_config(field, "must be positive"));
                }
            }
        }
        if self.max_workers == 0 {
            return Err(RewardError::invalid_config("max_workers", "must be positive"));
        }
        Ok(())
    }

    /// Direct distance built from `direct_p` and `direct_scale`
    pub fn direct(&self) -> Result<DirectDistance> {
        DirectDistance::new(self.direct_p, self.direct_scale)
    }

    /// Resolve a reward path against `data_root`
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> String {
        match &self.data_root {
            Some(root) if path != "dummy" => root.join(path).to_string_lossy().into_owned(),
            _ => path.to_string(),
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ComparisonConfig::default().validate().is_ok());
        assert!(ComparisonConfig::quick().validate().is_ok());
    }

    #[test]
    fn test_errors_name_the_field() {
        let config = ComparisonConfig {
            n_mean_samples: 0,
            ..ComparisonConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RewardError::InvalidConfig { ref field, .. } if field == "n_mean_samples"));

        let config = ComparisonConfig {
            discount: 1.5,
            ..ComparisonConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("discount"));
    }

    #[test]
    fn test_fit_kinds_skip_sample_counts() {
        let config = ComparisonConfig {
            distance_kind: DistanceKind::SymmetricMin,
            n_samples: 0,
            ..ComparisonConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_kind_in_json() {
        let err = serde_json::from_str::<ComparisonConfig>(r#"{"distance_kind": "cosine"}"#);
        assert!(err.is_err());
        let config: ComparisonConfig =
            serde_json::from_str(r#"{"distance_kind": "direct", "computation_kind": "mesh", "n_obs": 8}"#).unwrap();
        assert_eq!(config.distance_kind, DistanceKind::Direct);
        assert_eq!(config.n_obs, 8);
        assert_eq!(config.n_act, 256);
    }

    #[test]
    fn test_resolve_path() {
        let config = ComparisonConfig {
            data_root: Some(PathBuf::from("/data")),
            ..ComparisonConfig::default()
        };
        assert_eq!(config.resolve_path("dummy"), "dummy");
        assert_eq!(config.resolve_path("run/model"), "/data/run/model");
    }
}
