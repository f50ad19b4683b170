//! Observation and action spaces

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{RewardError, Result};

/// Space of observations or actions a reward model is defined over.
///
/// Values are always handled as flat `f64` rows. A discrete space stores the
/// element index in a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Space {
    /// Finite set `{0, .., n - 1}`
    Discrete {
        /// Number of elements
        n: usize,
    },
    /// Box of real vectors
    Box {
        /// Lower bounds for each flattened dimension
        low: Vec<f64>,
        /// Upper bounds for each flattened dimension
        high: Vec<f64>,
        /// Shape of a single element
        shape: Vec<usize>,
    },
}

impl Space {
    /// Create a discrete space with `n > 0` elements
    pub fn discrete(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(RewardError::invalid_config("space.n", "a discrete space needs at least one element"));
        }
        Ok(Self::Discrete { n })
    }

    /// Create a box space, checking bounds against the shape
    pub fn boxed(low: Vec<f64>, high: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let total_size: usize = shape.iter().product();
        if low.len() != total_size || high.len() != total_size {
            return Err(RewardError::DimensionMismatch {
                expected: total_size,
                actual: low.len().max(high.len()),
            });
        }
        if low.iter().zip(&high).any(|(l, h)| l > h) {
            return Err(RewardError::invalid_config("space.low", "lower bound exceeds upper bound"));
        }
        Ok(Self::Box { low, high, shape })
    }

    /// Box space with identical bounds in every dimension
    pub fn uniform_box(low: f64, high: f64, dim: usize) -> Result<Self> {
        Self::boxed(vec![low; dim], vec![high; dim], vec![dim])
    }

    /// Number of columns one element occupies in a batch
    #[must_use]
    pub fn flat_dim(&self) -> usize {
        match self {
            Self::Discrete { .. } => 1,
            Self::Box { shape, .. } => shape.iter().product(),
        }
    }

    /// Number of elements, if finite
    #[must_use]
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            Self::Discrete { n } => Some(*n),
            Self::Box { .. } => None,
        }
    }

    /// Check if a flat row is a member of the space
    #[must_use]
    pub fn contains(&self, row: &[f64]) -> bool {
        match self {
            Self::Discrete { n } => {
                row.len() == 1 && row[0] >= 0.0 && row[0].fract() == 0.0 && (row[0] as usize) < *n
            }
            Self::Box { low, high, .. } => {
                row.len() == low.len()
                    && row
                        .iter()
                        .zip(low)
                        .zip(high)
                        .all(|((x, l), h)| x >= l && x <= h)
            }
        }
    }

    /// Sample `n` elements uniformly; unbounded box dimensions use a standard normal.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f64> {
        match self {
            Self::Discrete { n: size } => {
                Array2::from_shape_fn((n, 1), |_| rng.gen_range(0..*size) as f64)
            }
            Self::Box { low, high, .. } => {
                use rand_distr::{Distribution, StandardNormal};
                Array2::from_shape_fn((n, low.len()), |(_, j)| {
                    let (l, h) = (low[j], high[j]);
                    if l.is_finite() && h.is_finite() {
                        if l == h {
                            l
                        } else {
                            rng.gen_range(l..h)
                        }
                    } else {
                        let z: f64 = StandardNormal.sample(rng);
                        z.clamp(l, h)
                    }
                })
            }
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discrete { n } => write!(f, "Discrete({n})"),
            Self::Box { shape, .. } => write!(f, "Box{shape:?}"),
        }
    }
}

/// Check that two spaces are equal, naming `what` in the error
pub fn ensure_same_space(what: &str, expected: &Space, actual: &Space) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RewardError::SpaceMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
