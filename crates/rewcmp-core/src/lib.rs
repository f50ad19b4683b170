//! Reward canonicalization and distance engine
//!
//! This crate removes potential shaping from reward functions, exactly on
//! finite MDPs and approximately by sampling on continuous ones, and compares
//! the canonical forms with direct, Pearson and fitted distances.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod batch;
pub mod canon;
pub mod config;
pub mod dissimilarity;
pub mod distance;
pub mod error;
pub mod reward;
pub mod space;
pub mod tabular;

// Re-export core traits and types
pub use batch::{BatchSource, SampleDist, TransitionBatch};
pub use canon::{
    canonicalize, discrete_iid_evaluate_models, mesh_canonicalize, sample_canon_shaping, CanonicalReward,
    DeshapeKind, FixedPointConfig,
};
pub use config::{ComparisonConfig, ComputationKind};
pub use dissimilarity::{Dissimilarity, DissimilarityMatrix, DissimilarityRecord, RewardCfg};
pub use distance::{
    canonical_reward_distance, cross_distance, cross_distance_parallel, deshape_pearson_distance, direct_distance,
    pearson_distance, DirectDistance, DistanceKind, SymmetricAggregation,
};
pub use error::{Result, RewardError};
pub use reward::{
    evaluate_models, ConstantReward, FnPotential, FnReward, LinearCombination, Potential, RewardModel, RewardNode,
    TabularPotential, ZeroReward,
};
pub use space::Space;
pub use tabular::{shape, tabulate, RewardTensor, TabularReward, TransitionDistribution};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BatchSource, CanonicalReward, ComparisonConfig, DeshapeKind, DistanceKind, Potential, Result, RewardError,
        RewardModel, RewardNode, RewardTensor, SampleDist, Space, TransitionBatch, TransitionDistribution,
    };
}
