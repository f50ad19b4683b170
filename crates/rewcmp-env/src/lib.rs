//! Environments and comparison pipelines for rewcmp
//!
//! This crate provides:
//! - Gridworld rewards and tabular divergence helpers
//! - Point mass dynamics and rewards
//! - Batch sources over spaces, dynamics and datasets
//! - A registry loading rewards by type tag
//! - Sample, mesh and NPEC comparison pipelines

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod comparison;
pub mod gridworld;
pub mod point_mass;
pub mod registry;
pub mod sources;

// Re-export pipelines
pub use comparison::{
    compare_rewards, compare_rewards_fitted, init_tracing, load_models, mesh_canon, npec_comparison,
    npec_comparison_parallel, npec_dissimilarity, output_dir, sample_canon, RewardModels, SourceFactory, ZERO_KIND,
};
pub use gridworld::{compute_divergence, gridworld_rewards, DivergenceOptions, GridDivergence, GridworldReward};
pub use point_mass::{GoalSeekingPolicy, PointMass, PointMassConfig};
pub use registry::{list_rewards, load_reward, register_reward, RewardRegistry};
pub use sources::{
    Dynamics, EpisodicDynamics, FiniteDataset, IidSource, Policy, PolicyRollouts, RandomPolicy, RandomTransitions,
    SpaceSampler, TransitionField, TransitionSampleDist,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        compare_rewards, compute_divergence, gridworld_rewards, load_reward, Dynamics, GridDivergence, PointMass,
        RandomTransitions,
    };
    pub use rewcmp_fit::prelude::*;
}
