//! Equivalence-class fitting for reward functions
//!
//! This crate searches the family of affine transforms and potential shaping
//! for the map that brings one reward closest to another:
//! - Trainable tabular and MLP potentials
//! - Squared and Lp regression losses
//! - Adam and SGD over a flat parameter vector
//! - Tabular NPEC distances built on the fitter

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod fitter;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod npec;
pub mod optimizer;
pub mod potential;
pub mod schedule;

// Re-export the fitter
pub use fitter::{EquivalenceFitter, FitReport, FitterConfig};
pub use model::{AffineOptions, AffineParameters, EquivalenceFamily, EquivalenceModel};
pub use npec::{asymmetric_distance, npec_distance, npec_fit, symmetric_distance, NpecConfig, NpecFit};

// Re-export building blocks
pub use loss::LossKind;
pub use mlp::{Activation, MlpConfig, MlpPotential};
pub use optimizer::{Optimizer, OptimizerKind};
pub use potential::{build_potential, TabularPotentialParams, TrainablePotential};
pub use schedule::LearningRateSchedule;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AffineParameters, EquivalenceFamily, EquivalenceFitter, FitReport, FitterConfig, LossKind, NpecConfig,
    };
    pub use rewcmp_core::prelude::*;
}
