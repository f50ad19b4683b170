//! NPEC distances on tabular rewards
//!
//! The distance from a source to a target is the smallest weighted Lp
//! residual the equivalence fitter reaches when mapping the source onto the
//! target over every enumerated transition.

use ndarray::Array1;
use rewcmp_core::dissimilarity::NORMALIZE_EPS;
use rewcmp_core::distance::weighted_norm;
use rewcmp_core::tabular::enumerate_transitions;
use rewcmp_core::{Result, RewardError, RewardModel, RewardTensor, SymmetricAggregation, TabularReward, TransitionDistribution};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::fitter::{EquivalenceFitter, FitReport, FitterConfig};
use crate::loss::LossKind;
use crate::model::EquivalenceFamily;
use crate::optimizer::OptimizerKind;

/// Tabular NPEC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpecConfig {
    /// Gradient steps per fit
    pub n_iter: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Final learning rate as a fraction of the initial one
    pub lr_final_fraction: f64,
    /// Exponent of the loss and of the reported residual norm
    pub p: f64,
    /// Transformation family
    pub family: EquivalenceFamily,
    /// Match moments before optimizing
    pub pretrain: bool,
    /// How `symmetric` combines both directions
    pub symmetric_aggregation: SymmetricAggregation,
    /// Seed for potential initialization
    pub seed: u64,
}

impl Default for NpecConfig {
    fn default() -> Self {
        Self {
            n_iter: 10_000,
            learning_rate: 1e-2,
            lr_final_fraction: 0.1,
            p: 2.0,
            family: EquivalenceFamily::AffinePotential,
            pretrain: true,
            symmetric_aggregation: SymmetricAggregation::Mean,
            seed: 0,
        }
    }
}

impl NpecConfig {
    /// Equivalent fitter configuration for a discount
    #[must_use]
    pub fn fitter_config(&self, discount: f64) -> FitterConfig {
        let loss = if (self.p - 2.0).abs() < f64::EPSILON {
            LossKind::Squared
        } else {
            LossKind::Ellp { p: self.p }
        };
        FitterConfig {
            family: self.family,
            loss,
            optimizer: OptimizerKind::Adam,
            learning_rate: self.learning_rate,
            lr_final_fraction: self.lr_final_fraction,
            total_timesteps: self.n_iter,
            batch_size: 1,
            affine_size: self.pretrain.then_some(1),
            discount,
            seed: self.seed,
            ..FitterConfig::default()
        }
    }
}

/// Fitted NPEC distance and the run that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpecFit {
    /// Weighted Lp residual of the best fit
    pub distance: f64,
    /// Fitting run
    pub report: FitReport,
}

/// Fit `source` onto `target` over every transition weighted by `dist`
#[instrument(skip(source, target, dist, config), fields(n_states = source.n_states(), family = %config.family))]
pub fn npec_fit(
    source: &RewardTensor,
    target: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    config: &NpecConfig,
) -> Result<NpecFit> {
    source.ensure_same_shape(target)?;
    dist.ensure_matches(source)?;

    let batch = enumerate_transitions(source.n_states(), source.n_actions())?;
    let weights = dist.flat_weights();
    let source_model: Arc<dyn RewardModel> = Arc::new(TabularReward::new(source.clone()));
    let target_model: Arc<dyn RewardModel> = Arc::new(TabularReward::new(target.clone()));

    let mut fitter = EquivalenceFitter::new(source_model, target_model, config.fitter_config(discount))?;
    let report = fitter.fit_weighted(&batch, weights.view(), config.n_iter)?;

    let model = fitter.model();
    let source_values = model.evaluate_source(&batch)?;
    let fitted = model.transform(&batch, source_values.view())?;
    let target_values: Array1<f64> = target.view().iter().copied().collect();
    let distance = weighted_norm((&fitted - &target_values).view(), Some(weights.view()), config.p)?;
    debug!(distance, steps = report.steps, "npec fit");
    Ok(NpecFit { distance, report })
}

/// NPEC distance from `source` to `target`
pub fn npec_distance(
    source: &RewardTensor,
    target: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    config: &NpecConfig,
) -> Result<f64> {
    Ok(npec_fit(source, target, dist, discount, config)?.distance)
}

/// NPEC distance normalized by the distance from the zero reward to `target`
pub fn asymmetric_distance(
    source: &RewardTensor,
    target: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    config: &NpecConfig,
) -> Result<f64> {
    let zero = RewardTensor::zeros(target.n_states(), target.n_actions())?;
    let numerator = npec_distance(source, target, dist, discount, config)?;
    let denominator = npec_distance(&zero, target, dist, discount, config)?;
    if denominator < NORMALIZE_EPS {
        warn!(denominator, "target is equivalent to the zero reward, flooring normalization");
    }
    let value = numerator / denominator.max(NORMALIZE_EPS);
    if !value.is_finite() {
        return Err(RewardError::NonFinite {
            context: "asymmetric npec distance".to_string(),
        });
    }
    Ok(value)
}

/// Both directions of [`asymmetric_distance`] combined by the configured aggregation
pub fn symmetric_distance(
    a: &RewardTensor,
    b: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    config: &NpecConfig,
) -> Result<f64> {
    let forward = asymmetric_distance(a, b, dist, discount, config)?;
    let backward = asymmetric_distance(b, a, dist, discount, config)?;
    Ok(config.symmetric_aggregation.combine(forward, backward))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rewcmp_core::shape;

    fn reward(seed: u64) -> RewardTensor {
        let mut rng = StdRng::seed_from_u64(seed);
        RewardTensor::new(Array3::from_shape_fn((3, 2, 3), |_| rng.gen_range(-3.0..3.0))).unwrap()
    }

    fn quick() -> NpecConfig {
        NpecConfig {
            n_iter: 4000,
            learning_rate: 0.05,
            ..NpecConfig::default()
        }
    }

    #[test]
    fn test_self_distance_near_zero() {
        let r = reward(0);
        let dist = TransitionDistribution::uniform(3, 2);
        let d = npec_distance(&r, &r, &dist, 0.9, &quick()).unwrap();
        assert!(d < 0.05, "{d}");
    }

    #[test]
    fn test_equivalent_reward_near_zero() {
        let r = reward(1);
        let target = shape(&r.affine(2.0, -1.0), array![1.0, 0.0, -2.0].view(), 0.9).unwrap();
        let dist = TransitionDistribution::uniform(3, 2);
        let fit = npec_fit(&r, &target, &dist, 0.9, &quick()).unwrap();
        assert!(fit.distance < 0.05, "{}", fit.distance);
        assert_abs_diff_eq!(fit.report.affine.scale, 2.0, epsilon = 0.05);
    }

    #[test]
    fn test_negation_bounded_away_from_zero_for_affine_only() {
        let r = reward(2);
        let dist = TransitionDistribution::uniform(3, 2);
        let config = NpecConfig {
            family: EquivalenceFamily::AffineOnly,
            ..quick()
        };
        let d = npec_distance(&r, &r.affine(-1.0, 0.0), &dist, 0.9, &config).unwrap();
        // best non-negative scale is zero, leaving the target's spread
        let values: Array1<f64> = r.view().iter().copied().collect();
        let centered = &values - values.mean().unwrap_or(0.0);
        let spread = weighted_norm(centered.view(), None, 2.0).unwrap();
        assert!(d > 0.9 * spread, "{d} vs {spread}");
    }

    #[test]
    fn test_symmetric_bounds() {
        let a = reward(3);
        let b = reward(4);
        let dist = TransitionDistribution::uniform(3, 2);
        let config = NpecConfig {
            n_iter: 300,
            ..quick()
        };
        let forward = asymmetric_distance(&a, &b, &dist, 0.9, &config).unwrap();
        let backward = asymmetric_distance(&b, &a, &dist, 0.9, &config).unwrap();
        let mean = symmetric_distance(&a, &b, &dist, 0.9, &config).unwrap();
        let min = symmetric_distance(
            &a,
            &b,
            &dist,
            0.9,
            &NpecConfig {
                symmetric_aggregation: SymmetricAggregation::Min,
                ..config.clone()
            },
        )
        .unwrap();
        assert!(min <= mean + 1e-12);
        assert!(mean <= forward.max(backward) + 1e-12);
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let dist = TransitionDistribution::uniform(3, 2);
        let other = RewardTensor::zeros(2, 2).unwrap();
        assert!(npec_distance(&reward(0), &other, &dist, 0.9, &quick()).is_err());
    }
}
