//! End-to-end comparisons over the point mass rewards

use approx::assert_abs_diff_eq;
use rewcmp_core::{BatchSource, ComparisonConfig, DistanceKind, RewardCfg, RewardError};
use rewcmp_env::sources::{Dynamics, FiniteDataset, RandomTransitions, SpaceSampler};
use rewcmp_env::{compare_rewards, load_models, sample_canon, PointMass, PointMassConfig};
use std::sync::Arc;

fn dynamics() -> Arc<PointMass> {
    Arc::new(PointMass::new(PointMassConfig::default()).unwrap())
}

fn cfg(kind: &str) -> RewardCfg {
    RewardCfg::new(kind, "dummy")
}

// undiscounted shaping cancels exactly when S and S' share draws
fn undiscounted(distance_kind: DistanceKind) -> ComparisonConfig {
    ComparisonConfig {
        discount: 1.0,
        distance_kind,
        ..ComparisonConfig::quick()
    }
}

#[test]
fn test_dense_equivalent_to_sparse_under_pearson() {
    let cfgs = [cfg("rewcmp/PointMassSparse-v0"), cfg("rewcmp/PointMassDense-v0")];
    let matrix = compare_rewards(&cfgs, dynamics(), &undiscounted(DistanceKind::Pearson)).unwrap();
    let d = matrix.get(&cfgs[0], &cfgs[1]).unwrap();
    assert!(!d.flagged);
    assert_abs_diff_eq!(d.value, 0.0, epsilon = 1e-6);
}

#[test]
fn test_dense_equivalent_to_sparse_under_direct() {
    let cfgs = [cfg("rewcmp/PointMassSparse-v0"), cfg("rewcmp/PointMassDense-v0")];
    let matrix = compare_rewards(&cfgs, dynamics(), &undiscounted(DistanceKind::Direct)).unwrap();
    assert_abs_diff_eq!(matrix.get(&cfgs[1], &cfgs[0]).unwrap().value, 0.0, epsilon = 1e-6);
}

#[test]
fn test_ground_truth_differs_from_sparse() {
    let cfgs = [cfg("rewcmp/PointMassSparse-v0"), cfg("rewcmp/PointMassGroundTruth-v0")];
    let matrix = compare_rewards(&cfgs, dynamics(), &undiscounted(DistanceKind::Pearson)).unwrap();
    assert!(matrix.get(&cfgs[0], &cfgs[1]).unwrap().value > 1e-3);
}

#[test]
fn test_exhausted_dataset_error_propagates() {
    let env = dynamics();
    let config = ComparisonConfig::quick();
    let models = load_models(
        &[cfg("rewcmp/PointMassSparse-v0")],
        env.observation_space(),
        env.action_space(),
        &config,
    )
    .unwrap();
    let data = RandomTransitions::from_spaces(env.clone(), 0).sample_batch(8).unwrap();
    let mut dataset = FiniteDataset::new(data);
    let mut obs_dist = SpaceSampler::new(env.observation_space().clone(), 1);
    let mut act_dist = SpaceSampler::new(env.action_space().clone(), 2);
    let result = sample_canon(&models, &mut dataset, &mut obs_dist, &mut act_dist, &config);
    assert!(matches!(result, Err(RewardError::Other(_))));
}
