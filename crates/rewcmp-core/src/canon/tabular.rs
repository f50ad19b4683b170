//! Exact canonicalization of reward tensors

use ndarray::{Array1, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{validate_discount, DeshapeKind, FixedPointConfig};
use crate::tabular::{RewardTensor, TransitionDistribution};
use crate::{RewardError, Result};

/// Reward with the shaping component removed, plus diagnostics from the solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReward {
    /// Canonical tensor `R + discount * phi[s'] - phi[s]`
    pub tensor: RewardTensor,
    /// Potential that was subtracted
    pub potential: Array1<f64>,
    /// Policy used
    pub kind: DeshapeKind,
    /// Whether the fixed-point solve reached its tolerance
    pub converged: bool,
    /// Iterations performed
    pub iterations: usize,
    /// Sup-norm of the final update
    pub residual: f64,
}

/// Solve `phi = baseline + discount * <anchor, phi>` by fixed-point iteration.
///
/// The update is a contraction with rate `discount` when `discount < 1`.
/// The tolerance is relative to `max(1, |phi|_inf)`. Returns the potential,
/// whether it converged, the iteration count and the last residual.
#[must_use]
pub fn fixed_point_potential(
    baseline: ArrayView1<'_, f64>,
    anchor: ArrayView1<'_, f64>,
    discount: f64,
    config: &FixedPointConfig,
) -> (Array1<f64>, bool, usize, f64) {
    let mut phi = baseline.to_owned();
    let mut residual = f64::INFINITY;
    for iteration in 1..=config.n_iter {
        let offset = discount * anchor.dot(&phi);
        let next = &baseline + offset;
        residual = next
            .iter()
            .zip(phi.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        phi = next;
        let scale = phi.iter().map(|v| v.abs()).fold(1.0, f64::max);
        if residual <= config.tolerance * scale {
            return (phi, true, iteration, residual);
        }
    }
    (phi, false, config.n_iter, residual)
}

/// Closed-form solution of the same fixed point, `phi = baseline + c` with
/// `c = discount * <anchor, baseline> / (1 - discount * sum(anchor))`.
pub fn direct_potential(baseline: ArrayView1<'_, f64>, anchor: ArrayView1<'_, f64>, discount: f64) -> Result<Array1<f64>> {
    let denominator = 1.0 - discount * anchor.sum();
    if denominator <= 0.0 {
        return Err(RewardError::Computation(format!(
            "no fixed point at discount {discount} with anchor mass {}",
            anchor.sum()
        )));
    }
    let offset = discount * anchor.dot(&baseline) / denominator;
    Ok(&baseline + offset)
}

fn baseline(
    reward: &RewardTensor,
    state_dist: ArrayView1<'_, f64>,
    action_dist: ArrayView1<'_, f64>,
    kind: DeshapeKind,
    config: &FixedPointConfig,
) -> Result<(Array1<f64>, Array1<f64>)> {
    let r = reward.view();
    let (ns, na, _) = r.dim();
    // expected reward of (s, a) over next states
    let next_mean = |s: usize, a: usize| -> f64 { (0..ns).map(|s2| state_dist[s2] * r[[s, a, s2]]).sum() };

    match kind {
        DeshapeKind::Singleton => {
            if config.anchor_action >= na {
                return Err(RewardError::invalid_config(
                    "fixed_point.anchor_action",
                    format!("{} is not an action below {na}", config.anchor_action),
                ));
            }
            if config.anchor_next_state >= ns {
                return Err(RewardError::invalid_config(
                    "fixed_point.anchor_next_state",
                    format!("{} is not a state below {ns}", config.anchor_next_state),
                ));
            }
            let b = Array1::from_shape_fn(ns, |s| r[[s, config.anchor_action, config.anchor_next_state]]);
            let mut anchor = Array1::zeros(ns);
            anchor[config.anchor_next_state] = 1.0;
            Ok((b, anchor))
        }
        DeshapeKind::FullyConnectedRandom => {
            let b = Array1::from_shape_fn(ns, |s| (0..na).map(|a| action_dist[a] * next_mean(s, a)).sum());
            Ok((b, state_dist.to_owned()))
        }
        DeshapeKind::FullyConnectedGreedy => {
            let b = Array1::from_shape_fn(ns, |s| {
                (0..na).map(|a| next_mean(s, a)).fold(f64::NEG_INFINITY, f64::max)
            });
            Ok((b, state_dist.to_owned()))
        }
    }
}

/// Canonicalize a reward tensor under a reference distribution.
///
/// Rewards that differ only by potential shaping map to the same tensor.
/// When the contraction at `discount` cannot reach the tolerance within
/// `config.n_iter` iterations the potential is solved directly instead.
/// If the iteration still stops short the best estimate is returned with
/// `converged = false`.
#[instrument(skip(reward, dist, config), fields(n_states = reward.n_states(), n_actions = reward.n_actions()))]
pub fn canonicalize(
    reward: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    kind: DeshapeKind,
    config: &FixedPointConfig,
) -> Result<CanonicalReward> {
    validate_discount(discount)?;
    config.validate()?;
    dist.ensure_matches(reward)?;

    let state_dist = dist.state_marginal();
    let action_dist = dist.action_marginal();
    let (b, anchor) = baseline(reward, state_dist.view(), action_dist.view(), kind, config)?;

    let r = reward.view();
    let (ns, na, _) = r.dim();

    if discount >= 1.0 {
        // no fixed point exists; subtract the centering constant directly
        let center = anchor.dot(&b);
        let tensor = Array3::from_shape_fn((ns, na, ns), |(s, a, s2)| {
            r[[s, a, s2]] + discount * b[s2] - b[s] - discount * center
        });
        return Ok(CanonicalReward {
            tensor: RewardTensor::new(tensor)?,
            potential: b,
            kind,
            converged: true,
            iterations: 0,
            residual: 0.0,
        });
    }

    if config.iterations_needed(discount) > config.n_iter {
        let phi = direct_potential(b.view(), anchor.view(), discount)?;
        debug!(discount, n_iter = config.n_iter, "iteration cap too small for discount, solved directly");
        let tensor = Array3::from_shape_fn((ns, na, ns), |(s, a, s2)| r[[s, a, s2]] + discount * phi[s2] - phi[s]);
        return Ok(CanonicalReward {
            tensor: RewardTensor::new(tensor)?,
            potential: phi,
            kind,
            converged: true,
            iterations: 0,
            residual: 0.0,
        });
    }

    let (phi, converged, iterations, residual) = fixed_point_potential(b.view(), anchor.view(), discount, config);
    if converged {
        debug!(iterations, residual, "fixed point converged");
    } else {
        warn!(
            iterations,
            residual,
            kind = %kind,
            "fixed point did not converge, returning best estimate"
        );
    }

    let tensor = Array3::from_shape_fn((ns, na, ns), |(s, a, s2)| r[[s, a, s2]] + discount * phi[s2] - phi[s]);
    Ok(CanonicalReward {
        tensor: RewardTensor::new(tensor)?,
        potential: phi,
        kind,
        converged,
        iterations,
        residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabular::shape;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn goal_reward() -> RewardTensor {
        RewardTensor::new(Array3::from_shape_fn((3, 2, 3), |(s, a, s2)| {
            if s2 == 2 {
                1.0
            } else {
                0.1 * a as f64 - 0.2 * s as f64
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_shaping_removed_for_every_kind() {
        let reward = goal_reward();
        let shaped = shape(&reward, array![1.0, -4.0, 2.5].view(), 0.9).unwrap();
        let dist = TransitionDistribution::uniform(3, 2);
        for kind in DeshapeKind::ALL {
            let a = canonicalize(&reward, &dist, 0.9, kind, &FixedPointConfig::default()).unwrap();
            let b = canonicalize(&shaped, &dist, 0.9, kind, &FixedPointConfig::default()).unwrap();
            assert!(a.converged && b.converged, "{kind} did not converge");
            for (x, y) in a.tensor.view().iter().zip(b.tensor.view().iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_matches_closed_form() {
        let reward = goal_reward();
        let dist = TransitionDistribution::uniform(3, 2);
        let canon = canonicalize(
            &reward,
            &dist,
            0.5,
            DeshapeKind::FullyConnectedRandom,
            &FixedPointConfig::default(),
        )
        .unwrap();
        let r = reward.view();
        let b: Vec<f64> = (0..3)
            .map(|s| {
                let mut total = 0.0;
                for a in 0..2 {
                    for s2 in 0..3 {
                        total += r[[s, a, s2]];
                    }
                }
                total / 6.0
            })
            .collect();
        let mean_b = b.iter().sum::<f64>() / 3.0;
        let expected = r[[0, 1, 2]] + 0.5 * b[2] - b[0] - 0.5 * mean_b;
        assert_abs_diff_eq!(canon.tensor.view()[[0, 1, 2]], expected, epsilon = 1e-10);
    }

    #[test]
    fn test_undiscounted_uses_closed_form() {
        let reward = goal_reward();
        let shaped = shape(&reward, array![3.0, 0.0, -1.0].view(), 1.0).unwrap();
        let dist = TransitionDistribution::uniform(3, 2);
        let config = FixedPointConfig::default();
        let a = canonicalize(&reward, &dist, 1.0, DeshapeKind::FullyConnectedGreedy, &config).unwrap();
        let b = canonicalize(&shaped, &dist, 1.0, DeshapeKind::FullyConnectedGreedy, &config).unwrap();
        for (x, y) in a.tensor.view().iter().zip(b.tensor.view().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_iteration_cap_flags_result() {
        let b = array![1.0, -2.0, 0.5];
        let anchor = array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];
        let config = FixedPointConfig {
            n_iter: 1,
            ..FixedPointConfig::default()
        };
        let (phi, converged, iterations, residual) = fixed_point_potential(b.view(), anchor.view(), 0.99, &config);
        assert!(!converged);
        assert_eq!(iterations, 1);
        assert!(residual > 0.0 && phi.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_small_iteration_cap_solves_directly() {
        let reward = goal_reward();
        let dist = TransitionDistribution::uniform(3, 2);
        let capped = FixedPointConfig {
            n_iter: 1,
            ..FixedPointConfig::default()
        };
        let direct = canonicalize(&reward, &dist, 0.99, DeshapeKind::FullyConnectedRandom, &capped).unwrap();
        let iterated =
            canonicalize(&reward, &dist, 0.99, DeshapeKind::FullyConnectedRandom, &FixedPointConfig::default())
                .unwrap();
        assert!(direct.converged && iterated.converged);
        assert_eq!(direct.iterations, 0);
        for (x, y) in direct.tensor.view().iter().zip(iterated.tensor.view().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_shaping_removed_near_unit_discount() {
        let discount = 0.9999;
        let reward = goal_reward();
        let shaped = shape(&reward, array![1.0, -4.0, 2.5].view(), discount).unwrap();
        let dist = TransitionDistribution::uniform(3, 2);
        let config = FixedPointConfig::default();
        assert!(config.iterations_needed(discount) > config.n_iter);
        for kind in DeshapeKind::ALL {
            let a = canonicalize(&reward, &dist, discount, kind, &config).unwrap();
            let b = canonicalize(&shaped, &dist, discount, kind, &config).unwrap();
            assert!(a.converged && b.converged, "{kind} did not converge");
            for (x, y) in a.tensor.view().iter().zip(b.tensor.view().iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_direct_potential_is_fixed_point() {
        let b = array![1.0, -2.0, 0.5];
        let anchor = array![0.0, 1.0, 0.0];
        let phi = direct_potential(b.view(), anchor.view(), 0.9).unwrap();
        let offset = 0.9 * anchor.dot(&phi);
        for (p, base) in phi.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*p, base + offset, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_singleton_anchor_out_of_range() {
        let config = FixedPointConfig {
            anchor_action: 5,
            ..FixedPointConfig::default()
        };
        let err = canonicalize(
            &goal_reward(),
            &TransitionDistribution::uniform(3, 2),
            0.9,
            DeshapeKind::Singleton,
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("anchor_action"));
    }

    #[test]
    fn test_rejects_mismatched_distribution() {
        let result = canonicalize(
            &goal_reward(),
            &TransitionDistribution::uniform(2, 2),
            0.9,
            DeshapeKind::Singleton,
            &FixedPointConfig::default(),
        );
        assert!(result.is_err());
    }
}
