//! Sample-based and mesh canonicalization for large or continuous spaces

use indexmap::IndexMap;
use ndarray::{concatenate, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{canonicalize, validate_discount, CanonicalReward, DeshapeKind, FixedPointConfig};
use crate::batch::{SampleDist, TransitionBatch};
use crate::reward::{evaluate_models, RewardModel};
use crate::tabular::{RewardTensor, TransitionDistribution};
use crate::{RewardError, Result};

fn repeat_row(row: ArrayView1<'_, f64>, n: usize) -> Result<Array2<f64>> {
    row.broadcast((n, row.len()))
        .map(|v| v.to_owned())
        .ok_or_else(|| RewardError::Computation("failed to broadcast observation row".to_string()))
}

fn check_rows(what: &str, rows: &Array2<f64>, expected: usize) -> Result<()> {
    if rows.nrows() == expected {
        Ok(())
    } else {
        Err(RewardError::Computation(format!(
            "{what} distribution returned {} rows, requested {expected}",
            rows.nrows()
        )))
    }
}

/// Mean reward of each observation over the sampled `(action, next_obs)` pairs
fn mean_rewards<K>(
    models: &IndexMap<K, Arc<dyn RewardModel>>,
    obs: ArrayView2<'_, f64>,
    mean_acts: &Array2<f64>,
    mean_next_obs: &Array2<f64>,
) -> Result<IndexMap<K, Array1<f64>>>
where
    K: Clone + Eq + Hash + Debug,
{
    let m = mean_acts.nrows();
    let mut means: IndexMap<K, Array1<f64>> =
        models.keys().map(|k| (k.clone(), Array1::zeros(obs.nrows()))).collect();
    for (i, row) in obs.rows().into_iter().enumerate() {
        let batch = TransitionBatch::new(repeat_row(row, m)?, mean_acts.clone(), mean_next_obs.clone())?;
        let values = evaluate_models(models, &batch)?;
        for (key, v) in values {
            if let Some(out) = means.get_mut(&key) {
                out[i] = v.mean().unwrap_or(0.0);
            }
        }
    }
    Ok(means)
}

/// Canonicalize rewards on a batch by Monte Carlo estimation of the shaping term.
///
/// For each transition `(s, a, s')` returns
/// `R(s, a, s') + discount * E[R(s', A, S')] - E[R(s, A, S')] - discount * E[R(S, A, S')]`
/// with `A` drawn from `act_dist` and `S, S'` from `obs_dist`, each expectation
/// estimated from `n_mean_samples` draws. The same observation draws stand in
/// for both `S` and `S'`, so a shaping term cancels exactly on every call. The
/// estimator is consistent; its variance shrinks as `n_mean_samples` grows.
#[instrument(skip(models, batch, act_dist, obs_dist), fields(n_models = models.len(), n = batch.len()))]
pub fn sample_canon_shaping<K>(
    models: &IndexMap<K, Arc<dyn RewardModel>>,
    batch: &TransitionBatch,
    act_dist: &mut dyn SampleDist,
    obs_dist: &mut dyn SampleDist,
    n_mean_samples: usize,
    discount: f64,
) -> Result<IndexMap<K, Array1<f64>>>
where
    K: Clone + Eq + Hash + Debug,
{
    validate_discount(discount)?;
    if n_mean_samples == 0 {
        return Err(RewardError::invalid_config("n_mean_samples", "must be positive"));
    }
    let raw = evaluate_models(models, batch)?;

    let mean_acts = act_dist.sample_rows(n_mean_samples)?;
    check_rows("action", &mean_acts, n_mean_samples)?;
    let mean_next_obs = obs_dist.sample_rows(n_mean_samples)?;
    check_rows("observation", &mean_next_obs, n_mean_samples)?;

    // evaluate obs and next_obs together
    let all_obs = concatenate(Axis(0), &[batch.obs(), batch.next_obs()])
        .map_err(|e| RewardError::Computation(e.to_string()))?;
    let per_obs = mean_rewards(models, all_obs.view(), &mean_acts, &mean_next_obs)?;
    let per_sample = mean_rewards(models, mean_next_obs.view(), &mean_acts, &mean_next_obs)?;
    debug!(n_mean_samples, "estimated conditional means");

    let n = batch.len();
    let mut deshaped = IndexMap::with_capacity(raw.len());
    for (key, rew) in raw {
        let means = &per_obs[&key];
        let center = per_sample[&key].mean().unwrap_or(0.0);
        let src_mean = means.slice(ndarray::s![..n]);
        let dst_mean = means.slice(ndarray::s![n..]);
        let canon = &rew + &(&dst_mean * discount) - &src_mean - discount * center;
        deshaped.insert(key, canon);
    }
    Ok(deshaped)
}

/// Rewards tabulated on a sampled mesh of observations and actions
#[derive(Debug, Clone)]
pub struct MeshEvaluation<K: Eq + Hash> {
    /// Reward tensors, shape `(n_obs, n_act, n_obs)`
    pub rewards: IndexMap<K, RewardTensor>,
    /// Sampled observations, one per mesh state
    pub obs: Array2<f64>,
    /// Sampled actions, one per mesh action
    pub actions: Array2<f64>,
}

/// Sample `n_obs` observations and `n_act` actions i.i.d. and evaluate every
/// model on each `(obs_i, act_j, obs_k)` combination.
#[instrument(skip(models, obs_dist, act_dist), fields(n_models = models.len()))]
pub fn discrete_iid_evaluate_models<K>(
    models: &IndexMap<K, Arc<dyn RewardModel>>,
    obs_dist: &mut dyn SampleDist,
    act_dist: &mut dyn SampleDist,
    n_obs: usize,
    n_act: usize,
) -> Result<MeshEvaluation<K>>
where
    K: Clone + Eq + Hash + Debug,
{
    if n_obs == 0 {
        return Err(RewardError::invalid_config("n_obs", "must be positive"));
    }
    if n_act == 0 {
        return Err(RewardError::invalid_config("n_act", "must be positive"));
    }
    let obs = obs_dist.sample_rows(n_obs)?;
    check_rows("observation", &obs, n_obs)?;
    let actions = act_dist.sample_rows(n_act)?;
    check_rows("action", &actions, n_act)?;

    // rows for a fixed obs_i enumerate (act_j, obs_k) in row-major order
    let block = n_act * n_obs;
    let act_rows: Vec<usize> = (0..block).map(|r| r / n_obs).collect();
    let next_rows: Vec<usize> = (0..block).map(|r| r % n_obs).collect();
    let block_acts = actions.select(Axis(0), &act_rows);
    let block_next = obs.select(Axis(0), &next_rows);

    let mut flat: IndexMap<K, Vec<f64>> = models
        .keys()
        .map(|k| (k.clone(), Vec::with_capacity(n_obs * block)))
        .collect();
    for row in obs.rows() {
        let batch = TransitionBatch::new(repeat_row(row, block)?, block_acts.clone(), block_next.clone())?;
        for (key, values) in evaluate_models(models, &batch)? {
            if let Some(out) = flat.get_mut(&key) {
                out.extend(values.iter());
            }
        }
    }

    let rewards = flat
        .into_iter()
        .map(|(key, values)| {
            let tensor = Array3::from_shape_vec((n_obs, n_act, n_obs), values)
                .map_err(|e| RewardError::Computation(e.to_string()))?;
            Ok((key, RewardTensor::new(tensor)?))
        })
        .collect::<Result<IndexMap<_, _>>>()?;
    Ok(MeshEvaluation { rewards, obs, actions })
}

/// Evaluate models on a sampled mesh and canonicalize each tensor exactly
/// under the uniform distribution over the mesh.
#[allow(clippy::too_many_arguments)]
pub fn mesh_canonicalize<K>(
    models: &IndexMap<K, Arc<dyn RewardModel>>,
    obs_dist: &mut dyn SampleDist,
    act_dist: &mut dyn SampleDist,
    n_obs: usize,
    n_act: usize,
    discount: f64,
    kind: DeshapeKind,
    config: &FixedPointConfig,
) -> Result<IndexMap<K, CanonicalReward>>
where
    K: Clone + Eq + Hash + Debug,
{
    let mesh = discrete_iid_evaluate_models(models, obs_dist, act_dist, n_obs, n_act)?;
    let dist = TransitionDistribution::uniform(n_obs, n_act);
    mesh.rewards
        .into_iter()
        .map(|(key, tensor)| Ok((key, canonicalize(&tensor, &dist, discount, kind, config)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::{FnPotential, FnReward, RewardNode};
    use crate::space::Space;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn line_reward() -> Arc<dyn RewardModel> {
        let space = Space::uniform_box(-1.0, 1.0, 1).unwrap();
        Arc::new(FnReward::new(space.clone(), space, |o, a, n| n[0] - o[0] + 0.5 * a[0] * a[0]))
    }

    fn uniform_dist(seed: u64) -> impl SampleDist {
        let space = Space::uniform_box(-1.0, 1.0, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        move |n: usize| -> Result<Array2<f64>> { Ok(space.sample(n, &mut rng)) }
    }

    #[test]
    fn test_sample_canon_shaping_removes_potential() {
        let base = line_reward();
        let space = Space::uniform_box(-1.0, 1.0, 1).unwrap();
        let phi = Arc::new(FnPotential::new(space, |o| 3.0 * o[0] * o[0]));
        let shaped = RewardNode::identity(base.clone()).shaped(phi, 0.9).unwrap();
        let mut models: IndexMap<&str, Arc<dyn RewardModel>> = IndexMap::new();
        models.insert("base", base);
        models.insert("shaped", Arc::new(shaped));

        let batch_space = Space::uniform_box(-1.0, 1.0, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let batch = TransitionBatch::new(
            batch_space.sample(32, &mut rng),
            batch_space.sample(32, &mut rng),
            batch_space.sample(32, &mut rng),
        )
        .unwrap();

        // both models see the same mean samples
        let out = sample_canon_shaping(&models, &batch, &mut uniform_dist(7), &mut uniform_dist(8), 256, 0.9).unwrap();
        for (x, y) in out["base"].iter().zip(out["shaped"].iter()) {
            assert!((x - y).abs() < 1e-9, "{x} vs {y}");
        }
    }

    #[test]
    fn test_mesh_shapes() {
        let mut models: IndexMap<&str, Arc<dyn RewardModel>> = IndexMap::new();
        models.insert("line", line_reward());
        let mesh = discrete_iid_evaluate_models(&models, &mut uniform_dist(0), &mut uniform_dist(1), 4, 3).unwrap();
        let tensor = &mesh.rewards["line"];
        assert_eq!(tensor.view().dim(), (4, 3, 4));
        let (o, a, n) = (mesh.obs[[1, 0]], mesh.actions[[2, 0]], mesh.obs[[3, 0]]);
        assert!((tensor.view()[[1, 2, 3]] - (n - o + 0.5 * a * a)).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_short_distribution() {
        let mut models: IndexMap<&str, Arc<dyn RewardModel>> = IndexMap::new();
        models.insert("line", line_reward());
        let mut short = |_: usize| -> Result<Array2<f64>> { Ok(Array2::zeros((1, 1))) };
        assert!(discrete_iid_evaluate_models(&models, &mut short, &mut uniform_dist(1), 4, 3).is_err());
    }
}
