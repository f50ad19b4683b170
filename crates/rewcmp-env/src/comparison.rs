//! End-to-end comparison pipelines
//!
//! Each pipeline loads rewards by [`RewardCfg`], computes a distance for every
//! `(source, target)` pair and returns a [`DissimilarityMatrix`]. The direct
//! and Pearson kinds compare canonicalized rewards; the npec, asymmetric and
//! symmetric kinds fit an equivalence transform per pair.

use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1};
use rewcmp_core::distance::{normalize_reward, pearson_correlation};
use rewcmp_core::{
    cross_distance, cross_distance_parallel, mesh_canonicalize, sample_canon_shaping, BatchSource, ComparisonConfig,
    ComputationKind, Dissimilarity, DissimilarityMatrix, DistanceKind, Result, RewardCfg, RewardError, RewardModel,
    SampleDist, Space, SymmetricAggregation,
};
use rewcmp_fit::{EquivalenceFitter, FitterConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::registry::load_reward;
use crate::sources::{Dynamics, RandomTransitions, SpaceSampler};

/// Type tag of the built-in zero reward
pub const ZERO_KIND: &str = "rewcmp/Zero-v0";

/// Rewards keyed by their configuration
pub type RewardModels = IndexMap<RewardCfg, Arc<dyn RewardModel>>;

/// Factory for fresh batch sources, called once per fitted pair with the run seed
pub type SourceFactory = Arc<dyn Fn(u64) -> Box<dyn BatchSource> + Send + Sync>;

/// Install a global `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Create a fresh run directory `root/name/<timestamp>_<id>`
pub fn output_dir(root: &Path, name: &str) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    let dir = root.join(name).join(format!("{stamp}_{}", &id[..8]));
    std::fs::create_dir_all(&dir)?;
    info!(dir = %dir.display(), "created output directory");
    Ok(dir)
}

/// Load every reward through the global registry
pub fn load_models(cfgs: &[RewardCfg], obs_space: &Space, act_space: &Space, config: &ComparisonConfig) -> Result<RewardModels> {
    cfgs.iter()
        .map(|cfg| {
            let path = config.resolve_path(&cfg.path);
            let model = load_reward(&cfg.kind, &path, obs_space, act_space, config.discount)?;
            Ok((cfg.clone(), model))
        })
        .collect()
}

/// Every entry of `items` except the zero reward when `skip_zero_target` is set
fn comparison_targets<V: Clone>(items: &IndexMap<RewardCfg, V>, skip_zero_target: bool) -> IndexMap<RewardCfg, V> {
    items
        .iter()
        .filter(|(cfg, _)| !(skip_zero_target && cfg.kind == ZERO_KIND))
        .map(|(cfg, v)| (cfg.clone(), v.clone()))
        .collect()
}

fn ensure_canonical_kind(config: &ComparisonConfig) -> Result<()> {
    if config.distance_kind.requires_fit() {
        return Err(RewardError::invalid_config(
            "distance_kind",
            format!("{} requires an equivalence fit, use compare_rewards_fitted", config.distance_kind),
        ));
    }
    Ok(())
}

fn pair_dissimilarity(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    config: &ComparisonConfig,
) -> Result<Dissimilarity> {
    match config.distance_kind {
        DistanceKind::Direct => {
            let direct = config.direct()?;
            let na = normalize_reward(a, weights, direct.p)?;
            let nb = normalize_reward(b, weights, direct.p)?;
            Ok(direct.distance(na.view(), nb.view(), weights)?.into())
        }
        DistanceKind::Pearson => Ok(match pearson_correlation(a, b, weights)? {
            Some(rho) => (1.0 - rho).into(),
            None => {
                warn!("zero variance canonical reward, reporting pearson distance 1");
                Dissimilarity {
                    value: 1.0,
                    flagged: true,
                }
            }
        }),
        other => Err(RewardError::invalid_config(
            "distance_kind",
            format!("{other} requires an equivalence fit, use compare_rewards_fitted"),
        )),
    }
}

fn canonical_matrix(canon: &IndexMap<RewardCfg, Array1<f64>>, config: &ComparisonConfig) -> Result<DissimilarityMatrix> {
    let targets = comparison_targets(canon, config.skip_zero_target);
    let entries = cross_distance(canon, &targets, |src, tgt| {
        pair_dissimilarity(src.view(), tgt.view(), None, config)
    })?;
    DissimilarityMatrix::from_entries(entries)
}

/// Monte Carlo canonicalization on a batch of `n_samples` transitions, then
/// direct or Pearson distance between every pair
#[instrument(skip_all, fields(n_models = models.len(), kind = %config.distance_kind))]
pub fn sample_canon(
    models: &RewardModels,
    batch_source: &mut dyn BatchSource,
    obs_dist: &mut dyn SampleDist,
    act_dist: &mut dyn SampleDist,
    config: &ComparisonConfig,
) -> Result<DissimilarityMatrix> {
    config.validate()?;
    ensure_canonical_kind(config)?;
    let batch = batch_source.sample_batch(config.n_samples)?;
    let canon = sample_canon_shaping(models, &batch, act_dist, obs_dist, config.n_mean_samples, config.discount)?;
    let matrix = canonical_matrix(&canon, config)?;
    info!(pairs = matrix.len(), "sample canonicalization complete");
    Ok(matrix)
}

/// Tabulate rewards on a sampled mesh, canonicalize exactly and compare
#[instrument(skip_all, fields(n_models = models.len(), kind = %config.distance_kind))]
pub fn mesh_canon(
    models: &RewardModels,
    obs_dist: &mut dyn SampleDist,
    act_dist: &mut dyn SampleDist,
    config: &ComparisonConfig,
) -> Result<DissimilarityMatrix> {
    config.validate()?;
    ensure_canonical_kind(config)?;
    let canonical = mesh_canonicalize(
        models,
        obs_dist,
        act_dist,
        config.n_obs,
        config.n_act,
        config.discount,
        config.canonical_kind,
        &config.fixed_point,
    )?;
    let mut flat = IndexMap::with_capacity(canonical.len());
    for (cfg, canon) in canonical {
        if !canon.converged {
            warn!(reward = %cfg, residual = canon.residual, "mesh canonicalization did not converge");
        }
        flat.insert(cfg, canon.tensor.view().iter().copied().collect::<Array1<f64>>());
    }
    let matrix = canonical_matrix(&flat, config)?;
    info!(pairs = matrix.len(), "mesh canonicalization complete");
    Ok(matrix)
}

/// Canonicalized comparison of registry rewards under `dynamics`, with
/// observations and actions drawn from the dynamics' own spaces
pub fn compare_rewards(cfgs: &[RewardCfg], dynamics: Arc<dyn Dynamics>, config: &ComparisonConfig) -> Result<DissimilarityMatrix> {
    let obs_space = dynamics.observation_space().clone();
    let act_space = dynamics.action_space().clone();
    let models = load_models(cfgs, &obs_space, &act_space, config)?;
    let mut obs_dist = SpaceSampler::new(obs_space, config.seed.wrapping_add(2));
    let mut act_dist = SpaceSampler::new(act_space, config.seed.wrapping_add(3));
    match config.computation_kind {
        ComputationKind::Sample => {
            let mut batches = RandomTransitions::from_spaces(dynamics, config.seed);
            sample_canon(&models, &mut batches, &mut obs_dist, &mut act_dist, config)
        }
        ComputationKind::Mesh => mesh_canon(&models, &mut obs_dist, &mut act_dist, config),
    }
}

fn fit_pair(
    source: &Arc<dyn RewardModel>,
    target: &Arc<dyn RewardModel>,
    make_source: &SourceFactory,
    fitter_config: &FitterConfig,
) -> Result<f64> {
    let mut fitter = EquivalenceFitter::new(Arc::clone(source), Arc::clone(target), fitter_config.clone())?;
    let mut batches = make_source(fitter_config.seed);
    fitter.fit(batches.as_mut())?;
    let eval = batches.sample_batch(fitter_config.batch_size)?;
    fitter.evaluate_loss(&eval, None)
}

/// Fit every source onto every target and report the loss on a held-out batch.
///
/// [`npec_dissimilarity`] turns the raw losses into the asymmetric or
/// symmetric variants.
#[instrument(skip_all, fields(n_models = models.len(), family = %fitter_config.family))]
pub fn npec_comparison(
    models: &RewardModels,
    make_source: &SourceFactory,
    fitter_config: &FitterConfig,
    skip_zero_target: bool,
) -> Result<DissimilarityMatrix> {
    fitter_config.validate()?;
    let targets = comparison_targets(models, skip_zero_target);
    let losses = cross_distance(models, &targets, |src, tgt| fit_pair(src, tgt, make_source, fitter_config))?;
    info!(pairs = losses.len(), "npec comparison complete");
    DissimilarityMatrix::from_entries(losses)
}

/// [`npec_comparison`] with up to `max_workers` pairs fitted concurrently
pub async fn npec_comparison_parallel(
    models: RewardModels,
    make_source: SourceFactory,
    fitter_config: FitterConfig,
    skip_zero_target: bool,
    max_workers: usize,
) -> Result<DissimilarityMatrix> {
    fitter_config.validate()?;
    let targets = comparison_targets(&models, skip_zero_target);
    let distances = cross_distance_parallel(
        Arc::new(models),
        Arc::new(targets),
        move |src, tgt| fit_pair(src, tgt, &make_source, &fitter_config),
        max_workers,
    )
    .await?;
    info!(pairs = distances.len(), max_workers, "parallel npec comparison complete");
    DissimilarityMatrix::from_entries(distances)
}

/// Raw NPEC losses turned into the dissimilarity named by `kind`.
///
/// `asymmetric` divides by the zero reward's loss on the same target; the
/// symmetric kinds then combine both directions of each pair. Both need the
/// zero reward among the sources.
pub fn npec_dissimilarity(raw: &DissimilarityMatrix, kind: DistanceKind) -> Result<DissimilarityMatrix> {
    let aggregation = match kind {
        DistanceKind::Npec => return Ok(raw.clone()),
        DistanceKind::Asymmetric => None,
        DistanceKind::Symmetric => Some(SymmetricAggregation::Mean),
        DistanceKind::SymmetricMin => Some(SymmetricAggregation::Min),
        DistanceKind::Direct | DistanceKind::Pearson => {
            return Err(RewardError::invalid_config(
                "distance_kind",
                format!("{kind} compares canonical rewards, not fitted ones"),
            ))
        }
    };
    let zero = raw
        .sources()
        .into_iter()
        .find(|cfg| cfg.kind == ZERO_KIND)
        .cloned()
        .ok_or_else(|| {
            RewardError::invalid_config("distance_kind", format!("{kind} needs {ZERO_KIND} among the sources"))
        })?;
    let normalized = raw.normalize_by(&zero)?;
    match aggregation {
        None => Ok(normalized),
        Some(aggregation) => normalized.without_target(&zero).symmetrize(aggregation),
    }
}

/// Fitted comparison of registry rewards under `dynamics`.
///
/// Pairs are fitted on random transitions, at most `config.max_workers` at a
/// time, with the fitter's discount and seed taken from `config`.
#[instrument(skip_all, fields(n_cfgs = cfgs.len(), kind = %config.distance_kind))]
pub async fn compare_rewards_fitted(
    cfgs: &[RewardCfg],
    dynamics: Arc<dyn Dynamics>,
    config: &ComparisonConfig,
    fitter_config: FitterConfig,
) -> Result<DissimilarityMatrix> {
    config.validate()?;
    if !config.distance_kind.requires_fit() {
        return Err(RewardError::invalid_config(
            "distance_kind",
            format!("{} needs no equivalence fit, use compare_rewards", config.distance_kind),
        ));
    }
    let models = load_models(cfgs, dynamics.observation_space(), dynamics.action_space(), config)?;
    let factory: SourceFactory = Arc::new(move |seed| {
        Box::new(RandomTransitions::from_spaces(Arc::clone(&dynamics), seed)) as Box<dyn BatchSource>
    });
    let fitter_config = FitterConfig {
        discount: config.discount,
        seed: config.seed,
        ..fitter_config
    };
    let raw = npec_comparison_parallel(models, factory, fitter_config, config.skip_zero_target, config.max_workers).await?;
    npec_dissimilarity(&raw, config.distance_kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point_mass::{PointMass, PointMassConfig};

    fn cfgs() -> Vec<RewardCfg> {
        vec![
            RewardCfg::new(ZERO_KIND, "dummy"),
            RewardCfg::new("rewcmp/PointMassSparse-v0", "dummy"),
            RewardCfg::new("rewcmp/PointMassDense-v0", "dummy"),
            RewardCfg::new("rewcmp/PointMassGroundTruth-v0", "dummy"),
        ]
    }

    fn dynamics() -> Arc<dyn Dynamics> {
        Arc::new(PointMass::new(PointMassConfig::default()).unwrap())
    }

    #[test]
    fn test_sample_canon_skips_zero_target() {
        let config = ComparisonConfig {
            n_samples: 32,
            n_mean_samples: 32,
            ..ComparisonConfig::quick()
        };
        let matrix = compare_rewards(&cfgs(), dynamics(), &config).unwrap();
        assert_eq!(matrix.len(), 4 * 3);
        let zero = RewardCfg::new(ZERO_KIND, "dummy");
        assert!(matrix.targets().iter().all(|cfg| **cfg != zero));
        for (_, d) in matrix.iter() {
            assert!((0.0..=2.0 + 1e-9).contains(&d.value));
        }
    }

    #[test]
    fn test_zero_source_is_flagged_under_pearson() {
        let matrix = compare_rewards(&cfgs(), dynamics(), &ComparisonConfig::quick()).unwrap();
        let zero = RewardCfg::new(ZERO_KIND, "dummy");
        let sparse = RewardCfg::new("rewcmp/PointMassSparse-v0", "dummy");
        let d = matrix.get(&zero, &sparse).unwrap();
        assert!(d.flagged);
        assert!((d.value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mesh_self_distance_zero() {
        let config = ComparisonConfig {
            computation_kind: ComputationKind::Mesh,
            distance_kind: DistanceKind::Direct,
            n_obs: 6,
            n_act: 4,
            ..ComparisonConfig::quick()
        };
        let matrix = compare_rewards(&cfgs()[1..], dynamics(), &config).unwrap();
        for cfg in &cfgs()[1..] {
            let d = matrix.get(cfg, cfg).unwrap();
            assert!(d.value.abs() < 1e-9, "{cfg}: {}", d.value);
        }
    }

    #[test]
    fn test_fit_based_kind_rejected_by_canonical_pipeline() {
        let config = ComparisonConfig {
            distance_kind: DistanceKind::Npec,
            ..ComparisonConfig::quick()
        };
        assert!(matches!(
            compare_rewards(&cfgs(), dynamics(), &config),
            Err(RewardError::InvalidConfig { .. })
        ));
    }

    fn npec_setup() -> (RewardModels, SourceFactory, FitterConfig) {
        let dynamics = dynamics();
        let models = load_models(
            &cfgs()[..3],
            dynamics.observation_space(),
            dynamics.action_space(),
            &ComparisonConfig::default(),
        )
        .unwrap();
        let factory: SourceFactory =
            Arc::new(move |seed| Box::new(RandomTransitions::from_spaces(Arc::clone(&dynamics), seed)) as Box<dyn BatchSource>);
        let config = FitterConfig {
            total_timesteps: 64 * 20,
            batch_size: 64,
            affine_size: Some(64),
            hidden_sizes: vec![8],
            ..FitterConfig::default()
        };
        (models, factory, config)
    }

    #[test]
    fn test_npec_comparison_shapes() {
        let (models, factory, config) = npec_setup();
        let matrix = npec_comparison(&models, &factory, &config, true).unwrap();
        assert_eq!(matrix.len(), 3 * 2);
        assert!(matrix.iter().all(|(_, d)| d.value.is_finite() && d.value >= 0.0));
    }

    #[test]
    fn test_symmetric_kinds_combine_asymmetric_directions() {
        let (models, factory, config) = npec_setup();
        let raw = npec_comparison(&models, &factory, &config, true).unwrap();
        let asymmetric = npec_dissimilarity(&raw, DistanceKind::Asymmetric).unwrap();
        let mean = npec_dissimilarity(&raw, DistanceKind::Symmetric).unwrap();
        let min = npec_dissimilarity(&raw, DistanceKind::SymmetricMin).unwrap();
        // zero reward dropped as source, never a target
        assert_eq!(asymmetric.len(), 2 * 2);
        assert_eq!(mean.len(), 2 * 2);
        for ((src, tgt), d) in mean.iter() {
            let forward = asymmetric.get(src, tgt).unwrap().value;
            let backward = asymmetric.get(tgt, src).unwrap().value;
            assert!((d.value - 0.5 * (forward + backward)).abs() < 1e-12);
            assert!((min.get(src, tgt).unwrap().value - forward.min(backward)).abs() < 1e-12);
        }
        assert_eq!(npec_dissimilarity(&raw, DistanceKind::Npec).unwrap(), raw);
        assert!(npec_dissimilarity(&raw, DistanceKind::Pearson).is_err());
    }

    #[test]
    fn test_normalized_kinds_need_zero_source() {
        let (mut models, factory, config) = npec_setup();
        models.shift_remove(&RewardCfg::new(ZERO_KIND, "dummy"));
        let raw = npec_comparison(&models, &factory, &config, true).unwrap();
        assert!(matches!(
            npec_dissimilarity(&raw, DistanceKind::Asymmetric),
            Err(RewardError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_fitted_comparison_is_symmetric() {
        let (_, _, fitter_config) = npec_setup();
        let config = ComparisonConfig {
            distance_kind: DistanceKind::SymmetricMin,
            max_workers: 2,
            ..ComparisonConfig::quick()
        };
        let matrix = compare_rewards_fitted(&cfgs()[..3], dynamics(), &config, fitter_config).await.unwrap();
        assert_eq!(matrix.len(), 2 * 2);
        for ((src, tgt), d) in matrix.iter() {
            assert_eq!(matrix.get(tgt, src).unwrap().value, d.value);
        }

        let canonical = ComparisonConfig {
            distance_kind: DistanceKind::Pearson,
            ..ComparisonConfig::quick()
        };
        let (_, _, fitter_config) = npec_setup();
        assert!(compare_rewards_fitted(&cfgs()[..3], dynamics(), &canonical, fitter_config).await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_npec_matches_sequential() {
        let (models, factory, config) = npec_setup();
        let sequential = npec_comparison(&models, &factory, &config, true).unwrap();
        let parallel = npec_comparison_parallel(models, factory, config, true, 2).await.unwrap();
        assert_eq!(sequential.len(), parallel.len());
        for ((src, tgt), d) in sequential.iter() {
            let other = parallel.get(src, tgt).unwrap();
            assert!((d.value - other.value).abs() < 1e-9);
        }
    }
}
