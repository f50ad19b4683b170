//! Example: compare point mass rewards with sample canonicalization and NPEC

use rewcmp_core::{BatchSource, ComparisonConfig, DistanceKind, RewardCfg};
use rewcmp_env::sources::{Dynamics, RandomTransitions};
use rewcmp_env::{
    compare_rewards, compare_rewards_fitted, init_tracing, load_models, npec_comparison_parallel, output_dir, PointMass, PointMassConfig,
    SourceFactory, ZERO_KIND,
};
use rewcmp_fit::FitterConfig;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dynamics = Arc::new(PointMass::new(PointMassConfig::default())?);
    let cfgs: Vec<RewardCfg> = [
        ZERO_KIND,
        "rewcmp/PointMassGroundTruth-v0",
        "rewcmp/PointMassSparse-v0",
        "rewcmp/PointMassSparseNoCtrl-v0",
        "rewcmp/PointMassDense-v0",
        "rewcmp/PointMassDenseNoCtrl-v0",
    ]
    .into_iter()
    .map(|kind| RewardCfg::new(kind, "dummy"))
    .collect();
    let out = output_dir(Path::new("output"), "point_mass_comparison")?;

    // Pearson distance between sample-canonicalized rewards
    let config = ComparisonConfig {
        n_samples: 1024,
        n_mean_samples: 1024,
        ..ComparisonConfig::default()
    };
    let canon = compare_rewards(&cfgs, dynamics.clone(), &config)?;
    for ((src, tgt), d) in canon.iter() {
        println!("{:>32} -> {:<32} {:.4}{}", src.kind, tgt.kind, d.value, if d.flagged { " *" } else { "" });
    }
    canon.save(&out, "sample_canon_pearson")?;

    // NPEC, normalized by the zero reward's distance to each target
    let models = load_models(&cfgs, dynamics.observation_space(), dynamics.action_space(), &config)?;
    let factory_dynamics: Arc<dyn Dynamics> = dynamics.clone();
    let factory: SourceFactory = Arc::new(move |seed| {
        Box::new(RandomTransitions::from_spaces(Arc::clone(&factory_dynamics), seed)) as Box<dyn BatchSource>
    });
    let fitter_config = FitterConfig {
        total_timesteps: 512 * 200,
        batch_size: 512,
        affine_size: Some(2048),
        ..FitterConfig::default()
    };
    let npec = npec_comparison_parallel(models, factory, fitter_config.clone(), true, config.max_workers).await?;
    let normalized = npec.normalize_by(&RewardCfg::new(ZERO_KIND, "dummy"))?;
    for ((src, tgt), d) in normalized.iter() {
        println!("{:>32} -> {:<32} {:.4}", src.kind, tgt.kind, d.value);
    }
    normalized.save(&out, "npec_normalized")?;

    // Mean of both NPEC directions
    let symmetric_config = ComparisonConfig {
        distance_kind: DistanceKind::Symmetric,
        ..config
    };
    let symmetric = compare_rewards_fitted(&cfgs, dynamics, &symmetric_config, fitter_config).await?;
    symmetric.save(&out, "npec_symmetric")?;

    println!("\nResults written to {}", out.display());
    Ok(())
}
