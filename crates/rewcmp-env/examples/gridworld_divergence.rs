//! Example: divergences between the built-in gridworld rewards

use rewcmp_core::{DeshapeKind, RewardCfg};
use rewcmp_env::gridworld::{compute_divergence, gridworld_rewards, DivergenceOptions, GridDivergence};
use rewcmp_env::{init_tracing, output_dir};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let rewards = gridworld_rewards();
    let discount = 0.99;
    let options = DivergenceOptions::gridworld();
    let out = output_dir(Path::new("output"), "gridworld_divergence")?;

    let kinds = [
        GridDivergence::Pearson(DeshapeKind::FullyConnectedRandom),
        GridDivergence::Direct(DeshapeKind::FullyConnectedGreedy),
        GridDivergence::Asymmetric,
    ];
    for kind in kinds {
        let matrix = compute_divergence(&rewards, discount, kind, &options)?;
        println!("\n{kind}");
        for (name, _) in &rewards {
            let src = RewardCfg::new(name.as_str(), "dummy");
            let row: Vec<String> = matrix
                .targets()
                .into_iter()
                .filter_map(|tgt| matrix.get(&src, tgt))
                .map(|d| format!("{:6.3}", d.value))
                .collect();
            println!("{name:>16}: {}", row.join(" "));
        }
        matrix.save(&out, &kind.to_string())?;
    }

    println!("\nResults written to {}", out.display());
    Ok(())
}
