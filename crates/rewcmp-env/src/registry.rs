//! Reward registry for loading rewards by type tag

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rewcmp_core::{Result, RewardError, RewardModel, Space, ZeroReward};
use tracing::debug;

use crate::point_mass::{dense_reward, ground_truth_reward, sparse_reward, PointMass};

/// Constructor for a registered reward: `(path, obs_space, act_space, discount)`
pub type RewardLoader = Box<dyn Fn(&str, &Space, &Space, f64) -> Result<Arc<dyn RewardModel>> + Send + Sync>;

lazy_static::lazy_static! {
    static ref REGISTRY: RwLock<RewardRegistry> = RwLock::new(RewardRegistry::with_builtins());
}

/// Map from reward type tag to constructor
pub struct RewardRegistry {
    loaders: HashMap<String, RewardLoader>,
}

fn point_mass(obs_space: &Space, act_space: &Space) -> Result<PointMass> {
    PointMass::from_spaces(obs_space, act_space)
}

impl RewardRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry holding the built-in rewards
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("rewcmp/Zero-v0", |_, obs, act, _| {
            Ok(Arc::new(ZeroReward::new(obs.clone(), act.clone())) as Arc<dyn RewardModel>)
        });
        registry.register("rewcmp/PointMassGroundTruth-v0", |_, obs, act, _| {
            let env = point_mass(obs, act)?;
            Ok(ground_truth_reward(&env, env.config().ctrl_coef))
        });
        registry.register("rewcmp/PointMassSparse-v0", |_, obs, act, _| {
            let env = point_mass(obs, act)?;
            Ok(sparse_reward(&env, env.config().ctrl_coef, env.config().threshold))
        });
        registry.register("rewcmp/PointMassSparseNoCtrl-v0", |_, obs, act, _| {
            let env = point_mass(obs, act)?;
            Ok(sparse_reward(&env, 0.0, env.config().threshold))
        });
        registry.register("rewcmp/PointMassDense-v0", |_, obs, act, discount| {
            let env = point_mass(obs, act)?;
            Ok(Arc::new(dense_reward(&env, env.config().ctrl_coef, discount)?) as Arc<dyn RewardModel>)
        });
        registry.register("rewcmp/PointMassDenseNoCtrl-v0", |_, obs, act, discount| {
            let env = point_mass(obs, act)?;
            Ok(Arc::new(dense_reward(&env, 0.0, discount)?) as Arc<dyn RewardModel>)
        });
        registry
    }

    /// Register a reward, replacing any existing loader for `kind`
    pub fn register<F>(&mut self, kind: impl Into<String>, loader: F)
    where
        F: Fn(&str, &Space, &Space, f64) -> Result<Arc<dyn RewardModel>> + Send + Sync + 'static,
    {
        self.loaders.insert(kind.into(), Box::new(loader));
    }

    /// Load a reward by type tag
    pub fn load(&self, kind: &str, path: &str, obs_space: &Space, act_space: &Space, discount: f64) -> Result<Arc<dyn RewardModel>> {
        let loader = self
            .loaders
            .get(kind)
            .ok_or_else(|| RewardError::unknown_kind("reward_type", kind))?;
        debug!(kind, path, "loading reward");
        loader(path, obs_space, act_space, discount)
    }

    /// Registered type tags, sorted
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.loaders.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for RewardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> RewardError {
    RewardError::Computation("reward registry lock poisoned".to_string())
}

/// Register a reward globally
pub fn register_reward<F>(kind: impl Into<String>, loader: F) -> Result<()>
where
    F: Fn(&str, &Space, &Space, f64) -> Result<Arc<dyn RewardModel>> + Send + Sync + 'static,
{
    REGISTRY.write().map_err(poisoned)?.register(kind, loader);
    Ok(())
}

/// Load a reward from the global registry
pub fn load_reward(kind: &str, path: &str, obs_space: &Space, act_space: &Space, discount: f64) -> Result<Arc<dyn RewardModel>> {
    REGISTRY.read().map_err(poisoned)?.load(kind, path, obs_space, act_space, discount)
}

/// List globally registered rewards
pub fn list_rewards() -> Result<Vec<String>> {
    Ok(REGISTRY.read().map_err(poisoned)?.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Dynamics, RandomTransitions};
    use rewcmp_core::BatchSource;

    fn spaces() -> (Space, Space) {
        let env = PointMass::new(crate::point_mass::PointMassConfig::default()).unwrap();
        (env.observation_space().clone(), env.action_space().clone())
    }

    #[test]
    fn test_builtins_listed() {
        let kinds = list_rewards().unwrap();
        assert!(kinds.contains(&"rewcmp/Zero-v0".to_string()));
        assert!(kinds.contains(&"rewcmp/PointMassDenseNoCtrl-v0".to_string()));
    }

    #[test]
    fn test_load_and_evaluate() {
        let (obs, act) = spaces();
        let env = Arc::new(PointMass::new(crate::point_mass::PointMassConfig::default()).unwrap());
        let batch = RandomTransitions::from_spaces(env, 0).sample_batch(16).unwrap();
        for kind in list_rewards().unwrap() {
            if !kind.starts_with("rewcmp/") {
                continue;
            }
            let reward = load_reward(&kind, "dummy", &obs, &act, 0.99).unwrap();
            let values = reward.evaluate(&batch).unwrap();
            assert_eq!(values.len(), 16, "{kind}");
        }
    }

    #[test]
    fn test_unknown_kind_named() {
        let (obs, act) = spaces();
        let err = load_reward("rewcmp/Nope-v0", "dummy", &obs, &act, 0.99).err().unwrap();
        assert!(matches!(err, RewardError::UnknownKind { ref field, .. } if field == "reward_type"));
    }

    #[test]
    fn test_register_custom_reward() {
        register_reward("test/Constant-v0", |_, obs, act, _| {
            Ok(Arc::new(rewcmp_core::ConstantReward::new(2.0, obs.clone(), act.clone())) as Arc<dyn RewardModel>)
        })
        .unwrap();
        let (obs, act) = spaces();
        assert!(load_reward("test/Constant-v0", "dummy", &obs, &act, 0.9).is_ok());
    }

    #[test]
    fn test_dense_shaping_uses_discount() {
        use approx::assert_abs_diff_eq;
        use ndarray::array;
        use rewcmp_core::TransitionBatch;

        let (obs, act) = spaces();
        let batch = TransitionBatch::new(
            array![[0.0, 0.0, 0.0, 0.0, 3.0, 4.0]],
            array![[0.0, 0.0]],
            array![[0.0, 0.0, 0.0, 0.0, 0.0, 1.0]],
        )
        .unwrap();
        let sparse = load_reward("rewcmp/PointMassSparseNoCtrl-v0", "dummy", &obs, &act, 0.9)
            .unwrap()
            .evaluate(&batch)
            .unwrap();
        let dense = load_reward("rewcmp/PointMassDenseNoCtrl-v0", "dummy", &obs, &act, 0.9)
            .unwrap()
            .evaluate(&batch)
            .unwrap();
        assert_abs_diff_eq!(dense[0], sparse[0] + 10.0 * (5.0 - 0.9 * 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_point_mass_rejects_bad_spaces() {
        let obs = Space::uniform_box(0.0, 1.0, 4).unwrap();
        let act = Space::uniform_box(-1.0, 1.0, 2).unwrap();
        assert!(load_reward("rewcmp/PointMassSparse-v0", "dummy", &obs, &act, 0.99).is_err());
    }
}
