//! Transformation families searched by the equivalence fitter
//!
//! An [`EquivalenceModel`] wraps a frozen source reward `R` and computes
//! `T(R)(s, a, s') = scale * R(s, a, s') + shift + discount * phi(s') - phi(s)`,
//! where each term is present only if the chosen family includes it.

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rewcmp_core::reward::ensure_finite;
use rewcmp_core::{Result, RewardError, RewardModel, RewardNode, Space, TransitionBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::potential::{build_potential, TrainablePotential};

/// Which transforms the fitter may apply to the source reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquivalenceFamily {
    /// Source passed through unchanged
    Identity,
    /// Scale and shift only
    AffineOnly,
    /// Potential shaping only
    PotentialOnly,
    /// Scale, shift and potential shaping
    #[default]
    AffinePotential,
}

impl EquivalenceFamily {
    /// Every family
    pub const ALL: [Self; 4] = [Self::Identity, Self::AffineOnly, Self::PotentialOnly, Self::AffinePotential];

    /// Configuration string
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::AffineOnly => "affine_only",
            Self::PotentialOnly => "potential_only",
            Self::AffinePotential => "affine_potential",
        }
    }

    /// Whether scale/shift parameters are present
    #[must_use]
    pub fn has_affine(self) -> bool {
        matches!(self, Self::AffineOnly | Self::AffinePotential)
    }

    /// Whether a shaping potential is present
    #[must_use]
    pub fn has_potential(self) -> bool {
        matches!(self, Self::PotentialOnly | Self::AffinePotential)
    }
}

impl fmt::Display for EquivalenceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquivalenceFamily {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| RewardError::unknown_kind("family", s))
    }
}

/// Which affine parameters are trainable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineOptions {
    /// Learn a positive scale
    pub scale: bool,
    /// Learn an additive shift
    pub shift: bool,
}

impl Default for AffineOptions {
    fn default() -> Self {
        Self { scale: true, shift: true }
    }
}

/// Fitted affine map `scale * R + constant`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineParameters {
    /// Additive constant
    pub constant: f64,
    /// Multiplicative scale
    pub scale: f64,
}

impl Default for AffineParameters {
    fn default() -> Self {
        Self {
            constant: 0.0,
            scale: 1.0,
        }
    }
}

/// Source reward wrapped in a trainable transform
pub struct EquivalenceModel {
    source: Arc<dyn RewardModel>,
    family: EquivalenceFamily,
    options: AffineOptions,
    discount: f64,
    log_scale: f64,
    shift: f64,
    potential: Option<Box<dyn TrainablePotential>>,
}

impl EquivalenceModel {
    /// Create a new model at the identity transform, with a randomly initialized potential
    pub fn new<R: Rng + ?Sized>(
        source: Arc<dyn RewardModel>,
        family: EquivalenceFamily,
        options: AffineOptions,
        discount: f64,
        hidden_sizes: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        let potential = if family.has_potential() {
            Some(build_potential(source.observation_space(), hidden_sizes, rng)?)
        } else {
            None
        };
        Ok(Self {
            source,
            family,
            options,
            discount,
            log_scale: 0.0,
            shift: 0.0,
            potential,
        })
    }

    /// Transform family
    #[must_use]
    pub fn family(&self) -> EquivalenceFamily {
        self.family
    }

    /// Source reward being transformed
    #[must_use]
    pub fn source(&self) -> &Arc<dyn RewardModel> {
        &self.source
    }

    fn learns_scale(&self) -> bool {
        self.family.has_affine() && self.options.scale
    }

    fn learns_shift(&self) -> bool {
        self.family.has_affine() && self.options.shift
    }

    /// Number of leading affine entries in [`Self::parameters`]
    #[must_use]
    pub fn num_affine_parameters(&self) -> usize {
        usize::from(self.learns_scale()) + usize::from(self.learns_shift())
    }

    /// Current affine map
    #[must_use]
    pub fn affine(&self) -> AffineParameters {
        AffineParameters {
            constant: if self.learns_shift() { self.shift } else { 0.0 },
            scale: if self.learns_scale() { self.log_scale.exp() } else { 1.0 },
        }
    }

    /// Overwrite the affine map; parameters the family does not learn are ignored
    pub fn set_affine(&mut self, scale: f64, constant: f64) -> Result<()> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(RewardError::invalid_config("scale", format!("{scale} is not a positive finite number")));
        }
        if !constant.is_finite() {
            return Err(RewardError::NonFinite {
                context: "affine shift".to_string(),
            });
        }
        self.log_scale = scale.ln();
        self.shift = constant;
        Ok(())
    }

    /// Length of the flat parameter vector
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.num_affine_parameters() + self.potential.as_ref().map_or(0, |p| p.num_parameters())
    }

    /// Flat parameters: log-scale, shift, then potential parameters
    #[must_use]
    pub fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.num_parameters());
        if self.learns_scale() {
            params.push(self.log_scale);
        }
        if self.learns_shift() {
            params.push(self.shift);
        }
        if let Some(potential) = &self.potential {
            params.extend(potential.parameters());
        }
        params
    }

    /// Overwrite the flat parameters in the order of [`Self::parameters`]
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(RewardError::DimensionMismatch {
                expected: self.num_parameters(),
                actual: params.len(),
            });
        }
        let mut idx = 0;
        if self.learns_scale() {
            self.log_scale = params[idx];
            idx += 1;
        }
        if self.learns_shift() {
            self.shift = params[idx];
            idx += 1;
        }
        if let Some(potential) = &mut self.potential {
            potential.set_parameters(&params[idx..])?;
        }
        Ok(())
    }

    /// Evaluate the untransformed source on `batch`
    pub fn evaluate_source(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        let values = self.source.evaluate(batch)?;
        ensure_finite(values.view(), "source reward")?;
        Ok(values)
    }

    /// Transformed reward, given the source values on the same batch
    pub fn transform(&self, batch: &TransitionBatch, source_values: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if source_values.len() != batch.len() {
            return Err(RewardError::DimensionMismatch {
                expected: batch.len(),
                actual: source_values.len(),
            });
        }
        let affine = self.affine();
        let output = source_values.mapv(|r| affine.scale * r + affine.constant);
        Ok(output + self.shaping(batch)?)
    }

    /// Shaping term `discount * phi(s') - phi(s)` on `batch`; zero without a potential
    pub fn shaping(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        match &self.potential {
            Some(potential) => {
                let old = potential.forward(batch.obs())?;
                let new = potential.forward(batch.next_obs())?;
                Ok(new * self.discount - old)
            }
            None => Ok(Array1::zeros(batch.len())),
        }
    }

    /// Gradient of `sum_i grad_out[i] * T(R)_i` with respect to [`Self::parameters`]
    pub fn gradients(
        &self,
        batch: &TransitionBatch,
        source_values: ArrayView1<'_, f64>,
        grad_out: ArrayView1<'_, f64>,
    ) -> Result<Vec<f64>> {
        if grad_out.len() != batch.len() || source_values.len() != batch.len() {
            return Err(RewardError::DimensionMismatch {
                expected: batch.len(),
                actual: grad_out.len().min(source_values.len()),
            });
        }
        let mut grads = Vec::with_capacity(self.num_parameters());
        if self.learns_scale() {
            let scale = self.log_scale.exp();
            grads.push(scale * grad_out.dot(&source_values));
        }
        if self.learns_shift() {
            grads.push(grad_out.sum());
        }
        if let Some(potential) = &self.potential {
            let next = potential.backward(batch.next_obs(), grad_out.mapv(|g| g * self.discount).view())?;
            let prev = potential.backward(batch.obs(), grad_out.mapv(|g| -g).view())?;
            grads.extend(next.iter().zip(&prev).map(|(a, b)| a + b));
        }
        Ok(grads)
    }

    /// Freeze the fitted transform into a reward tree
    pub fn to_reward_node(&self) -> Result<RewardNode> {
        let mut node = RewardNode::identity(Arc::clone(&self.source));
        let affine = self.affine();
        if self.learns_scale() {
            node = node.scaled(affine.scale);
        }
        if self.learns_shift() {
            node = node.shifted(affine.constant);
        }
        if let Some(potential) = &self.potential {
            node = node.shaped(potential.freeze()?, self.discount)?;
        }
        Ok(node)
    }

    /// Observation space of the source reward
    #[must_use]
    pub fn observation_space(&self) -> &Space {
        self.source.observation_space()
    }
}

impl fmt::Debug for EquivalenceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EquivalenceModel")
            .field("family", &self.family)
            .field("affine", &self.affine())
            .field("discount", &self.discount)
            .field("num_parameters", &self.num_parameters())
            .finish()
    }
}
