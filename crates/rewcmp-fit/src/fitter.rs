//! Equivalence fitter
//!
//! Searches a transformation family for the map that brings a source reward
//! closest to a fixed target reward. A run goes through construction, an
//! optional moment-matching pretraining of the affine part, then gradient
//! steps on fresh batches, and finally produces a [`FitReport`].
//!
//! In alternating mode every step first solves the affine part exactly by
//! weighted least squares against the target minus the current shaping term,
//! then takes a gradient step on the potential alone.

use metrics::{counter, histogram};
use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rewcmp_core::canon::validate_discount;
use rewcmp_core::reward::{ensure_compatible, ensure_finite};
use rewcmp_core::{BatchSource, Result, RewardError, RewardModel, TransitionBatch};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::loss::LossKind;
use crate::model::{AffineOptions, AffineParameters, EquivalenceFamily, EquivalenceModel};
use crate::optimizer::{Optimizer, OptimizerKind};
use crate::schedule::LearningRateSchedule;

/// Steps between progress log lines
const LOG_INTERVAL: usize = 100;

/// Equivalence fitter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// Transformation family
    pub family: EquivalenceFamily,
    /// Trainable affine parameters
    pub affine: AffineOptions,
    /// Regression loss
    pub loss: LossKind,
    /// Optimizer
    pub optimizer: OptimizerKind,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Final learning rate as a fraction of the initial one
    pub lr_final_fraction: f64,
    /// Transitions consumed by the optimization phase
    pub total_timesteps: usize,
    /// Transitions per gradient step
    pub batch_size: usize,
    /// Pretraining batch size; `None` skips pretraining
    pub affine_size: Option<usize>,
    /// Hidden layer sizes of an MLP potential
    pub hidden_sizes: Vec<usize>,
    /// Floor on standard deviations during pretraining
    pub std_eps: f64,
    /// Discount used by the shaping term
    pub discount: f64,
    /// Seed for potential initialization
    pub seed: u64,
    /// Solve scale and shift in closed form before each potential step
    pub alternating: bool,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            family: EquivalenceFamily::AffinePotential,
            affine: AffineOptions::default(),
            loss: LossKind::Squared,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-2,
            lr_final_fraction: 1.0,
            total_timesteps: 1_000_000,
            batch_size: 4096,
            affine_size: Some(16_386),
            hidden_sizes: vec![32, 32],
            std_eps: 1e-5,
            discount: 0.99,
            seed: 0,
            alternating: false,
        }
    }
}

impl FitterConfig {
    /// Small budget for smoke tests
    #[must_use]
    pub fn quick() -> Self {
        Self {
            total_timesteps: 8192,
            batch_size: 512,
            affine_size: Some(512),
            ..Self::default()
        }
    }

    /// Named variant of the default configuration
    ///
    /// `default`, `affine_only`, `no_rescale`, `shaping_only`, `ellp_loss`
    /// and `alternating_maximization`.
    pub fn preset(name: &str) -> Result<Self> {
        let base = Self::default();
        match name {
            "default" => Ok(base),
            "affine_only" => Ok(Self {
                family: EquivalenceFamily::AffineOnly,
                ..base
            }),
            "no_rescale" => Ok(Self {
                affine: AffineOptions {
                    scale: false,
                    shift: true,
                },
                ..base
            }),
            "shaping_only" => Ok(Self {
                family: EquivalenceFamily::PotentialOnly,
                affine_size: None,
                ..base
            }),
            "ellp_loss" => Ok(Self {
                loss: LossKind::Ellp { p: 0.5 },
                ..base
            }),
            "alternating_maximization" => Ok(Self {
                alternating: true,
                ..base
            }),
            other => Err(RewardError::unknown_kind("fitter_preset", other)),
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of gradient steps in [`EquivalenceFitter::fit`]
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.total_timesteps / self.batch_size.max(1)
    }

    /// Check every field, naming the first invalid one
    pub fn validate(&self) -> Result<()> {
        validate_discount(self.discount)?;
        self.loss.validate()?;
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(RewardError::invalid_config("learning_rate", "must be positive and finite"));
        }
        if !(0.0..=1.0).contains(&self.lr_final_fraction) {
            return Err(RewardError::invalid_config("lr_final_fraction", "must lie in [0, 1]"));
        }
        if self.batch_size == 0 {
            return Err(RewardError::invalid_config("batch_size", "must be positive"));
        }
        if self.affine_size == Some(0) {
            return Err(RewardError::invalid_config("affine_size", "must be positive when set"));
        }
        if !(self.std_eps > 0.0 && self.std_eps.is_finite()) {
            return Err(RewardError::invalid_config("std_eps", "must be positive and finite"));
        }
        if self.hidden_sizes.contains(&0) {
            return Err(RewardError::invalid_config("hidden_sizes", "layers must be non-empty"));
        }
        if self.alternating && self.loss != LossKind::Squared {
            return Err(RewardError::invalid_config("alternating", "closed-form affine solve needs the squared loss"));
        }
        Ok(())
    }
}

/// Outcome of one fitting run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Identifier of the run
    pub run_id: Uuid,
    /// Loss after the last step
    pub final_loss: f64,
    /// Loss of every gradient step
    pub loss_history: Vec<f64>,
    /// Fitted affine map, `scale * source + constant` approximating the target
    pub affine: AffineParameters,
    /// Gradient steps taken
    pub steps: usize,
    /// Mean of the loss history
    pub loss_mean: f64,
    /// Population standard deviation of the loss history
    pub loss_std: f64,
}

/// Weights normalized to sum to one; uniform when `None`
fn normalized_weights(n: usize, weights: Option<ArrayView1<'_, f64>>) -> Result<Array1<f64>> {
    match weights {
        None => Ok(Array1::from_elem(n, 1.0 / n.max(1) as f64)),
        Some(w) if w.len() != n => Err(RewardError::DimensionMismatch {
            expected: n,
            actual: w.len(),
        }),
        Some(w) => {
            let total = w.sum();
            if !(total > 0.0 && total.is_finite()) {
                return Err(RewardError::InvalidDistribution("weights must have positive mass".to_string()));
            }
            Ok(&w / total)
        }
    }
}

/// Weighted least-squares `y ~ scale * x + shift` with the scale floored at `min_scale`.
///
/// Parameters not in `options` stay at the identity; a constant `x` keeps `current_scale`.
fn least_squares_affine(
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
    options: AffineOptions,
    current_scale: f64,
    min_scale: f64,
) -> (f64, f64) {
    let mean_x = weights.dot(&x);
    let mean_y = weights.dot(&y);
    match (options.scale, options.shift) {
        (true, true) => {
            let cov: f64 = x.iter().zip(&y).zip(&weights).map(|((x, y), w)| w * (x - mean_x) * (y - mean_y)).sum();
            let var: f64 = x.iter().zip(&weights).map(|(x, w)| w * (x - mean_x).powi(2)).sum();
            let scale = if var > min_scale * min_scale {
                (cov / var).max(min_scale)
            } else {
                current_scale
            };
            (scale, mean_y - scale * mean_x)
        }
        (true, false) => {
            let xy: f64 = x.iter().zip(&y).zip(&weights).map(|((x, y), w)| w * x * y).sum();
            let xx: f64 = x.iter().zip(&weights).map(|(x, w)| w * x * x).sum();
            let scale = if xx > min_scale * min_scale {
                (xy / xx).max(min_scale)
            } else {
                current_scale
            };
            (scale, 0.0)
        }
        (false, true) => (1.0, mean_y - mean_x),
        (false, false) => (1.0, 0.0),
    }
}

/// Weighted or plain mean and standard deviation of `values`
fn moments(values: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>) -> Result<(f64, f64)> {
    match weights {
        None => Ok((values.iter().mean(), values.iter().population_std_dev())),
        Some(w) => {
            if w.len() != values.len() {
                return Err(RewardError::DimensionMismatch {
                    expected: values.len(),
                    actual: w.len(),
                });
            }
            let total = w.sum();
            if !(total > 0.0 && total.is_finite()) {
                return Err(RewardError::InvalidDistribution("weights must have positive mass".to_string()));
            }
            let mean = w.dot(&values) / total;
            let var = values.iter().zip(w).map(|(x, w)| w * (x - mean).powi(2)).sum::<f64>() / total;
            Ok((mean, var.sqrt()))
        }
    }
}

/// Gradient-based search for the best transform from a source to a target reward
pub struct EquivalenceFitter {
    config: FitterConfig,
    model: EquivalenceModel,
    target: Arc<dyn RewardModel>,
    optimizer: Optimizer,
    schedule: LearningRateSchedule,
    loss_history: Vec<f64>,
    run_id: Uuid,
}

impl EquivalenceFitter {
    /// Create a new fitter; fails if the rewards do not share spaces
    pub fn new(source: Arc<dyn RewardModel>, target: Arc<dyn RewardModel>, config: FitterConfig) -> Result<Self> {
        config.validate()?;
        ensure_compatible(source.as_ref(), target.as_ref())?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = EquivalenceModel::new(
            source,
            config.family,
            config.affine,
            config.discount,
            &config.hidden_sizes,
            &mut rng,
        )?;
        let schedule = LearningRateSchedule::new(config.learning_rate, config.lr_final_fraction, config.n_steps());
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            family = %config.family,
            parameters = model.num_parameters(),
            "created equivalence fitter"
        );

        Ok(Self {
            optimizer: Optimizer::new(config.optimizer),
            config,
            model,
            target,
            schedule,
            loss_history: Vec::new(),
            run_id,
        })
    }

    /// Model being fitted
    #[must_use]
    pub fn model(&self) -> &EquivalenceModel {
        &self.model
    }

    /// Consume the fitter, keeping the fitted model
    #[must_use]
    pub fn into_model(self) -> EquivalenceModel {
        self.model
    }

    /// Identifier of this run
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn evaluate_target(&self, batch: &TransitionBatch) -> Result<Array1<f64>> {
        let values = self.target.evaluate(batch)?;
        ensure_finite(values.view(), "target reward")?;
        Ok(values)
    }

    /// Match the first two moments of the transformed source to the target
    pub fn pretrain(&mut self, batch: &TransitionBatch) -> Result<AffineParameters> {
        self.pretrain_weighted(batch, None)
    }

    /// [`Self::pretrain`] with per-transition weights
    pub fn pretrain_weighted(
        &mut self,
        batch: &TransitionBatch,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<AffineParameters> {
        if !self.config.family.has_affine() {
            debug!(family = %self.config.family, "no affine parameters to pretrain");
            return Ok(self.model.affine());
        }
        let source = self.model.evaluate_source(batch)?;
        let target = self.evaluate_target(batch)?;
        let (source_mean, source_std) = moments(source.view(), weights)?;
        let (target_mean, target_std) = moments(target.view(), weights)?;

        let eps = self.config.std_eps;
        let scale = if self.config.affine.scale {
            target_std.max(eps) / source_std.max(eps)
        } else {
            1.0
        };
        let shift = if self.config.affine.shift {
            target_mean - scale * source_mean
        } else {
            0.0
        };
        self.model.set_affine(scale, shift)?;
        let affine = self.model.affine();
        debug!(scale = affine.scale, constant = affine.constant, "pretrained affine parameters");
        Ok(affine)
    }

    /// Loss of the current model on `batch`, without updating it
    pub fn evaluate_loss(&self, batch: &TransitionBatch, weights: Option<ArrayView1<'_, f64>>) -> Result<f64> {
        let source = self.model.evaluate_source(batch)?;
        let output = self.model.transform(batch, source.view())?;
        let target = self.evaluate_target(batch)?;
        let (loss, _) = self.config.loss.loss_and_grad(output.view(), target.view(), weights)?;
        Ok(loss)
    }

    /// Closed-form affine map against `target` minus the current shaping term
    pub fn solve_affine(
        &mut self,
        batch: &TransitionBatch,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<AffineParameters> {
        if !self.config.family.has_affine() {
            return Ok(self.model.affine());
        }
        let source = self.model.evaluate_source(batch)?;
        let target = self.evaluate_target(batch)?;
        self.solve_affine_on(batch, source.view(), target.view(), weights)
    }

    fn solve_affine_on(
        &mut self,
        batch: &TransitionBatch,
        source: ArrayView1<'_, f64>,
        target: ArrayView1<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<AffineParameters> {
        let residual = &target - &self.model.shaping(batch)?;
        let w = normalized_weights(batch.len(), weights)?;
        let (scale, shift) = least_squares_affine(
            source,
            residual.view(),
            w.view(),
            self.config.affine,
            self.model.affine().scale,
            self.config.std_eps,
        );
        self.model.set_affine(scale, shift)?;
        Ok(self.model.affine())
    }

    /// One gradient step on `batch`; returns the loss before the update
    ///
    /// In alternating mode the affine part is solved exactly first and only
    /// the potential follows the gradient.
    pub fn step(&mut self, batch: &TransitionBatch, weights: Option<ArrayView1<'_, f64>>) -> Result<f64> {
        let source = self.model.evaluate_source(batch)?;
        let target = self.evaluate_target(batch)?;
        let alternating = self.config.alternating && self.config.family.has_affine();
        if alternating {
            self.solve_affine_on(batch, source.view(), target.view(), weights)?;
        }
        let output = self.model.transform(batch, source.view())?;
        let (loss, grad_out) = self.config.loss.loss_and_grad(output.view(), target.view(), weights)?;
        if !loss.is_finite() {
            return Err(RewardError::NonFinite {
                context: format!("fit loss at step {}", self.optimizer.steps()),
            });
        }

        let mut grads = self.model.gradients(batch, source.view(), grad_out.view())?;
        if alternating {
            let n_affine = self.model.num_affine_parameters();
            grads[..n_affine].iter_mut().for_each(|g| *g = 0.0);
        }
        let mut params = self.model.parameters();
        let lr = self.schedule.value(self.optimizer.steps());
        self.optimizer.step(&mut params, &grads, lr)?;
        self.model.set_parameters(&params)?;

        self.loss_history.push(loss);
        counter!("rewcmp_fit_steps_total", 1);
        if self.optimizer.steps() % LOG_INTERVAL == 0 {
            debug!(step = self.optimizer.steps(), loss, lr, "fit progress");
        }
        Ok(loss)
    }

    /// Full run drawing fresh batches from `batches`
    #[instrument(skip(self, batches), fields(run_id = %self.run_id, family = %self.config.family))]
    pub fn fit(&mut self, batches: &mut dyn BatchSource) -> Result<FitReport> {
        if let Some(affine_size) = self.config.affine_size {
            let batch = batches.sample_batch(affine_size)?;
            self.pretrain(&batch)?;
        }
        let mut last = None;
        for _ in 0..self.config.n_steps() {
            let batch = batches.sample_batch(self.config.batch_size)?;
            last = Some(self.step(&batch, None)?);
        }
        let final_loss = match last {
            Some(loss) => loss,
            None => {
                let batch = batches.sample_batch(self.config.batch_size)?;
                self.evaluate_loss(&batch, None)?
            }
        };
        Ok(self.report(final_loss))
    }

    /// Full run on one fixed weighted batch, e.g. an enumerated tabular MDP
    #[instrument(skip(self, batch, weights), fields(run_id = %self.run_id, family = %self.config.family))]
    pub fn fit_weighted(
        &mut self,
        batch: &TransitionBatch,
        weights: ArrayView1<'_, f64>,
        n_iter: usize,
    ) -> Result<FitReport> {
        if self.config.affine_size.is_some() {
            self.pretrain_weighted(batch, Some(weights))?;
        }
        for _ in 0..n_iter {
            self.step(batch, Some(weights))?;
        }
        if self.config.alternating {
            self.solve_affine(batch, Some(weights))?;
        }
        let final_loss = self.evaluate_loss(batch, Some(weights))?;
        Ok(self.report(final_loss))
    }

    fn report(&self, final_loss: f64) -> FitReport {
        let (loss_mean, loss_std) = if self.loss_history.is_empty() {
            (final_loss, 0.0)
        } else {
            (
                self.loss_history.iter().mean(),
                self.loss_history.iter().population_std_dev(),
            )
        };
        let affine = self.model.affine();
        histogram!("rewcmp_fit_final_loss", final_loss);
        counter!("rewcmp_fit_runs_total", 1);
        info!(
            run_id = %self.run_id,
            final_loss,
            steps = self.loss_history.len(),
            scale = affine.scale,
            constant = affine.constant,
            "fit finished"
        );
        FitReport {
            run_id: self.run_id,
            final_loss,
            loss_history: self.loss_history.clone(),
            affine,
            steps: self.loss_history.len(),
            loss_mean,
            loss_std,
        }
    }
}
