//! Training of unrolled solvers and trainable masks.
//!
//! [`Trainer`] runs mini-batch gradient descent on the composite loss, evaluates the held-out
//! set after every epoch, keeps the metrics record up to date and writes checkpoints.

pub mod checkpoint;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod optimizer;

use crate::config::{MetricKey, TrainingConfig};
use crate::error::{LenslessError, Result};
use crate::graph::{Graph, Tensor, Var};
use crate::mask::TrainableMask;
use crate::math_tools::{max_normalize, norm_sq};
use crate::nn::{Module, Parameter, ProcessNetwork};
use crate::unrolled::UnrolledSolver;
use cancellable_loops::{try_for_each_cancellable, LoopOutcome};
use ndarray::s;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use dataset::{Dataset, InMemoryDataset};
pub use loss::{pixel_loss, GradientSimilarity, PerceptualLoss};
pub use metrics::{benchmark, EvalMetrics, Metrics};
pub use optimizer::{build_optimizer, Adam, LearningRateSchedule, Optimizer, Sgd};

const NORMALIZE_EPS: f32 = 1e-12;

/// Parameters that share an optimizer, a clipping norm and a NaN check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterGroup {
    Reconstruction,
    Mask,
}

impl Display for ParameterGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterGroup::Reconstruction => write!(f, "reconstruction"),
            ParameterGroup::Mask => write!(f, "mask"),
        }
    }
}

/// Result of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    /// The step was discarded because of non-finite gradients.
    pub skipped: bool,
}

pub struct Trainer {
    config: TrainingConfig,
    solver: UnrolledSolver,
    mask: Option<Box<dyn TrainableMask>>,
    perceptual: Option<Box<dyn PerceptualLoss>>,
    train_set: Box<dyn Dataset>,
    test_set: Box<dyn Dataset>,
    optimizer: Box<dyn Optimizer>,
    mask_optimizer: Option<Box<dyn Optimizer>>,
    schedule: LearningRateSchedule,
    metrics: Metrics,
    abort_flag: Arc<AtomicBool>,
    epochs_done: usize,
}

impl Trainer {
    /// # Arguments
    /// - `solver`: The unrolled solver to train.
    /// - `train_set`, `test_set`: Training pairs and the held-out set evaluated after each epoch.
    /// - `config`: Loss, optimizer and checkpoint settings.
    /// - `mask`: Optional trainable mask; its PSF replaces the solver's fixed PSF.
    /// - `perceptual`: Perceptual loss, required when `perceptual_weight` is set.
    pub fn new(
        mut solver: UnrolledSolver,
        train_set: Box<dyn Dataset>,
        test_set: Box<dyn Dataset>,
        config: TrainingConfig,
        mask: Option<Box<dyn TrainableMask>>,
        perceptual: Option<Box<dyn PerceptualLoss>>,
    ) -> Result<Self> {
        if config.batch_size == 0 || config.eval_batch_size == 0 {
            return Err(LenslessError::Configuration(
                "batch sizes must be at least one".to_string(),
            ));
        }
        if train_set.is_empty() || test_set.is_empty() {
            return Err(LenslessError::Usage(
                "training needs non-empty training and test sets".to_string(),
            ));
        }
        if config.perceptual_weight.is_some() && perceptual.is_none() {
            return Err(LenslessError::Configuration(
                "perceptual_weight is set but no perceptual loss was given".to_string(),
            ));
        }
        if config.mask_l1.is_some() && mask.is_none() {
            return Err(LenslessError::Configuration(
                "mask_l1 is set but no trainable mask was given".to_string(),
            ));
        }
        if let Some(crop) = config.crop.as_ref() {
            let (height, width, _) = solver.shape();
            crop.validate(height, width)?;
        }
        if config.unrolled_output_factor.is_some() {
            let unrolled = solver.config();
            if !unrolled.return_unrolled_output || unrolled.post_process.is_none() {
                return Err(LenslessError::Configuration(
                    "unrolled_output_factor needs a post-processor and return_unrolled_output"
                        .to_string(),
                ));
            }
        }

        let opt = &config.optimizer;
        let optimizer = build_optimizer(opt.kind, opt.lr, opt.momentum)?;
        let mask_optimizer = match mask {
            Some(_) => Some(build_optimizer(
                opt.kind,
                opt.mask_lr.unwrap_or(opt.lr),
                opt.momentum,
            )?),
            None => None,
        };
        let schedule = LearningRateSchedule::from_config(opt)?;
        if let Some(mask) = mask.as_ref() {
            solver.set_psf(&mask.current_psf())?;
        }
        let metrics = Metrics::new(
            solver.n_iter(),
            &solver.algorithm_name(),
            config.metric_for_best_model,
            perceptual.as_ref().map(|p| p.name()),
        )?;
        log::info!(
            "training {} on {} samples ({} held out), {} trainable values",
            solver.algorithm_name(),
            train_set.len(),
            test_set.len(),
            solver.num_trainable()
        );
        Ok(Trainer {
            config,
            solver,
            mask,
            perceptual,
            train_set,
            test_set,
            optimizer,
            mask_optimizer,
            schedule,
            metrics,
            abort_flag: Arc::new(AtomicBool::new(false)),
            epochs_done: 0,
        })
    }

    pub fn solver(&self) -> &UnrolledSolver {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut UnrolledSolver {
        &mut self.solver
    }

    pub fn mask(&self) -> Option<&dyn TrainableMask> {
        self.mask.as_deref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn epochs_done(&self) -> usize {
        self.epochs_done
    }

    /// Flag that interrupts training between batches when set.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_flag)
    }

    fn visit_group(&self, group: ParameterGroup, visitor: &mut dyn FnMut(&Parameter)) {
        match group {
            ParameterGroup::Reconstruction => self.solver.visit_parameters(visitor),
            ParameterGroup::Mask => {
                if let Some(mask) = self.mask.as_ref() {
                    mask.visit_parameters(visitor);
                }
            }
        }
    }

    fn visit_group_mut(&mut self, group: ParameterGroup, visitor: &mut dyn FnMut(&mut Parameter)) {
        match group {
            ParameterGroup::Reconstruction => self.solver.visit_parameters_mut(visitor),
            ParameterGroup::Mask => {
                if let Some(mask) = self.mask.as_mut() {
                    mask.visit_parameters_mut(visitor);
                }
            }
        }
    }

    fn groups(&self) -> Vec<ParameterGroup> {
        if self.mask.is_some() {
            vec![ParameterGroup::Reconstruction, ParameterGroup::Mask]
        } else {
            vec![ParameterGroup::Reconstruction]
        }
    }

    fn zero_grad(&mut self) {
        for group in self.groups() {
            self.visit_group_mut(group, &mut |p| p.zero_grad());
        }
    }

    /// Scans the stored gradients for NaN or infinite values, group by group.
    ///
    /// The mask group is only checked when a mask is configured.
    pub fn validate_gradients(&self) -> Result<()> {
        for group in self.groups() {
            let mut finite = true;
            self.visit_group(group, &mut |p| {
                if let Some(g) = p.grad() {
                    finite &= g.iter().all(|v| v.is_finite());
                }
            });
            if !finite {
                return Err(LenslessError::NumericInstability {
                    group: group.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Rescales the gradients of `group` so that their global norm is at most `max_norm`.
    fn clip_gradients(&mut self, group: ParameterGroup, max_norm: f32) -> f32 {
        let mut total = 0.0f64;
        self.visit_group(group, &mut |p| {
            if let (true, Some(g)) = (p.requires_grad(), p.grad()) {
                total += norm_sq(g) as f64;
            }
        });
        let norm = total.sqrt() as f32;
        if norm > max_norm {
            let scale = max_norm / (norm + 1e-6);
            self.visit_group_mut(group, &mut |p| {
                if let Some(g) = p.grad_mut() {
                    *g *= scale;
                }
            });
        }
        norm
    }

    /// Normalises each sample of the prediction, crops it, and evaluates the pixel and
    /// perceptual losses against the prepared target.
    ///
    /// # Returns
    /// The compared graph value, the loss and its gradient with respect to that value.
    fn loss_terms(&self, graph: &mut Graph, output: Var, target: &Tensor) -> Result<(Var, f32, Tensor)> {
        let normalized = graph.max_normalize(output, NORMALIZE_EPS);
        let prediction = match self.config.crop {
            Some(crop) => graph.window(normalized, crop.vertical, crop.horizontal)?,
            None => normalized,
        };
        let (mut value, mut grad) = pixel_loss(self.config.loss, graph.value(prediction), target)?;
        if let (Some(weight), Some(perceptual)) = (self.config.perceptual_weight, self.perceptual.as_ref()) {
            let (p_value, p_grad) = perceptual.evaluate(graph.value(prediction), target)?;
            value += weight * p_value;
            grad.scaled_add(weight, &p_grad);
        }
        Ok((prediction, value, grad))
    }

    fn prepare_target(&self, target: &Tensor) -> Result<Tensor> {
        let mut normalized = target.clone();
        for mut sample in normalized.outer_iter_mut() {
            let scaled = max_normalize(&sample, NORMALIZE_EPS);
            sample.assign(&scaled);
        }
        match self.config.crop {
            Some(crop) => {
                let (_, height, width, _) = normalized.dim();
                crop.validate(height, width)?;
                Ok(normalized
                    .slice(s![
                        ..,
                        crop.vertical.0..crop.vertical.1,
                        crop.horizontal.0..crop.horizontal.1,
                        ..
                    ])
                    .to_owned())
            }
            None => Ok(normalized),
        }
    }

    /// Weighted mean absolute value of the mask parameters, zero without `mask_l1`.
    fn mask_l1_penalty(&self) -> f32 {
        let (Some(weight), Some(mask)) = (self.config.mask_l1, self.mask.as_ref()) else {
            return 0.0;
        };
        let mut penalty = 0.0;
        mask.visit_parameters(&mut |p| {
            let n = p.len().max(1) as f32;
            penalty += weight * p.value().iter().map(|v| v.abs()).sum::<f32>() / n;
        });
        penalty
    }

    /// Adds the L1 sparsity penalty of the mask parameters to their gradients.
    ///
    /// # Returns
    /// The weighted penalty value.
    fn mask_sparsity(&mut self) -> f32 {
        let penalty = self.mask_l1_penalty();
        let (Some(weight), Some(mask)) = (self.config.mask_l1, self.mask.as_mut()) else {
            return 0.0;
        };
        mask.visit_parameters_mut(&mut |p| {
            let n = p.len().max(1) as f32;
            let g = p
                .value()
                .mapv(|v| if v == 0.0 { 0.0 } else { weight * v.signum() / n });
            p.accumulate_gradient(&g);
        });
        penalty
    }

    /// One optimisation step on a batch.
    ///
    /// Forward, loss, backward and gradient validation complete before any parameter is
    /// written. With `skip_nan`, a step with non-finite gradients is logged and discarded.
    ///
    /// # Arguments
    /// - `measurements`: `N × H × W × C` measurements.
    /// - `targets`: Matching ground-truth images.
    pub fn train_step(&mut self, measurements: &Tensor, targets: &Tensor) -> Result<StepOutcome> {
        if measurements.shape() != targets.shape() {
            return Err(LenslessError::shape("training targets", measurements.shape(), targets.shape()));
        }
        self.zero_grad();
        let mut graph = Graph::new();
        let psf = match self.mask.as_mut() {
            Some(mask) => Some(mask.psf(&mut graph)?),
            None => None,
        };
        let input = graph.constant(measurements.clone());
        let output = self.solver.forward(&mut graph, input, psf)?;
        let target = self.prepare_target(targets)?;

        let (prediction, mut loss, grad) = self.loss_terms(&mut graph, output.image, &target)?;
        let mut seeds = vec![(prediction, grad)];
        let unrolled = output.unrolled.filter(|_| self.solver.has_post_process());
        if let (Some(factor), Some(unrolled)) = (self.config.unrolled_output_factor, unrolled) {
            let (prediction, value, grad) = self.loss_terms(&mut graph, unrolled, &target)?;
            loss += factor * value;
            seeds.push((prediction, grad * factor));
        }

        let mut grads = graph.backward_from(seeds)?;
        self.solver.collect_gradients(&mut grads);
        if let Some(mask) = self.mask.as_mut() {
            mask.visit_parameters_mut(&mut |p| p.collect_gradient(&mut grads));
        }
        loss += self.mask_sparsity();

        if let Err(err) = self.validate_gradients() {
            if !self.config.skip_nan {
                return Err(err);
            }
            log::warn!("skipping step: {err}");
            self.zero_grad();
            return Ok(StepOutcome { loss, skipped: true });
        }

        if let Some(max_norm) = self.config.clip_grad {
            for group in self.groups() {
                let norm = self.clip_gradients(group, max_norm);
                log::debug!("{group} gradient norm {norm:.4e}");
            }
        }

        let optimizer = &mut self.optimizer;
        self.solver.visit_parameters_mut(&mut |p| optimizer.update(p));
        if let (Some(mask), Some(optimizer)) = (self.mask.as_mut(), self.mask_optimizer.as_mut()) {
            mask.visit_parameters_mut(&mut |p| optimizer.update(p));
            mask.project();
            self.solver.set_psf(&mask.current_psf())?;
        }
        Ok(StepOutcome { loss, skipped: false })
    }

    /// Inserts, freezes and unfreezes the processors scheduled for `epoch`.
    fn apply_component_schedule(&mut self, epoch: usize) -> Result<()> {
        let channels = self.solver.shape().2;
        let before = self.solver.num_trainable();
        let unrolled = self.solver.config().clone();
        if let Some(pre) = unrolled.pre_process.as_ref() {
            if pre.delay == Some(epoch) {
                log::info!("epoch {epoch}: inserting the pre-processor");
                self.solver
                    .insert_pre_process(ProcessNetwork::new("pre_process", channels, pre)?)?;
            }
            if pre.freeze == Some(epoch) {
                log::info!("epoch {epoch}: freezing the pre-processor");
                self.solver.freeze_pre_process();
            }
            if pre.unfreeze == Some(epoch) {
                log::info!("epoch {epoch}: unfreezing the pre-processor");
                self.solver.unfreeze_pre_process();
            }
        }
        if let Some(post) = unrolled.post_process.as_ref() {
            if post.delay == Some(epoch) {
                log::info!("epoch {epoch}: inserting the post-processor");
                self.solver
                    .insert_post_process(ProcessNetwork::new("post_process", channels, post)?)?;
            }
            if post.freeze == Some(epoch) {
                log::info!("epoch {epoch}: freezing the post-processor");
                self.solver.freeze_post_process();
            }
            if post.unfreeze == Some(epoch) {
                log::info!("epoch {epoch}: unfreezing the post-processor");
                self.solver.unfreeze_post_process();
            }
        }
        let after = self.solver.num_trainable();
        if after != before {
            log::info!("trainable values: {before} -> {after}");
        }
        Ok(())
    }

    fn apply_learning_rate(&mut self, epoch: usize) {
        let factor = self.schedule.factor(epoch);
        let opt = &self.config.optimizer;
        self.optimizer.set_lr(opt.lr * factor);
        if let Some(mask_optimizer) = self.mask_optimizer.as_mut() {
            mask_optimizer.set_lr(opt.mask_lr.unwrap_or(opt.lr) * factor);
        }
        log::debug!("epoch {epoch}: learning rate {:.3e}", self.optimizer.lr());
    }

    /// # Returns
    /// The mean loss of the applied steps, or `None` if the abort flag interrupted the epoch.
    fn train_epoch(&mut self, epoch: usize) -> Result<Option<f32>> {
        let batches = dataset::shuffled_batches(
            self.train_set.len(),
            self.config.batch_size,
            self.config.seed.wrapping_add(epoch as u64),
        );
        let abort_flag = Arc::clone(&self.abort_flag);
        let mut total = 0.0f64;
        let mut applied = 0usize;
        let outcome = try_for_each_cancellable(batches, &abort_flag, |batch| -> Result<()> {
            let mut measurements = Vec::with_capacity(batch.len());
            let mut targets = Vec::with_capacity(batch.len());
            for index in batch {
                let (m, t) = self.train_set.get(index)?;
                measurements.push(m);
                targets.push(t);
            }
            let step = self.train_step(&dataset::stack(&measurements)?, &dataset::stack(&targets)?)?;
            if !step.skipped {
                total += step.loss as f64;
                applied += 1;
            }
            log::debug!("epoch {epoch}: batch loss {:.4e}", step.loss);
            Ok(())
        })?;
        if outcome.is_aborted() {
            log::info!("epoch {epoch} aborted after {} batches", outcome.processed());
            return Ok(None);
        }
        if applied == 0 {
            log::warn!("epoch {epoch}: every step was skipped");
            return Ok(Some(f32::NAN));
        }
        Ok(Some((total / applied as f64) as f32))
    }

    /// Score compared against the best so far.
    fn eval_score(&self, loss: f32, eval: &EvalMetrics) -> f32 {
        match self.config.metric_for_best_model {
            Some(MetricKey::Loss) => loss,
            Some(MetricKey::Mse) => eval.mse,
            Some(MetricKey::Mae) => eval.mae,
            Some(MetricKey::Psnr) => eval.psnr,
            Some(MetricKey::Ssim) => eval.ssim,
            Some(MetricKey::Perceptual) => eval.perceptual.unwrap_or(f32::INFINITY),
            None => {
                let mut score = eval.mse;
                if let (Some(weight), Some(p)) = (self.config.perceptual_weight, eval.perceptual) {
                    score += weight * p;
                }
                score + self.mask_l1_penalty()
            }
        }
    }

    fn save(&self, dir: &Path, label: &str) -> Result<()> {
        save_checkpoint(dir, label, &self.solver, self.mask.as_deref())
    }

    /// Evaluation, metrics record and checkpoints after `epoch` (counted from 1).
    fn on_epoch_end(&mut self, epoch: usize, loss: f32, save_dir: Option<&Path>) -> Result<()> {
        let abort_flag = Arc::clone(&self.abort_flag);
        let eval = benchmark(
            &mut self.solver,
            self.test_set.as_ref(),
            self.config.eval_batch_size,
            self.config.crop.as_ref(),
            self.perceptual.as_deref(),
            &abort_flag,
        )?;
        let Some(eval) = eval else {
            return Ok(());
        };
        self.metrics.push_epoch(loss, &eval)?;
        let score = self.eval_score(loss, &eval);
        let improved = self.metrics.update_best(epoch, score);
        log::info!(
            "epoch {epoch}: loss {loss:.4e}, MSE {:.4e}, PSNR {:.2} dB, SSIM {:.4}{}",
            eval.mse,
            eval.psnr,
            eval.ssim,
            if improved { " (best)" } else { "" }
        );
        if let Some(dir) = save_dir {
            std::fs::create_dir_all(dir)?;
            self.metrics.save(dir)?;
            if improved {
                self.save(dir, "BEST")?;
            }
            if let Some(every) = self.config.save_every {
                if every > 0 && epoch % every == 0 {
                    self.save(dir, &epoch.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Trains for `n_epoch` epochs, continuing the epoch count of earlier calls.
    ///
    /// # Arguments
    /// - `n_epoch`: Number of epochs.
    /// - `save_dir`: Directory for `metrics.json` and the checkpoints; nothing is written when
    ///   `None`.
    ///
    /// # Returns
    /// How many epochs ran and whether the abort flag ended training early.
    pub fn train(&mut self, n_epoch: usize, save_dir: Option<&Path>) -> Result<LoopOutcome> {
        let save_dir: Option<PathBuf> = save_dir.map(Path::to_path_buf);
        let abort_flag = Arc::clone(&self.abort_flag);
        let outcome = try_for_each_cancellable(0..n_epoch, &abort_flag, |_| -> Result<()> {
            let epoch = self.epochs_done;
            self.apply_component_schedule(epoch)?;
            self.apply_learning_rate(epoch);
            let Some(loss) = self.train_epoch(epoch)? else {
                return Ok(());
            };
            self.epochs_done += 1;
            let done = self.epochs_done;
            self.on_epoch_end(done, loss, save_dir.as_deref())
        })?;
        if outcome.is_aborted() {
            log::info!("training aborted after {} epochs", self.epochs_done);
        } else {
            log::info!(
                "training finished: best epoch {} with score {:.4e}",
                self.metrics.best_epoch(),
                self.metrics.best_eval_score()
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Crop, Method, OptimizerConfig, ProcessConfig, UnrolledConfig};
    use approx::assert_relative_eq;
    use crate::mask::TrainablePsf;
    use crate::psf::gaussian_psf;
    use ndarray::{Array3, Axis};
    use std::sync::atomic::Ordering;

    fn images(n: usize, h: usize, w: usize) -> Vec<Array3<f32>> {
        (0..n)
            .map(|k| {
                Array3::from_shape_fn((h, w, 1), |(i, j, _)| {
                    0.1 + ((i * 3 + j * 5 + k) % 7) as f32 / 7.0
                })
            })
            .collect()
    }

    fn dataset(psf: &Array3<f32>, n: usize) -> Box<dyn Dataset> {
        let (h, w, _) = psf.dim();
        Box::new(InMemoryDataset::simulate(psf, images(n, h, w)).unwrap())
    }

    fn unrolled(method: Method) -> UnrolledConfig {
        UnrolledConfig {
            method,
            n_iter: 3,
            ..Default::default()
        }
    }

    fn training() -> TrainingConfig {
        TrainingConfig {
            batch_size: 1,
            eval_batch_size: 2,
            seed: 7,
            clip_grad: Some(1.0),
            optimizer: OptimizerConfig {
                lr: 1e-3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn trainer(method: Method, config: TrainingConfig) -> Trainer {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let solver = UnrolledSolver::new(&psf, &unrolled(method)).unwrap();
        Trainer::new(solver, dataset(&psf, 2), dataset(&psf, 2), config, None, None).unwrap()
    }

    fn parameter_values(solver: &UnrolledSolver) -> Vec<f32> {
        let mut values = Vec::new();
        solver.visit_parameters(&mut |p| values.extend(p.value().iter().cloned()));
        values
    }

    fn batch(trainer: &Trainer) -> (Tensor, Tensor) {
        let (m, t) = trainer.train_set.get(0).unwrap();
        (m.insert_axis(Axis(0)), t.insert_axis(Axis(0)))
    }

    #[test]
    fn test_training_step_changes_parameters() {
        for method in [
            Method::UnrolledFista,
            Method::UnrolledAdmm,
            Method::TrainableInversion,
        ] {
            let mut trainer = trainer(method, training());
            let before = parameter_values(trainer.solver());
            let (m, t) = batch(&trainer);
            let outcome = trainer.train_step(&m, &t).unwrap();
            assert!(outcome.loss.is_finite(), "{method}");
            assert!(!outcome.skipped);
            let after = parameter_values(trainer.solver());
            assert!(before.iter().zip(after.iter()).any(|(a, b)| a != b), "{method}");
        }
    }

    #[test]
    fn test_clipping_bounds_the_gradient_norm() {
        let mut trainer = trainer(Method::UnrolledFista, training());
        trainer.solver.visit_parameters_mut(&mut |p| {
            let g = Tensor::from_elem(p.value().raw_dim(), 10.0);
            p.accumulate_gradient(&g);
        });
        let norm = trainer.clip_gradients(ParameterGroup::Reconstruction, 1.0);
        assert!(norm > 1.0);
        let mut total = 0.0;
        trainer.solver.visit_parameters(&mut |p| total += norm_sq(p.grad().unwrap()));
        assert!(total.sqrt() <= 1.0 + 1e-4);
    }

    #[test]
    fn test_nan_gradients_raise_or_skip() {
        let mut strict = trainer(Method::UnrolledFista, training());
        let (m, t) = batch(&strict);
        let mut poisoned = m.clone();
        poisoned[[0, 0, 0, 0]] = f32::NAN;
        let err = strict.train_step(&poisoned, &t).unwrap_err();
        assert!(matches!(
            err,
            LenslessError::NumericInstability { ref group } if group == "reconstruction"
        ));

        let mut lenient = trainer(
            Method::UnrolledFista,
            TrainingConfig {
                skip_nan: true,
                ..training()
            },
        );
        let before = parameter_values(lenient.solver());
        let outcome = lenient.train_step(&poisoned, &t).unwrap();
        assert!(outcome.skipped);
        assert_eq!(before, parameter_values(lenient.solver()));
    }

    #[test]
    fn test_mask_training_projects_and_updates_psf() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let solver = UnrolledSolver::new(&psf, &unrolled(Method::UnrolledFista)).unwrap();
        let mask: Box<dyn TrainableMask> = Box::new(TrainablePsf::new(&psf).unwrap());
        let mut trainer = Trainer::new(
            solver,
            dataset(&psf, 2),
            dataset(&psf, 2),
            TrainingConfig {
                mask_l1: Some(1e-3),
                optimizer: OptimizerConfig {
                    lr: 1e-3,
                    mask_lr: Some(1e-2),
                    ..Default::default()
                },
                ..training()
            },
            Some(mask),
            None,
        )
        .unwrap();
        let (m, t) = batch(&trainer);
        let outcome = trainer.train_step(&m, &t).unwrap();
        assert!(outcome.loss.is_finite());
        let mask_psf = trainer.mask().unwrap().current_psf();
        assert!(mask_psf.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(trainer.solver().psf(), &mask_psf);
        assert_ne!(mask_psf, psf);
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let build = |config: TrainingConfig| {
            let solver = UnrolledSolver::new(&psf, &unrolled(Method::UnrolledFista)).unwrap();
            Trainer::new(solver, dataset(&psf, 1), dataset(&psf, 1), config, None, None)
        };
        for config in [
            TrainingConfig {
                perceptual_weight: Some(0.1),
                ..training()
            },
            TrainingConfig {
                mask_l1: Some(0.1),
                ..training()
            },
            TrainingConfig {
                unrolled_output_factor: Some(0.5),
                ..training()
            },
            TrainingConfig {
                batch_size: 0,
                ..training()
            },
        ] {
            assert!(matches!(build(config), Err(LenslessError::Configuration(_))));
        }
    }

    #[test]
    fn test_train_writes_metrics_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let solver = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                return_unrolled_output: true,
                post_process: Some(ProcessConfig {
                    depth: 2,
                    hidden_channels: 2,
                    delay: Some(1),
                    ..Default::default()
                }),
                ..unrolled(Method::UnrolledFista)
            },
        )
        .unwrap();
        let perceptual: Box<dyn PerceptualLoss> = Box::new(GradientSimilarity);
        let mut trainer = Trainer::new(
            solver,
            dataset(&psf, 3),
            dataset(&psf, 2),
            TrainingConfig {
                save_every: Some(1),
                perceptual_weight: Some(0.1),
                unrolled_output_factor: Some(0.5),
                metric_for_best_model: Some(MetricKey::Psnr),
                ..training()
            },
            None,
            Some(perceptual),
        )
        .unwrap();
        assert!(!trainer.solver().has_post_process());
        let outcome = trainer.train(2, Some(dir.path())).unwrap();
        assert_eq!(outcome, LoopOutcome::Completed { processed: 2 });
        assert!(trainer.solver().has_post_process());
        assert_eq!(trainer.epochs_done(), 2);

        let metrics = trainer.metrics();
        for key in metrics.keys() {
            assert_eq!(metrics.series(key).unwrap().len(), 2, "{key}");
        }
        assert!(metrics.best_epoch() >= 1);
        let json = std::fs::read_to_string(dir.path().join(metrics::METRICS_FILE)).unwrap();
        assert!(json.contains("GRADIENT_SIMILARITY"));
        assert!(checkpoint::recon_path(dir.path(), "BEST").exists());
        assert!(checkpoint::recon_path(dir.path(), "1").exists());
        assert!(checkpoint::recon_path(dir.path(), "2").exists());
    }

    #[test]
    fn test_crop_outside_image_rejected() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let build = |crop: Crop| {
            let solver = UnrolledSolver::new(&psf, &unrolled(Method::UnrolledFista)).unwrap();
            let config = TrainingConfig {
                crop: Some(crop),
                ..training()
            };
            Trainer::new(solver, dataset(&psf, 1), dataset(&psf, 1), config, None, None)
        };
        for crop in [
            Crop {
                vertical: (0, 20),
                horizontal: (0, 8),
            },
            Crop {
                vertical: (2, 6),
                horizontal: (5, 5),
            },
        ] {
            assert!(matches!(build(crop), Err(LenslessError::Configuration(_))));
        }

        let mut trainer = build(Crop {
            vertical: (2, 6),
            horizontal: (1, 7),
        })
        .unwrap();
        let (m, t) = batch(&trainer);
        assert!(trainer.train_step(&m, &t).unwrap().loss.is_finite());
    }

    #[test]
    fn test_unrolled_output_ignored_until_post_processor_exists() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let build = |factor: Option<f32>| {
            let solver = UnrolledSolver::new(
                &psf,
                &UnrolledConfig {
                    return_unrolled_output: true,
                    post_process: Some(ProcessConfig {
                        depth: 2,
                        hidden_channels: 2,
                        delay: Some(1),
                        ..Default::default()
                    }),
                    ..unrolled(Method::UnrolledFista)
                },
            )
            .unwrap();
            let config = TrainingConfig {
                unrolled_output_factor: factor,
                ..training()
            };
            Trainer::new(solver, dataset(&psf, 1), dataset(&psf, 1), config, None, None).unwrap()
        };
        let mut weighted = build(Some(0.5));
        let mut plain = build(None);
        assert!(!weighted.solver().has_post_process());
        let (m, t) = batch(&weighted);
        let weighted_loss = weighted.train_step(&m, &t).unwrap().loss;
        let plain_loss = plain.train_step(&m, &t).unwrap().loss;
        assert_relative_eq!(weighted_loss, plain_loss, epsilon = 1e-6);
    }

    #[test]
    fn test_default_eval_score_includes_mask_sparsity() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let solver = UnrolledSolver::new(&psf, &unrolled(Method::UnrolledFista)).unwrap();
        let mask: Box<dyn TrainableMask> = Box::new(TrainablePsf::new(&psf).unwrap());
        let trainer = Trainer::new(
            solver,
            dataset(&psf, 1),
            dataset(&psf, 1),
            TrainingConfig {
                mask_l1: Some(0.5),
                ..training()
            },
            Some(mask),
            None,
        )
        .unwrap();
        let eval = EvalMetrics {
            mse: 0.25,
            mae: 0.4,
            psnr: 6.0,
            ssim: 0.3,
            perceptual: None,
        };
        let mean_abs = psf.mapv(f32::abs).sum() / psf.len() as f32;
        assert_relative_eq!(
            trainer.eval_score(1.0, &eval),
            0.25 + 0.5 * mean_abs,
            epsilon = 1e-6
        );

        let unmasked = self::trainer(Method::UnrolledFista, training());
        assert_relative_eq!(unmasked.eval_score(1.0, &eval), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_abort_flag_stops_training() {
        let mut trainer = trainer(Method::TrainableInversion, training());
        trainer.abort_flag().store(true, Ordering::Relaxed);
        let outcome = trainer.train(3, None).unwrap();
        assert_eq!(outcome, LoopOutcome::Aborted { processed: 0 });
        assert_eq!(trainer.epochs_done(), 0);
        assert!(trainer.metrics().is_empty());
    }
}
