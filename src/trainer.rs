//! The training loop.
//!
//! Each step draws a batch from the flow, evaluates the integrand once,
//! computes the divergence and its gradient coefficients, backpropagates
//! them through the flow and applies one Adam update.

use std::ops::ControlFlow;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointRef};
use crate::error::{FlowError, Result};
use crate::flow::FlowModel;
use crate::integrand::{Integrand, IntegrandError};
use crate::integrator::RunningEstimate;
use crate::math::ewma;
use crate::optimizer::Adam;
use crate::settings::TrainSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    Initialized,
    Training,
    /// Set by the caller through [`Trainer::mark_converged`].
    Converged,
    Failed,
}

/// Diagnostics of one training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStep {
    pub step_index: u64,
    pub loss: f64,
    /// Integral estimate of this batch
    pub integral: f64,
    pub std_error: f64,
    /// Kish effective sample size of the batch weights
    pub effective_sample_size: f64,
    pub n_nonfinite: usize,
    pub n_domain: usize,
    pub learning_rate: f64,
    pub grad_norm: f64,
    /// False if the parameters were left unchanged
    pub accepted: bool,
}

/// The loss stopped improving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceWarning {
    /// Number of recent steps that were compared
    pub window: usize,
    pub best_in_window: f64,
    pub best_before: f64,
}

pub struct Trainer<'a> {
    flow: &'a mut FlowModel,
    optimizer: Adam,
    settings: TrainSettings,
    state: TrainerState,
    history: Vec<TrainStep>,
    consecutive_failures: u64,
    step: u64,
    checkpoint_path: Option<PathBuf>,
    unsaved_steps: u64,
    plateau_reported: bool,
    best_loss: f64,
}

impl<'a> Trainer<'a> {
    pub fn new(flow: &'a mut FlowModel, settings: TrainSettings) -> Result<Self> {
        Self::resume(flow, settings, None, 0)
    }

    /// Continue a run from a checkpoint's optimizer state and step counter.
    ///
    /// A restored optimizer keeps its own options; `settings.adam` is only
    /// used when `optimizer` is `None`.
    pub fn resume(
        flow: &'a mut FlowModel,
        settings: TrainSettings,
        optimizer: Option<Adam>,
        step: u64,
    ) -> Result<Self> {
        settings.validate()?;
        let optimizer = optimizer.unwrap_or_else(|| Adam::new(settings.adam));
        Ok(Self {
            flow,
            optimizer,
            settings,
            state: TrainerState::Initialized,
            history: vec![],
            consecutive_failures: 0,
            step,
            checkpoint_path: None,
            unsaved_steps: 0,
            plateau_reported: false,
            best_loss: f64::INFINITY,
        })
    }

    /// Save a checkpoint to `path` on failure, on drop and every
    /// `checkpoint_every` steps.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn flow(&self) -> &FlowModel {
        &*self.flow
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn settings(&self) -> &TrainSettings {
        &self.settings
    }

    /// Steps taken, including the ones of the run this trainer resumed.
    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    pub fn history(&self) -> &[TrainStep] {
        &self.history
    }

    /// Lowest batch loss seen by this trainer.
    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss.is_finite().then_some(self.best_loss)
    }

    pub fn mark_converged(&mut self) {
        if self.state != TrainerState::Failed {
            info!(step = self.step, "training marked as converged");
            self.state = TrainerState::Converged;
        }
    }

    /// Exponentially weighted moving average of the integral estimates of
    /// the accepted steps, most recent weighted highest.
    pub fn ewma_integral(&self, window: usize) -> Option<f64> {
        let integrals: Vec<f64> = self
            .history
            .iter()
            .filter(|step| step.accepted)
            .map(|step| step.integral)
            .collect();
        ewma(&integrals, window)
    }

    /// Report a plateau if the best loss of the last `plateau_window`
    /// accepted steps is no better than the best loss before them.
    pub fn convergence_warning(&self) -> Option<ConvergenceWarning> {
        let losses: Vec<f64> = self
            .history
            .iter()
            .filter(|step| step.accepted)
            .map(|step| step.loss)
            .collect();
        let window = self.settings.plateau_window;
        if losses.len() <= window {
            return None;
        }
        let (before, recent) = losses.split_at(losses.len() - window);
        let best_before = before.iter().copied().fold(f64::INFINITY, f64::min);
        let best_in_window = recent.iter().copied().fold(f64::INFINITY, f64::min);
        (best_in_window >= best_before).then_some(ConvergenceWarning {
            window,
            best_in_window,
            best_before,
        })
    }

    pub fn save_checkpoint(&mut self) -> Result<()> {
        if let Some(path) = self.checkpoint_path.as_ref() {
            CheckpointRef::new(&*self.flow, Some(&self.optimizer), self.step).save(path)?;
            self.unsaved_steps = 0;
        }
        Ok(())
    }

    /// Write the parameters that produced the current accepted batch, before
    /// they are updated, as the best ones so far.
    fn save_best(&self, step_index: u64) {
        if !self.settings.keep_best {
            return;
        }
        let Some(path) = self.checkpoint_path.as_ref() else {
            return;
        };
        let best = CheckpointRef::new(&*self.flow, Some(&self.optimizer), step_index);
        if let Err(err) = best.save(&Checkpoint::best_path(path)) {
            warn!(error = %err, "could not save best checkpoint");
        }
    }

    fn fail(&mut self, err: FlowError) -> FlowError {
        error!(step = self.step, error = %err, "training failed");
        self.state = TrainerState::Failed;
        if let Err(save_err) = self.save_checkpoint() {
            error!(error = %save_err, "could not save checkpoint of failed run");
        }
        err
    }

    fn reject(&mut self, mut record: TrainStep, reason: &str) -> Result<TrainStep> {
        self.consecutive_failures += 1;
        warn!(
            step = record.step_index,
            consecutive = self.consecutive_failures,
            reason,
            "rejected training step"
        );
        record.accepted = false;
        record.learning_rate = 0.;
        self.history.push(record.clone());
        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            return Err(self.fail(FlowError::TrainingFailed {
                consecutive: self.consecutive_failures,
            }));
        }
        Ok(record)
    }

    /// Take one training step.
    ///
    /// Returns the diagnostics of the step, also for steps that were rejected
    /// without changing the parameters. Errors move the trainer to
    /// [`TrainerState::Failed`].
    pub fn step<I, R>(&mut self, integrand: &mut I, rng: &mut R) -> Result<TrainStep>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        match self.state {
            TrainerState::Converged | TrainerState::Failed => {
                return Err(FlowError::InvalidState(self.state));
            }
            TrainerState::Initialized => {
                info!(
                    step = self.step,
                    num_params = self.flow.num_params(),
                    "starting training"
                );
                self.state = TrainerState::Training;
            }
            TrainerState::Training => {}
        }

        if integrand.dim() != self.flow.dim() {
            return Err(self.fail(FlowError::Shape {
                what: "integrand dimension",
                expected: self.flow.dim(),
                found: integrand.dim(),
            }));
        }

        let step_index = self.step;
        self.step += 1;
        self.unsaved_steps += 1;
        let mut record = TrainStep {
            step_index,
            loss: f64::NAN,
            integral: f64::NAN,
            std_error: f64::NAN,
            effective_sample_size: 0.,
            n_nonfinite: 0,
            n_domain: 0,
            learning_rate: 0.,
            grad_norm: f64::NAN,
            accepted: false,
        };

        let (points, log_prob) = self.flow.sample(self.settings.batch_size, rng);
        let values = match integrand.evaluate(&points) {
            Ok(values) => values,
            Err(err) if err.is_recoverable() => {
                return self.reject(record, &format!("integrand error: {err}"));
            }
            Err(err) => return Err(self.fail(FlowError::Integrand(Box::new(err)))),
        };

        let loss = match self.settings.divergence.compute(&points, &log_prob, &values) {
            Ok(loss) => loss,
            Err(err) => return Err(self.fail(err)),
        };
        record.loss = loss.loss;
        record.integral = loss.integral;
        record.std_error = loss.std_error;
        record.n_nonfinite = loss.n_nonfinite;
        record.n_domain = loss.n_domain;

        let mut running = RunningEstimate::default();
        running.add_batch(&values, &log_prob);
        record.effective_sample_size = running.finalize().weight_ess;

        if loss.n_used == 0 {
            return self.reject(record, "no usable sample in batch");
        }

        let gradient = match self.flow.log_prob_gradient(&points, &loss.coefficients) {
            Ok((_, gradient)) => gradient,
            Err(err) => return Err(self.fail(err)),
        };
        record.grad_norm = gradient.norm();
        if !gradient.is_finite() {
            return self.reject(record, "non-finite gradient");
        }
        if loss.loss < self.best_loss {
            debug!(step = step_index, loss = loss.loss, "new best loss");
            self.best_loss = loss.loss;
            self.save_best(step_index);
        }

        record.learning_rate = match self.optimizer.update(self.flow.parameters_mut(), &gradient) {
            Ok(lr) => lr,
            Err(err) => return Err(self.fail(err)),
        };
        record.accepted = true;
        self.consecutive_failures = 0;

        debug!(
            step = record.step_index,
            loss = record.loss,
            integral = record.integral,
            std_error = record.std_error,
            ess = record.effective_sample_size,
            grad_norm = record.grad_norm,
            lr = record.learning_rate,
            "training step"
        );
        self.history.push(record.clone());

        if let Some(every) = self.settings.checkpoint_every {
            if self.step % every == 0 {
                if let Err(err) = self.save_checkpoint() {
                    warn!(error = %err, "could not save periodic checkpoint");
                }
            }
        }
        Ok(record)
    }

    /// Run up to `n_steps` steps.
    ///
    /// `callback` sees every step and can stop the loop between batches.
    pub fn train<I, R, F>(
        &mut self,
        n_steps: u64,
        integrand: &mut I,
        rng: &mut R,
        mut callback: F,
    ) -> Result<()>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
        F: FnMut(&TrainStep) -> ControlFlow<()>,
    {
        for _ in 0..n_steps {
            let record = self.step(integrand, rng)?;
            if !self.plateau_reported {
                if let Some(warning) = self.convergence_warning() {
                    warn!(
                        step = record.step_index,
                        best_in_window = warning.best_in_window,
                        best_before = warning.best_before,
                        "loss has not improved in the last {} steps",
                        warning.window
                    );
                    self.plateau_reported = true;
                }
            }
            if callback(&record).is_break() {
                info!(step = record.step_index, "training stopped by callback");
                break;
            }
        }
        Ok(())
    }
}

impl Drop for Trainer<'_> {
    fn drop(&mut self) {
        if self.unsaved_steps == 0 || self.state == TrainerState::Failed {
            return;
        }
        if let Err(err) = self.save_checkpoint() {
            error!(error = %err, "could not save checkpoint on exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioner::{Activation, ConditionerOptions};
    use crate::integrand::tests::{Scripted, TestError};
    use crate::integrand::FnIntegrand;
    use crate::settings::FlowSettings;
    use pretty_assertions::assert_eq;
    use rand::{rngs::SmallRng, SeedableRng};

    fn small_settings() -> TrainSettings {
        TrainSettings {
            batch_size: 64,
            max_consecutive_failures: 3,
            plateau_window: 5,
            ..Default::default()
        }
    }

    fn flow(dim: usize) -> FlowModel {
        let mut rng = SmallRng::seed_from_u64(0);
        FlowModel::new(FlowSettings::with_dim(dim), &mut rng).unwrap()
    }

    #[test]
    fn takes_steps_and_records_history() {
        let mut flow = flow(2);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut integrand = FnIntegrand::from_fn(2, |x: &[f64]| 1. + x[0]);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        assert_eq!(trainer.state(), TrainerState::Initialized);
        let step = trainer.step(&mut integrand, &mut rng).unwrap();
        assert!(step.accepted);
        assert_eq!(step.step_index, 0);
        assert_eq!(trainer.state(), TrainerState::Training);

        let mut seen = 0;
        trainer
            .train(10, &mut integrand, &mut rng, |_| {
                seen += 1;
                if seen == 4 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, 4);
        assert_eq!(trainer.history().len(), 5);
        assert_eq!(trainer.steps_taken(), 5);
        assert_eq!(trainer.optimizer().num_steps(), 5);
        let average = trainer.ewma_integral(3).unwrap();
        assert!((average - 1.5).abs() < 0.2);
    }

    #[test]
    fn constant_integrand_has_no_gradient() {
        let mut flow = flow(2);
        let mut rng = SmallRng::seed_from_u64(2);
        let mut integrand = FnIntegrand::from_fn(2, |_: &[f64]| 2.);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        let step = trainer.step(&mut integrand, &mut rng).unwrap();
        assert!(step.grad_norm < 1e-10);
        assert!((step.integral - 2.).abs() < 1e-10);
        assert!(step.std_error < 1e-10);
    }

    #[test]
    fn recoverable_errors_fail_after_threshold() {
        let mut flow = flow(1);
        let before = flow.clone();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut integrand = Scripted {
            dim: 1,
            errors: vec![TestError::Transient, TestError::Transient, TestError::Transient],
            calls: 0,
        };
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        assert!(!trainer.step(&mut integrand, &mut rng).unwrap().accepted);
        assert!(!trainer.step(&mut integrand, &mut rng).unwrap().accepted);
        assert!(matches!(
            trainer.step(&mut integrand, &mut rng),
            Err(FlowError::TrainingFailed { consecutive: 3 })
        ));
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert!(matches!(
            trainer.step(&mut integrand, &mut rng),
            Err(FlowError::InvalidState(TrainerState::Failed))
        ));
        drop(trainer);
        for (a, b) in flow.stack().layers().iter().zip(before.stack().layers()) {
            assert_eq!(a.params(), b.params());
        }
    }

    #[test]
    fn accepted_step_resets_failure_count() {
        let mut flow = flow(1);
        let mut rng = SmallRng::seed_from_u64(4);
        let mut integrand = Scripted {
            dim: 1,
            errors: vec![TestError::Transient, TestError::Transient],
            calls: 0,
        };
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        trainer.train(3, &mut integrand, &mut rng, |_| ControlFlow::Continue(())).unwrap();
        integrand.errors = vec![TestError::Transient, TestError::Transient];
        trainer.train(3, &mut integrand, &mut rng, |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(trainer.state(), TrainerState::Training);
        assert_eq!(trainer.history().iter().filter(|s| s.accepted).count(), 2);
    }

    #[test]
    fn fatal_errors_fail_immediately() {
        let mut flow = flow(1);
        let mut rng = SmallRng::seed_from_u64(5);
        let mut integrand = Scripted {
            dim: 1,
            errors: vec![TestError::Fatal],
            calls: 0,
        };
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        assert!(matches!(
            trainer.step(&mut integrand, &mut rng),
            Err(FlowError::Integrand(_))
        ));
        assert_eq!(trainer.state(), TrainerState::Failed);

        let mut flow = self::flow(2);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        let mut wrong_dim = FnIntegrand::from_fn(3, |_: &[f64]| 1.);
        assert!(matches!(
            trainer.step(&mut wrong_dim, &mut rng),
            Err(FlowError::Shape { .. })
        ));
        assert_eq!(trainer.state(), TrainerState::Failed);
    }

    #[test]
    fn nan_batches_are_rejected() {
        let mut flow = flow(1);
        let mut rng = SmallRng::seed_from_u64(6);
        let mut integrand = FnIntegrand::from_fn(1, |_: &[f64]| f64::NAN);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        let step = trainer.step(&mut integrand, &mut rng).unwrap();
        assert!(!step.accepted);
        assert_eq!(step.n_nonfinite, 64);
    }

    #[test]
    fn non_finite_gradients_fail_after_threshold() {
        let settings = FlowSettings {
            conditioner: ConditionerOptions {
                activation: Activation::Tanh,
                ..Default::default()
            },
            ..FlowSettings::with_dim(2)
        };
        let mut flow = FlowModel::new(settings, &mut SmallRng::seed_from_u64(0)).unwrap();
        {
            // Conditioner of the first layer: one held input, two tanh layers of
            // width 32, then the 21 quadratic spline parameters. With every
            // unit at tanh(0) = 0 the layer stays the identity, but the chain
            // of two f64::MAX weights overflows when backpropagated.
            let width = 32;
            let second = 2 * width;
            let output = second + (width + 1) * width;
            let params = flow.parameters_mut().next().unwrap();
            params.iter_mut().for_each(|p| *p = 0.);
            params[second] = f64::MAX;
            // weight from the first hidden unit to the first raw knot height
            params[output + 10 * width] = f64::MAX;
        }
        let before = flow.clone();

        let mut rng = SmallRng::seed_from_u64(10);
        let mut integrand = FnIntegrand::from_fn(2, |x: &[f64]| 1. + x[0]);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        for _ in 0..2 {
            let step = trainer.step(&mut integrand, &mut rng).unwrap();
            assert!(!step.accepted);
            assert!(step.loss.is_finite());
            assert!(!step.grad_norm.is_finite());
        }
        assert!(matches!(
            trainer.step(&mut integrand, &mut rng),
            Err(FlowError::TrainingFailed { consecutive: 3 })
        ));
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert_eq!(trainer.optimizer().num_steps(), 0);
        assert_eq!(trainer.best_loss(), None);
        drop(trainer);
        for (a, b) in flow.stack().layers().iter().zip(before.stack().layers()) {
            assert_eq!(a.params(), b.params());
        }
    }

    #[test]
    fn converged_trainer_refuses_steps() {
        let mut flow = flow(1);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut integrand = FnIntegrand::from_fn(1, |x: &[f64]| x[0]);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        trainer.step(&mut integrand, &mut rng).unwrap();
        trainer.mark_converged();
        assert!(matches!(
            trainer.step(&mut integrand, &mut rng),
            Err(FlowError::InvalidState(TrainerState::Converged))
        ));
    }

    #[test]
    fn plateau_detection() {
        let mut flow = flow(1);
        let mut trainer = Trainer::new(&mut flow, small_settings()).unwrap();
        let record = |step_index, loss| TrainStep {
            step_index,
            loss,
            integral: 1.,
            std_error: 0.1,
            effective_sample_size: 10.,
            n_nonfinite: 0,
            n_domain: 0,
            learning_rate: 1e-3,
            grad_norm: 1.,
            accepted: true,
        };
        trainer.history = (0..5).map(|i| record(i, 1. - i as f64 * 0.1)).collect();
        assert!(trainer.convergence_warning().is_none());
        trainer.history.extend((5..10).map(|i| record(i, 0.8)));
        let warning = trainer.convergence_warning().unwrap();
        assert_eq!(warning.window, 5);
        assert_eq!(warning.best_in_window, 0.8);
        assert!((warning.best_before - 0.6).abs() < 1e-12);
        trainer.history.push(record(10, 0.5));
        assert!(trainer.convergence_warning().is_none());
    }

    #[test]
    fn saves_on_drop_and_failure() {
        let dir = std::env::temp_dir().join(format!("flow-trainer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trainer.json");
        let mut rng = SmallRng::seed_from_u64(8);

        let mut flow = flow(2);
        let mut integrand = FnIntegrand::from_fn(2, |x: &[f64]| x[0] * x[1]);
        {
            let mut trainer = Trainer::new(&mut flow, small_settings())
                .unwrap()
                .with_checkpoint(&path);
            trainer.train(3, &mut integrand, &mut rng, |_| ControlFlow::Continue(())).unwrap();
        }
        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint.step, 3);
        assert!(!Checkpoint::best_path(&path).exists());
        assert_eq!(checkpoint.optimizer.as_ref().map(|o| o.num_steps()), Some(3));

        let Checkpoint {
            mut flow,
            optimizer,
            step,
            ..
        } = checkpoint;
        let mut failing = Scripted {
            dim: 2,
            errors: vec![TestError::Fatal],
            calls: 0,
        };
        let mut trainer = Trainer::resume(&mut flow, small_settings(), optimizer, step)
            .unwrap()
            .with_checkpoint(&path);
        assert!(trainer.step(&mut failing, &mut rng).is_err());
        drop(trainer);
        assert_eq!(Checkpoint::load(&path).unwrap().step, 4);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn keeps_parameters_with_lowest_loss() {
        let dir = std::env::temp_dir().join(format!("flow-trainer-best-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");
        let mut rng = SmallRng::seed_from_u64(9);

        let mut flow = flow(2);
        let mut integrand =
            FnIntegrand::from_fn(2, |x: &[f64]| (-10. * (x[0] - 0.3).powi(2)).exp() + x[1]);
        let settings = TrainSettings {
            keep_best: true,
            ..small_settings()
        };
        let best_step = {
            let mut trainer = Trainer::new(&mut flow, settings).unwrap().with_checkpoint(&path);
            trainer.train(8, &mut integrand, &mut rng, |_| ControlFlow::Continue(())).unwrap();
            let best = trainer
                .history()
                .iter()
                .min_by(|a, b| a.loss.total_cmp(&b.loss))
                .unwrap();
            assert_eq!(trainer.best_loss(), Some(best.loss));
            best.step_index
        };

        let best = Checkpoint::load(Checkpoint::best_path(&path)).unwrap();
        assert_eq!(best.step, best_step);
        // saved before the update of that step
        assert_eq!(best.optimizer.map(|adam| adam.num_steps()), Some(best_step));
        assert_eq!(Checkpoint::load(&path).unwrap().step, 8);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
