//! Streaming training and evaluation passes.
//!
//! Every pass walks the whole stream in chronological batches from reset memory. Training passes
//! forward every observed row, optimise on the train rows of each batch and detach memory after
//! every update; evaluation passes score every observed row and feed the per-role metric
//! accumulators.

use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    checkpoint::CheckpointStore,
    config::TrainConfig,
    dataloader::Dataset,
    early_stop::EarlyStopMonitor,
    lifecycle::{ModelSession, PassKind, PassStats},
    loss::{compute_loss, GaussianPrior, LossKind},
    metrics::{Metric, MetricSummary, PointwiseMetric},
    model::{Adam, AdamConfig, StatefulModel},
    roles::{PerSplit, Split},
    stream::Event,
    telemetry::LearningTelemetry,
};

/// Hyperparameters of the passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// Events per batch.
    pub batch_size: usize,
    /// Maximum training epochs.
    pub epochs: usize,
    /// Standard deviation of the Gaussian likelihood.
    pub observe_std: f32,
    /// Objective variant.
    pub loss: LossKind,
    /// Prior over the latent initial state.
    pub prior: GaussianPrior,
    /// Optimizer hyperparameters.
    pub adam: AdamConfig,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self::from_config(&TrainConfig::default())
    }
}

impl TrainerSettings {
    /// Settings taken from a run configuration.
    #[must_use]
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            epochs: config.epochs,
            observe_std: config.observe_std,
            loss: config.loss,
            prior: config.prior,
            adam: config.adam(),
        }
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Summary per role.
    pub metrics: PerSplit<MetricSummary>,
    /// Lifecycle counters.
    pub stats: PassStats,
}

/// Outcome of one training epoch and the evaluation pass that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Mean train-subset loss over the batches that had train rows; NaN when none had.
    pub train_loss: f64,
    /// Optimizer steps taken.
    pub optimizer_steps: usize,
    /// Counters of the training pass.
    pub train_stats: PassStats,
    /// Evaluation after the epoch.
    pub eval: PassReport,
    /// Wall-clock seconds of the training pass.
    pub seconds: f64,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run index.
    pub run: usize,
    /// Per-epoch reports.
    pub epochs: Vec<EpochReport>,
    /// Epoch whose checkpoint was restored; `None` when the pre-training state was kept.
    pub best_epoch: Option<usize>,
    /// Whether early stopping ended the run.
    pub stopped_early: bool,
    /// Final pass on the restored model.
    pub final_pass: PassReport,
    /// Final point-wise results per horizon.
    pub pointwise: Vec<(f64, PerSplit<MetricSummary>)>,
}

/// Test metrics averaged over runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Runs averaged.
    pub runs: usize,
    /// Mean of each test statistic; `count` sums the runs' counts.
    pub test: MetricSummary,
}

impl RunSummary {
    /// Averages the final test metrics. A NaN in any run makes the mean NaN.
    #[must_use]
    pub fn from_outcomes(outcomes: &[RunOutcome]) -> Self {
        let tests: Vec<MetricSummary> = outcomes
            .iter()
            .map(|outcome| outcome.final_pass.metrics.test)
            .collect();
        let average = |field: fn(&MetricSummary) -> f64| mean(&tests.iter().map(field).collect::<Vec<_>>());
        Self {
            runs: outcomes.len(),
            test: MetricSummary {
                msle: average(|s| s.msle),
                male: average(|s| s.male),
                mape: average(|s| s.mape),
                pcc: average(|s| s.pcc),
                loss: average(|s| s.loss),
                count: tests.iter().map(|s| s.count).sum(),
            },
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Drives training epochs, evaluation passes and the end-of-run restore.
#[derive(Debug, Clone)]
pub struct Trainer {
    settings: TrainerSettings,
    telemetry: LearningTelemetry,
}

impl Trainer {
    /// Trainer without telemetry sinks.
    #[must_use]
    pub fn new(settings: TrainerSettings) -> Self {
        Self {
            settings,
            telemetry: LearningTelemetry::disabled(),
        }
    }

    /// Routes logs and events through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LearningTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Pass hyperparameters.
    #[must_use]
    pub const fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Scores every observed row of the stream from reset memory.
    ///
    /// Accumulators are cleared first. Summaries are appended to the metric history and, with
    /// `move_final`, recorded as final results. `pointwise` is fed alongside when given.
    pub fn eval_model<M: StatefulModel>(
        &self,
        model: &mut M,
        data: &Dataset,
        metric: &mut Metric,
        mut pointwise: Option<&mut PointwiseMetric>,
        move_final: bool,
    ) -> Result<PassReport> {
        let settings = &self.settings;
        let mut session = ModelSession::begin(model, PassKind::Eval);
        metric.fresh();
        if let Some(pointwise) = pointwise.as_deref_mut() {
            pointwise.fresh();
        }
        let mut losses = PerSplit::<Vec<f64>>::default();
        for batch in data.stream.loader(settings.batch_size)? {
            let partition = batch.partition();
            let output = session.forward(&batch, &partition.observed())?;
            let cascades = batch.cascades();
            let predictions = output.prediction.to_vec();
            for split in Split::ALL {
                let mask = &partition[split];
                if !mask.any() {
                    continue;
                }
                let targets = mask.select(&cascades);
                let labels = data.decoder.labels(&targets)?;
                let loss = compute_loss(
                    settings.loss,
                    &output.prediction,
                    &labels,
                    mask,
                    &output.first_point,
                    settings.prior,
                    settings.observe_std,
                )?;
                losses[split].push(f64::from(loss.value));
                let selected = mask.select(&predictions);
                metric.update(&targets, &selected, &labels, split)?;
                if let Some(pointwise) = pointwise.as_deref_mut() {
                    let ages: Vec<f64> = batch.events().iter().map(Event::age).collect();
                    pointwise.update(&mask.select(&ages), &targets, &selected, &labels, split)?;
                }
            }
            session.update(&batch)?;
        }
        let stats = session.finish()?;
        let metrics = PerSplit::from_fn(|split| {
            metric.calculate_metric(split, true, move_final, mean(&losses[split]))
        });
        Ok(PassReport { metrics, stats })
    }

    /// One training epoch. Returns the pass counters, the mean train loss and the number of
    /// optimizer steps.
    pub fn train_epoch<M: StatefulModel>(
        &self,
        model: &mut M,
        data: &Dataset,
        optimizer: &mut Adam,
    ) -> Result<(PassStats, f64, usize)> {
        let settings = &self.settings;
        let mut session = ModelSession::begin(model, PassKind::Train);
        let mut losses = Vec::new();
        for batch in data.stream.loader(settings.batch_size)? {
            let partition = batch.partition();
            let train = &partition.train;
            let output = session.forward(&batch, &partition.observed())?;
            if train.any() {
                let labels = data.decoder.labels(&train.select(&batch.cascades()))?;
                let loss = compute_loss(
                    settings.loss,
                    &output.prediction,
                    &labels,
                    train,
                    &output.first_point,
                    settings.prior,
                    settings.observe_std,
                )?;
                session.optimize(&output, &loss.grad, optimizer)?;
                losses.push(f64::from(loss.value));
            }
            session.update(&batch)?;
            session.detach()?;
        }
        let stats = session.finish()?;
        Ok((stats, mean(&losses), losses.len()))
    }

    /// Trains `model` for one run.
    ///
    /// Each epoch is followed by an evaluation pass whose validation msle feeds
    /// `early_stopper`. Afterwards the best checkpoint is restored, a final pass records the
    /// final metrics, results are persisted and the restored model is saved again.
    pub fn train_model<M: StatefulModel>(
        &self,
        run: usize,
        data: &Dataset,
        model: &mut M,
        early_stopper: &mut EarlyStopMonitor,
        metric: &mut Metric,
        pointwise: Option<&mut PointwiseMetric>,
    ) -> Result<RunOutcome> {
        let telemetry = self.telemetry.for_run(run);
        telemetry.log(
            LogLevel::Info,
            "run.start",
            json!({
                "events": data.stream.len(),
                "batches": data.stream.batch_count(self.settings.batch_size),
                "roles": data.stream.role_counts(),
                "device": model.device().to_string(),
            }),
        )?;
        early_stopper.ensure_initial_checkpoint(model)?;
        let mut optimizer = Adam::new(self.settings.adam);
        let mut epochs = Vec::new();
        let mut stopped_early = false;
        for epoch in 0..self.settings.epochs {
            let started = Instant::now();
            let (train_stats, train_loss, optimizer_steps) =
                self.train_epoch(model, data, &mut optimizer)?;
            let seconds = started.elapsed().as_secs_f64();
            let eval = self.eval_model(model, data, metric, None, false)?;
            telemetry.log(
                LogLevel::Info,
                "epoch.completed",
                json!({ "epoch": epoch, "seconds": seconds, "train_loss": train_loss }),
            )?;
            for split in Split::ALL {
                metric.info(split)?;
            }
            let stop = early_stopper.early_stop_check(eval.metrics.val.msle, model)?;
            telemetry.event(
                "training.epoch_completed",
                json!({
                    "epoch": epoch,
                    "train_loss": train_loss,
                    "val": eval.metrics.val,
                }),
            )?;
            epochs.push(EpochReport {
                epoch,
                train_loss,
                optimizer_steps,
                train_stats,
                eval,
                seconds,
            });
            if stop {
                stopped_early = true;
                telemetry.log(
                    LogLevel::Info,
                    "early_stop.fired",
                    json!({ "epoch": epoch, "patience": early_stopper.patience() }),
                )?;
                telemetry.event(
                    "training.early_stopped",
                    json!({ "epoch": epoch, "best_epoch": early_stopper.best_epoch() }),
                )?;
                break;
            }
        }

        let store = early_stopper.store();
        let restored = store
            .load(model, run)
            .with_context(|| format!("restoring best checkpoint of run {run}"))?;
        telemetry.log(
            LogLevel::Info,
            "checkpoint.restored",
            json!({ "epoch": restored.epoch, "checkpoint": restored.id }),
        )?;
        let (final_pass, pointwise) = self.finish_run(run, data, model, metric, pointwise)?;
        store
            .save(model, run, restored.epoch)
            .with_context(|| format!("saving final model of run {run}"))?;
        telemetry.event(
            "training.run_completed",
            json!({ "best_epoch": restored.epoch, "test": final_pass.metrics.test }),
        )?;
        Ok(RunOutcome {
            run,
            epochs,
            best_epoch: restored.epoch,
            stopped_early,
            final_pass,
            pointwise,
        })
    }

    /// Restores the checkpoint of `run` and runs only the final pass.
    pub fn evaluate_run<M: StatefulModel>(
        &self,
        run: usize,
        data: &Dataset,
        model: &mut M,
        store: &CheckpointStore,
        metric: &mut Metric,
        pointwise: Option<&mut PointwiseMetric>,
    ) -> Result<RunOutcome> {
        let restored = store
            .load(model, run)
            .with_context(|| format!("loading checkpoint of run {run}"))?;
        let (final_pass, pointwise) = self.finish_run(run, data, model, metric, pointwise)?;
        Ok(RunOutcome {
            run,
            epochs: Vec::new(),
            best_epoch: restored.epoch,
            stopped_early: false,
            final_pass,
            pointwise,
        })
    }

    #[allow(clippy::type_complexity)]
    fn finish_run<M: StatefulModel>(
        &self,
        run: usize,
        data: &Dataset,
        model: &mut M,
        metric: &mut Metric,
        pointwise: Option<&mut PointwiseMetric>,
    ) -> Result<(PassReport, Vec<(f64, PerSplit<MetricSummary>)>)> {
        let telemetry = self.telemetry.for_run(run);
        let mut pointwise = pointwise.filter(|pointwise| !pointwise.is_empty());
        let final_pass = self.eval_model(model, data, metric, pointwise.as_deref_mut(), true)?;
        for split in Split::ALL {
            metric.info(split)?;
        }
        metric
            .save()
            .with_context(|| format!("saving metrics of run {run}"))?;
        let horizons = match pointwise {
            Some(pointwise) => {
                let results = pointwise.calculate();
                pointwise
                    .save()
                    .with_context(|| format!("saving point-wise metrics of run {run}"))?;
                results
            }
            None => Vec::new(),
        };
        telemetry.log(
            LogLevel::Info,
            "run.final",
            json!({ "metrics": final_pass.metrics, "events": final_pass.stats.events }),
        )?;
        Ok((final_pass, horizons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_manager::Device,
        early_stop::Direction,
        labels::DecoderTable,
        model::{
            CascadeMemoryModel, CascadeModelConfig, FirstPoint, ForwardOutput, ModelError,
            OutputGrad, ParamStore,
        },
        roles::{Role, RoleMask},
        stream::{EventBatch, EventStream},
        synthetic::{generate, SyntheticConfig},
    };
    use ndarray::{arr1, Array1, Array2, Ix1};
    use shared_event_bus::MemoryEventBus;
    use std::{cell::RefCell, sync::Arc};
    use tempfile::{tempdir, TempDir};

    fn role_of(cascade: u64) -> Role {
        match cascade {
            0..=5 => Role::Train,
            6 | 7 => Role::Val,
            8 => Role::Test,
            _ => Role::Unobserved,
        }
    }

    /// Ten cascades with five interleaved events each.
    fn small_dataset(role: fn(u64) -> Role) -> Dataset {
        let mut events = Vec::new();
        for step in 0..5_u32 {
            for cascade in 0..10_u64 {
                events.push(Event {
                    source: cascade * 7 + u64::from(step),
                    destination: cascade * 7 + u64::from(step) + 1,
                    cascade,
                    transfer_time: f64::from(step) * 10.0 + cascade as f64,
                    publish_time: cascade as f64,
                    role: role(cascade),
                });
            }
        }
        let decoder: DecoderTable = (0..10).map(|cascade| (cascade, (cascade * 3 + 2) as f64)).collect();
        Dataset::new(EventStream::new(events).unwrap(), decoder).unwrap()
    }

    fn model(seed: u64) -> CascadeMemoryModel {
        CascadeMemoryModel::new(
            CascadeModelConfig {
                memory_dim: 4,
                external_memory_size: 4,
                seed,
                ..CascadeModelConfig::default()
            },
            Device::Cpu,
        )
    }

    /// One event per cascade, in cascade order.
    fn single_event_dataset(roles: &[Role], sizes: &[f64]) -> Dataset {
        let events = roles
            .iter()
            .enumerate()
            .map(|(cascade, role)| Event {
                source: cascade as u64,
                destination: cascade as u64 + 100,
                cascade: cascade as u64,
                transfer_time: cascade as f64,
                publish_time: 0.0,
                role: *role,
            })
            .collect();
        let decoder: DecoderTable = sizes
            .iter()
            .enumerate()
            .map(|(cascade, size)| (cascade as u64, *size))
            .collect();
        Dataset::new(EventStream::new(events).unwrap(), decoder).unwrap()
    }

    /// Predicts one learnable level for every targeted row.
    ///
    /// Records the target and observed masks of training forwards and the level at the start of
    /// every evaluation pass.
    #[derive(Debug, Default)]
    struct LevelModel {
        level: f32,
        training: bool,
        training_forwards: RefCell<Vec<(RoleMask, RoleMask)>>,
        evaluated_levels: Vec<f32>,
    }

    impl StatefulModel for LevelModel {
        type Tape = ();

        fn device(&self) -> Device {
            Device::Cpu
        }

        fn forward(
            &self,
            batch: &EventBatch,
            target: &RoleMask,
        ) -> Result<ForwardOutput<()>, ModelError> {
            if self.training {
                self.training_forwards
                    .borrow_mut()
                    .push((target.clone(), batch.partition().observed()));
            }
            let prediction = Array1::from_iter(
                (0..batch.len()).map(|row| if target.contains(row) { self.level } else { 0.0 }),
            );
            Ok(ForwardOutput {
                prediction,
                first_point: FirstPoint {
                    mean: Array2::zeros((batch.len(), 1)),
                    std: 1.0,
                },
                target: target.clone(),
                tape: (),
            })
        }

        fn backward(
            &self,
            _output: &ForwardOutput<()>,
            grad: &OutputGrad,
        ) -> Result<ParamStore, ModelError> {
            Ok(ParamStore::new().with("level", arr1(&[grad.prediction.sum()])))
        }

        fn parameters(&self) -> ParamStore {
            ParamStore::new().with("level", arr1(&[self.level]))
        }

        fn load_parameters(&mut self, params: &ParamStore) -> Result<(), ModelError> {
            self.level = params.typed::<Ix1>("level", &[1])?[0];
            Ok(())
        }

        fn update_state(&mut self, _batch: &EventBatch) -> Result<(), ModelError> {
            Ok(())
        }

        fn detach_state(&mut self) {}

        fn reset_state(&mut self) {}

        fn set_training(&mut self, training: bool) {
            if !training {
                self.evaluated_levels.push(self.level);
            }
            self.training = training;
        }
    }

    struct Harness {
        dir: TempDir,
        trainer: Trainer,
        monitor: EarlyStopMonitor,
        metric: Metric,
    }

    fn harness(epochs: usize, batch_size: usize, patience: usize, lr: f32) -> Harness {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("models").join("trial"));
        let settings = TrainerSettings {
            batch_size,
            epochs,
            observe_std: 1.0,
            adam: AdamConfig {
                lr,
                ..AdamConfig::default()
            },
            ..TrainerSettings::default()
        };
        Harness {
            trainer: Trainer::new(settings),
            monitor: EarlyStopMonitor::new(patience, Direction::LowerIsBetter, 1e-3, store, 0),
            metric: Metric::new(dir.path().join("results").join("trial_0.json")),
            dir,
        }
    }

    #[test]
    fn every_event_is_visited_once_per_pass() {
        let data = small_dataset(role_of);
        let mut h = harness(3, 4, 10, 1e-2);
        let mut model = model(0);
        let outcome = h
            .trainer
            .train_model(0, &data, &mut model, &mut h.monitor, &mut h.metric, None)
            .unwrap();

        assert_eq!(outcome.epochs.len(), 3);
        for report in &outcome.epochs {
            assert_eq!(report.train_stats.events, 50);
            assert_eq!(report.train_stats.batches, 13);
            assert_eq!(report.eval.stats.events, 50);
            // batches 4, 9 and 12 hold only val, test or unobserved rows
            assert_eq!(report.optimizer_steps, 10);
        }
        assert_eq!(outcome.final_pass.stats.events, 50);
        for split in Split::ALL {
            assert_eq!(h.metric.accumulated(split).len(), data.stream.count(split));
            assert_eq!(outcome.final_pass.metrics[split].count, data.stream.count(split));
            assert_eq!(h.metric.history()[split].len(), 4);
            assert!(h.metric.final_result()[split].is_some());
        }
        assert!(h.dir.path().join("results").join("trial_0.json").is_file());
        assert!(h.monitor.store().exists(0));
    }

    #[test]
    fn training_forwards_cover_every_observed_row() {
        let roles = [Role::Train, Role::Val, Role::Test, Role::Unobserved];
        let roles: Vec<Role> = roles.iter().copied().cycle().take(8).collect();
        let data = single_event_dataset(&roles, &[3.0; 8]);
        let h = harness(1, 4, 10, 1e-2);
        let mut model = LevelModel::default();
        let mut optimizer = Adam::new(h.trainer.settings().adam);
        let (_, _, steps) = h
            .trainer
            .train_epoch(&mut model, &data, &mut optimizer)
            .unwrap();

        assert_eq!(steps, 2);
        let forwards = model.training_forwards.into_inner();
        assert_eq!(forwards.len(), 2);
        for (target, observed) in &forwards {
            assert_eq!(target, observed);
            assert_eq!(target.indices(), vec![0, 1, 2]);
        }
    }

    #[test]
    fn best_checkpoint_is_restored_after_training() {
        // train rows pull the level towards 10, validation rows sit at 1
        let roles = [
            Role::Train,
            Role::Val,
            Role::Train,
            Role::Val,
            Role::Train,
            Role::Test,
            Role::Unobserved,
            Role::Test,
        ];
        let sizes = [1023.0, 1.0, 1023.0, 1.0, 1023.0, 1.0, 1.0, 1.0];
        let data = single_event_dataset(&roles, &sizes);
        let mut h = harness(3, 2, 10, 0.3);
        let mut model = LevelModel::default();
        let outcome = h
            .trainer
            .train_model(0, &data, &mut model, &mut h.monitor, &mut h.metric, None)
            .unwrap();

        assert!(!outcome.stopped_early);
        assert_eq!(outcome.epochs.len(), 3);
        assert_eq!(outcome.best_epoch, Some(0));
        let val: Vec<f64> = outcome
            .epochs
            .iter()
            .map(|report| report.eval.metrics.val.msle)
            .collect();
        assert!(val[0] < val[1] && val[1] < val[2], "val msle {val:?}");

        // one level per epoch evaluation, then the final pass
        let levels = &model.evaluated_levels;
        assert_eq!(levels.len(), 4);
        assert!(levels[2] > levels[0]);
        assert_eq!(levels[3], levels[0]);
        assert_eq!(model.parameters(), ParamStore::new().with("level", arr1(&[levels[0]])));
        assert_eq!(outcome.final_pass.metrics.val, outcome.epochs[0].eval.metrics.val);
    }

    #[test]
    fn empty_validation_role_does_not_crash() {
        let data = small_dataset(|cascade| if cascade < 7 { Role::Train } else { Role::Test });
        let mut h = harness(5, 4, 2, 1e-2);
        let mut model = model(1);
        let outcome = h
            .trainer
            .train_model(0, &data, &mut model, &mut h.monitor, &mut h.metric, None)
            .unwrap();
        assert!(outcome.stopped_early);
        assert_eq!(outcome.epochs.len(), 2);
        assert_eq!(outcome.best_epoch, None);
        assert!(outcome.final_pass.metrics.val.msle.is_nan());
        assert!(outcome.final_pass.metrics.test.msle.is_finite());
    }

    #[test]
    fn training_reduces_loss_on_a_learnable_stream() {
        let data = generate(&SyntheticConfig {
            cascades: 60,
            seed: 3,
            ..SyntheticConfig::default()
        })
        .unwrap();
        let mut h = harness(6, 25, 100, 5e-2);
        let mut model = model(2);
        let outcome = h
            .trainer
            .train_model(0, &data, &mut model, &mut h.monitor, &mut h.metric, None)
            .unwrap();
        let first = outcome.epochs.first().unwrap().train_loss;
        let last = outcome.epochs.last().unwrap().train_loss;
        assert!(last < first, "train loss went from {first} to {last}");
    }

    #[test]
    fn evaluating_a_saved_run_reproduces_final_metrics() {
        let data = small_dataset(role_of);
        let mut h = harness(2, 4, 10, 1e-2);
        let mut trained = model(4);
        let outcome = h
            .trainer
            .train_model(0, &data, &mut trained, &mut h.monitor, &mut h.metric, None)
            .unwrap();

        let mut fresh = model(99);
        let mut metric = Metric::new(h.dir.path().join("eval_0.json"));
        let evaluated = h
            .trainer
            .evaluate_run(0, &data, &mut fresh, h.monitor.store(), &mut metric, None)
            .unwrap();
        assert_eq!(evaluated.final_pass, outcome.final_pass);
        assert_eq!(evaluated.best_epoch, outcome.best_epoch);
    }

    #[test]
    fn pointwise_results_are_saved_after_the_final_pass() {
        let data = small_dataset(role_of);
        let mut h = harness(1, 8, 10, 1e-2);
        let path = h.dir.path().join("results").join("trial_0_single.json");
        let mut pointwise = PointwiseMetric::new(&path, &[5.0, 100.0]);
        let mut model = model(5);
        let outcome = h
            .trainer
            .train_model(
                0,
                &data,
                &mut model,
                &mut h.monitor,
                &mut h.metric,
                Some(&mut pointwise),
            )
            .unwrap();
        assert_eq!(outcome.pointwise.len(), 2);
        // ages are 0, 10, 20, 30, 40 within each cascade
        assert_eq!(outcome.pointwise[0].1.train.count, 6);
        assert_eq!(outcome.pointwise[1].1.train.count, 30);
        assert_eq!(PointwiseMetric::load(&path).unwrap().len(), 2);
    }

    #[test]
    fn run_events_reach_the_bus() {
        let data = small_dataset(role_of);
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = LearningTelemetry::builder("trainer")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let mut h = harness(2, 10, 10, 1e-2);
        h.monitor = EarlyStopMonitor::new(
            10,
            Direction::LowerIsBetter,
            1e-3,
            h.monitor.store().clone(),
            0,
        )
        .with_telemetry(telemetry.for_run(0));
        let trainer = h.trainer.clone().with_telemetry(telemetry);
        let mut model = model(6);
        trainer
            .train_model(0, &data, &mut model, &mut h.monitor, &mut h.metric, None)
            .unwrap();
        assert_eq!(bus.of_type("training.epoch_completed").len(), 2);
        assert_eq!(bus.of_type("training.run_completed").len(), 1);
        assert!(!bus.of_type("training.checkpoint_saved").is_empty());
        assert!(bus
            .snapshot()
            .iter()
            .all(|event| event.payload["run"] == json!(0)));
    }

    #[test]
    fn run_summary_averages_test_metrics() {
        let report = |msle: f64| PassReport {
            metrics: PerSplit::from_fn(|_| MetricSummary {
                msle,
                male: 1.0,
                mape: 0.5,
                pcc: 0.2,
                loss: 0.0,
                count: 3,
            }),
            stats: PassStats {
                kind: PassKind::Eval,
                batches: 1,
                events: 3,
            },
        };
        let outcome = |run: usize, msle: f64| RunOutcome {
            run,
            epochs: Vec::new(),
            best_epoch: None,
            stopped_early: false,
            final_pass: report(msle),
            pointwise: Vec::new(),
        };
        let summary = RunSummary::from_outcomes(&[outcome(0, 1.0), outcome(1, 2.0)]);
        assert_eq!(summary.runs, 2);
        assert!((summary.test.msle - 1.5).abs() < 1e-12);
        assert_eq!(summary.test.count, 6);
        assert!(RunSummary::from_outcomes(&[]).test.msle.is_nan());
    }
}
