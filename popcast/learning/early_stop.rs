//! Patience-based early stopping that checkpoints every improvement.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    model::StatefulModel,
    telemetry::LearningTelemetry,
};

/// Which way a monitored value improves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Smaller values are better (losses, errors).
    #[default]
    LowerIsBetter,
    /// Larger values are better (correlations).
    HigherIsBetter,
}

impl Direction {
    fn improves(self, current: f64, best: f64, tolerance: f64) -> bool {
        match self {
            Self::LowerIsBetter => current < best - tolerance,
            Self::HigherIsBetter => current > best + tolerance,
        }
    }
}

/// Tracks the best validation value of a run and saves the model whenever it improves.
#[derive(Debug)]
pub struct EarlyStopMonitor {
    patience: usize,
    direction: Direction,
    tolerance: f64,
    best_value: Option<f64>,
    best_epoch: Option<usize>,
    rounds: usize,
    checks: usize,
    saved: bool,
    store: CheckpointStore,
    run: usize,
    telemetry: LearningTelemetry,
}

impl EarlyStopMonitor {
    /// Monitor for `run` that stops after `patience` checks without improvement.
    #[must_use]
    pub fn new(
        patience: usize,
        direction: Direction,
        tolerance: f64,
        store: CheckpointStore,
        run: usize,
    ) -> Self {
        Self {
            patience,
            direction,
            tolerance,
            best_value: None,
            best_epoch: None,
            rounds: 0,
            checks: 0,
            saved: false,
            store,
            run,
            telemetry: LearningTelemetry::disabled(),
        }
    }

    /// Reports improvements and saves through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LearningTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Best value seen so far.
    #[must_use]
    pub const fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    /// Check index (epoch) that produced the best value.
    #[must_use]
    pub const fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Consecutive checks without improvement.
    #[must_use]
    pub const fn rounds(&self) -> usize {
        self.rounds
    }

    /// Allowed rounds without improvement.
    #[must_use]
    pub const fn patience(&self) -> usize {
        self.patience
    }

    /// Improvement direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Minimum change that counts as an improvement.
    #[must_use]
    pub const fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Run this monitor belongs to.
    #[must_use]
    pub const fn run(&self) -> usize {
        self.run
    }

    /// Store receiving the checkpoints.
    #[must_use]
    pub const fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Saves the current parameters unless a checkpoint was already written by this monitor.
    pub fn ensure_initial_checkpoint<M: StatefulModel>(
        &mut self,
        model: &M,
    ) -> Result<Option<Checkpoint>> {
        if self.saved {
            return Ok(None);
        }
        self.save(model, None).map(Some)
    }

    /// Records `current` and returns whether training should stop.
    ///
    /// The first non-NaN value becomes the baseline. NaN never improves.
    pub fn early_stop_check<M: StatefulModel>(&mut self, current: f64, model: &M) -> Result<bool> {
        let epoch = self.checks;
        self.checks += 1;
        let improved = !current.is_nan()
            && self.best_value.map_or(true, |best| {
                self.direction.improves(current, best, self.tolerance)
            });
        if improved {
            self.best_value = Some(current);
            self.best_epoch = Some(epoch);
            self.rounds = 0;
            self.save(model, Some(epoch))?;
            self.telemetry.log(
                LogLevel::Info,
                "early_stop.improved",
                json!({ "epoch": epoch, "value": current }),
            )?;
            return Ok(false);
        }
        self.rounds += 1;
        self.telemetry.log(
            LogLevel::Debug,
            "early_stop.no_improvement",
            json!({ "epoch": epoch, "value": current, "rounds": self.rounds }),
        )?;
        Ok(self.rounds >= self.patience)
    }

    fn save<M: StatefulModel>(&mut self, model: &M, epoch: Option<usize>) -> Result<Checkpoint> {
        let checkpoint = self
            .store
            .save(model, self.run, epoch)
            .with_context(|| format!("saving checkpoint for run {}", self.run))?;
        self.saved = true;
        self.telemetry.event(
            "training.checkpoint_saved",
            json!({
                "checkpoint": checkpoint.id,
                "epoch": epoch,
                "path": self.store.path_for(self.run),
            }),
        )?;
        Ok(checkpoint)
    }
}
