//! Online per-role metric accumulation.
//!
//! Predictions and labels live on the transformed (`log2`) scale. `msle` and `male` are computed
//! there directly; `mape` maps both back to raw sizes first. Empty accumulators summarise to NaN
//! instead of failing so that a missing role never aborts a run.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    checkpoint::write_atomically,
    labels::inverse_transform,
    roles::{PerSplit, Split},
    stream::CascadeId,
    telemetry::LearningTelemetry,
};

/// Errors raised by metric accumulation and persistence.
#[derive(Debug, Error)]
pub enum MetricError {
    /// Columns passed to `update` have different lengths.
    #[error("metric update with {targets} targets, {predictions} predictions, {labels} labels")]
    LengthMismatch {
        /// Cascade ids supplied.
        targets: usize,
        /// Predictions supplied.
        predictions: usize,
        /// Labels supplied.
        labels: usize,
    },
    /// Point-wise update with one age per row missing or extra.
    #[error("point-wise update with {ages} ages for {rows} rows")]
    AgeCount {
        /// Ages supplied.
        ages: usize,
        /// Rows in the other columns.
        rows: usize,
    },
    /// Reading or writing the result file failed.
    #[error("metric file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The result file is not valid JSON.
    #[error("metric file {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Serialises non-finite floats as `null` and reads `null` back as NaN.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Option::<f64>::deserialize(deserializer).map(|value| value.unwrap_or(f64::NAN))
    }
}

/// Summary statistics of one role over one pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean squared error on the transformed scale.
    #[serde(with = "nan_as_null")]
    pub msle: f64,
    /// Mean absolute error on the transformed scale.
    #[serde(with = "nan_as_null")]
    pub male: f64,
    /// Mean absolute percentage error on raw sizes.
    #[serde(with = "nan_as_null")]
    pub mape: f64,
    /// Pearson correlation of predictions and labels.
    #[serde(with = "nan_as_null")]
    pub pcc: f64,
    /// Mean loss reported by the caller.
    #[serde(with = "nan_as_null")]
    pub loss: f64,
    /// Number of accumulated observations.
    pub count: usize,
}

impl MetricSummary {
    /// Summary of an empty accumulator.
    #[must_use]
    pub const fn empty(loss: f64) -> Self {
        Self {
            msle: f64::NAN,
            male: f64::NAN,
            mape: f64::NAN,
            pcc: f64::NAN,
            loss,
            count: 0,
        }
    }

    /// Folds observations into statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_observations(observations: &[Observation], loss: f64) -> Self {
        if observations.is_empty() {
            return Self::empty(loss);
        }
        let n = observations.len() as f64;
        let (mut squared, mut absolute, mut relative) = (0.0, 0.0, 0.0);
        for observation in observations {
            let error = f64::from(observation.prediction) - f64::from(observation.label);
            squared += error * error;
            absolute += error.abs();
            let actual = inverse_transform(observation.label);
            relative += (inverse_transform(observation.prediction) - actual).abs() / actual;
        }
        Self {
            msle: squared / n,
            male: absolute / n,
            mape: relative / n,
            pcc: pearson(observations),
            loss,
            count: observations.len(),
        }
    }

    /// True when nothing was accumulated.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl PartialEq for MetricSummary {
    fn eq(&self, other: &Self) -> bool {
        fn same(left: f64, right: f64) -> bool {
            left == right || (left.is_nan() && right.is_nan())
        }
        same(self.msle, other.msle)
            && same(self.male, other.male)
            && same(self.mape, other.mape)
            && same(self.pcc, other.pcc)
            && same(self.loss, other.loss)
            && self.count == other.count
    }
}

#[allow(clippy::cast_precision_loss)]
fn pearson(observations: &[Observation]) -> f64 {
    if observations.len() < 2 {
        return f64::NAN;
    }
    let n = observations.len() as f64;
    let mean_p = observations.iter().map(|o| f64::from(o.prediction)).sum::<f64>() / n;
    let mean_l = observations.iter().map(|o| f64::from(o.label)).sum::<f64>() / n;
    let (mut cov, mut var_p, mut var_l) = (0.0, 0.0, 0.0);
    for observation in observations {
        let dp = f64::from(observation.prediction) - mean_p;
        let dl = f64::from(observation.label) - mean_l;
        cov += dp * dl;
        var_p += dp * dp;
        var_l += dl * dl;
    }
    if var_p == 0.0 || var_l == 0.0 {
        return f64::NAN;
    }
    cov / (var_p.sqrt() * var_l.sqrt())
}

/// One accumulated prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Cascade the prediction is about.
    pub cascade: CascadeId,
    /// Prediction on the transformed scale.
    pub prediction: f32,
    /// Label on the transformed scale.
    pub label: f32,
}

/// Persisted per-role history plus the final snapshot of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricLog {
    /// One summary per evaluation pass, in order.
    pub history: PerSplit<Vec<MetricSummary>>,
    /// Summary of the final pass on the restored best model.
    #[serde(rename = "final")]
    pub final_result: PerSplit<Option<MetricSummary>>,
}

impl MetricLog {
    /// Reads a log written by [`Metric::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetricError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| MetricError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| MetricError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn save(&self, path: &Path) -> Result<(), MetricError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| MetricError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomically(path, &json).map_err(|source| MetricError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Per-role accumulators for one pass plus the run's metric history.
#[derive(Debug)]
pub struct Metric {
    path: PathBuf,
    accumulators: PerSplit<Vec<Observation>>,
    latest: PerSplit<Option<MetricSummary>>,
    log: MetricLog,
    telemetry: LearningTelemetry,
}

impl Metric {
    /// Metric persisted to `path` by [`Metric::save`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accumulators: PerSplit::default(),
            latest: PerSplit::default(),
            log: MetricLog::default(),
            telemetry: LearningTelemetry::disabled(),
        }
    }

    /// Routes [`Metric::info`] through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LearningTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Result file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clears every accumulator. History and final snapshot are kept.
    pub fn fresh(&mut self) {
        for split in Split::ALL {
            self.accumulators[split].clear();
        }
    }

    /// Appends observations for one role.
    pub fn update(
        &mut self,
        targets: &[CascadeId],
        predictions: &[f32],
        labels: &[f32],
        split: Split,
    ) -> Result<(), MetricError> {
        if targets.len() != predictions.len() || predictions.len() != labels.len() {
            return Err(MetricError::LengthMismatch {
                targets: targets.len(),
                predictions: predictions.len(),
                labels: labels.len(),
            });
        }
        self.accumulators[split].extend(targets.iter().zip(predictions).zip(labels).map(
            |((&cascade, &prediction), &label)| Observation {
                cascade,
                prediction,
                label,
            },
        ));
        Ok(())
    }

    /// Observations accumulated for `split` in the current pass.
    #[must_use]
    pub fn accumulated(&self, split: Split) -> &[Observation] {
        &self.accumulators[split]
    }

    /// Folds the accumulator of `split` into a summary, optionally recording it in the history
    /// and/or as the final result.
    pub fn calculate_metric(
        &mut self,
        split: Split,
        move_history: bool,
        move_final: bool,
        loss: f64,
    ) -> MetricSummary {
        let summary = MetricSummary::from_observations(&self.accumulators[split], loss);
        self.latest[split] = Some(summary);
        if move_history {
            self.log.history[split].push(summary);
        }
        if move_final {
            self.log.final_result[split] = Some(summary);
        }
        summary
    }

    /// Logs the most recent summary of `split`.
    pub fn info(&self, split: Split) -> anyhow::Result<()> {
        match self.latest[split] {
            Some(summary) => self.telemetry.log(
                LogLevel::Info,
                "metric.summary",
                json!({ "role": split.label(), "summary": summary }),
            ),
            None => self.telemetry.log(
                LogLevel::Debug,
                "metric.summary.missing",
                json!({ "role": split.label() }),
            ),
        }
    }

    /// Per-role history of summaries.
    #[must_use]
    pub const fn history(&self) -> &PerSplit<Vec<MetricSummary>> {
        &self.log.history
    }

    /// Final snapshot per role.
    #[must_use]
    pub const fn final_result(&self) -> &PerSplit<Option<MetricSummary>> {
        &self.log.final_result
    }

    /// History and final snapshot as persisted.
    #[must_use]
    pub const fn log(&self) -> &MetricLog {
        &self.log
    }

    /// Writes history and final snapshot to the result path.
    pub fn save(&self) -> Result<(), MetricError> {
        self.log.save(&self.path)
    }
}

/// Results of one prediction horizon, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonLog {
    /// Maximum observed age of the events that fed this horizon.
    pub timestamp: f64,
    /// History and final snapshot.
    #[serde(flatten)]
    pub log: MetricLog,
}

/// Metrics restricted to events observed for at most `t` time units, one set per horizon.
#[derive(Debug)]
pub struct PointwiseMetric {
    path: PathBuf,
    horizons: Vec<(f64, Metric)>,
}

impl PointwiseMetric {
    /// Tracks one accumulator per timestamp; persisted to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timestamps: &[f64]) -> Self {
        let path = path.into();
        let horizons = timestamps
            .iter()
            .map(|&t| (t, Metric::new(path.clone())))
            .collect();
        Self { path, horizons }
    }

    /// True when no horizon is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.horizons.is_empty()
    }

    /// Clears every accumulator.
    pub fn fresh(&mut self) {
        for (_, metric) in &mut self.horizons {
            metric.fresh();
        }
    }

    /// Appends observations, keeping per horizon `t` only rows with `age <= t`.
    pub fn update(
        &mut self,
        ages: &[f64],
        targets: &[CascadeId],
        predictions: &[f32],
        labels: &[f32],
        split: Split,
    ) -> Result<(), MetricError> {
        if targets.len() != predictions.len() || predictions.len() != labels.len() {
            return Err(MetricError::LengthMismatch {
                targets: targets.len(),
                predictions: predictions.len(),
                labels: labels.len(),
            });
        }
        if ages.len() != targets.len() {
            return Err(MetricError::AgeCount {
                ages: ages.len(),
                rows: targets.len(),
            });
        }
        for (horizon, metric) in &mut self.horizons {
            let keep: Vec<usize> = (0..ages.len()).filter(|&i| ages[i] <= *horizon).collect();
            let pick = |values: &[f32]| keep.iter().map(|&i| values[i]).collect::<Vec<_>>();
            let cascades: Vec<CascadeId> = keep.iter().map(|&i| targets[i]).collect();
            metric.update(&cascades, &pick(predictions), &pick(labels), split)?;
        }
        Ok(())
    }

    /// Summarises every horizon and role, recording them as history and final results.
    pub fn calculate(&mut self) -> Vec<(f64, PerSplit<MetricSummary>)> {
        self.horizons
            .iter_mut()
            .map(|(t, metric)| {
                let summary =
                    PerSplit::from_fn(|split| metric.calculate_metric(split, true, true, f64::NAN));
                (*t, summary)
            })
            .collect()
    }

    /// Horizon logs in configuration order.
    #[must_use]
    pub fn logs(&self) -> Vec<HorizonLog> {
        self.horizons
            .iter()
            .map(|(timestamp, metric)| HorizonLog {
                timestamp: *timestamp,
                log: metric.log().clone(),
            })
            .collect()
    }

    /// Writes every horizon's log to the result path.
    pub fn save(&self) -> Result<(), MetricError> {
        let json = serde_json::to_vec_pretty(&self.logs()).map_err(|source| MetricError::Json {
            path: self.path.clone(),
            source,
        })?;
        write_atomically(&self.path, &json).map_err(|source| MetricError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Reads horizon logs written by [`PointwiseMetric::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<HorizonLog>, MetricError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| MetricError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| MetricError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::transform_size;
    use tempfile::tempdir;

    #[test]
    fn exact_prediction_has_zero_error() {
        let mut metric = Metric::new("unused.json");
        let label = transform_size(12.0);
        metric.update(&[4], &[label], &[label], Split::Test).unwrap();
        let summary = metric.calculate_metric(Split::Test, false, false, 0.0);
        assert_eq!(summary.msle, 0.0);
        assert_eq!(summary.male, 0.0);
        assert_eq!(summary.mape, 0.0);
        assert!(summary.pcc.is_nan());
        assert_eq!(summary.count, 1);
    }

    #[test]
    fn empty_role_is_all_nan() {
        let mut metric = Metric::new("unused.json");
        let summary = metric.calculate_metric(Split::Val, true, false, f64::NAN);
        assert!(summary.msle.is_nan() && summary.male.is_nan());
        assert!(summary.mape.is_nan() && summary.pcc.is_nan());
        assert!(summary.is_empty());
        assert_eq!(metric.history().val.len(), 1);
    }

    #[test]
    fn statistics_on_known_values() {
        let mut metric = Metric::new("unused.json");
        metric
            .update(&[1, 2, 3], &[1.0, 2.0, 4.0], &[1.0, 3.0, 3.0], Split::Train)
            .unwrap();
        let summary = metric.calculate_metric(Split::Train, false, false, 0.5);
        assert!((summary.msle - 2.0 / 3.0).abs() < 1e-12);
        assert!((summary.male - 2.0 / 3.0).abs() < 1e-12);
        // raw sizes: prediction 1, 3, 15 against 1, 7, 7
        let mape = (0.0 + 4.0 / 7.0 + 8.0 / 7.0) / 3.0;
        assert!((summary.mape - mape).abs() < 1e-9);
        assert!((summary.pcc - (4.0_f64 / 7.0).sqrt()).abs() < 1e-9);
        assert_eq!(summary.loss, 0.5);
    }

    #[test]
    fn constant_labels_give_nan_correlation() {
        let mut metric = Metric::new("unused.json");
        metric
            .update(&[1, 2], &[1.0, 2.0], &[3.0, 3.0], Split::Train)
            .unwrap();
        assert!(metric
            .calculate_metric(Split::Train, false, false, 0.0)
            .pcc
            .is_nan());
    }

    #[test]
    fn fresh_clears_accumulators_but_keeps_history() {
        let mut metric = Metric::new("unused.json");
        metric.update(&[1], &[1.0], &[1.0], Split::Val).unwrap();
        metric.calculate_metric(Split::Val, true, true, 0.0);
        metric.fresh();
        assert!(metric.accumulated(Split::Val).is_empty());
        assert_eq!(metric.history().val.len(), 1);
        assert!(metric.final_result().val.is_some());
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let mut metric = Metric::new("unused.json");
        assert!(matches!(
            metric.update(&[1, 2], &[1.0], &[1.0], Split::Test),
            Err(MetricError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn save_round_trips_nan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("run_0.json");
        let mut metric = Metric::new(&path);
        metric.update(&[1], &[2.0], &[2.0], Split::Test).unwrap();
        metric.calculate_metric(Split::Test, true, true, 0.25);
        metric.calculate_metric(Split::Val, true, true, f64::NAN);
        metric.save().unwrap();
        let log = MetricLog::load(&path).unwrap();
        assert_eq!(&log, metric.log());
        assert!(log.final_result.val.unwrap().msle.is_nan());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"final\""));
    }

    #[test]
    fn pointwise_filters_by_observation_age() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_0_single.json");
        let mut pointwise = PointwiseMetric::new(&path, &[1.0, 10.0]);
        pointwise
            .update(
                &[0.5, 5.0, 20.0],
                &[1, 2, 3],
                &[1.0, 2.0, 3.0],
                &[1.0, 2.0, 3.0],
                Split::Test,
            )
            .unwrap();
        let results = pointwise.calculate();
        assert_eq!(results[0].1.test.count, 1);
        assert_eq!(results[1].1.test.count, 2);
        pointwise.save().unwrap();
        let logs = PointwiseMetric::load(&path).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].log.final_result.test.unwrap().count, 2);
    }

    #[test]
    fn pointwise_rejects_ragged_columns() {
        let mut pointwise = PointwiseMetric::new("unused.json", &[1.0]);
        assert!(matches!(
            pointwise.update(&[0.5, 0.5], &[1, 2], &[1.0], &[1.0, 2.0], Split::Val),
            Err(MetricError::LengthMismatch {
                targets: 2,
                predictions: 1,
                labels: 2,
            })
        ));
        assert!(matches!(
            pointwise.update(&[0.5, 0.5], &[1], &[1.0], &[1.0], Split::Val),
            Err(MetricError::AgeCount { ages: 2, rows: 1 })
        ));
        assert_eq!(pointwise.calculate()[0].1.val.count, 0);
    }
}
