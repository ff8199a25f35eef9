//! Run configuration: a TOML document with dataset presets, overridable from the CLI.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    device_manager::DevicePreference,
    loss::{GaussianPrior, LossKind},
    model::{AdamConfig, CascadeModelConfig},
};

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The file is not valid TOML for [`TrainConfig`].
    #[error("parsing {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered as TOML.
    #[error("rendering config: {0}")]
    Render(#[from] toml::ser::Error),
    /// A field holds an unusable value.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Known datasets and their default time windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetPreset {
    /// Retweet cascades, timestamps in seconds, windows in days.
    #[default]
    Twitter,
    /// Repost cascades, timestamps in seconds, windows in hours.
    Weibo,
    /// Citation cascades, timestamps in days, windows in years.
    Aps,
}

impl DatasetPreset {
    /// Lower-case dataset name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Weibo => "weibo",
            Self::Aps => "aps",
        }
    }

    /// Default windows of the dataset.
    #[must_use]
    pub const fn windows(self) -> TimeWindows {
        match self {
            Self::Twitter => TimeWindows {
                time_unit: 86_400.0,
                observe_time: 2.0,
                restruct_time: 4.0,
                predict_time: 32.0,
                train_time: 8.0,
                val_time: 12.0,
                test_time: 16.0,
            },
            Self::Weibo => TimeWindows {
                time_unit: 3_600.0,
                observe_time: 1.0,
                restruct_time: 2.0,
                predict_time: 24.0,
                train_time: 8.0,
                val_time: 12.0,
                test_time: 18.0,
            },
            Self::Aps => TimeWindows {
                time_unit: 365.0,
                observe_time: 3.0,
                restruct_time: 5.0,
                predict_time: 20.0,
                train_time: 8.0,
                val_time: 9.0,
                test_time: 10.0,
            },
        }
    }
}

impl fmt::Display for DatasetPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Time windows of a dataset, expressed in `time_unit`s.
///
/// Cascades published before `train_time` are training cascades, before `val_time` validation
/// cascades and before `test_time` test cascades. An event only becomes usable once its cascade
/// has been observed for `observe_time`; the final size is counted up to `predict_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindows {
    /// Raw timestamp units per window unit.
    pub time_unit: f64,
    /// Observation window.
    pub observe_time: f64,
    /// End of the reconstruction range used by the latent dynamics.
    pub restruct_time: f64,
    /// Horizon at which the final size is counted.
    pub predict_time: f64,
    /// Publication cut-off of training cascades.
    pub train_time: f64,
    /// Publication cut-off of validation cascades.
    pub val_time: f64,
    /// Publication cut-off of test cascades.
    pub test_time: f64,
}

impl TimeWindows {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("time_unit", self.time_unit),
            ("observe_time", self.observe_time),
            ("predict_time", self.predict_time),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, format!("must be positive, got {value}")));
            }
        }
        if !(self.train_time <= self.val_time && self.val_time <= self.test_time) {
            return Err(invalid(
                "windows",
                "publication cut-offs must satisfy train <= val <= test".into(),
            ));
        }
        if self.observe_time > self.predict_time {
            return Err(invalid(
                "observe_time",
                "observation window exceeds the prediction horizon".into(),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Everything a training invocation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Dataset preset.
    pub dataset: DatasetPreset,
    /// Directory holding `events.jsonl` and `decoder.json`; defaults to `data/{dataset}`.
    pub data_dir: Option<PathBuf>,
    /// Events per batch.
    pub batch_size: usize,
    /// Maximum epochs per run.
    pub epochs: usize,
    /// Adam learning rate.
    pub lr: f32,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Minimum validation msle decrease that counts as improvement.
    pub tolerance: f64,
    /// Independent runs; run `i` is seeded with `seed + i`.
    pub runs: usize,
    /// Base seed.
    pub seed: u64,
    /// Accelerator index; `None` forces the CPU.
    pub gpu: Option<usize>,
    /// Standard deviation of the Gaussian likelihood.
    pub observe_std: f32,
    /// Objective variant.
    pub loss: LossKind,
    /// Width of the cascade memory.
    pub memory_dim: usize,
    /// Capacity of the external memory.
    pub memory_size: usize,
    /// Per-event memory decay.
    pub decay: f32,
    /// Per-interaction user activity decay.
    pub activity_decay: f32,
    /// Observation ages at which point-wise metrics are reported.
    pub predict_timestamps: Vec<f64>,
    /// Name of the trial, used in every output path.
    pub prefix: String,
    /// Directory of model checkpoints.
    pub model_dir: PathBuf,
    /// Directory of metric results.
    pub result_dir: PathBuf,
    /// Directory of run logs.
    pub log_dir: PathBuf,
    /// Prior over the latent initial state.
    pub prior: GaussianPrior,
    /// Window override; the dataset preset is used when absent.
    pub windows: Option<TimeWindows>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetPreset::default(),
            data_dir: None,
            batch_size: 50,
            epochs: 150,
            lr: 1e-4,
            patience: 15,
            tolerance: 1e-3,
            runs: 1,
            seed: 0,
            gpu: Some(0),
            observe_std: 0.1,
            loss: LossKind::default(),
            prior: GaussianPrior::default(),
            memory_dim: 64,
            memory_size: 16,
            decay: 0.9,
            activity_decay: 0.95,
            predict_timestamps: Vec::new(),
            windows: None,
            prefix: "test".into(),
            model_dir: PathBuf::from("saved_models"),
            result_dir: PathBuf::from("results"),
            log_dir: PathBuf::from("log"),
        }
    }
}

impl TrainConfig {
    /// Reads and validates a TOML file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = self.to_toml()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, rendered).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// TOML rendering.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("runs", self.runs),
            ("patience", self.patience),
            ("memory_dim", self.memory_dim),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(invalid(field, "must be at least 1".into()));
            }
        }
        let positive = [
            ("lr", self.lr),
            ("observe_std", self.observe_std),
            ("prior.std", self.prior.std),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, format!("must be positive, got {value}")));
            }
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(invalid("tolerance", format!("must be non-negative, got {}", self.tolerance)));
        }
        for (field, value) in [("decay", self.decay), ("activity_decay", self.activity_decay)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, format!("must lie in (0, 1], got {value}")));
            }
        }
        if let Some(bad) = self
            .predict_timestamps
            .iter()
            .find(|t| !(t.is_finite() && **t >= 0.0))
        {
            return Err(invalid(
                "predict_timestamps",
                format!("timestamps must be finite and non-negative, got {bad}"),
            ));
        }
        if self.prefix.is_empty() {
            return Err(invalid("prefix", "must not be empty".into()));
        }
        self.windows().validate()
    }

    /// Effective time windows.
    #[must_use]
    pub fn windows(&self) -> TimeWindows {
        self.windows.unwrap_or_else(|| self.dataset.windows())
    }

    /// Dataset directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data").join(self.dataset.name()))
    }

    /// Model hyperparameters of `run`.
    #[must_use]
    pub fn model_config(&self, run: usize) -> CascadeModelConfig {
        CascadeModelConfig {
            memory_dim: self.memory_dim,
            decay: self.decay,
            activity_decay: self.activity_decay,
            external_memory_size: self.memory_size,
            first_point_std: self.prior.std,
            time_scale: self.windows().time_unit,
            seed: self.seed.wrapping_add(run as u64),
        }
    }

    /// Optimizer hyperparameters.
    #[must_use]
    pub fn adam(&self) -> AdamConfig {
        AdamConfig {
            lr: self.lr,
            ..AdamConfig::default()
        }
    }

    /// Requested device.
    #[must_use]
    pub fn device_preference(&self) -> DevicePreference {
        self.gpu
            .map_or(DevicePreference::CpuOnly, DevicePreference::Accelerator)
    }

    fn trial(&self) -> String {
        format!("{}_{}", self.dataset.name(), self.prefix)
    }

    /// Checkpoint prefix; run `i` is stored at `{prefix}_{i}.json`.
    #[must_use]
    pub fn model_prefix(&self) -> PathBuf {
        self.model_dir.join(self.trial())
    }

    /// Metric result prefix; run `i` is stored at `{prefix}_{i}.json`.
    #[must_use]
    pub fn result_prefix(&self) -> PathBuf {
        self.result_dir.join(self.trial())
    }

    /// Metric result file of `run`.
    #[must_use]
    pub fn result_path(&self, run: usize) -> PathBuf {
        suffixed(&self.result_prefix(), &format!("_{run}.json"))
    }

    /// Point-wise result file of `run`.
    #[must_use]
    pub fn pointwise_path(&self, run: usize) -> PathBuf {
        suffixed(&self.result_prefix(), &format!("_{run}_single.json"))
    }

    /// Log file of the trial.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        suffixed(&self.log_dir.join(self.trial()), ".log")
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
