#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Popcast learning stack: streaming training and evaluation of stateful cascade popularity
//! models over chronological propagation events.

/// Event roles, role masks and per-role containers.
#[path = "../roles.rs"]
pub mod roles;

/// Chronological event stream and batch loader.
#[path = "../stream.rs"]
pub mod stream;

/// Final-size labels and their transform.
#[path = "../labels.rs"]
pub mod labels;

/// Dataset files on disk.
#[path = "../dataloader.rs"]
pub mod dataloader;

/// Seeded synthetic datasets.
#[path = "../synthetic.rs"]
pub mod synthetic;

/// Device discovery and selection.
#[path = "../device_manager.rs"]
pub mod device_manager;

/// Model contract, reference model and optimizer.
#[path = "../model/main.rs"]
pub mod model;

/// Ordering of memory operations within a pass.
#[path = "../lifecycle.rs"]
pub mod lifecycle;

/// Training objective.
#[path = "../loss.rs"]
pub mod loss;

/// Per-role metric accumulation and persistence.
#[path = "../metrics.rs"]
pub mod metrics;

/// Per-run model checkpoints.
#[path = "../checkpoint.rs"]
pub mod checkpoint;

/// Patience-based early stopping.
#[path = "../early_stop.rs"]
pub mod early_stop;

/// Run configuration and dataset presets.
#[path = "../config.rs"]
pub mod config;

/// Structured logs and bus events.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Training and evaluation passes.
#[path = "../trainer.rs"]
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use config::{ConfigError, DatasetPreset, TimeWindows, TrainConfig};
pub use dataloader::{load_dataset, write_dataset, DataLoaderError, Dataset};
pub use device_manager::{Device, DeviceInfo, DeviceManager, DevicePreference};
pub use early_stop::{Direction, EarlyStopMonitor};
pub use labels::{inverse_transform, transform_size, DecoderTable, LabelError};
pub use lifecycle::{LifecycleError, ModelSession, PassKind, PassPhase, PassStats};
pub use loss::{compute_loss, GaussianPrior, LossError, LossKind, LossValue};
pub use metrics::{Metric, MetricError, MetricLog, MetricSummary, PointwiseMetric};
pub use model::{
    Adam, AdamConfig, CascadeMemoryModel, CascadeModelConfig, ModelError, ParamStore,
    StatefulModel,
};
pub use roles::{PerSplit, Role, RoleMask, RolePartition, Split};
pub use stream::{CascadeId, EntityId, Event, EventBatch, EventStream, StreamError};
pub use synthetic::{generate, SyntheticConfig};
pub use telemetry::{LearningTelemetry, LearningTelemetryBuilder};
pub use trainer::{EpochReport, PassReport, RunOutcome, RunSummary, Trainer, TrainerSettings};
