use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use popcast_learning::{
    config::{DatasetPreset, TrainConfig},
    dataloader::{load_dataset, write_dataset, Dataset},
    device_manager::{Device, DeviceManager},
    early_stop::{Direction, EarlyStopMonitor},
    metrics::{Metric, PointwiseMetric},
    model::CascadeMemoryModel,
    synthetic::{generate, SyntheticConfig},
    telemetry::LearningTelemetry,
    trainer::{RunOutcome, RunSummary, Trainer, TrainerSettings},
    CheckpointStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use uuid::Uuid;

const DEFAULT_MANIFEST: &str = "log/jobs/index.jsonl";

#[derive(Parser, Debug)]
#[command(name = "trn", version, about = "Cascade popularity training runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trains every run of a configuration and aggregates the test metrics.
    Train(TrainArgs),
    /// Restores a run's checkpoint and runs the final evaluation pass only.
    Evaluate {
        #[command(flatten)]
        overrides: ConfigArgs,
        /// Run whose checkpoint is restored.
        #[arg(long, default_value_t = 0)]
        run: usize,
    },
    /// Writes a synthetic dataset.
    Synth {
        /// Output directory.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 200)]
        cascades: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 10.0)]
        observe_time: f64,
        #[arg(long, default_value_t = 100.0)]
        horizon: f64,
    },
    /// Lists most recent jobs.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
    /// Shows status for a given job id.
    Status {
        job_id: String,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    overrides: ConfigArgs,
    #[arg(long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
}

/// TOML configuration plus command-line overrides.
#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    lr: Option<f32>,
    #[arg(long)]
    patience: Option<usize>,
    #[arg(long)]
    runs: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    gpu: Option<usize>,
    #[arg(long)]
    cpu_only: bool,
    #[arg(long)]
    observe_std: Option<f32>,
    #[arg(long)]
    prefix: Option<String>,
    /// Comma separated observation ages for point-wise metrics.
    #[arg(long, value_delimiter = ',')]
    predict_timestamps: Option<Vec<f64>>,
    /// Appends bus events to this JSONL file.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Echo info records to the console.
    #[arg(long)]
    verbose: bool,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => TrainConfig::default(),
        };
        if let Some(name) = &self.dataset {
            config.dataset = parse_dataset(name)?;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(value) = self.batch_size {
            config.batch_size = value;
        }
        if let Some(value) = self.epochs {
            config.epochs = value;
        }
        if let Some(value) = self.lr {
            config.lr = value;
        }
        if let Some(value) = self.patience {
            config.patience = value;
        }
        if let Some(value) = self.runs {
            config.runs = value;
        }
        if let Some(value) = self.seed {
            config.seed = value;
        }
        if self.cpu_only {
            config.gpu = None;
        } else if let Some(index) = self.gpu {
            config.gpu = Some(index);
        }
        if let Some(value) = self.observe_std {
            config.observe_std = value;
        }
        if let Some(prefix) = &self.prefix {
            config.prefix.clone_from(prefix);
        }
        if let Some(timestamps) = &self.predict_timestamps {
            config.predict_timestamps.clone_from(timestamps);
        }
        config.validate()?;
        Ok(config)
    }

    fn telemetry(&self, config: &TrainConfig) -> Result<LearningTelemetry> {
        let console = if self.verbose {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let mut builder = LearningTelemetry::builder("trn")
            .log_path(config.log_path())
            .console_level(console);
        if let Some(path) = &self.event_log {
            builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder.build()
    }
}

fn parse_dataset(name: &str) -> Result<DatasetPreset> {
    [DatasetPreset::Twitter, DatasetPreset::Weibo, DatasetPreset::Aps]
        .into_iter()
        .find(|preset| preset.name().eq_ignore_ascii_case(name))
        .with_context(|| format!("unknown dataset `{name}` (expected twitter, weibo or aps)"))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct JobManifestEntry {
    job_id: String,
    submitted_at: DateTime<Utc>,
    config: Option<PathBuf>,
    dataset: String,
    prefix: String,
    runs: usize,
    device: String,
    log_path: PathBuf,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<PathBuf>,
}

impl JobManifestEntry {
    fn new(config_path: Option<PathBuf>, config: &TrainConfig, device: Device) -> Self {
        Self {
            job_id: format!("job-{}", Uuid::new_v4()),
            submitted_at: Utc::now(),
            config: config_path,
            dataset: config.dataset.name().into(),
            prefix: config.prefix.clone(),
            runs: config.runs,
            device: device.to_string(),
            log_path: config.log_path(),
            status: "pending".into(),
            summary: None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => handle_train(&args),
        Commands::Evaluate { overrides, run } => handle_evaluate(&overrides, run),
        Commands::Synth {
            out,
            cascades,
            seed,
            observe_time,
            horizon,
        } => {
            let config = SyntheticConfig {
                cascades,
                seed,
                observe_time,
                horizon,
                ..SyntheticConfig::default()
            };
            let dataset = generate(&config)?;
            write_dataset(&out, &dataset)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "out": out,
                    "events": dataset.stream.len(),
                    "cascades": dataset.decoder.len(),
                    "roles": dataset.stream.role_counts(),
                }))?
            );
            Ok(())
        }
        Commands::List { limit, manifest } => {
            let entries = read_manifest(&manifest)?;
            for entry in entries.into_iter().rev().take(limit) {
                println!(
                    "{} | {}_{} | {} | {} | {}",
                    entry.job_id,
                    entry.dataset,
                    entry.prefix,
                    entry.status,
                    entry.submitted_at,
                    entry.device
                );
            }
            Ok(())
        }
        Commands::Status { job_id, manifest } => {
            let entries = read_manifest(&manifest)?;
            if let Some(entry) = entries.into_iter().find(|e| e.job_id == job_id) {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("job {job_id} not found");
            }
            Ok(())
        }
    }
}

fn prepare(overrides: &ConfigArgs) -> Result<(TrainConfig, Device, Dataset, LearningTelemetry)> {
    let config = overrides.resolve()?;
    let device = DeviceManager::autodetect().select(config.device_preference());
    let data_dir = config.data_dir();
    let mut dataset = load_dataset(&data_dir)
        .with_context(|| format!("loading dataset from {}", data_dir.display()))?;
    dataset.stream = dataset.stream.on_device(device);
    let telemetry = overrides.telemetry(&config)?;
    Ok((config, device, dataset, telemetry))
}

fn handle_train(args: &TrainArgs) -> Result<()> {
    let (config, device, dataset, telemetry) = prepare(&args.overrides)?;
    let mut entry = JobManifestEntry::new(args.overrides.config.clone(), &config, device);
    entry.status = "queued".into();
    append_manifest(&args.manifest, &entry)?;
    telemetry.log(
        LogLevel::Info,
        "job queued",
        json!({ "job_id": entry.job_id, "config": config }),
    )?;
    telemetry.event(
        "training.job_submitted",
        json!({ "job_id": entry.job_id, "dataset": entry.dataset, "prefix": entry.prefix }),
    )?;

    update_status(&args.manifest, &entry.job_id, "running", None)?;
    match run_all(&config, device, &dataset, &telemetry) {
        Ok(outcomes) => {
            let summary = RunSummary::from_outcomes(&outcomes);
            let summary_path = with_suffix(&config.result_prefix(), "_summary.json");
            write_json(&summary_path, &json!({ "runs": outcomes, "summary": summary }))?;
            update_status(&args.manifest, &entry.job_id, "completed", Some(&summary_path))?;
            telemetry.event(
                "training.job_completed",
                json!({ "job_id": entry.job_id, "test": summary.test }),
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(err) => {
            update_status(&args.manifest, &entry.job_id, "failed", None)?;
            telemetry.log(
                LogLevel::Error,
                "job failed",
                json!({ "job_id": entry.job_id, "error": format!("{err:#}") }),
            )?;
            telemetry.event(
                "training.job_failed",
                json!({ "job_id": entry.job_id, "error": err.to_string() }),
            )?;
            Err(err)
        }
    }
}

fn run_all(
    config: &TrainConfig,
    device: Device,
    dataset: &Dataset,
    telemetry: &LearningTelemetry,
) -> Result<Vec<RunOutcome>> {
    let trainer = Trainer::new(TrainerSettings::from_config(config)).with_telemetry(telemetry.clone());
    let store = CheckpointStore::new(config.model_prefix());
    (0..config.runs)
        .map(|run| {
            let run_telemetry = telemetry.for_run(run);
            let mut model = CascadeMemoryModel::new(config.model_config(run), device);
            let mut early_stopper = EarlyStopMonitor::new(
                config.patience,
                Direction::LowerIsBetter,
                config.tolerance,
                store.clone(),
                run,
            )
            .with_telemetry(run_telemetry.clone());
            let mut metric = Metric::new(config.result_path(run)).with_telemetry(run_telemetry);
            let mut pointwise =
                PointwiseMetric::new(config.pointwise_path(run), &config.predict_timestamps);
            trainer
                .train_model(
                    run,
                    dataset,
                    &mut model,
                    &mut early_stopper,
                    &mut metric,
                    Some(&mut pointwise),
                )
                .with_context(|| format!("run {run} failed"))
        })
        .collect()
}

fn handle_evaluate(overrides: &ConfigArgs, run: usize) -> Result<()> {
    let (config, device, dataset, telemetry) = prepare(overrides)?;
    let telemetry = telemetry.for_run(run);
    let trainer = Trainer::new(TrainerSettings::from_config(&config)).with_telemetry(telemetry.clone());
    let store = CheckpointStore::new(config.model_prefix());
    let mut model = CascadeMemoryModel::new(config.model_config(run), device);
    let mut metric = Metric::new(with_suffix(&config.result_prefix(), &format!("_{run}_eval.json")))
        .with_telemetry(telemetry);
    let mut pointwise = PointwiseMetric::new(
        with_suffix(&config.result_prefix(), &format!("_{run}_eval_single.json")),
        &config.predict_timestamps,
    );
    let outcome = trainer.evaluate_run(
        run,
        &dataset,
        &mut model,
        &store,
        &mut metric,
        Some(&mut pointwise),
    )?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn append_manifest(path: &Path, entry: &JobManifestEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Vec<JobManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JobManifestEntry = serde_json::from_str(&line)?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_status(path: &Path, job_id: &str, status: &str, summary: Option<&Path>) -> Result<()> {
    let mut entries = read_manifest(path)?;
    let mut changed = false;
    for entry in &mut entries {
        if entry.job_id == job_id {
            entry.status = status.to_string();
            if let Some(summary) = summary {
                entry.summary = Some(summary.to_path_buf());
            }
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }
    let mut file = File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, &entry)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}
