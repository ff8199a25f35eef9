use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

/// Builder for learning telemetry sinks.
pub struct LearningTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    file_level: LogLevel,
    console_level: Option<LogLevel>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl LearningTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            file_level: LogLevel::Debug,
            console_level: None,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Minimum level written to the log file.
    #[must_use]
    pub fn file_level(mut self, level: LogLevel) -> Self {
        self.file_level = level;
        self
    }

    /// Minimum level echoed to stderr.
    #[must_use]
    pub fn console_level(mut self, level: LogLevel) -> Self {
        self.console_level = Some(level);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<LearningTelemetry> {
        let logger = match self.log_path {
            Some(path) => {
                let mut logger = JsonLogger::new(path)?.with_file_level(self.file_level);
                if let Some(level) = self.console_level {
                    logger = logger.with_console_level(level);
                }
                Some(logger)
            }
            None => None,
        };
        let event = self.event_publisher.map(EventHandle::new).transpose()?;
        Ok(LearningTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                event,
            }),
            run: None,
        })
    }
}

/// Telemetry handle shared by the trainer, metrics and early stopper.
#[derive(Clone)]
pub struct LearningTelemetry {
    inner: Arc<TelemetryInner>,
    run: Option<usize>,
}

impl fmt::Debug for LearningTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LearningTelemetry")
            .field("module", &self.inner.module)
            .field("run", &self.run)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new()?,
            publisher,
        })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl LearningTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> LearningTelemetryBuilder {
        LearningTelemetryBuilder::new(module)
    }

    /// Handle without sinks; every call is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "learning".into(),
                logger: None,
                event: None,
            }),
            run: None,
        }
    }

    /// Same sinks, with records and events tagged by `run`.
    #[must_use]
    pub fn for_run(&self, run: usize) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            run: Some(run),
        }
    }

    /// Run tag, if any.
    #[must_use]
    pub const fn run(&self) -> Option<usize> {
        self.run
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record =
                LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            record.run = self.run;
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus. The run tag is added to object payloads.
    pub fn event(&self, event_type: &str, mut payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            if let (Some(run), Some(fields)) = (self.run, payload.as_object_mut()) {
                fields.entry("run").or_insert_with(|| Value::from(run));
            }
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::read_records;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("learning.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = LearningTelemetry::builder("learning")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap()
            .for_run(3);
        telemetry
            .log(LogLevel::Info, "epoch.start", json!({ "epoch": 1 }))
            .unwrap();
        telemetry
            .event("training.epoch_completed", json!({ "epoch": 1 }))
            .unwrap();
        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run, Some(3));
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["run"], json!(3));
    }

    #[test]
    fn file_level_drops_debug_records() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("learning.log");
        let telemetry = LearningTelemetry::builder("learning")
            .log_path(&path)
            .file_level(LogLevel::Info)
            .build()
            .unwrap();
        telemetry.log(LogLevel::Debug, "batch", Value::Null).unwrap();
        telemetry.log(LogLevel::Warn, "slow", Value::Null).unwrap();
        assert_eq!(read_records(&path).unwrap().len(), 1);
    }

    #[test]
    fn disabled_handle_is_silent() {
        let telemetry = LearningTelemetry::disabled();
        telemetry.log(LogLevel::Error, "ignored", json!({})).unwrap();
        telemetry.event("ignored", json!({})).unwrap();
        assert_eq!(telemetry.run(), None);
    }
}
