//! Per-run model checkpoints.
//!
//! One JSON file per run under a path prefix, written atomically through a temporary sibling.

use std::{
    ffi::OsString,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ModelError, ParamStore, StatefulModel};

/// Errors raised by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint was ever saved for the run.
    #[error("no checkpoint for run {run} at {path}")]
    Missing {
        /// Run index.
        run: usize,
        /// Expected file.
        path: PathBuf,
    },
    /// Filesystem failure.
    #[error("checkpoint {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The file is not a valid checkpoint.
    #[error("checkpoint {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// The file belongs to another run.
    #[error("checkpoint {path} belongs to run {found}, expected run {expected}")]
    RunMismatch {
        /// File involved.
        path: PathBuf,
        /// Requested run.
        expected: usize,
        /// Run recorded in the file.
        found: usize,
    },
    /// The stored parameters do not fit the model.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Serialized model parameters of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id of this save.
    pub id: Uuid,
    /// Run the parameters belong to.
    pub run: usize,
    /// Epoch that produced them; `None` for the pre-training state.
    pub epoch: Option<usize>,
    /// Save time.
    pub saved_at: DateTime<Utc>,
    /// Learnable parameters.
    pub parameters: ParamStore,
}

/// Checkpoints keyed by `(prefix, run)`, stored as `{prefix}_{run}.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStore {
    prefix: PathBuf,
}

impl CheckpointStore {
    /// Store writing next to `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Path prefix.
    #[must_use]
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// File holding the checkpoint of `run`.
    #[must_use]
    pub fn path_for(&self, run: usize) -> PathBuf {
        let mut name = OsString::from(self.prefix.as_os_str());
        name.push(format!("_{run}.json"));
        PathBuf::from(name)
    }

    /// Whether `run` has a checkpoint on disk.
    #[must_use]
    pub fn exists(&self, run: usize) -> bool {
        self.path_for(run).is_file()
    }

    /// Persists the model's parameters, replacing any previous checkpoint of the run.
    pub fn save<M: StatefulModel>(
        &self,
        model: &M,
        run: usize,
        epoch: Option<usize>,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            run,
            epoch,
            saved_at: Utc::now(),
            parameters: model.parameters(),
        };
        let path = self.path_for(run);
        let bytes = serde_json::to_vec(&checkpoint).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomically(&path, &bytes).map_err(|source| CheckpointError::Io { path, source })?;
        Ok(checkpoint)
    }

    /// Reads the checkpoint of `run` without touching any model.
    pub fn read(&self, run: usize) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(run);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::Missing { run, path });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&contents).map_err(|source| CheckpointError::Json {
                path: path.clone(),
                source,
            })?;
        if checkpoint.run != run {
            return Err(CheckpointError::RunMismatch {
                path,
                expected: run,
                found: checkpoint.run,
            });
        }
        Ok(checkpoint)
    }

    /// Restores the parameters saved for `run` into `model`.
    pub fn load<M: StatefulModel>(
        &self,
        model: &mut M,
        run: usize,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self.read(run)?;
        model.load_parameters(&checkpoint.parameters)?;
        Ok(checkpoint)
    }
}

/// Writes through a sibling temporary file so readers never see a partial file.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_manager::Device,
        model::{CascadeMemoryModel, CascadeModelConfig},
        roles::{Role, RoleMask},
        stream::{Event, EventBatch},
    };
    use tempfile::tempdir;

    fn model(seed: u64) -> CascadeMemoryModel {
        CascadeMemoryModel::new(
            CascadeModelConfig {
                memory_dim: 4,
                seed,
                ..CascadeModelConfig::default()
            },
            Device::Cpu,
        )
    }

    #[test]
    fn path_appends_run_index() {
        let store = CheckpointStore::new("saved_models/twitter");
        assert_eq!(
            store.path_for(2),
            PathBuf::from("saved_models/twitter_2.json")
        );
    }

    #[test]
    fn round_trip_reproduces_forward_output() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("model"));
        let trained = model(1);
        store.save(&trained, 0, Some(3)).unwrap();

        let mut restored = model(2);
        let checkpoint = store.load(&mut restored, 0).unwrap();
        assert_eq!(checkpoint.epoch, Some(3));

        let batch = EventBatch::new(
            0,
            vec![Event {
                source: 1,
                destination: 2,
                cascade: 3,
                transfer_time: 4.0,
                publish_time: 1.0,
                role: Role::Test,
            }],
            Device::Cpu,
        );
        let mask = RoleMask::new(vec![true]);
        let expected = trained.forward(&batch, &mask).unwrap();
        let actual = restored.forward(&batch, &mask).unwrap();
        assert_eq!(expected.prediction, actual.prediction);
        assert_eq!(expected.first_point, actual.first_point);
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("model"));
        let mut target = model(0);
        assert!(!store.exists(5));
        assert!(matches!(
            store.load(&mut target, 5),
            Err(CheckpointError::Missing { run: 5, .. })
        ));
    }

    #[test]
    fn save_overwrites_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("model"));
        let first = store.save(&model(1), 0, Some(0)).unwrap();
        let second = store.save(&model(2), 0, Some(1)).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.read(0).unwrap(), second);
    }
}
