use std::{
    fs,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    labels::DecoderTable,
    stream::{CascadeId, Event, EventStream, StreamError},
};

/// File holding one JSON event per line, in transfer-time order.
pub const EVENTS_FILE: &str = "events.jsonl";
/// File holding the cascade id to final size mapping.
pub const DECODER_FILE: &str = "decoder.json";

/// Errors raised by the dataset loader.
#[derive(Debug, Error)]
pub enum DataLoaderError {
    /// I/O error (filesystem).
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// JSON parsing failure.
    #[error("json error in {path}{}: {source}", line_suffix(*.line))]
    Json {
        /// File involved.
        path: PathBuf,
        /// One-based line of the offending record, for line-oriented files.
        line: Option<usize>,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// The events violate stream invariants.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The events file holds no event.
    #[error("{0} contains no events")]
    EmptyStream(PathBuf),
    /// An observed event belongs to a cascade without a final size.
    #[error("cascade {0} has observed events but no entry in decoder.json")]
    MissingLabel(CascadeId),
}

fn line_suffix(line: Option<usize>) -> String {
    line.map(|line| format!(" line {line}")).unwrap_or_default()
}

/// Event stream plus the ground truth of its cascades.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Chronological events.
    pub stream: EventStream,
    /// Final cascade sizes.
    pub decoder: DecoderTable,
}

impl Dataset {
    /// Pairs a stream with its decoder table, checking that every observed event has a label.
    pub fn new(stream: EventStream, decoder: DecoderTable) -> Result<Self, DataLoaderError> {
        if let Some(event) = stream
            .events()
            .iter()
            .find(|event| event.role.is_observed() && !decoder.contains(event.cascade))
        {
            return Err(DataLoaderError::MissingLabel(event.cascade));
        }
        Ok(Self { stream, decoder })
    }
}

/// Loads `events.jsonl` and `decoder.json` from `dir`.
pub fn load_dataset(dir: impl AsRef<Path>) -> Result<Dataset, DataLoaderError> {
    let dir = dir.as_ref();
    let events = read_events(&dir.join(EVENTS_FILE))?;
    let decoder = read_decoder(&dir.join(DECODER_FILE))?;
    Dataset::new(EventStream::new(events)?, decoder)
}

/// Writes a dataset in the layout read by [`load_dataset`].
pub fn write_dataset(dir: impl AsRef<Path>, dataset: &Dataset) -> Result<(), DataLoaderError> {
    let dir = dir.as_ref();
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DataLoaderError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let events_path = dir.join(EVENTS_FILE);
    let file = fs::File::create(&events_path).map_err(io_error(&events_path))?;
    let mut writer = BufWriter::new(file);
    for event in dataset.stream.events() {
        serde_json::to_writer(&mut writer, event).map_err(|source| DataLoaderError::Json {
            path: events_path.clone(),
            line: None,
            source,
        })?;
        writer.write_all(b"\n").map_err(io_error(&events_path))?;
    }
    writer.flush().map_err(io_error(&events_path))?;

    let decoder_path = dir.join(DECODER_FILE);
    let json = serde_json::to_vec_pretty(&dataset.decoder).map_err(|source| DataLoaderError::Json {
        path: decoder_path.clone(),
        line: None,
        source,
    })?;
    fs::write(&decoder_path, json).map_err(io_error(&decoder_path))
}

fn read_events(path: &Path) -> Result<Vec<Event>, DataLoaderError> {
    let file = fs::File::open(path).map_err(|source| DataLoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| DataLoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| DataLoaderError::Json {
            path: path.to_path_buf(),
            line: Some(index + 1),
            source,
        })?;
        events.push(event);
    }
    if events.is_empty() {
        return Err(DataLoaderError::EmptyStream(path.to_path_buf()));
    }
    Ok(events)
}

fn read_decoder(path: &Path) -> Result<DecoderTable, DataLoaderError> {
    let contents = fs::read_to_string(path).map_err(|source| DataLoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| DataLoaderError::Json {
        path: path.to_path_buf(),
        line: None,
        source,
    })
}
