//! Durable checkpoints for scrapes in progress.
//!
//! One JSON record per query signature. The file store writes through a temp file and
//! renames it into place, so a crash mid-write leaves the previous checkpoint intact.

use crate::model::{ProgressRecord, Query, RawPost};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fixed namespace every checkpoint key lives under.
pub const PROGRESS_NAMESPACE: &str = "fuuka_scrape_progress";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("progress directory missing or not writable: {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid progress record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode progress record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value persistence of partial scrape state, keyed by query.
pub trait ProgressStore {
    /// The record stored under this query's key, if any. The caller still compares the
    /// stored query, since distinct queries may share a key.
    fn load(&self, query: &Query) -> Result<Option<ProgressRecord>, PersistError>;
    /// Overwrite the record for `query`.
    fn save(&self, query: &Query, posts: &[RawPost], next_page: u32) -> Result<(), PersistError>;
    /// Remove the record for `query`. Missing records are not an error.
    fn clear(&self, query: &Query) -> Result<(), PersistError>;
}

/// Borrowing twin of [ProgressRecord] so a checkpoint does not copy the accumulator.
#[derive(Serialize)]
struct RecordRef<'a> {
    query: &'a Query,
    posts: &'a [RawPost],
    #[serde(rename = "nextPage")]
    next_page: u32,
    #[serde(rename = "savedAt")]
    saved_at: DateTime<Utc>,
}

/// File name for a query: namespace plus the signature with non-alphanumerics replaced.
pub fn record_file_name(query: &Query) -> String {
    let slug: String = query
        .signature()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}.json", PROGRESS_NAMESPACE, slug)
}

/// Default checkpoint directory: `<data_dir>/tripscrape/progress`, or `./.tripscrape-progress`.
pub fn default_progress_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tripscrape").join("progress"))
        .unwrap_or_else(|| PathBuf::from(".tripscrape-progress"))
}

/// Checkpoints as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, query: &Query) -> PathBuf {
        self.dir.join(record_file_name(query))
    }

    fn ensure_dir(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistError::Dir {
            path: self.dir.clone(),
            source: e,
        })
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self, query: &Query) -> Result<Option<ProgressRecord>, PersistError> {
        let path = self.path_for(query);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::Io(e)),
        };
        let record = serde_json::from_reader(io::BufReader::new(file))
            .map_err(|e| PersistError::Decode { path, source: e })?;
        Ok(Some(record))
    }

    fn save(&self, query: &Query, posts: &[RawPost], next_page: u32) -> Result<(), PersistError> {
        self.ensure_dir()?;
        let record = RecordRef {
            query,
            posts,
            next_page,
            saved_at: Utc::now(),
        };
        let tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &record)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(query))
            .map_err(|e| PersistError::Io(e.error))?;
        Ok(())
    }

    fn clear(&self, query: &Query) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(query)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::Io(e)),
        }
    }
}

/// In-process store. Used for `--no-resume` runs and in tests.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: RefCell<HashMap<String, ProgressRecord>>,
}

impl MemoryProgressStore {
    /// Record currently stored under this query's key.
    pub fn get(&self, query: &Query) -> Option<ProgressRecord> {
        self.records.borrow().get(&query.signature()).cloned()
    }

    /// Store a record under `key`'s slot whose embedded query is `stored`.
    pub fn insert_raw(&self, key: &Query, stored: Query, posts: Vec<RawPost>, next_page: u32) {
        self.records.borrow_mut().insert(
            key.signature(),
            ProgressRecord {
                query: stored,
                posts,
                next_page,
                saved_at: Utc::now(),
            },
        );
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, query: &Query) -> Result<Option<ProgressRecord>, PersistError> {
        Ok(self.get(query))
    }

    fn save(&self, query: &Query, posts: &[RawPost], next_page: u32) -> Result<(), PersistError> {
        self.insert_raw(query, query.clone(), posts.to_vec(), next_page);
        Ok(())
    }

    fn clear(&self, query: &Query) -> Result<(), PersistError> {
        self.records.borrow_mut().remove(&query.signature());
        Ok(())
    }
}
