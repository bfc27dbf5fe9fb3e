//! Output files: flat JSON, threaded JSON, and JSON Lines. Plus the end-of-run summary.

use crate::model::{Post, Thread};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default file name prefix.
pub const DEFAULT_PREFIX: &str = "fuuka";

/// Errors from the export writers.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Cannot write output: {path}: directory does not exist.")]
    MissingDir { path: PathBuf },

    #[error("Failed to write output: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode output: {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity made safe for file names: every non-alphanumeric character becomes `_`. Case is kept.
pub fn slug(identity: &str) -> String {
    let s: String = identity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if s.is_empty() {
        "anonymous".to_string()
    } else {
        s
    }
}

/// Paths of the three files written by [export_all].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub flat: PathBuf,
    pub threaded: PathBuf,
    pub jsonl: PathBuf,
}

impl ExportPaths {
    /// `<prefix>_<slug>_flat.json`, `<prefix>_<slug>_threaded.json`, `<prefix>_<slug>_posts.jsonl` in `dir`.
    pub fn new(dir: &Path, prefix: &str, identity: &str) -> Self {
        let base = format!("{}_{}", prefix, slug(identity));
        Self {
            flat: dir.join(format!("{}_flat.json", base)),
            threaded: dir.join(format!("{}_threaded.json", base)),
            jsonl: dir.join(format!("{}_posts.jsonl", base)),
        }
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, ExportError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| ExportError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

fn finish(mut writer: BufWriter<File>, path: &Path) -> Result<(), ExportError> {
    writer.flush().map_err(|e| ExportError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| ExportError::Encode {
        path: path.to_path_buf(),
        source: e,
    })?;
    finish(writer, path)
}

/// Flat JSON array of posts.
pub fn write_flat_json(posts: &[Post], path: &Path) -> Result<(), ExportError> {
    write_json(posts, path)
}

/// JSON array of `{thread_id, board, posts}`.
pub fn write_threaded_json(threads: &[Thread], path: &Path) -> Result<(), ExportError> {
    write_json(threads, path)
}

/// One JSON object per line.
pub fn write_jsonl(posts: &[Post], path: &Path) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    for post in posts {
        serde_json::to_writer(&mut writer, post).map_err(|e| ExportError::Encode {
            path: path.to_path_buf(),
            source: e,
        })?;
        writer.write_all(b"\n").map_err(|e| ExportError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    finish(writer, path)
}

/// Write all three encodings into `dir`, which must already exist.
pub fn export_all(
    posts: &[Post],
    threads: &[Thread],
    dir: &Path,
    prefix: &str,
    identity: &str,
) -> Result<ExportPaths, ExportError> {
    if !dir.is_dir() {
        return Err(ExportError::MissingDir {
            path: dir.to_path_buf(),
        });
    }
    let paths = ExportPaths::new(dir, prefix, identity);
    write_flat_json(posts, &paths.flat)?;
    write_threaded_json(threads, &paths.threaded)?;
    write_jsonl(posts, &paths.jsonl)?;
    Ok(paths)
}

/// End-of-run statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub posts: usize,
    pub threads: usize,
    /// Distinct board codes, sorted.
    pub boards: Vec<String>,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

impl Summary {
    pub fn new(posts: &[Post], threads: &[Thread]) -> Self {
        let boards: BTreeSet<&str> = posts.iter().filter_map(|p| p.board.as_deref()).collect();
        let dated = || {
            posts
                .iter()
                .filter_map(|p| p.timestamp.zip(p.date_iso.as_ref()))
        };
        Self {
            posts: posts.len(),
            threads: threads.len(),
            boards: boards.into_iter().map(String::from).collect(),
            first_date: dated().min_by_key(|(ts, _)| *ts).map(|(_, d)| d.clone()),
            last_date: dated().max_by_key(|(ts, _)| *ts).map(|(_, d)| d.clone()),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Posts: {}", self.posts)?;
        writeln!(f, "Threads: {}", self.threads)?;
        if self.boards.is_empty() {
            writeln!(f, "Boards: -")?;
        } else {
            writeln!(f, "Boards: {}", self.boards.join(", "))?;
        }
        match (&self.first_date, &self.last_date) {
            (Some(first), Some(last)) => write!(f, "Dates: {} .. {}", first, last),
            _ => write!(f, "Dates: -"),
        }
    }
}
