//! Data model for scraped posts.
//!
//! Raw records keep the archive's field names so they survive a checkpoint unchanged.
//! The normalizer turns them into the canonical [Post]; the exporter consumes [Post] and [Thread].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one scrape run. Also the key used to match a saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub username: String,
    pub tripcode: String,
    /// Board codes in the order given. Empty means all boards.
    pub boards: Vec<String>,
}

impl Query {
    /// Build a query from a dot-delimited board list (e.g. `"x.pol"`, or `""` for all boards).
    pub fn new(username: &str, tripcode: &str, boards: &str) -> Self {
        Self {
            username: username.trim().to_string(),
            tripcode: tripcode.trim().to_string(),
            boards: parse_boards(boards),
        }
    }

    /// Boards joined with `.` the way the search endpoints expect them.
    pub fn boards_param(&self) -> String {
        self.boards.join(".")
    }

    /// The single board code when exactly one board is requested.
    pub fn single_board(&self) -> Option<&str> {
        match self.boards.as_slice() {
            [board] => Some(board.as_str()),
            _ => None,
        }
    }

    /// Username when set, else tripcode. Used for file names and log lines.
    pub fn identity(&self) -> &str {
        if self.username.is_empty() {
            &self.tripcode
        } else {
            &self.username
        }
    }

    /// Stable textual signature of every field; keys the progress store.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.username,
            self.tripcode,
            self.boards_param()
        )
    }
}

fn parse_boards(s: &str) -> Vec<String> {
    s.split('.')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect()
}

/// Which page source produced a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceKind {
    /// JSON search API.
    #[default]
    #[serde(rename = "api")]
    Structured,
    /// HTML search results page.
    #[serde(rename = "html")]
    Markup,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Structured => f.write_str("api"),
            SourceKind::Markup => f.write_str("html"),
        }
    }
}

/// A value the archive sends either as a number or as a string (ids, flags, timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Identifier form: integers as decimal, non-empty trimmed strings as-is.
    pub fn as_id(&self) -> Option<String> {
        match self {
            Scalar::Int(n) => Some(n.to_string()),
            Scalar::Float(f) if f.fract() == 0.0 && f.is_finite() => Some((*f as i64).to_string()),
            Scalar::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// True for the string `"1"` or the number 1.
    pub fn is_one(&self) -> bool {
        match self {
            Scalar::Int(n) => *n == 1,
            Scalar::Float(f) => *f == 1.0,
            Scalar::Text(s) => s == "1",
            Scalar::Bool(_) => false,
        }
    }

    /// Epoch seconds from a number or a numeric string.
    pub fn as_epoch(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Float(f) if f.is_finite() => Some(*f as i64),
            Scalar::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Board as sent by the API (nested object) or by older records (flat code).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoardRef {
    Nested(BoardInfo),
    Flat(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardInfo {
    #[serde(default)]
    pub shortname: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Attached file descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub media_filename: Option<String>,
    pub media_link: Option<String>,
    pub remote_media_link: Option<String>,
    pub thumb_link: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Provider-specific post record. Not canonical; every field may be missing.
///
/// Unknown fields are kept in `extra` so a record written to a checkpoint reads back identical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPost {
    #[serde(rename = "_source")]
    pub source: SourceKind,
    pub doc_id: Option<Scalar>,
    pub num: Option<Scalar>,
    pub thread_num: Option<Scalar>,
    pub op: Option<Scalar>,
    pub board: Option<BoardRef>,
    pub timestamp: Option<Scalar>,
    pub fourchan_date: Option<String>,
    pub name: Option<String>,
    pub trip: Option<String>,
    pub poster_hash: Option<String>,
    pub poster_country: Option<String>,
    pub title: Option<String>,
    pub comment_sanitized: Option<String>,
    pub comment: Option<String>,
    pub comment_processed: Option<String>,
    pub media: Option<MediaInfo>,
    pub media_link: Option<String>,
    pub deleted: Option<Scalar>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Canonical post. Every field is always serialized; absent values become `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: Option<String>,
    pub thread_id: Option<String>,
    pub board: Option<String>,
    pub is_op: bool,
    /// Epoch seconds. Present iff `date_iso` is present.
    pub timestamp: Option<i64>,
    pub date_iso: Option<String>,
    pub name: Option<String>,
    pub tripcode: Option<String>,
    pub poster_id: Option<String>,
    pub country: Option<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub text_html: Option<String>,
    pub has_media: bool,
    pub media_filename: Option<String>,
    pub media_url: Option<String>,
    pub thumb_url: Option<String>,
    pub deleted: bool,
}

/// Posts sharing a thread, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub board: Option<String>,
    pub posts: Vec<Post>,
}

/// Checkpoint of a scrape in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub query: Query,
    pub posts: Vec<RawPost>,
    /// First page not yet fetched (1-based).
    #[serde(rename = "nextPage")]
    pub next_page: u32,
    #[serde(rename = "savedAt")]
    pub saved_at: DateTime<Utc>,
}
