//! Optional config file loading. Search order: ./tripscrape.toml, then
//! $XDG_CONFIG_HOME/tripscrape/config.toml (or ~/.config/tripscrape/config.toml).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Archive root, e.g. "https://archive.example.org/".
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub tripcode: Option<String>,
    /// Dot-delimited board codes, e.g. "x.pol". Empty or absent searches all boards.
    pub boards: Option<String>,
    /// Delay in milliseconds between pages.
    pub delay_ms: Option<u64>,
    pub start_page: Option<u32>,
    /// Retries per page after the first attempt.
    pub max_retries: Option<u32>,
    /// Backoff unit in milliseconds; retry n waits n times this.
    pub retry_backoff_ms: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Session cookie string sent with every request.
    pub cookie: Option<String>,
    /// Default output directory when -o is not set. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// Output file name prefix.
    pub prefix: Option<String>,
    /// Directory for resumable progress records.
    pub progress_dir: Option<PathBuf>,
}

/// Candidate config paths in search order.
pub fn config_paths() -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir().context("Cannot determine current directory")?;
    let mut paths = vec![cwd.join("tripscrape.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("tripscrape").join("config.toml"));
    }
    Ok(paths)
}

/// Read and parse one config file.
pub fn read_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("Invalid config {}", path.display()))
}

/// First existing file in [config_paths].
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>> {
    for path in config_paths()? {
        if path.exists() {
            log::debug!("Using config {}", path.display());
            return read_config(&path).map(Some);
        }
    }
    Ok(None)
}
