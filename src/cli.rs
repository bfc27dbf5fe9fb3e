//! CLI parsing and orchestration. Parses args, merges the config file, runs the scrape,
//! writes the three output files, and maps errors to exit codes.

use crate::config::{self, Config};
use crate::export::{export_all, ExportError, Summary, DEFAULT_PREFIX};
use crate::progress::{default_progress_dir, FileProgressStore, MemoryProgressStore, ProgressStore};
use crate::scraper::{
    parse_base_url, scrape_posts, PoliteClient, ScrapeConfig, ScrapeOptions, ScrapeStatus,
    ScraperError, SourceMode, ThreadSleeper,
};
use clap::Parser;
use log::{info, warn};
use reqwest::Url;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0:#}")]
    Config(anyhow::Error),

    #[error("{0}")]
    Scraper(#[from] ScraperError),

    #[error("Scrape aborted at page {page} after repeated failures. Partial results were written; run again to resume.")]
    Incomplete {
        page: u32,
        #[source]
        source: ScraperError,
    },

    #[error("Finished with page(s) {pages:?} skipped after repeated failures. Partial results were written; run again to fetch them.")]
    PagesSkipped { pages: Vec<u32> },

    #[error("{0}")]
    Export(#[from] ExportError),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Config(_) => 1,
            CliRunError::Scraper(e) if e.is_config() => 1,
            CliRunError::Scraper(_)
            | CliRunError::Incomplete { .. }
            | CliRunError::PagesSkipped { .. } => 2,
            CliRunError::Export(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tripscrape")]
#[command(about = "Collect every post by a username or tripcode from a FoolFuuka archive and write JSON")]
#[command(
    after_help = "Config file keys (base_url, username, tripcode, boards, delay_ms, start_page, max_retries, retry_backoff_ms, timeout_secs, user_agent, cookie, output_dir, prefix, progress_dir) are read from ./tripscrape.toml or <config dir>/tripscrape/config.toml. CLI flags override config."
)]
pub struct Args {
    /// Poster name to search for.
    #[arg(short, long)]
    pub username: Option<String>,

    /// Tripcode to search for, including the leading '!'.
    #[arg(short, long)]
    pub tripcode: Option<String>,

    /// Dot-delimited board codes, e.g. x.pol. Default: all boards.
    #[arg(short, long)]
    pub boards: Option<String>,

    /// Archive root URL, e.g. https://archive.example.org/
    #[arg(long)]
    pub base_url: Option<String>,

    /// Delay between pages in milliseconds (default 13000).
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// First page to fetch when not resuming (default 1).
    #[arg(long, value_parser = parse_page)]
    pub start_page: Option<u32>,

    /// Retries per page after the first attempt (default 3).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Linear retry backoff unit in milliseconds (default 5000).
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Request timeout in seconds (default 30).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// HTTP User-Agent (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Session cookie sent with every request, e.g. "foolframe_session=abc".
    #[arg(long)]
    pub cookie: Option<String>,

    /// Page source: auto (API, then HTML if the API run aborts), api, or html.
    #[arg(long, default_value = "auto", value_parser = parse_source)]
    pub source: SourceMode,

    /// Directory for the output files. Must exist. Default: current directory.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Output file name prefix (default "fuuka").
    #[arg(long)]
    pub prefix: Option<String>,

    /// Directory for resumable progress records.
    #[arg(long)]
    pub progress_dir: Option<PathBuf>,

    /// Ignore and do not keep progress records.
    #[arg(long)]
    pub no_resume: bool,

    /// Drop posts whose id was already seen.
    #[arg(long)]
    pub dedupe: bool,

    /// Suppress progress output (warnings and errors only).
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and the full error chain.
    #[arg(long)]
    pub verbose: bool,
}

fn parse_source(s: &str) -> Result<SourceMode, String> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(SourceMode::Auto),
        "api" | "json" => Ok(SourceMode::Structured),
        "html" => Ok(SourceMode::Markup),
        _ => Err(format!(
            "Invalid --source value: '{}'. Use auto, api, or html.",
            s
        )),
    }
}

fn parse_page(s: &str) -> Result<u32, String> {
    match s.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!("Invalid page number: '{}'. Pages start at 1.", s)),
    }
}

/// Everything a run needs, after CLI flags are laid over the config file.
#[derive(Debug)]
pub struct Settings {
    pub scrape: ScrapeConfig,
    pub base_url: Url,
    pub mode: SourceMode,
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub progress_dir: PathBuf,
    pub resume: bool,
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Merge args over config over defaults. Fails without touching the network when the
/// identity or base URL is missing.
pub fn resolve_settings(args: &Args, config: Option<&Config>) -> Result<Settings, CliRunError> {
    let from_config = |f: fn(&Config) -> Option<String>| config.and_then(f);
    let defaults = ScrapeConfig::default();

    let scrape = ScrapeConfig {
        username: args
            .username
            .clone()
            .or_else(|| from_config(|c| c.username.clone()))
            .unwrap_or_default(),
        tripcode: args
            .tripcode
            .clone()
            .or_else(|| from_config(|c| c.tripcode.clone()))
            .unwrap_or_default(),
        boards: args
            .boards
            .clone()
            .or_else(|| from_config(|c| c.boards.clone()))
            .unwrap_or_default(),
        delay_ms: args
            .delay_ms
            .or_else(|| config.and_then(|c| c.delay_ms))
            .unwrap_or(defaults.delay_ms),
        start_page: args
            .start_page
            .or_else(|| config.and_then(|c| c.start_page))
            .unwrap_or(defaults.start_page),
        max_retries: args
            .max_retries
            .or_else(|| config.and_then(|c| c.max_retries))
            .unwrap_or(defaults.max_retries),
        retry_backoff_ms: args
            .retry_backoff_ms
            .or_else(|| config.and_then(|c| c.retry_backoff_ms))
            .unwrap_or(defaults.retry_backoff_ms),
        dedupe: args.dedupe,
        ..defaults
    };
    scrape.validate().map_err(|e| match e {
        ScraperError::MissingIdentity => CliRunError::InvalidInput(
            "No identity given. Pass --username, --tripcode, or both (or set them in the config file)."
                .to_string(),
        ),
        other => CliRunError::Scraper(other),
    })?;

    let base_input = args
        .base_url
        .clone()
        .or_else(|| from_config(|c| c.base_url.clone()))
        .ok_or_else(|| {
            CliRunError::InvalidInput(
                "No archive given. Pass --base-url (e.g. https://archive.example.org/) or set base_url in the config file."
                    .to_string(),
            )
        })?;
    let base_url = parse_base_url(&base_input)?;

    Ok(Settings {
        scrape,
        base_url,
        mode: args.source,
        timeout_secs: args
            .timeout
            .or_else(|| config.and_then(|c| c.timeout_secs))
            .unwrap_or(DEFAULT_TIMEOUT_SECS),
        user_agent: args
            .user_agent
            .clone()
            .or_else(|| from_config(|c| c.user_agent.clone())),
        cookie: args.cookie.clone().or_else(|| from_config(|c| c.cookie.clone())),
        output_dir: args
            .output_dir
            .clone()
            .or_else(|| config.and_then(|c| c.output_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(".")),
        prefix: args
            .prefix
            .clone()
            .or_else(|| from_config(|c| c.prefix.clone()))
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        progress_dir: args
            .progress_dir
            .clone()
            .or_else(|| config.and_then(|c| c.progress_dir.clone()))
            .unwrap_or_else(default_progress_dir),
        resume: !args.no_resume,
    })
}

/// The output directory must exist before a long scrape starts.
fn validate_output_dir(dir: &Path) -> Result<(), CliRunError> {
    if !dir.is_dir() {
        return Err(CliRunError::InvalidInput(format!(
            "Cannot write output: {}: directory does not exist.",
            dir.display()
        )));
    }
    Ok(())
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config().map_err(CliRunError::Config)?;
    let settings = resolve_settings(args, config.as_ref())?;
    validate_output_dir(&settings.output_dir)?;

    let mut builder = PoliteClient::builder().timeout_secs(settings.timeout_secs);
    if let Some(ua) = &settings.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(cookie) = &settings.cookie {
        builder = builder.cookie(cookie.clone());
    }
    let mut client = builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

    let file_store;
    let memory_store;
    let store: &dyn ProgressStore = if settings.resume {
        file_store = FileProgressStore::new(&settings.progress_dir);
        info!("Progress records in {}", file_store.dir().display());
        &file_store
    } else {
        memory_store = MemoryProgressStore::default();
        &memory_store
    };

    let spinner: RefCell<Option<indicatif::ProgressBar>> = RefCell::new(None);
    let progress_cb = |page: u32, count: usize| {
        let mut state = spinner.borrow_mut();
        let pb = state.get_or_insert_with(|| {
            let bar = indicatif::ProgressBar::new_spinner();
            if let Ok(style) =
                indicatif::ProgressStyle::default_spinner().template("{spinner} {msg} ({elapsed})")
            {
                bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        pb.set_message(format!("Page {}: {} post(s) so far", page, count));
    };
    let progress: Option<&dyn Fn(u32, usize)> = if args.quiet { None } else { Some(&progress_cb) };
    let options = ScrapeOptions {
        progress,
        resume: settings.resume,
    };

    let result = scrape_posts(
        settings.mode,
        &settings.scrape,
        &settings.base_url,
        &mut client,
        store,
        &ThreadSleeper,
        &options,
    );
    if let Some(pb) = spinner.borrow_mut().take() {
        pb.disable_steady_tick();
        pb.finish_and_clear();
    }
    let report = result?;

    if report.fell_back {
        warn!("Results come from the HTML search pages after the JSON API run was aborted");
    }
    if !report.skipped_pages.is_empty() {
        warn!(
            "Skipped page(s) after exhausting retries: {:?}",
            report.skipped_pages
        );
    }
    info!(
        "{} page(s) fetched via {}, {} rate-limit wait(s)",
        report.pages_fetched, report.source, report.rate_limited
    );

    let paths = export_all(
        &report.posts,
        &report.threads,
        &settings.output_dir,
        &settings.prefix,
        report.query.identity(),
    )?;

    if !args.quiet {
        eprintln!("{}", Summary::new(&report.posts, &report.threads));
        for path in [&paths.flat, &paths.threaded, &paths.jsonl] {
            eprintln!("Wrote {}", path.display());
        }
    }

    match report.status {
        ScrapeStatus::Completed => Ok(()),
        ScrapeStatus::Partial { .. } => Err(CliRunError::PagesSkipped {
            pages: report.skipped_pages,
        }),
        ScrapeStatus::CircuitBroken { page, last_error } => Err(CliRunError::Incomplete {
            page,
            source: last_error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("tripscrape").chain(argv.iter().copied()))
    }

    #[test]
    fn parse_source_all() {
        assert_eq!(parse_source("auto"), Ok(SourceMode::Auto));
        assert_eq!(parse_source("api"), Ok(SourceMode::Structured));
        assert_eq!(parse_source("JSON"), Ok(SourceMode::Structured));
        assert_eq!(parse_source("html"), Ok(SourceMode::Markup));
        assert!(parse_source("rss").is_err());
    }

    #[test]
    fn parse_page_rejects_zero() {
        assert_eq!(parse_page("3"), Ok(3));
        assert!(parse_page("0").is_err());
        assert!(parse_page("x").is_err());
    }

    #[test]
    fn flags_parse() -> Result<(), clap::Error> {
        let a = args(&[
            "-u", "Bob", "-b", "x.pol", "--base-url", "https://archive.example.org",
            "--delay-ms", "100", "--source", "html", "--no-resume", "--dedupe", "-q",
        ])?;
        assert_eq!(a.username.as_deref(), Some("Bob"));
        assert_eq!(a.boards.as_deref(), Some("x.pol"));
        assert_eq!(a.delay_ms, Some(100));
        assert_eq!(a.source, SourceMode::Markup);
        assert!(a.no_resume && a.dedupe && a.quiet);
        assert!(args(&["--start-page", "0"]).is_err());
        Ok(())
    }

    #[test]
    fn defaults_apply_without_config() -> Result<(), Box<dyn std::error::Error>> {
        let a = args(&["-t", "!Ep8pui8Vw2", "--base-url", "https://archive.example.org/sub"])?;
        let s = resolve_settings(&a, None)?;
        assert_eq!(s.scrape.tripcode, "!Ep8pui8Vw2");
        assert_eq!(s.scrape.delay_ms, 13_000);
        assert_eq!(s.scrape.start_page, 1);
        assert_eq!(s.scrape.max_retries, 3);
        assert_eq!(s.scrape.retry_backoff_ms, 5_000);
        assert_eq!(s.scrape.max_consecutive_failures, 5);
        assert!(!s.scrape.dedupe);
        assert_eq!(s.base_url.as_str(), "https://archive.example.org/sub/");
        assert_eq!(s.mode, SourceMode::Auto);
        assert_eq!(s.timeout_secs, 30);
        assert_eq!(s.prefix, "fuuka");
        assert_eq!(s.output_dir, PathBuf::from("."));
        assert!(s.resume);
        Ok(())
    }

    #[test]
    fn args_override_config() -> Result<(), Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(
            r#"
            base_url = "https://config.example.org/"
            username = "FromConfig"
            boards = "pol"
            delay_ms = 2000
            prefix = "cfg"
            timeout_secs = 10
            "#,
        )?;
        let a = args(&["-u", "Bob", "--delay-ms", "50"])?;
        let s = resolve_settings(&a, Some(&config))?;
        assert_eq!(s.scrape.username, "Bob");
        assert_eq!(s.scrape.boards, "pol");
        assert_eq!(s.scrape.delay_ms, 50);
        assert_eq!(s.base_url.as_str(), "https://config.example.org/");
        assert_eq!(s.prefix, "cfg");
        assert_eq!(s.timeout_secs, 10);
        Ok(())
    }

    #[test]
    fn missing_identity_is_invalid_input() -> Result<(), clap::Error> {
        let a = args(&["--base-url", "https://archive.example.org/"])?;
        let err = match resolve_settings(&a, None) {
            Err(e) => e,
            Ok(_) => panic!("expected missing identity"),
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("--username"));
        Ok(())
    }

    #[test]
    fn missing_or_bad_base_url_is_invalid_input() -> Result<(), clap::Error> {
        let a = args(&["-u", "Bob"])?;
        assert!(matches!(
            resolve_settings(&a, None),
            Err(CliRunError::InvalidInput(_))
        ));
        let a = args(&["-u", "Bob", "--base-url", "archive"])?;
        match resolve_settings(&a, None) {
            Err(e) => assert_eq!(e.exit_code(), 1),
            Ok(_) => panic!("expected invalid URL"),
        }
        Ok(())
    }

    #[test]
    fn validate_output_dir_missing() {
        assert!(validate_output_dir(&std::env::temp_dir()).is_ok());
        let result = validate_output_dir(Path::new("/nonexistent_dir_tripscrape_xyz"));
        assert!(matches!(result, Err(CliRunError::InvalidInput(msg)) if msg.contains("does not exist")));
    }

    #[test]
    fn cli_run_error_exit_codes() {
        assert_eq!(CliRunError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(CliRunError::Config(anyhow::anyhow!("bad toml")).exit_code(), 1);
        assert_eq!(CliRunError::Scraper(ScraperError::MissingIdentity).exit_code(), 1);
        let http = || ScraperError::HttpStatus {
            status: 502,
            status_text: "Bad Gateway".into(),
            url: "https://archive.example.org/".into(),
        };
        assert_eq!(CliRunError::Scraper(http()).exit_code(), 2);
        assert_eq!(
            CliRunError::Incomplete {
                page: 4,
                source: http()
            }
            .exit_code(),
            2
        );
        assert_eq!(CliRunError::PagesSkipped { pages: vec![2] }.exit_code(), 2);
        assert_eq!(
            CliRunError::Export(ExportError::MissingDir {
                path: PathBuf::from("out")
            })
            .exit_code(),
            3
        );
    }
}
