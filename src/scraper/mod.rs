//! Page sources and scraping. Source trait, shared client, the two adapters, the engine,
//! and the dispatch that falls back from the JSON API to the HTML pages.

mod client;
mod error;

pub mod engine;
pub mod markup;
pub mod structured;

pub use client::{
    retry_after_secs, HttpResponse, PoliteClient, PoliteClientBuilder, ReqwestTransport, Sleeper,
    ThreadSleeper, Transport, DEFAULT_RETRY_AFTER_SECS,
};
pub use engine::{ScrapeConfig, ScrapeEngine, ScrapeOptions, ScrapeOutcome, ScrapeStatus};
pub use error::ScraperError;
pub use markup::MarkupSource;
pub use structured::StructuredSource;

use crate::model::{Post, Query, RawPost, SourceKind, Thread};
use crate::normalize::{dedupe_by_post_id, group_by_thread, normalize};
use crate::progress::ProgressStore;
use log::{info, warn};
use reqwest::Url;

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Posts(Vec<RawPost>),
    /// Normal end of pagination, not an error.
    EndOfResults,
}

/// Fetches and parses one page of search results for a query.
///
/// Implementations are stateless apart from the HTTP client they borrow; all scrape state
/// lives in the engine.
pub trait PageSource {
    fn kind(&self) -> SourceKind;
    fn fetch_page(&mut self, query: &Query, page: u32) -> Result<Page, ScraperError>;
}

/// Which source(s) a scrape may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// JSON API, restarting once with the HTML pages if the API run is aborted.
    #[default]
    Auto,
    Structured,
    Markup,
}

/// Parse and normalize the archive base URL so relative endpoint paths join under it.
pub fn parse_base_url(input: &str) -> Result<Url, ScraperError> {
    let trimmed = input.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash).map_err(|e| ScraperError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ScraperError::InvalidUrl {
            input: input.to_string(),
            reason: "expected an http(s) URL with a host".to_string(),
        });
    }
    Ok(url)
}

/// Result of a whole scrape: canonical posts, their threads, and how the run ended.
#[derive(Debug)]
pub struct ScrapeReport {
    pub query: Query,
    pub posts: Vec<Post>,
    pub threads: Vec<Thread>,
    /// Source of the run whose posts are reported.
    pub source: SourceKind,
    pub status: ScrapeStatus,
    /// Whether the API run was abandoned for the HTML pages.
    pub fell_back: bool,
    pub pages_fetched: u32,
    pub resumed_from: Option<u32>,
    pub skipped_pages: Vec<u32>,
    /// 429 waits across the whole scrape.
    pub rate_limited: u64,
}

/// Validate, scrape, normalize, and group.
///
/// Fails fast, before any request, when the config names no identity. In [SourceMode::Auto]
/// an API run that ends with the circuit broken is followed by exactly one fresh run over the
/// HTML pages; that run does not resume and overwrites the checkpoint.
pub fn scrape_posts(
    mode: SourceMode,
    config: &ScrapeConfig,
    base: &Url,
    client: &mut PoliteClient,
    store: &dyn ProgressStore,
    sleeper: &dyn Sleeper,
    options: &ScrapeOptions<'_>,
) -> Result<ScrapeReport, ScraperError> {
    config.validate()?;
    let query = config.query();
    let engine = ScrapeEngine::new(config, store, sleeper);
    info!(
        "Scraping posts by {} on {}",
        query.identity(),
        if query.boards.is_empty() {
            "all boards".to_string()
        } else {
            query.boards_param()
        }
    );

    let mut fell_back = false;
    let outcome = match mode {
        SourceMode::Structured => engine.run(&mut StructuredSource::new(client, base.clone()), options),
        SourceMode::Markup => engine.run(&mut MarkupSource::new(client, base.clone()), options),
        SourceMode::Auto => {
            let api = engine.run(&mut StructuredSource::new(client, base.clone()), options);
            match &api.status {
                ScrapeStatus::CircuitBroken { last_error, .. } => {
                    warn!(
                        "JSON API run aborted ({}); restarting the scrape from HTML search pages",
                        last_error
                    );
                    fell_back = true;
                    let fresh = ScrapeOptions {
                        progress: options.progress,
                        resume: false,
                    };
                    engine.run(&mut MarkupSource::new(client, base.clone()), &fresh)
                }
                ScrapeStatus::Completed | ScrapeStatus::Partial { .. } => api,
            }
        }
    };

    let mut posts = normalize(&outcome.posts);
    if config.dedupe {
        let before = posts.len();
        posts = dedupe_by_post_id(posts);
        if posts.len() != before {
            info!("Removed {} duplicate post(s)", before - posts.len());
        }
    }
    let threads = group_by_thread(&posts);
    Ok(ScrapeReport {
        query,
        posts,
        threads,
        source: outcome.source,
        status: outcome.status,
        fell_back,
        pages_fetched: outcome.pages_fetched,
        resumed_from: outcome.resumed_from,
        skipped_pages: outcome.skipped_pages,
        rate_limited: client.rate_limited_count(),
    })
}
