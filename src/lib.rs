//! tripscrape: CLI scraper that collects every post by a username or tripcode from a
//! FoolFuuka archive, outputting JSON.

pub mod cli;
pub mod config;
pub mod export;
pub mod model;
pub mod normalize;
pub mod progress;
pub mod scraper;

// Re-exports for CLI and consumers.
pub use export::{export_all, ExportError, ExportPaths, Summary};
pub use model::{Post, Query, RawPost, SourceKind, Thread};
pub use normalize::{dedupe_by_post_id, group_by_thread, normalize};
pub use progress::{FileProgressStore, MemoryProgressStore, PersistError, ProgressStore};
pub use crate::scraper::{
    scrape_posts, Page, PageSource, PoliteClient, PoliteClientBuilder, ScrapeConfig, ScrapeOptions,
    ScrapeReport, ScrapeStatus, ScraperError, SourceMode,
};
