//! Shared error type for page sources and the scrape entry point.

use thiserror::Error;

/// Errors surfaced by the HTTP client, the page sources, and config validation.
///
/// Rate limiting (HTTP 429) and end of results are not errors and never appear here.
#[derive(Debug, Error)]
pub enum ScraperError {
    // Configuration
    #[error("No identity given: set a username, a tripcode, or both.")]
    MissingIdentity,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    // Transport
    #[error("Network error: could not reach {url}: {source}")]
    Network { url: String, source: reqwest::Error },

    #[error("HTTP {status} {status_text} when fetching: {url}")]
    HttpStatus {
        status: u16,
        status_text: String,
        url: String,
    },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead { url: String, source: reqwest::Error },

    // Parsing
    #[error("Could not parse search response from {url}: {reason}")]
    ParseResponse { url: String, reason: String },

    #[error("Could not parse search results page: {message}")]
    ParseMarkup { message: String },
}

impl ScraperError {
    /// Configuration problems are reported before any request is made.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ScraperError::MissingIdentity
                | ScraperError::InvalidConfig { .. }
                | ScraperError::InvalidUrl { .. }
        )
    }
}
