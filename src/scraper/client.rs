//! Blocking HTTP client that honours server-directed rate limiting (HTTP 429 + Retry-After).

use crate::scraper::error::ScraperError;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, RETRY_AFTER};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; tripscrape/0.1; +https://github.com/tripscrape)";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// Wait used for a 429 without a usable Retry-After header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Timed suspension. Every wait in a scrape (page delay, retry backoff, 429) goes through this.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// One HTTP response, body already read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// Raw Retry-After header, if any.
    pub retry_after: Option<String>,
    pub body: String,
}

/// Issues a single GET. Implemented over reqwest; replaced by a scripted fake in tests.
pub trait Transport {
    fn get(&self, url: &str, accept: &str) -> Result<HttpResponse, ScraperError>;
}

/// reqwest-backed transport with cookie store, timeout, and redirect limit.
#[derive(Debug)]
pub struct ReqwestTransport {
    inner: reqwest::blocking::Client,
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str, accept: &str) -> Result<HttpResponse, ScraperError> {
        let response = self
            .inner
            .get(url)
            .header(ACCEPT, accept)
            .send()
            .map_err(|e| ScraperError::Network {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().map_err(|e| ScraperError::BodyRead {
            url: url.to_string(),
            source: e,
        })?;
        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            retry_after,
            body,
        })
    }
}

/// Seconds to wait for a 429. Integer Retry-After only; anything else falls back to 30.
pub fn retry_after_secs(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// HTTP client shared by both page sources.
///
/// A 429 is a directive to wait, not a failure: the same request is re-issued after the
/// server-specified delay, as many times as the server asks. Those waits are counted in
/// [PoliteClient::rate_limited_count] and never surface to retry or failure budgets.
pub struct PoliteClient {
    transport: Box<dyn Transport>,
    sleeper: Box<dyn Sleeper>,
    rate_limited: u64,
}

impl std::fmt::Debug for PoliteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoliteClient")
            .field("rate_limited", &self.rate_limited)
            .finish_non_exhaustive()
    }
}

impl PoliteClient {
    /// Builder for custom User-Agent, timeout, and session cookie.
    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }

    /// Wrap an arbitrary transport (used by tests and alternative HTTP stacks).
    pub fn with_transport(transport: Box<dyn Transport>, sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            transport,
            sleeper,
            rate_limited: 0,
        }
    }

    /// GET `url` and return the body of a 2xx response.
    ///
    /// 429 responses are waited out and retried in place. Any other non-2xx status is
    /// returned as [ScraperError::HttpStatus].
    pub fn get_text(&mut self, url: &str, accept: &str) -> Result<String, ScraperError> {
        let mut waits = 0u64;
        loop {
            let response = self.transport.get(url, accept)?;
            if response.status == 429 {
                let secs = retry_after_secs(response.retry_after.as_deref());
                waits += 1;
                self.rate_limited += 1;
                warn!(
                    "Rate limited at {} (wait #{} for this request); sleeping {}s",
                    url, waits, secs
                );
                self.sleeper.sleep(Duration::from_secs(secs));
                continue;
            }
            if !(200..300).contains(&response.status) {
                return Err(ScraperError::HttpStatus {
                    status: response.status,
                    status_text: response.status_text,
                    url: url.to_string(),
                });
            }
            debug!("GET {} -> {}", url, response.status);
            return Ok(response.body);
        }
    }

    /// Total number of 429 waits since this client was built.
    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited
    }
}

/// Builder for PoliteClient.
#[derive(Debug)]
pub struct PoliteClientBuilder {
    user_agent: Option<String>,
    timeout_secs: u64,
    cookie: Option<String>,
}

impl Default for PoliteClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            cookie: None,
        }
    }
}

impl PoliteClientBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Set request timeout in seconds. Default 30.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Session cookie string sent with every request (e.g. `"foolframe_xyz=abc; other=1"`).
    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Build the blocking reqwest client and wrap it. Waits use [ThreadSleeper].
    pub fn build(self) -> Result<PoliteClient, reqwest::Error> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let mut headers = HeaderMap::new();
        if let Some(cookie) = self.cookie.as_deref().filter(|c| !c.trim().is_empty()) {
            match HeaderValue::from_str(cookie.trim()) {
                Ok(v) => {
                    headers.insert(COOKIE, v);
                }
                Err(e) => warn!("Ignoring session cookie with invalid characters: {}", e),
            }
        }
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(PoliteClient::with_transport(
            Box::new(ReqwestTransport { inner }),
            Box::new(ThreadSleeper),
        ))
    }
}
