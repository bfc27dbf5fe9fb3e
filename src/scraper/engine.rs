//! Resumable pagination loop: retries with linear backoff, a consecutive-failure circuit
//! breaker, a fixed politeness delay between pages, and a checkpoint after every page.

use crate::model::{Query, RawPost, SourceKind};
use crate::progress::ProgressStore;
use crate::scraper::error::ScraperError;
use crate::scraper::{Page, PageSource, Sleeper};
use log::{debug, info, warn};
use std::time::Duration;

pub const DEFAULT_DELAY_MS: u64 = 13_000;
pub const DEFAULT_START_PAGE: u32 = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;
/// Consecutive failed fetches, across pages, that abort a run.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Immutable settings for one run. Built once and passed by reference everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub username: String,
    pub tripcode: String,
    /// Dot-delimited board codes; empty for all boards.
    pub boards: String,
    pub delay_ms: u64,
    pub start_page: u32,
    /// Retries per page after the first attempt.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_consecutive_failures: u32,
    /// Drop repeated post ids after normalization. Off by default.
    pub dedupe: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            tripcode: String::new(),
            boards: String::new(),
            delay_ms: DEFAULT_DELAY_MS,
            start_page: DEFAULT_START_PAGE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            dedupe: false,
        }
    }
}

impl ScrapeConfig {
    /// Reject configs that cannot produce a request. Runs before any network call.
    pub fn validate(&self) -> Result<(), ScraperError> {
        if self.username.trim().is_empty() && self.tripcode.trim().is_empty() {
            return Err(ScraperError::MissingIdentity);
        }
        if self.start_page == 0 {
            return Err(ScraperError::InvalidConfig {
                reason: "start page must be 1 or greater".to_string(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ScraperError::InvalidConfig {
                reason: "consecutive failure limit must be 1 or greater".to_string(),
            });
        }
        Ok(())
    }

    pub fn query(&self) -> Query {
        Query::new(&self.username, &self.tripcode, &self.boards)
    }
}

/// Options that vary per call rather than per config.
pub struct ScrapeOptions<'a> {
    /// Called after each stored page with (page number, accumulated post count).
    pub progress: Option<&'a dyn Fn(u32, usize)>,
    /// Load a matching checkpoint before the first fetch.
    pub resume: bool,
}

impl Default for ScrapeOptions<'_> {
    fn default() -> Self {
        Self {
            progress: None,
            resume: true,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum ScrapeStatus {
    /// Pagination reached end of results; the checkpoint was removed.
    Completed,
    /// Too many consecutive failures. The checkpoint points at `page` for a later resume.
    CircuitBroken { page: u32, last_error: ScraperError },
    /// Pagination ended but some pages were skipped after exhausting their retries.
    /// The checkpoint points at `resume_page`, the first skipped page.
    Partial { resume_page: u32 },
}

impl ScrapeStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ScrapeStatus::Completed)
    }
}

/// What a run produced. Posts are returned in both terminal states.
#[derive(Debug)]
pub struct ScrapeOutcome {
    pub posts: Vec<RawPost>,
    pub status: ScrapeStatus,
    pub source: SourceKind,
    /// Pages fetched successfully in this run (resumed pages not included).
    pub pages_fetched: u32,
    /// Page the run resumed from, when a checkpoint was used.
    pub resumed_from: Option<u32>,
    /// Pages given up on after exhausting their retries.
    pub skipped_pages: Vec<u32>,
}

/// Drives a [PageSource] page by page, checkpointing into a [ProgressStore].
pub struct ScrapeEngine<'a> {
    config: &'a ScrapeConfig,
    store: &'a dyn ProgressStore,
    sleeper: &'a dyn Sleeper,
}

impl<'a> ScrapeEngine<'a> {
    pub fn new(
        config: &'a ScrapeConfig,
        store: &'a dyn ProgressStore,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            config,
            store,
            sleeper,
        }
    }

    /// Seed posts and starting page from a checkpoint whose query matches exactly.
    fn resume_point(&self, query: &Query) -> (Vec<RawPost>, u32, Option<u32>) {
        let fresh = (Vec::new(), self.config.start_page, None);
        match self.store.load(query) {
            Ok(Some(record)) if record.query == *query => {
                let page = record.next_page.max(1);
                info!(
                    "Resuming {} from page {} with {} saved post(s) (saved {})",
                    query.identity(),
                    page,
                    record.posts.len(),
                    record.saved_at.to_rfc3339()
                );
                (record.posts, page, Some(page))
            }
            Ok(Some(record)) => {
                debug!(
                    "Ignoring checkpoint for a different query ({})",
                    record.query.signature()
                );
                fresh
            }
            Ok(None) => fresh,
            Err(e) => {
                warn!("Could not read checkpoint, starting fresh: {}", e);
                fresh
            }
        }
    }

    fn checkpoint(&self, query: &Query, posts: &[RawPost], next_page: u32) {
        if let Err(e) = self.store.save(query, posts, next_page) {
            warn!(
                "Could not save progress (resume may not be possible): {}",
                e
            );
        }
    }

    /// Run until end of results or until the circuit breaker trips.
    pub fn run(&self, source: &mut dyn PageSource, options: &ScrapeOptions<'_>) -> ScrapeOutcome {
        let query = self.config.query();
        let (mut posts, mut page, resumed_from) = if options.resume {
            self.resume_point(&query)
        } else {
            (Vec::new(), self.config.start_page, None)
        };
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let delay = Duration::from_millis(self.config.delay_ms);
        let mut consecutive_failures = 0u32;
        let mut pages_fetched = 0u32;
        let mut skipped_pages = Vec::new();
        // First skipped page and the number of posts gathered before it.
        let mut first_skip: Option<(u32, usize)> = None;

        let kind = source.kind();
        let outcome = |posts: Vec<RawPost>,
                       status: ScrapeStatus,
                       pages_fetched: u32,
                       skipped_pages: Vec<u32>| ScrapeOutcome {
            posts,
            status,
            source: kind,
            pages_fetched,
            resumed_from,
            skipped_pages,
        };

        loop {
            let mut attempt = 0u32;
            let result = loop {
                debug!("Fetching page {} via {} (attempt {})", page, kind, attempt + 1);
                match source.fetch_page(&query, page) {
                    Ok(found) => break Ok(found),
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Page {} failed ({} consecutive failure(s)): {}",
                            page, consecutive_failures, e
                        );
                        if consecutive_failures >= self.config.max_consecutive_failures {
                            let (resume_page, kept) = first_skip.unwrap_or((page, posts.len()));
                            warn!(
                                "Giving up after {} consecutive failures; {} post(s) kept, resume from page {}",
                                consecutive_failures,
                                posts.len(),
                                resume_page
                            );
                            self.checkpoint(&query, &posts[..kept], resume_page);
                            return outcome(
                                posts,
                                ScrapeStatus::CircuitBroken {
                                    page: resume_page,
                                    last_error: e,
                                },
                                pages_fetched,
                                skipped_pages,
                            );
                        }
                        if attempt >= self.config.max_retries {
                            break Err(e);
                        }
                        attempt += 1;
                        let wait = backoff.saturating_mul(attempt);
                        info!("Retrying page {} in {}ms", page, wait.as_millis());
                        self.sleeper.sleep(wait);
                    }
                }
            };

            match result {
                Ok(Page::Posts(found)) => {
                    consecutive_failures = 0;
                    pages_fetched += 1;
                    debug!("Page {}: {} post(s)", page, found.len());
                    posts.extend(found);
                    self.checkpoint(&query, &posts, page + 1);
                    if let Some(progress) = options.progress {
                        progress(page, posts.len());
                    }
                    page += 1;
                    self.sleeper.sleep(delay);
                }
                Ok(Page::EndOfResults) => {
                    if let Some((resume_page, kept)) = first_skip {
                        warn!(
                            "Reached the end with {} skipped page(s); {} post(s) collected, resume from page {}",
                            skipped_pages.len(),
                            posts.len(),
                            resume_page
                        );
                        self.checkpoint(&query, &posts[..kept], resume_page);
                        return outcome(
                            posts,
                            ScrapeStatus::Partial { resume_page },
                            pages_fetched,
                            skipped_pages,
                        );
                    }
                    info!(
                        "No more results after page {}; {} post(s) collected",
                        page.saturating_sub(1),
                        posts.len()
                    );
                    if let Err(e) = self.store.clear(&query) {
                        warn!("Could not remove finished checkpoint: {}", e);
                    }
                    return outcome(posts, ScrapeStatus::Completed, pages_fetched, skipped_pages);
                }
                Err(e) => {
                    warn!(
                        "Skipping page {} after {} attempt(s): {}",
                        page,
                        attempt + 1,
                        e
                    );
                    first_skip.get_or_insert((page, posts.len()));
                    skipped_pages.push(page);
                    page += 1;
                    self.sleeper.sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scalar;
    use crate::progress::MemoryProgressStore;
    use crate::progress::PersistError;
    use crate::scraper::client::tests::RecordingSleeper;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Scripted page source; records which pages were requested.
    struct FakeSource {
        script: VecDeque<Result<Page, ScraperError>>,
        requested: Vec<u32>,
    }

    impl FakeSource {
        fn new(script: Vec<Result<Page, ScraperError>>) -> Self {
            Self {
                script: script.into(),
                requested: Vec::new(),
            }
        }
    }

    impl PageSource for FakeSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Structured
        }

        fn fetch_page(&mut self, _query: &Query, page: u32) -> Result<Page, ScraperError> {
            self.requested.push(page);
            self.script.pop_front().unwrap_or(Ok(Page::EndOfResults))
        }
    }

    fn post(num: i64) -> RawPost {
        RawPost {
            num: Some(Scalar::Int(num)),
            ..RawPost::default()
        }
    }

    fn posts(nums: &[i64]) -> Result<Page, ScraperError> {
        Ok(Page::Posts(nums.iter().copied().map(post).collect()))
    }

    fn fail() -> Result<Page, ScraperError> {
        Err(ScraperError::HttpStatus {
            status: 500,
            status_text: "Internal Server Error".into(),
            url: "https://archive.example.org/".into(),
        })
    }

    fn config() -> ScrapeConfig {
        ScrapeConfig {
            username: "Bob".into(),
            boards: "x".into(),
            delay_ms: 100,
            retry_backoff_ms: 10,
            ..ScrapeConfig::default()
        }
    }

    fn nums(posts: &[RawPost]) -> Vec<i64> {
        posts
            .iter()
            .filter_map(|p| p.num.as_ref().and_then(Scalar::as_epoch))
            .collect()
    }

    #[test]
    fn validate_requires_identity() {
        let cfg = ScrapeConfig::default();
        assert!(matches!(cfg.validate(), Err(ScraperError::MissingIdentity)));
        let cfg = ScrapeConfig {
            tripcode: "!abc".into(),
            ..ScrapeConfig::default()
        };
        assert!(cfg.validate().is_ok());
        let cfg = ScrapeConfig {
            start_page: 0,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(ScraperError::InvalidConfig { .. })));
    }

    #[test]
    fn end_of_results_completes_and_clears_checkpoint() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![posts(&[1, 2]), Ok(Page::EndOfResults)]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(out.status.is_completed());
        assert_eq!(nums(&out.posts), vec![1, 2]);
        assert_eq!(source.requested, vec![1, 2]);
        assert_eq!(out.pages_fetched, 1);
        assert!(store.get(&cfg.query()).is_none());
        // One politeness delay after the only successful page.
        assert_eq!(*sleeper.slept.borrow(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn checkpoint_written_after_each_page() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let seen = RefCell::new(Vec::new());
        let progress = |page: u32, count: usize| {
            let record = store.get(&cfg.query());
            seen.borrow_mut()
                .push((page, count, record.map(|r| (r.next_page, r.posts.len()))));
        };
        let options = ScrapeOptions {
            progress: Some(&progress),
            resume: true,
        };
        let mut source = FakeSource::new(vec![posts(&[1]), posts(&[2, 3]), Ok(Page::EndOfResults)]);
        ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &options);
        assert_eq!(
            *seen.borrow(),
            vec![(1, 1, Some((2, 1))), (2, 3, Some((3, 3)))]
        );
    }

    #[test]
    fn fail_twice_then_succeed_keeps_page_and_resets_counter() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        // Page 1 ok; page 2 fails twice, then ok; page 3 fails 3 times then ok; end.
        // Without the reset after page 2, page 3's third failure would trip the breaker.
        let mut source = FakeSource::new(vec![
            posts(&[1]),
            fail(),
            fail(),
            posts(&[2]),
            fail(),
            fail(),
            fail(),
            posts(&[3]),
            Ok(Page::EndOfResults),
        ]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(out.status.is_completed());
        assert_eq!(nums(&out.posts), vec![1, 2, 3]);
        assert_eq!(source.requested, vec![1, 2, 2, 2, 3, 3, 3, 3, 4]);
        assert!(out.skipped_pages.is_empty());
        let ms = |n| Duration::from_millis(n);
        assert_eq!(
            *sleeper.slept.borrow(),
            vec![ms(100), ms(10), ms(20), ms(100), ms(10), ms(20), ms(30), ms(100)]
        );
    }

    #[test]
    fn five_consecutive_failures_across_pages_abort_and_keep_posts() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        // Page 2: 4 attempts fail (1 + 3 retries) and is skipped; page 3 fails once more -> 5.
        let mut source = FakeSource::new(vec![posts(&[1, 2]), fail(), fail(), fail(), fail(), fail(), posts(&[9])]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        match &out.status {
            ScrapeStatus::CircuitBroken { page, .. } => assert_eq!(*page, 2),
            other => panic!("expected CircuitBroken, got {:?}", other),
        }
        assert_eq!(nums(&out.posts), vec![1, 2]);
        assert_eq!(out.skipped_pages, vec![2]);
        assert_eq!(source.requested, vec![1, 2, 2, 2, 2, 3]);
        // The checkpoint rewinds to the skipped page so a resume fetches it again.
        let record = store.get(&cfg.query()).expect("checkpoint kept");
        assert_eq!(record.next_page, 2);
        assert_eq!(record.posts.len(), 2);
    }

    #[test]
    fn skipped_page_keeps_checkpoint_and_resume_recovers_it() {
        let cfg = ScrapeConfig {
            delay_ms: 0,
            retry_backoff_ms: 0,
            ..config()
        };
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![
            posts(&[1]),
            fail(),
            fail(),
            fail(),
            fail(),
            posts(&[3]),
            Ok(Page::EndOfResults),
        ]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(!out.status.is_completed());
        assert!(matches!(out.status, ScrapeStatus::Partial { resume_page: 2 }));
        assert_eq!(out.skipped_pages, vec![2]);
        assert_eq!(nums(&out.posts), vec![1, 3]);
        let record = store.get(&cfg.query()).expect("checkpoint kept");
        assert_eq!(record.next_page, 2);
        assert_eq!(nums(&record.posts), vec![1]);

        let mut retry = FakeSource::new(vec![posts(&[2]), posts(&[3]), Ok(Page::EndOfResults)]);
        let resumed = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut retry, &ScrapeOptions::default());
        assert!(resumed.status.is_completed());
        assert_eq!(retry.requested, vec![2, 3, 4]);
        assert_eq!(nums(&resumed.posts), vec![1, 2, 3]);
        assert!(store.get(&cfg.query()).is_none());
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let cfg = ScrapeConfig {
            retry_backoff_ms: u64::MAX,
            ..config()
        };
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![fail(), fail(), posts(&[1]), Ok(Page::EndOfResults)]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(out.status.is_completed());
        let slept = sleeper.slept.borrow();
        assert_eq!(slept[0], Duration::from_millis(u64::MAX));
        assert_eq!(slept[1], Duration::MAX);
    }

    #[test]
    fn breaker_trips_within_one_page_when_retries_exceed_limit() {
        let cfg = ScrapeConfig {
            max_retries: 10,
            ..config()
        };
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new((0..10).map(|_| fail()).collect());
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(matches!(out.status, ScrapeStatus::CircuitBroken { page: 1, .. }));
        assert_eq!(source.requested.len(), 5);
        assert!(out.posts.is_empty());
    }

    #[test]
    fn resume_with_matching_checkpoint_continues_from_saved_page() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();

        // Interrupted run: page 1 stored, then the breaker trips on page 2.
        let mut first = FakeSource::new(vec![posts(&[1, 2]), fail(), fail(), fail(), fail(), fail()]);
        let cfg_strict = ScrapeConfig {
            max_retries: 5,
            ..cfg.clone()
        };
        let out = ScrapeEngine::new(&cfg_strict, &store, &sleeper).run(&mut first, &ScrapeOptions::default());
        assert!(!out.status.is_completed());

        let mut second = FakeSource::new(vec![posts(&[3]), Ok(Page::EndOfResults)]);
        let resumed = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut second, &ScrapeOptions::default());
        assert_eq!(resumed.resumed_from, Some(2));
        assert_eq!(second.requested, vec![2, 3]);

        let mut uninterrupted = FakeSource::new(vec![posts(&[1, 2]), posts(&[3]), Ok(Page::EndOfResults)]);
        let clean_store = MemoryProgressStore::default();
        let clean = ScrapeEngine::new(&cfg, &clean_store, &sleeper).run(&mut uninterrupted, &ScrapeOptions::default());
        assert_eq!(nums(&resumed.posts), nums(&clean.posts));
        assert!(store.get(&cfg.query()).is_none());
    }

    #[test]
    fn checkpoint_for_different_query_is_ignored() {
        let cfg = ScrapeConfig {
            start_page: 4,
            ..config()
        };
        let store = MemoryProgressStore::default();
        let mut other = cfg.query();
        other.boards = vec!["pol".into()];
        store.insert_raw(&cfg.query(), other, vec![post(77)], 9);
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![posts(&[1]), Ok(Page::EndOfResults)]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert_eq!(out.resumed_from, None);
        assert_eq!(source.requested, vec![4, 5]);
        assert_eq!(nums(&out.posts), vec![1]);
    }

    #[test]
    fn resume_disabled_starts_fresh() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        store.insert_raw(&cfg.query(), cfg.query(), vec![post(77)], 9);
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![Ok(Page::EndOfResults)]);
        let options = ScrapeOptions {
            progress: None,
            resume: false,
        };
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &options);
        assert!(out.posts.is_empty());
        assert_eq!(source.requested, vec![1]);
    }

    struct FailingStore;

    impl ProgressStore for FailingStore {
        fn load(&self, _query: &Query) -> Result<Option<crate::model::ProgressRecord>, PersistError> {
            Ok(None)
        }
        fn save(&self, _query: &Query, _posts: &[RawPost], _next_page: u32) -> Result<(), PersistError> {
            Err(PersistError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
        fn clear(&self, _query: &Query) -> Result<(), PersistError> {
            Ok(())
        }
    }

    #[test]
    fn persistence_failure_is_not_fatal() {
        let cfg = config();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![posts(&[1]), posts(&[2]), Ok(Page::EndOfResults)]);
        let out = ScrapeEngine::new(&cfg, &FailingStore, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(out.status.is_completed());
        assert_eq!(nums(&out.posts), vec![1, 2]);
    }

    #[test]
    fn empty_first_page_returns_no_posts_without_error() {
        let cfg = config();
        let store = MemoryProgressStore::default();
        let sleeper = RecordingSleeper::default();
        let mut source = FakeSource::new(vec![Ok(Page::EndOfResults)]);
        let out = ScrapeEngine::new(&cfg, &store, &sleeper).run(&mut source, &ScrapeOptions::default());
        assert!(out.status.is_completed());
        assert!(out.posts.is_empty());
        assert!(sleeper.slept.borrow().is_empty());
    }
}
