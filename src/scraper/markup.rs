//! HTML search results adapter. Fallback when the JSON API is unavailable.
//!
//! Selectors and class-name conventions follow the FoolFuuka theme markup:
//! one `article.post` per result, `doc_id_<id>` in its class list, a permalink
//! `/<board>/thread/<thread>/#<post>` in the header. The theme changes from time to time;
//! everything site-specific lives in this file.

use crate::model::{BoardRef, MediaInfo, Query, RawPost, Scalar, SourceKind};
use crate::scraper::error::ScraperError;
use crate::scraper::{Page, PageSource, PoliteClient};
use chrono::DateTime;
use log::debug;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml";

static PERMALINK_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"/thread/(\d+)/#(\d+)"));
static POST_NO_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"No\.\s*(\d+)"));

fn compiled(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex, ScraperError> {
    re.as_ref().map_err(|e| ScraperError::ParseMarkup {
        message: format!("invalid pattern: {}", e),
    })
}

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
fn parse_selector(sel: &str) -> Result<Selector, ScraperError> {
    Selector::parse(sel).map_err(|e| ScraperError::ParseMarkup {
        message: format!("invalid selector {:?}: {}", sel, e),
    })
}

/// Page source backed by the HTML search pages.
pub struct MarkupSource<'a> {
    client: &'a mut PoliteClient,
    base: Url,
}

impl<'a> MarkupSource<'a> {
    pub fn new(client: &'a mut PoliteClient, base: Url) -> Self {
        Self { client, base }
    }
}

/// Search page URL: `/_/search/username/<u>/tripcode/<t>/page/<n>/`.
///
/// With exactly one board the board code replaces `_`. Empty username or tripcode segments are left out.
pub fn search_page_url(base: &Url, query: &Query, page: u32) -> Result<Url, ScraperError> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    let page = page.to_string();
    {
        let mut segments = url.path_segments_mut().map_err(|_| ScraperError::InvalidUrl {
            input: base.to_string(),
            reason: "base URL cannot carry a path".to_string(),
        })?;
        segments.pop_if_empty();
        segments.push(query.single_board().unwrap_or("_"));
        segments.push("search");
        if !query.username.is_empty() {
            segments.extend(["username", query.username.as_str()]);
        }
        if !query.tripcode.is_empty() {
            segments.extend(["tripcode", query.tripcode.as_str()]);
        }
        segments.extend(["page", page.as_str(), ""]);
    }
    Ok(url)
}

struct Selectors {
    container: Selector,
    link: Selector,
    header: Selector,
    time: Selector,
    author: Selector,
    tripcode: Selector,
    title: Selector,
    poster_hash: Selector,
    country: Selector,
    text: Selector,
    file_name: Selector,
    image_link: Selector,
    thumb: Selector,
}

impl Selectors {
    fn new() -> Result<Self, ScraperError> {
        Ok(Self {
            container: parse_selector("article.post")?,
            link: parse_selector("a[href]")?,
            header: parse_selector(".post_data")?,
            time: parse_selector("time")?,
            author: parse_selector(".post_author")?,
            tripcode: parse_selector(".post_tripcode")?,
            title: parse_selector(".post_title")?,
            poster_hash: parse_selector(".poster_hash")?,
            country: parse_selector(".poster_country, .flag")?,
            text: parse_selector(".text")?,
            file_name: parse_selector(".post_file_filename")?,
            image_link: parse_selector("a.thread_image_link")?,
            thumb: parse_selector("img.post_image")?,
        })
    }
}

fn first_text(el: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_attr(el: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    el.select(sel)
        .next()
        .and_then(|e| e.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `doc_id_<id>` from the container's class list.
fn doc_id(el: &ElementRef<'_>) -> Option<String> {
    el.value()
        .classes()
        .find_map(|c| c.strip_prefix("doc_id_"))
        .filter(|id| !id.is_empty())
        .map(String::from)
}

/// Board code of a permalink: the first path segment below the archive root.
fn board_from_href(base: &Url, href: &str) -> Option<String> {
    let resolved = base.join(href).ok()?;
    let prefix: Vec<&str> = base
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let segments: Vec<&str> = resolved.path_segments()?.filter(|s| !s.is_empty()).collect();
    let rest = segments.strip_prefix(prefix.as_slice()).unwrap_or(&segments);
    rest.first()
        .filter(|b| **b != "_")
        .map(|b| b.to_string())
}

/// True when the element sits inside the comment body, where quotes and backlinks live.
fn in_comment_body(link: &ElementRef<'_>) -> bool {
    link.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().classes().any(|c| c == "text"))
}

/// Thread number, post number, and board from the permalink.
/// Links in the comment body are ignored. Falls back to `No.<n>` in the header text
/// when no other link has the permalink shape.
fn post_location(
    el: &ElementRef<'_>,
    sel: &Selectors,
    base: &Url,
) -> Result<(Option<String>, Option<String>, Option<String>), ScraperError> {
    let permalink = compiled(&PERMALINK_RE)?;
    for link in el.select(&sel.link) {
        if in_comment_body(&link) {
            continue;
        }
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if let Some(caps) = permalink.captures(href) {
            let board = board_from_href(base, href);
            return Ok((
                caps.get(1).map(|m| m.as_str().to_string()),
                caps.get(2).map(|m| m.as_str().to_string()),
                board,
            ));
        }
    }
    let header_text = el
        .select(&sel.header)
        .next()
        .map(|h| h.text().collect::<String>())
        .unwrap_or_else(|| el.text().collect::<String>());
    let num = compiled(&POST_NO_RE)?
        .captures(&header_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    Ok((None, num, None))
}

fn parse_container(el: &ElementRef<'_>, sel: &Selectors, base: &Url) -> Result<RawPost, ScraperError> {
    let (thread_num, num, board) = post_location(el, sel, base)?;
    let board = board.or_else(|| el.value().attr("data-board").map(String::from));

    let time = el.select(&sel.time).next();
    let timestamp = time
        .and_then(|t| t.value().attr("datetime"))
        .and_then(|dt| DateTime::parse_from_rfc3339(dt.trim()).ok())
        .map(|dt| Scalar::Int(dt.timestamp()));
    let fourchan_date = time
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| time.and_then(|t| t.value().attr("title")).map(String::from));

    let (comment_sanitized, comment) = match el.select(&sel.text).next() {
        Some(text) => (
            Some(text.text().collect::<String>().trim().to_string()),
            Some(text.inner_html().trim().to_string()),
        ),
        None => (None, None),
    };

    let file_name = first_attr(el, &sel.file_name, "title").or_else(|| first_text(el, &sel.file_name));
    let media_link = first_attr(el, &sel.image_link, "href");
    let thumb_link = first_attr(el, &sel.thumb, "src").or_else(|| first_attr(el, &sel.thumb, "data-src"));
    let media = if file_name.is_some() || media_link.is_some() || thumb_link.is_some() {
        Some(MediaInfo {
            media_filename: file_name,
            media_link,
            thumb_link,
            ..MediaInfo::default()
        })
    } else {
        None
    };

    let op = match (&num, &thread_num) {
        (Some(n), Some(t)) if n == t => Some(Scalar::Int(1)),
        (Some(_), Some(_)) => Some(Scalar::Int(0)),
        _ => None,
    };

    Ok(RawPost {
        source: SourceKind::Markup,
        doc_id: doc_id(el).map(Scalar::Text),
        num: num.map(Scalar::Text),
        thread_num: thread_num.map(Scalar::Text),
        op,
        board: board.map(BoardRef::Flat),
        timestamp,
        fourchan_date,
        name: first_text(el, &sel.author),
        trip: first_text(el, &sel.tripcode),
        poster_hash: first_text(el, &sel.poster_hash)
            .map(|h| h.trim_start_matches("ID:").trim().to_string())
            .filter(|h| !h.is_empty()),
        poster_country: first_attr(el, &sel.country, "title"),
        title: first_text(el, &sel.title),
        comment_sanitized,
        comment,
        media,
        ..RawPost::default()
    })
}

/// Parse one search results document. No post containers means end of results.
///
/// `base` resolves relative permalinks when reading the board code.
pub fn parse_search_page(html: &str, base: &Url) -> Result<Page, ScraperError> {
    let sel = Selectors::new()?;
    let doc = Html::parse_document(html);
    let posts = doc
        .select(&sel.container)
        .map(|el| parse_container(&el, &sel, base))
        .collect::<Result<Vec<_>, _>>()?;
    if posts.is_empty() {
        return Ok(Page::EndOfResults);
    }
    Ok(Page::Posts(posts))
}

fn board_of(post: &RawPost) -> Option<&str> {
    match post.board.as_ref()? {
        BoardRef::Flat(code) => Some(code.as_str()),
        BoardRef::Nested(info) => info.shortname.as_deref(),
    }
}

impl PageSource for MarkupSource<'_> {
    fn kind(&self) -> SourceKind {
        SourceKind::Markup
    }

    fn fetch_page(&mut self, query: &Query, page: u32) -> Result<Page, ScraperError> {
        let url = search_page_url(&self.base, query, page)?;
        let html = self.client.get_text(url.as_str(), ACCEPT_HTML)?;
        let page = parse_search_page(&html, &self.base)?;
        // The multi-board path searches every board; keep only the requested ones.
        match page {
            Page::Posts(mut posts) if query.boards.len() > 1 => {
                let before = posts.len();
                posts.retain(|p| board_of(p).map_or(true, |b| query.boards.iter().any(|q| q == b)));
                if posts.len() != before {
                    debug!("Dropped {} post(s) outside {}", before - posts.len(), query.boards_param());
                }
                Ok(Page::Posts(posts))
            }
            other => Ok(other),
        }
    }
}
