//! Raw records -> canonical posts, and canonical posts -> threads.

use crate::model::{BoardRef, Post, RawPost, Scalar, Thread};
use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use scraper::Html;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Bucket for posts without a thread id.
pub const UNKNOWN_THREAD: &str = "unknown";

static WHITESPACE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\s+"));

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn collapse_whitespace(s: &str) -> String {
    match WHITESPACE_RE.as_ref() {
        Ok(re) => re.replace_all(s, " ").trim().to_string(),
        Err(_) => s.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Plain text of a comment: markup reduced to its text content, whitespace collapsed.
pub fn plain_text(comment: &str) -> String {
    if comment.contains('<') || comment.contains('&') {
        let fragment = Html::parse_fragment(comment);
        let text: String = fragment.root_element().text().collect();
        collapse_whitespace(&text)
    } else {
        collapse_whitespace(comment)
    }
}

/// Epoch seconds and the matching ISO-8601 UTC string, or neither.
fn timestamp_pair(raw: Option<&Scalar>) -> (Option<i64>, Option<String>) {
    let Some(ts) = raw.and_then(Scalar::as_epoch) else {
        return (None, None);
    };
    match DateTime::from_timestamp(ts, 0) {
        Some(dt) => (Some(ts), Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true))),
        None => (None, None),
    }
}

fn board_code(board: Option<&BoardRef>) -> Option<String> {
    match board? {
        BoardRef::Nested(info) => non_empty(info.shortname.as_ref()),
        BoardRef::Flat(code) => non_empty(Some(code)),
    }
}

/// Map one raw record to the canonical schema. Missing fields become `None`; never fails.
pub fn normalize_post(raw: &RawPost) -> Post {
    let (timestamp, date_iso) = timestamp_pair(raw.timestamp.as_ref());
    let text = raw
        .comment_sanitized
        .as_deref()
        .or(raw.comment.as_deref())
        .map(plain_text);
    let media = raw.media.as_ref();
    Post {
        post_id: raw.num.as_ref().and_then(Scalar::as_id),
        thread_id: raw.thread_num.as_ref().and_then(Scalar::as_id),
        board: board_code(raw.board.as_ref()),
        is_op: raw.op.as_ref().is_some_and(Scalar::is_one),
        timestamp,
        date_iso,
        name: non_empty(raw.name.as_ref()),
        tripcode: non_empty(raw.trip.as_ref()),
        poster_id: non_empty(raw.poster_hash.as_ref()),
        country: non_empty(raw.poster_country.as_ref()),
        subject: non_empty(raw.title.as_ref()),
        text,
        text_html: raw.comment_processed.clone().or_else(|| raw.comment.clone()),
        has_media: media.is_some() || raw.media_link.is_some(),
        media_filename: media.and_then(|m| non_empty(m.media_filename.as_ref())),
        media_url: media
            .and_then(|m| non_empty(m.media_link.as_ref()).or_else(|| non_empty(m.remote_media_link.as_ref())))
            .or_else(|| non_empty(raw.media_link.as_ref())),
        thumb_url: media.and_then(|m| non_empty(m.thumb_link.as_ref())),
        deleted: raw
            .deleted
            .as_ref()
            .is_some_and(|d| d.is_one() || matches!(d, Scalar::Bool(true))),
    }
}

/// Normalize every raw record, preserving order and duplicates.
pub fn normalize(raw: &[RawPost]) -> Vec<Post> {
    raw.iter().map(normalize_post).collect()
}

/// Keep the first post for each `post_id`. Posts without an id are always kept.
pub fn dedupe_by_post_id(posts: Vec<Post>) -> Vec<Post> {
    let mut seen = HashSet::new();
    posts
        .into_iter()
        .filter(|p| match &p.post_id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .collect()
}

/// Group posts by thread, oldest first within each thread (missing timestamps sort as 0).
///
/// Threads come out in first-seen order; callers should not rely on it.
pub fn group_by_thread(posts: &[Post]) -> Vec<Thread> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut threads: Vec<Thread> = Vec::new();
    for post in posts {
        let key = post.thread_id.as_deref().unwrap_or(UNKNOWN_THREAD);
        let slot = *index.entry(key).or_insert_with(|| {
            threads.push(Thread {
                thread_id: key.to_string(),
                board: post.board.clone(),
                posts: Vec::new(),
            });
            threads.len() - 1
        });
        threads[slot].posts.push(post.clone());
    }
    for thread in &mut threads {
        thread.posts.sort_by_key(|p| p.timestamp.unwrap_or(0));
    }
    threads
}
