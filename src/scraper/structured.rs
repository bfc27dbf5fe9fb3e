//! JSON search API adapter (`/_/api/chan/search/`).
//!
//! Envelope shapes accepted, everything else is a parse error:
//! * `{"0": {"posts": [...]}, ...}` (object keyed by result bucket)
//! * `[{"posts": [...]}, ...]` (array; bucket at index 0)
//!
//! A top-level `error` field, a missing bucket, or an empty `posts` array mean end of results.

use crate::model::{Query, RawPost, SourceKind};
use crate::scraper::error::ScraperError;
use crate::scraper::{Page, PageSource, PoliteClient};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

const SEARCH_PATH: &str = "_/api/chan/search/";
const ACCEPT_JSON: &str = "application/json";

/// Page source backed by the archive's JSON search endpoint.
pub struct StructuredSource<'a> {
    client: &'a mut PoliteClient,
    base: Url,
}

impl<'a> StructuredSource<'a> {
    pub fn new(client: &'a mut PoliteClient, base: Url) -> Self {
        Self { client, base }
    }
}

/// Search URL for one page. Parameters with empty values are left out entirely.
pub fn search_url(base: &Url, query: &Query, page: u32) -> Result<Url, ScraperError> {
    let mut url = base.join(SEARCH_PATH).map_err(|e| ScraperError::InvalidUrl {
        input: base.to_string(),
        reason: e.to_string(),
    })?;
    let boards = query.boards_param();
    let page = page.to_string();
    let params = [
        ("boards", boards.as_str()),
        ("username", query.username.as_str()),
        ("tripcode", query.tripcode.as_str()),
        ("page", page.as_str()),
    ];
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in params.iter().filter(|(_, v)| !v.is_empty()) {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// The result bucket. Only `posts` is read; the rest of the bucket is ignored.
#[derive(Debug, Deserialize)]
struct Bucket {
    #[serde(default)]
    posts: Vec<RawPost>,
}

/// Parse a search response body into a page of raw posts or end of results.
pub fn parse_search_response(body: &str, url: &str) -> Result<Page, ScraperError> {
    let parse_err = |reason: String| ScraperError::ParseResponse {
        url: url.to_string(),
        reason,
    };
    let value: Value = serde_json::from_str(body).map_err(|e| parse_err(e.to_string()))?;
    let bucket = match &value {
        Value::Object(map) => {
            if map.contains_key("error") {
                return Ok(Page::EndOfResults);
            }
            map.get("0")
        }
        Value::Array(items) => items.first(),
        other => {
            return Err(parse_err(format!(
                "expected an object or array envelope, got {}",
                json_kind(other)
            )))
        }
    };
    let bucket = match bucket {
        Some(b) if !b.is_null() => b,
        _ => return Ok(Page::EndOfResults),
    };
    let bucket: Bucket =
        serde_json::from_value(bucket.clone()).map_err(|e| parse_err(e.to_string()))?;
    if bucket.posts.is_empty() {
        return Ok(Page::EndOfResults);
    }
    let posts = bucket
        .posts
        .into_iter()
        .map(|mut p| {
            p.source = SourceKind::Structured;
            p
        })
        .collect();
    Ok(Page::Posts(posts))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl PageSource for StructuredSource<'_> {
    fn kind(&self) -> SourceKind {
        SourceKind::Structured
    }

    fn fetch_page(&mut self, query: &Query, page: u32) -> Result<Page, ScraperError> {
        let url = search_url(&self.base, query, page)?;
        let body = self.client.get_text(url.as_str(), ACCEPT_JSON)?;
        parse_search_response(&body, url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::client::tests::scripted_client;

    fn base() -> Url {
        Url::parse("https://archive.example.org/").expect("valid base")
    }

    #[test]
    fn search_url_includes_only_non_empty_params() -> Result<(), ScraperError> {
        let url = search_url(&base(), &Query::new("Bob", "", "x.pol"), 2)?;
        assert_eq!(
            url.as_str(),
            "https://archive.example.org/_/api/chan/search/?boards=x.pol&username=Bob&page=2"
        );
        let url = search_url(&base(), &Query::new("", "!Ep8pui8Vw2", ""), 1)?;
        assert_eq!(
            url.as_str(),
            "https://archive.example.org/_/api/chan/search/?tripcode=%21Ep8pui8Vw2&page=1"
        );
        Ok(())
    }

    #[test]
    fn object_envelope_with_posts() -> Result<(), ScraperError> {
        let body = r#"{"0":{"posts":[{"num":"1","thread_num":"1"},{"num":"2","thread_num":"1"}]},"meta":{"total_found":2}}"#;
        match parse_search_response(body, "u")? {
            Page::Posts(posts) => {
                assert_eq!(posts.len(), 2);
                assert!(posts.iter().all(|p| p.source == SourceKind::Structured));
            }
            Page::EndOfResults => panic!("expected posts"),
        }
        Ok(())
    }

    #[test]
    fn array_envelope_with_posts() -> Result<(), ScraperError> {
        let body = r#"[{"posts":[{"num":5}]}]"#;
        assert!(matches!(parse_search_response(body, "u")?, Page::Posts(p) if p.len() == 1));
        Ok(())
    }

    #[test]
    fn end_of_results_shapes() -> Result<(), ScraperError> {
        for body in [
            r#"{"error":"No results found."}"#,
            r#"{"meta":{}}"#,
            r#"{"0":{"posts":[]}}"#,
            r#"{"0":null}"#,
            r#"[]"#,
        ] {
            assert!(
                matches!(parse_search_response(body, "u")?, Page::EndOfResults),
                "{} should end pagination",
                body
            );
        }
        Ok(())
    }

    #[test]
    fn malformed_body_is_parse_error() {
        assert!(matches!(
            parse_search_response("<html>", "u"),
            Err(ScraperError::ParseResponse { .. })
        ));
        assert!(matches!(
            parse_search_response("42", "u"),
            Err(ScraperError::ParseResponse { .. })
        ));
    }

    #[test]
    fn fetch_page_sends_json_accept_header() -> Result<(), ScraperError> {
        let (mut client, transport, _) = scripted_client();
        transport.push(200, None, r#"{"0":{"posts":[{"num":"9"}]}}"#);
        let mut source = StructuredSource::new(&mut client, base());
        let page = source.fetch_page(&Query::new("Bob", "", "x"), 1)?;
        assert!(matches!(page, Page::Posts(p) if p.len() == 1));
        let requests = transport.requests.borrow();
        assert_eq!(requests[0].1, "application/json");
        assert!(requests[0].0.contains("boards=x&username=Bob&page=1"));
        Ok(())
    }
}
