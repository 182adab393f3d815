//! Single-page fetch with bounded retry, per-attempt timeout and cooperative
//! cancellation, plus the page/record parser shared with the page cache.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::model::{CatalogPage, Scope, TrackDescriptor};
use crate::source::CatalogSource;

/// Retry behaviour for one page fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(20),
            backoff: Duration::from_secs(1),
        }
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(cfg: &FetchConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            timeout: cfg.timeout(),
            backoff: cfg.backoff(),
        }
    }
}

pub struct CatalogFetcher {
    source: Arc<dyn CatalogSource>,
    policy: RetryPolicy,
}

impl CatalogFetcher {
    pub fn new(source: Arc<dyn CatalogSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch and parse one page.
    ///
    /// Transient failures (timeout, connection, 5xx) are retried after a
    /// fixed backoff until `max_retries` attempts have been made, then
    /// reported as `Exhausted(last_cause)`. Anything else fails on the spot.
    /// An empty but well-formed page is `Ok`.
    pub async fn fetch_page(
        &self,
        scope: &Scope,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> Result<CatalogPage, FetchError> {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;
            debug!("fetch {} page {} attempt {}/{}", scope, page, attempt, max_attempts);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                res = tokio::time::timeout(
                    self.policy.timeout,
                    self.source.fetch(scope, page, page_size),
                ) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(FetchError::Timeout),
                },
            };

            match outcome.and_then(|raw| parse_page(scope, page, raw)) {
                Ok(parsed) => {
                    if attempt > 1 {
                        info!("{} page {} succeeded on attempt {}", scope, page, attempt);
                    }
                    return Ok(parsed);
                }
                Err(err) if err.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!(
                            "{} page {}: giving up after {} attempts: {}",
                            scope, page, attempt, err
                        );
                        return Err(FetchError::Exhausted(Box::new(err)));
                    }
                    warn!(
                        "{} page {} attempt {}/{} failed: {}; retrying in {:?}",
                        scope, page, attempt, max_attempts, err, self.policy.backoff
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                    }
                }
                Err(err) => {
                    warn!("{} page {}: not retrying: {}", scope, page, err);
                    return Err(err);
                }
            }
        }
    }
}

/// Turn a raw page body into a `CatalogPage`.
///
/// The body must be a JSON array of records or an object holding a `data`
/// array. Records missing a title or stream URL are skipped and logged; they
/// still count toward `raw_records` so one bad record cannot end pagination.
pub fn parse_page(scope: &Scope, number: u32, raw: Value) -> Result<CatalogPage, FetchError> {
    let (tracks, raw_records) = {
        let records = match &raw {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(FetchError::MalformedPayload(
                        "object without a 'data' array".to_string(),
                    ))
                }
            },
            other => {
                return Err(FetchError::MalformedPayload(format!(
                    "expected array or object, got {}",
                    json_kind(other)
                )))
            }
        };

        let tracks: Vec<TrackDescriptor> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, record)| parse_record(scope, number, idx, record))
            .collect();
        (tracks, records.len())
    };

    Ok(CatalogPage {
        scope: scope.clone(),
        number,
        tracks,
        raw_records,
        raw,
    })
}

fn parse_record(scope: &Scope, page: u32, idx: usize, record: &Value) -> Option<TrackDescriptor> {
    let title = non_empty_str(&record["title"]);
    let stream_locator = non_empty_str(&record["stream_url"]);

    let (title, stream_locator) = match (title, stream_locator) {
        (Some(t), Some(s)) => (t, s),
        (None, _) => {
            warn!("{} page {} record {}: skipped, missing title", scope, page, idx);
            return None;
        }
        (_, None) => {
            warn!("{} page {} record {}: skipped, missing stream_url", scope, page, idx);
            return None;
        }
    };

    let id = match &record["id"] {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    Some(TrackDescriptor {
        id,
        title,
        stream_locator,
        duration_ms: seconds_to_ms(&record["duration"]),
        artist: non_empty_str(&record["user"]["username"]),
        source_scope: Some(scope.clone()),
    })
}

fn non_empty_str(v: &Value) -> Option<String> {
    v.as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The API reports duration in seconds, sometimes as a string.
fn seconds_to_ms(v: &Value) -> u64 {
    let secs = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match secs {
        Some(s) if s.is_finite() && s > 0.0 => (s * 1000.0).round() as u64,
        _ => 0,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::search("ambient")
    }

    #[test]
    fn test_parse_array_payload() {
        let raw = json!([
            {"id": 7, "title": "First", "stream_url": "https://s/1", "duration": "125", "user": {"username": "dj"}},
            {"id": "8", "title": "Second", "stream_url": "https://s/2", "duration": 60.5}
        ]);
        let page = parse_page(&scope(), 1, raw).unwrap();
        assert_eq!(page.raw_records, 2);
        assert_eq!(page.tracks.len(), 2);
        assert_eq!(page.tracks[0].id.as_deref(), Some("7"));
        assert_eq!(page.tracks[0].duration_ms, 125_000);
        assert_eq!(page.tracks[0].artist.as_deref(), Some("dj"));
        assert_eq!(page.tracks[1].id.as_deref(), Some("8"));
        assert_eq!(page.tracks[1].duration_ms, 60_500);
        assert_eq!(page.tracks[1].source_scope, Some(scope()));
    }

    #[test]
    fn test_parse_data_object_payload() {
        let raw = json!({"data": [{"title": "Only", "stream_url": "https://s/only"}]});
        let page = parse_page(&scope(), 3, raw).unwrap();
        assert_eq!(page.number, 3);
        assert_eq!(page.tracks.len(), 1);
        assert_eq!(page.tracks[0].id, None);
        assert_eq!(page.tracks[0].duration_ms, 0);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(matches!(
            parse_page(&scope(), 1, json!({"success": false})),
            Err(FetchError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_page(&scope(), 1, json!("nope")),
            Err(FetchError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_bad_records_skipped_but_counted() {
        let raw = json!([
            {"title": "", "stream_url": "https://s/1"},
            {"title": "No stream"},
            {"title": "Good", "stream_url": "https://s/3"}
        ]);
        let page = parse_page(&scope(), 1, raw).unwrap();
        assert_eq!(page.raw_records, 3);
        assert_eq!(page.tracks.len(), 1);
        assert_eq!(page.skipped(), 2);
        assert!(!page.is_empty());
    }

    #[test]
    fn test_only_malformed_records_is_not_empty() {
        let page = parse_page(&scope(), 1, json!([{"id": 1}])).unwrap();
        assert!(page.tracks.is_empty());
        assert!(!page.is_empty());
    }

    #[test]
    fn test_empty_array_is_empty_page() {
        let page = parse_page(&scope(), 4, json!([])).unwrap();
        assert!(page.is_empty());
    }
}
