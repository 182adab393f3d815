#![allow(dead_code)]

use async_trait::async_trait;
use hearthis_core::{
    CatalogFetcher, CatalogSource, FetchError, PageCache, PaginationController,
    PaginationSettings, PlaybackError, Player, RetryPolicy, Scope,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Page(Value),
    Delayed(Duration, Value),
    Fail(FetchError),
    /// Never answers; only a timeout or cancellation gets the caller out.
    Hang,
}

/// In-memory catalog source. Each page has a script of replies consumed in
/// order; the last reply repeats. Unscripted pages are empty.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<HashMap<u32, VecDeque<Reply>>>,
    calls: Mutex<Vec<(Scope, u32)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a fetch as in flight until dropped, so cancelled calls count too.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, number: u32, replies: Vec<Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(number, replies.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<(Scope, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most fetches that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for ScriptedSource {
    async fn fetch(&self, scope: &Scope, page: u32, _count: u32) -> Result<Value, FetchError> {
        self.calls.lock().unwrap().push((scope.clone(), page));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        let reply = {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&page) {
                Some(q) if q.len() > 1 => q.pop_front().unwrap(),
                Some(q) => q.front().cloned().unwrap_or(Reply::Page(json!([]))),
                None => Reply::Page(json!([])),
            }
        };
        match reply {
            Reply::Page(v) => Ok(v),
            Reply::Delayed(d, v) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Reply::Fail(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Page body with one record per id, titled `<prefix><id>`.
pub fn records(prefix: &str, ids: &[u32]) -> Value {
    Value::Array(
        ids.iter()
            .map(|id| {
                json!({
                    "id": id,
                    "title": format!("{}{}", prefix, id),
                    "stream_url": format!("https://stream/{}", id),
                    "duration": 90
                })
            })
            .collect(),
    )
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        timeout: Duration::from_millis(50),
        backoff: Duration::ZERO,
    }
}

pub fn controller(
    source: Arc<ScriptedSource>,
    cache: Option<PageCache>,
    workers: usize,
) -> (
    PaginationController,
    tokio::sync::mpsc::UnboundedReceiver<hearthis_core::CatalogEvent>,
) {
    let fetcher = CatalogFetcher::new(source, fast_policy());
    PaginationController::new(
        fetcher,
        cache,
        PaginationSettings {
            page_size: 20,
            workers,
            page_budget: None,
        },
    )
}

/// Player that writes every call to a shared log.
#[derive(Clone, Default)]
pub struct RecordingPlayer {
    pub log: Arc<Mutex<Vec<String>>>,
    pub fail_load: Arc<Mutex<bool>>,
}

impl RecordingPlayer {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("load ").map(String::from))
            .collect()
    }

    pub fn fail_loads(&self, fail: bool) {
        *self.fail_load.lock().unwrap() = fail;
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn load(&mut self, stream_locator: &str) -> Result<(), PlaybackError> {
        if *self.fail_load.lock().unwrap() {
            return Err(PlaybackError::LoadFailed(stream_locator.to_string()));
        }
        self.record(format!("load {}", stream_locator));
        Ok(())
    }

    async fn play(&mut self) -> Result<(), PlaybackError> {
        self.record("play".into());
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PlaybackError> {
        self.record("pause".into());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.record("stop".into());
        Ok(())
    }

    async fn set_volume(&mut self, volume: u8) -> Result<(), PlaybackError> {
        self.record(format!("volume {}", volume));
        Ok(())
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), PlaybackError> {
        self.record(format!("mute {}", muted));
        Ok(())
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        self.record(format!("seek {}", position_ms));
        Ok(())
    }
}
