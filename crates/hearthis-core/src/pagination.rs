//! Per-scope pagination runs and the merged catalog they build.
//!
//! All catalog state sits behind one `RwLock`. Resets, merges and state
//! transitions happen under the write lock, and every event is sent while
//! that lock is held, so the event order always matches the order in which
//! readers can observe the changes. Each run carries a generation number;
//! a page whose run has been superseded or cancelled is dropped at merge
//! time instead of landing in the fresh catalog.

use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::PageCache;
use crate::config::Config;
use crate::error::FetchError;
use crate::fetcher::CatalogFetcher;
use crate::model::{CatalogPage, Scope, TrackDescriptor, TrackKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeState {
    /// More pages may be requested with `load_next_page`.
    Idle,
    Loading,
    Exhausted,
    /// Terminal until the scope is loaded again. Tracks merged before the
    /// failure stay in the catalog.
    Failed(FetchError),
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeState::Idle => write!(f, "idle"),
            ScopeState::Loading => write!(f, "loading"),
            ScopeState::Exhausted => write!(f, "exhausted"),
            ScopeState::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Notifications for the single consumer of catalog changes.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    /// The scope's catalog was cleared for a fresh run.
    ScopeReset { scope: Scope },
    PageMerged {
        scope: Scope,
        page: u32,
        /// Tracks that survived dedup.
        added: usize,
        total: usize,
    },
    ScopeExhausted { scope: Scope },
    ScopeFailed { scope: Scope, error: FetchError },
}

/// Why `load_next_page` refused to start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadRejected {
    #[error("{0} has not been loaded")]
    Unknown(Scope),
    #[error("{0} is already loading")]
    Loading(Scope),
    #[error("{0} has no more pages")]
    Exhausted(Scope),
    #[error("{0} failed; load it again to retry")]
    Failed(Scope),
}

#[derive(Debug, Clone)]
pub struct PaginationSettings {
    /// `count` sent with every page request.
    pub page_size: u32,
    /// Concurrent page fetches in a bulk run.
    pub workers: usize,
    /// Pages per `load_scope` run; `None` runs until the scope is exhausted.
    pub page_budget: Option<u32>,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            workers: 5,
            page_budget: None,
        }
    }
}

impl From<&Config> for PaginationSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            page_size: cfg.api.page_size,
            workers: cfg.fetch.workers,
            page_budget: cfg.fetch.page_budget(),
        }
    }
}

#[derive(Default)]
struct ScopeEntries {
    tracks: Vec<TrackDescriptor>,
    seen: HashSet<TrackKey>,
}

struct ScopeRun {
    generation: u64,
    state: ScopeState,
    next_page: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct CatalogState {
    entries: HashMap<Scope, ScopeEntries>,
    runs: HashMap<Scope, ScopeRun>,
    next_generation: u64,
}

impl CatalogState {
    fn is_current(&self, scope: &Scope, generation: u64) -> bool {
        self.runs
            .get(scope)
            .map(|r| r.generation == generation && !r.cancel.is_cancelled())
            .unwrap_or(false)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

enum Step {
    Continue,
    Stop,
}

struct Inner {
    fetcher: CatalogFetcher,
    cache: Option<PageCache>,
    settings: PaginationSettings,
    state: RwLock<CatalogState>,
    events: mpsc::UnboundedSender<CatalogEvent>,
}

/// Cheap to clone; clones share the same catalog.
#[derive(Clone)]
pub struct PaginationController {
    inner: Arc<Inner>,
}

impl PaginationController {
    pub fn new(
        fetcher: CatalogFetcher,
        cache: Option<PageCache>,
        settings: PaginationSettings,
    ) -> (Self, mpsc::UnboundedReceiver<CatalogEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            fetcher,
            cache,
            settings,
            state: RwLock::new(CatalogState::default()),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Clear the scope and start paginating it from page 1.
    ///
    /// Any run already in flight for the scope is cancelled in the same
    /// critical section that clears the catalog. The returned handle
    /// completes when the new run stops.
    pub async fn load_scope(&self, scope: Scope) -> JoinHandle<()> {
        let (generation, cancel) = {
            let mut st = self.inner.state.write().await;
            if let Some(old) = st.runs.get(&scope) {
                if old.state == ScopeState::Loading {
                    debug!("cancelling in-flight run for {}", scope);
                }
                old.cancel.cancel();
            }
            let generation = st.bump_generation();
            let cancel = CancellationToken::new();
            st.entries.insert(scope.clone(), ScopeEntries::default());
            st.runs.insert(
                scope.clone(),
                ScopeRun {
                    generation,
                    state: ScopeState::Loading,
                    next_page: 1,
                    cancel: cancel.clone(),
                },
            );
            self.inner.emit(CatalogEvent::ScopeReset {
                scope: scope.clone(),
            });
            (generation, cancel)
        };

        info!("loading {}", scope);
        let inner = Arc::clone(&self.inner);
        let budget = inner.settings.page_budget;
        tokio::spawn(async move { inner.run(scope, generation, 1, budget, cancel).await })
    }

    /// Fetch exactly one more page without clearing what is already there.
    /// Only allowed while the scope is `Idle`.
    pub async fn load_next_page(&self, scope: &Scope) -> Result<JoinHandle<()>, LoadRejected> {
        let (generation, page, cancel) = {
            let mut st = self.inner.state.write().await;
            let run = st
                .runs
                .get_mut(scope)
                .ok_or_else(|| LoadRejected::Unknown(scope.clone()))?;
            match run.state {
                ScopeState::Idle => {}
                ScopeState::Loading => return Err(LoadRejected::Loading(scope.clone())),
                ScopeState::Exhausted => return Err(LoadRejected::Exhausted(scope.clone())),
                ScopeState::Failed(_) => return Err(LoadRejected::Failed(scope.clone())),
            }
            run.state = ScopeState::Loading;
            (run.generation, run.next_page, run.cancel.clone())
        };

        debug!("loading {} page {}", scope, page);
        let inner = Arc::clone(&self.inner);
        let scope = scope.clone();
        Ok(tokio::spawn(async move {
            inner.run(scope, generation, page, Some(1), cancel).await
        }))
    }

    /// Abort the scope's in-flight run. Pages already merged stay; pages
    /// still in flight are discarded. The scope returns to `Idle`.
    pub async fn cancel(&self, scope: &Scope) {
        let mut st = self.inner.state.write().await;
        let generation = st.bump_generation();
        if let Some(run) = st.runs.get_mut(scope) {
            run.cancel.cancel();
            run.cancel = CancellationToken::new();
            run.generation = generation;
            if run.state == ScopeState::Loading {
                run.state = ScopeState::Idle;
                info!("cancelled run for {}", scope);
            }
        }
    }

    /// Snapshot of the merged tracks, in page order.
    pub async fn tracks(&self, scope: &Scope) -> Vec<TrackDescriptor> {
        let st = self.inner.state.read().await;
        st.entries
            .get(scope)
            .map(|e| e.tracks.clone())
            .unwrap_or_default()
    }

    pub async fn state(&self, scope: &Scope) -> Option<ScopeState> {
        let st = self.inner.state.read().await;
        st.runs.get(scope).map(|r| r.state.clone())
    }

    /// Page the next `load_next_page` would fetch.
    pub async fn next_page(&self, scope: &Scope) -> Option<u32> {
        let st = self.inner.state.read().await;
        st.runs.get(scope).map(|r| r.next_page)
    }
}

impl Inner {
    fn emit(&self, event: CatalogEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.events.send(event);
    }

    async fn run(
        &self,
        scope: Scope,
        generation: u64,
        first_page: u32,
        budget: Option<u32>,
        cancel: CancellationToken,
    ) {
        let last_page = match budget {
            Some(n) => first_page.saturating_add(n.max(1) - 1),
            None => u32::MAX,
        };
        let workers = self.settings.workers.max(1);

        // Fetches run up to `workers` at a time; `buffered` yields them in
        // page order, which is the order they are merged in.
        let scope_ref = &scope;
        let cancel_ref = &cancel;
        let mut pages = stream::iter(first_page..=last_page)
            .map(move |number| async move {
                (number, self.fetch_or_cache(scope_ref, number, cancel_ref).await)
            })
            .buffered(workers);

        while let Some((number, result)) = pages.next().await {
            match result {
                Ok(page) => {
                    if let Step::Stop = self.merge(generation, page).await {
                        return;
                    }
                }
                Err(FetchError::Cancelled) => {
                    debug!("{} page {}: run cancelled", scope, number);
                    return;
                }
                Err(err) => {
                    self.fail(&scope, generation, number, err).await;
                    return;
                }
            }
        }

        let mut st = self.state.write().await;
        if st.is_current(&scope, generation) {
            if let Some(run) = st.runs.get_mut(&scope) {
                if run.state == ScopeState::Loading {
                    run.state = ScopeState::Idle;
                    debug!("{} idle, next page {}", scope, run.next_page);
                }
            }
        }
    }

    async fn fetch_or_cache(
        &self,
        scope: &Scope,
        number: u32,
        cancel: &CancellationToken,
    ) -> Result<CatalogPage, FetchError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(scope, number) {
                return Ok(hit);
            }
        }

        let page = self
            .fetcher
            .fetch_page(scope, number, self.settings.page_size, cancel)
            .await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&page) {
                warn!("{} page {}: cache write skipped: {}", scope, number, e);
            }
        }
        Ok(page)
    }

    async fn merge(&self, generation: u64, page: CatalogPage) -> Step {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        let scope = page.scope.clone();

        if !st.is_current(&scope, generation) {
            debug!("{} page {}: discarded, run superseded", scope, page.number);
            return Step::Stop;
        }

        let entries = st.entries.entry(scope.clone()).or_default();
        let valid = page.tracks.len();
        let skipped = page.skipped();
        let mut added = 0;
        for track in page.tracks {
            if entries.seen.insert(track.key()) {
                entries.tracks.push(track);
                added += 1;
            }
        }
        let total = entries.tracks.len();

        let Some(run) = st.runs.get_mut(&scope) else {
            return Step::Stop;
        };
        run.next_page = page.number.saturating_add(1);

        // Nothing new: either the source ran dry or it is repeating itself.
        let exhausted = page.raw_records == 0 || (valid > 0 && added == 0);
        if exhausted {
            run.state = ScopeState::Exhausted;
            info!("{} exhausted at page {} ({} tracks)", scope, page.number, total);
            self.emit(CatalogEvent::ScopeExhausted { scope });
            return Step::Stop;
        }

        if skipped > 0 {
            warn!("{} page {}: {} records skipped", scope, page.number, skipped);
        }
        debug!("{} page {}: +{} ({} total)", scope, page.number, added, total);
        self.emit(CatalogEvent::PageMerged {
            scope,
            page: page.number,
            added,
            total,
        });
        Step::Continue
    }

    async fn fail(&self, scope: &Scope, generation: u64, number: u32, error: FetchError) {
        let mut st = self.state.write().await;
        if !st.is_current(scope, generation) {
            return;
        }
        if let Some(run) = st.runs.get_mut(scope) {
            warn!("{} failed at page {}: {}", scope, number, error);
            run.state = ScopeState::Failed(error.clone());
            self.emit(CatalogEvent::ScopeFailed {
                scope: scope.clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::RetryPolicy;
    use crate::source::CatalogSource;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Serves `pages` full pages of two tracks each, then empty pages.
    struct Numbered {
        pages: u32,
    }

    #[async_trait]
    impl CatalogSource for Numbered {
        async fn fetch(&self, _scope: &Scope, page: u32, _count: u32) -> Result<Value, FetchError> {
            if page > self.pages {
                return Ok(json!([]));
            }
            Ok(json!([
                {"id": page * 10, "title": format!("t{}a", page), "stream_url": "u"},
                {"id": page * 10 + 1, "title": format!("t{}b", page), "stream_url": "u"}
            ]))
        }
    }

    fn controller(pages: u32, budget: Option<u32>) -> (PaginationController, mpsc::UnboundedReceiver<CatalogEvent>) {
        let policy = RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_secs(1),
            backoff: Duration::ZERO,
        };
        let fetcher = CatalogFetcher::new(Arc::new(Numbered { pages }), policy);
        PaginationController::new(
            fetcher,
            None,
            PaginationSettings {
                page_size: 2,
                workers: 2,
                page_budget: budget,
            },
        )
    }

    #[tokio::test]
    async fn test_budgeted_run_returns_to_idle() {
        let (ctl, mut rx) = controller(5, Some(2));
        let scope = Scope::genre("techno");
        ctl.load_scope(scope.clone()).await.await.unwrap();

        assert_eq!(ctl.state(&scope).await, Some(ScopeState::Idle));
        assert_eq!(ctl.next_page(&scope).await, Some(3));
        assert_eq!(ctl.tracks(&scope).await.len(), 4);

        assert_eq!(rx.recv().await, Some(CatalogEvent::ScopeReset { scope: scope.clone() }));
        assert!(matches!(rx.recv().await, Some(CatalogEvent::PageMerged { page: 1, .. })));
        assert!(matches!(rx.recv().await, Some(CatalogEvent::PageMerged { page: 2, total: 4, .. })));

        ctl.load_next_page(&scope).await.unwrap().await.unwrap();
        assert_eq!(ctl.tracks(&scope).await.len(), 6);
        assert_eq!(ctl.next_page(&scope).await, Some(4));
    }

    #[tokio::test]
    async fn test_unbounded_run_reaches_exhausted() {
        let (ctl, _rx) = controller(3, None);
        let scope = Scope::search("x");
        ctl.load_scope(scope.clone()).await.await.unwrap();
        assert_eq!(ctl.state(&scope).await, Some(ScopeState::Exhausted));
        let titles: Vec<_> = ctl.tracks(&scope).await.into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["t1a", "t1b", "t2a", "t2b", "t3a", "t3b"]);
    }

    #[tokio::test]
    async fn test_next_page_on_unknown_scope_rejected() {
        let (ctl, _rx) = controller(1, None);
        let scope = Scope::genre("none");
        assert_eq!(
            ctl.load_next_page(&scope).await.unwrap_err(),
            LoadRejected::Unknown(scope)
        );
    }
}
