/// DaemonCore: single-owner event loop.
///
/// Commands from stdin, catalog events from the pagination controller and
/// mpv events all arrive as `CoreEvent`s on one channel. DaemonCore owns the
/// playback queue (and through it the mpv player) exclusively, so a scope
/// load and the matching queue reset happen in the same turn of the loop.
/// Everything the daemon reports goes to stdout as one JSON `Notice` per line.
use std::path::Path;
use std::sync::Arc;

use hearthis_core::pagination::PaginationSettings;
use hearthis_core::playlist;
use hearthis_core::protocol::{Command, ListedTrack, Notice, QueueSource};
use hearthis_core::state::{PersistentState, StateStore};
use hearthis_core::{
    CatalogEvent, CatalogFetcher, Config, Direction, HearThisSource, PageCache,
    PaginationController, PlaybackError, PlaybackQueue, QueueEvent, RetryPolicy, Scope,
    SelectedSet, TransportState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::mpv::{MpvEvent, MpvPlayer, PlayerSignal};

#[derive(Debug)]
pub enum CoreEvent {
    Input(Command),
    Catalog(CatalogEvent),
    Mpv(MpvEvent),
    /// Result of a background lookup (genres, artist info) or a parse error.
    Reply(Notice),
    HeartbeatTick,
    Shutdown,
}

pub struct DaemonCore {
    controller: PaginationController,
    source: Arc<HearThisSource>,
    queue: PlaybackQueue<MpvPlayer>,
    queue_rx: mpsc::UnboundedReceiver<QueueEvent>,
    selected: SelectedSet,
    queue_source: QueueSource,
    active_scope: Option<Scope>,
    state: StateStore,
    event_tx: mpsc::Sender<CoreEvent>,
    out: tokio::io::Stdout,
}

impl DaemonCore {
    pub fn new(config: &Config, event_tx: mpsc::Sender<CoreEvent>) -> anyhow::Result<Self> {
        let source = Arc::new(HearThisSource::new(&config.api)?);
        let fetcher = CatalogFetcher::new(source.clone(), RetryPolicy::from(&config.fetch));

        let cache = if config.cache.enabled {
            let opened = match &config.cache.dir {
                Some(dir) => PageCache::persistent(dir.clone()),
                None => PageCache::session(),
            };
            match opened {
                Ok(c) => {
                    info!("page cache at {}", c.dir().display());
                    Some(c)
                }
                Err(e) => {
                    warn!("page cache disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (controller, catalog_rx) =
            PaginationController::new(fetcher, cache, PaginationSettings::from(config));
        forward(catalog_rx, event_tx.clone(), CoreEvent::Catalog);

        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(256);
        forward_bounded(mpv_rx, event_tx.clone(), CoreEvent::Mpv);
        let (queue, queue_rx) = PlaybackQueue::new(MpvPlayer::new(mpv_tx));

        let fallback = PersistentState {
            volume: config.playback.default_volume.min(100),
            repeat: config.playback.repeat,
            ..PersistentState::default()
        };
        let state = StateStore::open(config.daemon.state_file.clone(), fallback);

        Ok(Self {
            controller,
            source,
            queue,
            queue_rx,
            selected: SelectedSet::new(),
            queue_source: QueueSource::Catalog,
            active_scope: None,
            state,
            event_tx,
            out: tokio::io::stdout(),
        })
    }

    /// Apply the saved session and reload the last scope.
    async fn restore(&mut self) {
        let saved = self.state.get().clone();
        if let Err(e) = self.queue.set_volume(saved.volume).await {
            warn!("restore volume: {}", e);
        }
        if let Err(e) = self.queue.set_muted(saved.muted).await {
            warn!("restore mute: {}", e);
        }
        self.queue.set_repeat(saved.repeat);
        self.queue.set_shuffle(saved.shuffle);
        if let Some(scope) = saved.last_scope {
            info!("restoring {}", scope);
            self.load_scope(scope).await;
        }
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.restore().await;
        self.emit_state().await;

        spawn_stdin_reader(self.event_tx.clone());

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                if heartbeat_tx.send(CoreEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(evt) = event_rx.recv().await {
            match evt {
                CoreEvent::Shutdown => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                CoreEvent::Input(Command::Quit) => {
                    info!("DaemonCore: quit");
                    break;
                }
                CoreEvent::Input(cmd) => {
                    debug!("DaemonCore: command {:?}", cmd);
                    if let Err(e) = self.handle_command(cmd).await {
                        error!("DaemonCore: command error: {}", e);
                        self.emit(&Notice::Error {
                            message: e.to_string(),
                        })
                        .await;
                    }
                }
                CoreEvent::Catalog(evt) => self.handle_catalog_event(evt).await,
                CoreEvent::Mpv(evt) => self.handle_mpv_event(evt).await,
                CoreEvent::Reply(notice) => self.emit(&notice).await,
                CoreEvent::HeartbeatTick => {
                    if !self.queue.player_mut().check_alive()
                        && self.queue.state() != TransportState::Stopped
                    {
                        let _ = self.queue.stop().await;
                    }
                    if self.queue.state() == TransportState::Playing {
                        self.emit_state().await;
                    }
                }
            }
            self.drain_queue_events().await;
        }

        self.queue.player_mut().shutdown().await;
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Artist {
                username,
                track_type,
            } => self.load_scope(Scope::artist(username, track_type)).await,
            Command::Genre { id } => self.load_scope(Scope::genre(id)).await,
            Command::Search { text } => self.load_scope(Scope::search(text)).await,
            Command::More => {
                let Some(scope) = self.active_scope.clone() else {
                    anyhow::bail!("nothing loaded yet");
                };
                drop(self.controller.load_next_page(&scope).await?);
            }
            Command::Genres => {
                let source = Arc::clone(&self.source);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let notice = match source.fetch_genres().await {
                        Ok(ids) => Notice::Genres { ids },
                        Err(e) => Notice::Error {
                            message: format!("genres: {}", e),
                        },
                    };
                    let _ = tx.send(CoreEvent::Reply(notice)).await;
                });
            }
            Command::Info { username } => {
                let source = Arc::clone(&self.source);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let notice = match source.fetch_artist_info(&username).await {
                        Ok(info) => Notice::Artist { info },
                        Err(e) => Notice::Error {
                            message: format!("artist {}: {}", username, e),
                        },
                    };
                    let _ = tx.send(CoreEvent::Reply(notice)).await;
                });
            }
            Command::List => self.emit_list().await,
            Command::Play { index } => {
                let res = self.queue.select(index).await;
                self.after_transport(res).await;
            }
            Command::Toggle => {
                let res = self.queue.toggle_play_pause().await;
                self.after_transport(res).await;
            }
            Command::Stop => {
                let res = self.queue.stop().await;
                self.after_transport(res).await;
            }
            Command::Next => {
                let res = self.queue.advance(Direction::Next).await;
                self.after_transport(res).await;
            }
            Command::Prev => {
                let res = self.queue.advance(Direction::Previous).await;
                self.after_transport(res).await;
            }
            Command::Repeat => {
                let repeat = self.queue.cycle_repeat();
                self.state.update(|s| s.repeat = repeat).await?;
                self.emit_state().await;
            }
            Command::Shuffle => {
                let shuffle = self.queue.toggle_shuffle();
                self.state.update(|s| s.shuffle = shuffle).await?;
                self.emit_state().await;
            }
            Command::Filter { text } => {
                self.queue.set_search(text.as_deref().unwrap_or(""));
                self.emit_list().await;
            }
            Command::Add { index } => {
                let Some(track) = self.queue.track_at(index).cloned() else {
                    anyhow::bail!("no track at {}", index);
                };
                let title = track.display();
                if self.selected.add(track) {
                    if self.queue_source == QueueSource::Selected {
                        self.queue.set_tracks(self.selected.tracks().to_vec());
                    }
                    self.info(format!("added {}", title)).await;
                } else {
                    self.info(format!("{} already selected", title)).await;
                }
            }
            Command::Remove { index } => {
                if self.queue_source == QueueSource::Selected {
                    self.selected.set_cursor(self.queue.active_index());
                }
                let Some(track) = self.selected.remove(index) else {
                    anyhow::bail!("no selected track at {}", index);
                };
                if self.queue_source == QueueSource::Selected {
                    self.queue.reset(self.selected.tracks().to_vec());
                    self.restore_selected_cursor();
                }
                self.info(format!("removed {}", track.display())).await;
            }
            Command::Selected => {
                let current = self.queue.current().map(|t| t.key());
                let tracks = self
                    .selected
                    .tracks()
                    .iter()
                    .enumerate()
                    .map(|(i, t)| ListedTrack::new(i, t, Some(t.key()) == current))
                    .collect();
                self.emit(&Notice::List {
                    source: QueueSource::Selected,
                    tracks,
                })
                .await;
            }
            Command::Source { source } => {
                self.switch_source(source).await;
                self.emit_list().await;
            }
            Command::Volume { value } => {
                let res = self.queue.set_volume(value).await;
                self.after_transport(res).await;
                let volume = self.queue.volume();
                self.state.update(|s| s.volume = volume).await?;
            }
            Command::Mute => {
                let res = self.queue.toggle_mute().await.map(|_| ());
                self.after_transport(res).await;
                let muted = self.queue.muted();
                self.state.update(|s| s.muted = muted).await?;
            }
            Command::Seek { seconds } => {
                let ms = (seconds * 1000.0).round() as u64;
                let res = self.queue.seek(ms).await;
                self.after_transport(res).await;
            }
            Command::Save { path } => {
                let tracks: Vec<_> = self.queue.visible().cloned().collect();
                playlist::save_playlist(Path::new(&path), &tracks).await?;
                self.info(format!("saved {} tracks to {}", tracks.len(), path))
                    .await;
            }
            Command::Load { path } => {
                let decoded = playlist::load_playlist(Path::new(&path)).await?;
                self.selected.clear();
                for track in decoded.tracks {
                    self.selected.add(track);
                }
                self.queue_source = QueueSource::Selected;
                self.queue.reset(self.selected.tracks().to_vec());
                self.info(format!(
                    "loaded {} tracks from {} ({} lines skipped)",
                    self.selected.len(),
                    path,
                    decoded.skipped.len()
                ))
                .await;
                self.emit_list().await;
            }
            Command::Quit => {}
        }
        Ok(())
    }

    /// Collaborator failures are already on the queue's event channel, so
    /// only a bad index is reported here.
    async fn after_transport(&mut self, res: Result<(), PlaybackError>) {
        match res {
            Ok(()) => {}
            Err(PlaybackError::IndexOutOfRange { index, len }) => {
                self.emit(&Notice::Error {
                    message: format!("no track {} ({} listed)", index, len),
                })
                .await;
            }
            Err(e) => debug!("transport: {}", e),
        }
        self.emit_state().await;
    }

    async fn load_scope(&mut self, scope: Scope) {
        self.active_scope = Some(scope.clone());
        if self.queue_source == QueueSource::Catalog {
            self.queue.reset(Vec::new());
        }
        // the run reports through catalog events; its handle is not needed
        drop(self.controller.load_scope(scope.clone()).await);
        if let Err(e) = self.state.update(|s| s.last_scope = Some(scope.clone())).await {
            warn!("saving state: {}", e);
        }
        self.emit(&Notice::ScopeLoading { scope }).await;
    }

    /// The selected list keeps its own position while the catalog is the
    /// active source.
    async fn switch_source(&mut self, source: QueueSource) {
        if self.queue_source == QueueSource::Selected {
            self.selected.set_cursor(self.queue.active_index());
        }
        self.queue_source = source;
        let tracks = match source {
            QueueSource::Selected => self.selected.tracks().to_vec(),
            QueueSource::Catalog => match &self.active_scope {
                Some(scope) => self.controller.tracks(scope).await,
                None => Vec::new(),
            },
        };
        self.queue.reset(tracks);
        if source == QueueSource::Selected {
            self.restore_selected_cursor();
        }
    }

    /// Put the queue back on the selected list's own position unless the
    /// playing track already placed it.
    fn restore_selected_cursor(&mut self) {
        if self.queue.active_index().is_some() {
            return;
        }
        if let Some(c) = self.selected.cursor() {
            self.queue.set_active_index(c);
        }
    }

    // ── catalog / mpv events ──────────────────────────────────────────────────

    async fn handle_catalog_event(&mut self, evt: CatalogEvent) {
        let scope = match &evt {
            CatalogEvent::ScopeReset { scope }
            | CatalogEvent::PageMerged { scope, .. }
            | CatalogEvent::ScopeExhausted { scope }
            | CatalogEvent::ScopeFailed { scope, .. } => scope.clone(),
        };
        if self.active_scope.as_ref() != Some(&scope) {
            debug!("ignoring event for inactive {}: {:?}", scope, evt);
            return;
        }

        match evt {
            CatalogEvent::ScopeReset { .. } => {}
            CatalogEvent::PageMerged {
                scope,
                page,
                added,
                total,
            } => {
                if self.queue_source == QueueSource::Catalog {
                    let tracks = self.controller.tracks(&scope).await;
                    self.queue.set_tracks(tracks);
                }
                self.emit(&Notice::PageMerged {
                    scope,
                    page,
                    added,
                    total,
                })
                .await;
            }
            CatalogEvent::ScopeExhausted { scope } => {
                if self.queue_source == QueueSource::Catalog {
                    let tracks = self.controller.tracks(&scope).await;
                    self.queue.set_tracks(tracks);
                }
                self.emit(&Notice::ScopeExhausted { scope }).await;
            }
            CatalogEvent::ScopeFailed { scope, error } => {
                self.emit(&Notice::ScopeFailed {
                    scope,
                    error: error.to_string(),
                })
                .await;
            }
        }
    }

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        let Some(signal) = evt.signal() else {
            debug!("mpv event: {:?}", evt.raw);
            return;
        };
        if !self.queue.player_mut().admit(&signal) {
            debug!("mpv: dropping {:?} from the previous file", signal);
            return;
        }
        match signal {
            PlayerSignal::Position(ms) => self.queue.on_position_changed(ms),
            PlayerSignal::Duration(ms) => self.queue.on_duration_changed(ms),
            PlayerSignal::Loaded => debug!("mpv: file loaded"),
            PlayerSignal::Ended => {
                if let Err(e) = self.queue.on_track_ended().await {
                    debug!("advance after end of track: {}", e);
                }
            }
            PlayerSignal::Failed(msg) => {
                warn!("mpv could not play the stream: {}", msg);
                self.emit(&Notice::Error {
                    message: format!("playback failed: {}", msg),
                })
                .await;
                let _ = self.queue.stop().await;
            }
        }
    }

    async fn drain_queue_events(&mut self) {
        while let Ok(evt) = self.queue_rx.try_recv() {
            let notice = match evt {
                QueueEvent::TrackChanged { index, track } => Notice::Track {
                    index,
                    title: track.display(),
                    stream_locator: track.stream_locator,
                },
                QueueEvent::StateChanged(_) => continue,
                QueueEvent::PlaybackError(e) => Notice::Error {
                    message: e.to_string(),
                },
            };
            self.emit(&notice).await;
        }
    }

    // ── output ────────────────────────────────────────────────────────────────

    async fn emit_list(&mut self) {
        let cursor = self.queue.cursor();
        let tracks = self
            .queue
            .visible()
            .enumerate()
            .map(|(i, t)| ListedTrack::new(i, t, Some(i) == cursor))
            .collect();
        let notice = Notice::List {
            source: self.queue_source,
            tracks,
        };
        self.emit(&notice).await;
    }

    async fn emit_state(&mut self) {
        let notice = Notice::State {
            state: self.queue.state(),
            repeat: self.queue.repeat(),
            shuffle: self.queue.shuffle(),
            volume: self.queue.volume(),
            muted: self.queue.muted(),
            timeline: self.queue.format_timeline(),
        };
        self.emit(&notice).await;
    }

    async fn info(&mut self, message: String) {
        self.emit(&Notice::Info { message }).await;
    }

    async fn emit(&mut self, notice: &Notice) {
        let mut line = match serde_json::to_string(notice) {
            Ok(l) => l,
            Err(e) => {
                error!("cannot serialise notice: {}", e);
                return;
            }
        };
        line.push('\n');
        if let Err(e) = self.out.write_all(line.as_bytes()).await {
            warn!("stdout write failed: {}", e);
            return;
        }
        let _ = self.out.flush().await;
    }
}

fn forward<T, F>(mut rx: mpsc::UnboundedReceiver<T>, tx: mpsc::Sender<CoreEvent>, wrap: F)
where
    T: Send + 'static,
    F: Fn(T) -> CoreEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if tx.send(wrap(item)).await.is_err() {
                break;
            }
        }
    });
}

fn forward_bounded<T, F>(mut rx: mpsc::Receiver<T>, tx: mpsc::Sender<CoreEvent>, wrap: F)
where
    T: Send + 'static,
    F: Fn(T) -> CoreEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if tx.send(wrap(item)).await.is_err() {
                break;
            }
        }
    });
}

/// One command per stdin line; EOF shuts the daemon down.
fn spawn_stdin_reader(tx: mpsc::Sender<CoreEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let evt = match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match Command::parse_line(&line) {
                    Ok(cmd) => CoreEvent::Input(cmd),
                    Err(message) => CoreEvent::Reply(Notice::Error { message }),
                },
                Ok(None) => CoreEvent::Shutdown,
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    CoreEvent::Shutdown
                }
            };
            let done = matches!(evt, CoreEvent::Shutdown);
            if tx.send(evt).await.is_err() || done {
                break;
            }
        }
    });
}
