//! Playback queue: the visible view over a track list, one cursor, repeat
//! and shuffle policy, and the transport state machine that drives a
//! `Player`.
//!
//! The queue keeps the tracks in catalog order (`backing`) and derives the
//! visible `view` from it as a list of backing indices, shuffled and
//! filtered as configured. The active track is remembered by backing index,
//! so the cursor follows it through filter and shuffle changes and is
//! `None` whenever the active track is not visible.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PlaybackError;
use crate::model::{TrackDescriptor, TrackKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

impl RepeatMode {
    /// Off -> One -> All -> Off
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::One,
            RepeatMode::One => RepeatMode::All,
            RepeatMode::All => RepeatMode::Off,
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepeatMode::Off => "off",
            RepeatMode::One => "one",
            RepeatMode::All => "all",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// The audio backend. The queue is its only caller.
#[async_trait]
pub trait Player: Send {
    async fn load(&mut self, stream_locator: &str) -> Result<(), PlaybackError>;
    async fn play(&mut self) -> Result<(), PlaybackError>;
    async fn pause(&mut self) -> Result<(), PlaybackError>;
    async fn stop(&mut self) -> Result<(), PlaybackError>;
    /// 0..=100
    async fn set_volume(&mut self, volume: u8) -> Result<(), PlaybackError>;
    async fn set_muted(&mut self, muted: bool) -> Result<(), PlaybackError>;
    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// `index` is the view position, `None` if the track is not visible.
    TrackChanged {
        index: Option<usize>,
        track: TrackDescriptor,
    },
    StateChanged(TransportState),
    PlaybackError(PlaybackError),
}

pub type TrackFilter = Box<dyn Fn(&TrackDescriptor) -> bool + Send + Sync>;

pub struct PlaybackQueue<P: Player> {
    player: P,
    backing: Vec<TrackDescriptor>,
    filter: Option<TrackFilter>,
    /// Permutation of backing indices, fixed while shuffle stays on.
    shuffle_order: Option<Vec<usize>>,
    view: Vec<usize>,
    /// Backing index of the active track.
    active: Option<usize>,
    current: Option<TrackDescriptor>,
    state: TransportState,
    repeat: RepeatMode,
    volume: u8,
    muted: bool,
    position_ms: u64,
    duration_ms: u64,
    rng: StdRng,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl<P: Player> PlaybackQueue<P> {
    pub fn new(player: P) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        Self::with_rng(player, StdRng::from_entropy())
    }

    /// Deterministic shuffle order, for tests.
    pub fn with_seed(player: P, seed: u64) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        Self::with_rng(player, StdRng::seed_from_u64(seed))
    }

    fn with_rng(player: P, rng: StdRng) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let queue = Self {
            player,
            backing: Vec::new(),
            filter: None,
            shuffle_order: None,
            view: Vec::new(),
            active: None,
            current: None,
            state: TransportState::Stopped,
            repeat: RepeatMode::Off,
            volume: 50,
            muted: false,
            position_ms: 0,
            duration_ms: 0,
            rng,
            events,
        };
        (queue, rx)
    }

    // --- accessors ---

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle_order.is_some()
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Number of visible tracks.
    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Tracks held in catalog order, visible or not.
    pub fn backing(&self) -> &[TrackDescriptor] {
        &self.backing
    }

    pub fn visible(&self) -> impl Iterator<Item = &TrackDescriptor> + '_ {
        self.view.iter().map(move |&i| &self.backing[i])
    }

    pub fn track_at(&self, index: usize) -> Option<&TrackDescriptor> {
        self.view.get(index).map(|&i| &self.backing[i])
    }

    /// View position of the active track.
    pub fn cursor(&self) -> Option<usize> {
        let active = self.active?;
        self.view.iter().position(|&i| i == active)
    }

    /// Catalog-order index of the active track, visible or not.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Make the track at catalog-order `index` active without touching
    /// transport. Play starts it when stopped; next/prev step from it.
    pub fn set_active_index(&mut self, index: usize) -> bool {
        if index >= self.backing.len() {
            return false;
        }
        self.active = Some(index);
        true
    }

    /// The track most recently handed to the player.
    pub fn current(&self) -> Option<&TrackDescriptor> {
        self.current.as_ref()
    }

    // --- view maintenance ---

    /// Install a new track list. A list that starts with the current one
    /// (another page merged) is appended in place, keeping the cursor and
    /// the shuffled order up to it; anything else replaces the list.
    pub fn set_tracks(&mut self, tracks: Vec<TrackDescriptor>) {
        let old_len = self.backing.len();
        let extends = old_len > 0
            && tracks.len() >= old_len
            && tracks[..old_len] == self.backing[..];

        if extends {
            self.backing = tracks;
            let new_len = self.backing.len();
            let active = self.active;
            if let Some(order) = &mut self.shuffle_order {
                // newcomers land at random spots after the active track,
                // so what was already played keeps its place
                let floor = active
                    .and_then(|a| order.iter().position(|&i| i == a))
                    .map_or(0, |p| p + 1);
                for idx in old_len..new_len {
                    let at = self.rng.gen_range(floor..=order.len());
                    order.insert(at, idx);
                }
            }
        } else {
            self.reset(tracks);
            return;
        }
        self.rebuild_view();
    }

    /// Replace the list outright. The cursor is cleared unless the playing
    /// track is also in the new list. Transport is not touched.
    pub fn reset(&mut self, tracks: Vec<TrackDescriptor>) {
        self.backing = tracks;
        let key: Option<TrackKey> = self.current.as_ref().map(|t| t.key());
        self.active = key.and_then(|k| self.backing.iter().position(|t| t.key() == k));
        if self.shuffle_order.is_some() {
            self.shuffle_order = Some(self.permutation());
        }
        self.rebuild_view();
        debug!("queue reset, {} tracks", self.backing.len());
    }

    /// Limit the view to tracks matching `filter`; `None` shows everything.
    /// Transport is unaffected even when the active track is hidden.
    pub fn set_filter(&mut self, filter: Option<TrackFilter>) {
        self.filter = filter;
        self.rebuild_view();
    }

    /// Case-insensitive title match; blank text clears the filter.
    pub fn set_search(&mut self, text: &str) {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            self.set_filter(None);
        } else {
            self.set_filter(Some(Box::new(move |t: &TrackDescriptor| {
                t.title.to_lowercase().contains(&needle)
            })));
        }
    }

    /// Turning shuffle on draws a fresh permutation that stays fixed until
    /// shuffle is turned off again.
    pub fn toggle_shuffle(&mut self) -> bool {
        if self.shuffle_order.is_some() {
            self.shuffle_order = None;
        } else {
            self.shuffle_order = Some(self.permutation());
        }
        self.rebuild_view();
        info!("shuffle {}", if self.shuffle() { "on" } else { "off" });
        self.shuffle()
    }

    pub fn set_shuffle(&mut self, on: bool) {
        if on != self.shuffle() {
            self.toggle_shuffle();
        }
    }

    fn permutation(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.backing.len()).collect();
        order.shuffle(&mut self.rng);
        order
    }

    fn rebuild_view(&mut self) {
        let backing = &self.backing;
        let filter = &self.filter;
        let keep = |i: &usize| filter.as_ref().map_or(true, |f| f(&backing[*i]));
        let view: Vec<usize> = match &self.shuffle_order {
            Some(order) => order.iter().copied().filter(keep).collect(),
            None => (0..backing.len()).filter(keep).collect(),
        };
        self.view = view;
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    pub fn cycle_repeat(&mut self) -> RepeatMode {
        self.repeat = self.repeat.cycle();
        info!("repeat {}", self.repeat);
        self.repeat
    }

    // --- transport ---

    /// Start the track at view position `index`.
    pub async fn select(&mut self, index: usize) -> Result<(), PlaybackError> {
        let Some(&backing_idx) = self.view.get(index) else {
            return Err(PlaybackError::IndexOutOfRange {
                index,
                len: self.view.len(),
            });
        };
        self.start(backing_idx).await
    }

    async fn start(&mut self, backing_idx: usize) -> Result<(), PlaybackError> {
        let track = self.backing[backing_idx].clone();

        if self.state == TransportState::Playing {
            if let Err(e) = self.player.stop().await {
                warn!("stopping previous track failed: {}", e);
                self.report(e);
            }
        }

        self.active = Some(backing_idx);
        self.current = Some(track.clone());
        self.position_ms = 0;
        self.duration_ms = track.duration_ms;
        info!("playing {}", track.display());

        if let Err(e) = self.player.load(&track.stream_locator).await {
            return Err(self.fail_start(e));
        }
        if let Err(e) = self.player.play().await {
            return Err(self.fail_start(e));
        }
        self.emit(QueueEvent::TrackChanged {
            index: self.cursor(),
            track,
        });
        self.set_state(TransportState::Playing);
        Ok(())
    }

    fn fail_start(&mut self, e: PlaybackError) -> PlaybackError {
        warn!("playback failed: {}", e);
        self.set_state(TransportState::Stopped);
        self.report(e.clone());
        e
    }

    /// Playing pauses, Paused resumes, Stopped starts the active track (or
    /// the first visible one).
    pub async fn toggle_play_pause(&mut self) -> Result<(), PlaybackError> {
        match self.state {
            TransportState::Playing => match self.player.pause().await {
                Ok(()) => {
                    self.set_state(TransportState::Paused);
                    Ok(())
                }
                Err(e) => Err(self.transport_failed(e)),
            },
            TransportState::Paused => match self.player.play().await {
                Ok(()) => {
                    self.set_state(TransportState::Playing);
                    Ok(())
                }
                Err(e) => Err(self.transport_failed(e)),
            },
            TransportState::Stopped => match (self.cursor(), self.active) {
                (Some(index), _) => self.select(index).await,
                (None, Some(hidden)) if hidden < self.backing.len() => self.start(hidden).await,
                _ if !self.view.is_empty() => self.select(0).await,
                _ => Ok(()),
            },
        }
    }

    /// Stop playback. The active track is kept, so play starts it again.
    pub async fn stop(&mut self) -> Result<(), PlaybackError> {
        if let Err(e) = self.player.stop().await {
            return Err(self.transport_failed(e));
        }
        self.position_ms = 0;
        self.set_state(TransportState::Stopped);
        Ok(())
    }

    /// View position `advance(direction)` would select, or `None` when it
    /// would do nothing.
    fn step(&self, direction: Direction) -> Option<usize> {
        let len = self.view.len();
        if len == 0 {
            return None;
        }
        let Some(cursor) = self.cursor() else {
            return Some(match direction {
                Direction::Next => 0,
                Direction::Previous => len - 1,
            });
        };
        match (self.repeat, direction) {
            (RepeatMode::One, _) => None,
            (RepeatMode::Off, Direction::Next) => (cursor + 1 < len).then_some(cursor + 1),
            (RepeatMode::Off, Direction::Previous) => cursor.checked_sub(1),
            (RepeatMode::All, Direction::Next) => Some((cursor + 1) % len),
            (RepeatMode::All, Direction::Previous) => Some((cursor + len - 1) % len),
        }
    }

    pub async fn advance(&mut self, direction: Direction) -> Result<(), PlaybackError> {
        match self.step(direction) {
            Some(index) => self.select(index).await,
            None => {
                debug!("advance {:?}: nothing to do", direction);
                Ok(())
            }
        }
    }

    /// The player finished the current stream.
    pub async fn on_track_ended(&mut self) -> Result<(), PlaybackError> {
        if self.repeat == RepeatMode::One {
            return match self.active {
                Some(idx) if idx < self.backing.len() => self.start(idx).await,
                _ => {
                    self.set_state(TransportState::Stopped);
                    Ok(())
                }
            };
        }
        match self.step(Direction::Next) {
            Some(index) => self.select(index).await,
            None => {
                info!("end of queue");
                self.position_ms = 0;
                self.set_state(TransportState::Stopped);
                Ok(())
            }
        }
    }

    // --- volume, seek, timeline ---

    pub async fn set_volume(&mut self, volume: u8) -> Result<(), PlaybackError> {
        let volume = volume.min(100);
        if let Err(e) = self.player.set_volume(volume).await {
            return Err(self.transport_failed(e));
        }
        self.volume = volume;
        Ok(())
    }

    pub async fn set_muted(&mut self, muted: bool) -> Result<(), PlaybackError> {
        if let Err(e) = self.player.set_muted(muted).await {
            return Err(self.transport_failed(e));
        }
        self.muted = muted;
        Ok(())
    }

    pub async fn toggle_mute(&mut self) -> Result<bool, PlaybackError> {
        self.set_muted(!self.muted).await?;
        Ok(self.muted)
    }

    /// Seeking only makes sense with a track loaded; otherwise ignored.
    pub async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        if self.state == TransportState::Stopped {
            return Ok(());
        }
        if let Err(e) = self.player.seek(position_ms).await {
            return Err(self.transport_failed(e));
        }
        self.position_ms = position_ms;
        Ok(())
    }

    pub fn on_position_changed(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
    }

    pub fn on_duration_changed(&mut self, duration_ms: u64) {
        self.duration_ms = duration_ms;
    }

    pub fn position_ms(&self) -> u64 {
        self.position_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// `mm:ss / mm:ss`
    pub fn format_timeline(&self) -> String {
        format!(
            "{} / {}",
            format_mm_ss(self.position_ms),
            format_mm_ss(self.duration_ms)
        )
    }

    // --- events ---

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            self.state = state;
            self.emit(QueueEvent::StateChanged(state));
        }
    }

    fn transport_failed(&mut self, e: PlaybackError) -> PlaybackError {
        warn!("transport command failed: {}", e);
        self.report(e.clone());
        e
    }

    fn report(&self, e: PlaybackError) {
        self.emit(QueueEvent::PlaybackError(e));
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

pub fn format_mm_ss(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Tracks the user picked by hand, in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct SelectedSet {
    tracks: Vec<TrackDescriptor>,
    cursor: Option<usize>,
}

impl SelectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the track was already selected.
    pub fn add(&mut self, track: TrackDescriptor) -> bool {
        let key = track.key();
        if self.tracks.iter().any(|t| t.key() == key) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<TrackDescriptor> {
        if index >= self.tracks.len() {
            return None;
        }
        let removed = self.tracks.remove(index);
        self.cursor = match self.cursor {
            Some(c) if c == index => None,
            Some(c) if c > index => Some(c - 1),
            other => other,
        };
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.cursor = None;
    }

    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<usize>) {
        self.cursor = cursor.filter(|&c| c < self.tracks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Player that accepts everything and remembers the last locator.
    #[derive(Default)]
    struct Quiet {
        loaded: Vec<String>,
    }

    #[async_trait]
    impl Player for Quiet {
        async fn load(&mut self, locator: &str) -> Result<(), PlaybackError> {
            self.loaded.push(locator.to_string());
            Ok(())
        }
        async fn play(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }
        async fn pause(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }
        async fn set_volume(&mut self, _volume: u8) -> Result<(), PlaybackError> {
            Ok(())
        }
        async fn set_muted(&mut self, _muted: bool) -> Result<(), PlaybackError> {
            Ok(())
        }
        async fn seek(&mut self, _position_ms: u64) -> Result<(), PlaybackError> {
            Ok(())
        }
    }

    fn tracks(n: usize) -> Vec<TrackDescriptor> {
        (0..n)
            .map(|i| TrackDescriptor::new(format!("Track {}", i), format!("u{}", i)))
            .collect()
    }

    fn queue(n: usize) -> PlaybackQueue<Quiet> {
        let (mut q, _rx) = PlaybackQueue::with_seed(Quiet::default(), 7);
        q.set_tracks(tracks(n));
        q
    }

    #[test]
    fn test_repeat_cycle() {
        assert_eq!(RepeatMode::Off.cycle(), RepeatMode::One);
        assert_eq!(RepeatMode::One.cycle(), RepeatMode::All);
        assert_eq!(RepeatMode::All.cycle(), RepeatMode::Off);
    }

    #[tokio::test]
    async fn test_off_stops_at_boundaries() {
        let mut q = queue(3);
        q.select(2).await.unwrap();
        q.advance(Direction::Next).await.unwrap();
        assert_eq!(q.cursor(), Some(2));
        q.select(0).await.unwrap();
        q.advance(Direction::Previous).await.unwrap();
        assert_eq!(q.cursor(), Some(0));
    }

    #[tokio::test]
    async fn test_all_wraps_backwards() {
        let mut q = queue(3);
        q.set_repeat(RepeatMode::All);
        q.select(0).await.unwrap();
        q.advance(Direction::Previous).await.unwrap();
        assert_eq!(q.cursor(), Some(2));
    }

    #[tokio::test]
    async fn test_toggle_play_pause_cycle() {
        let mut q = queue(2);
        q.toggle_play_pause().await.unwrap();
        assert_eq!(q.state(), TransportState::Playing);
        assert_eq!(q.cursor(), Some(0));
        q.toggle_play_pause().await.unwrap();
        assert_eq!(q.state(), TransportState::Paused);
        q.toggle_play_pause().await.unwrap();
        assert_eq!(q.state(), TransportState::Playing);
        q.stop().await.unwrap();
        assert_eq!(q.state(), TransportState::Stopped);
        assert_eq!(q.cursor(), Some(0));
    }

    #[tokio::test]
    async fn test_filter_hides_active_track_and_next_falls_back() {
        let mut q = queue(5);
        q.select(3).await.unwrap();
        q.set_search("track 1");
        assert_eq!(q.len(), 1);
        assert_eq!(q.cursor(), None);
        assert_eq!(q.state(), TransportState::Playing);

        q.set_search("");
        assert_eq!(q.cursor(), Some(3));

        q.set_filter(Some(Box::new(|t: &TrackDescriptor| t.title != "Track 3")));
        q.advance(Direction::Next).await.unwrap();
        assert_eq!(q.current().map(|t| t.title.as_str()), Some("Track 0"));
    }

    #[tokio::test]
    async fn test_shuffle_order_is_stable_and_cursor_follows() {
        let mut q = queue(8);
        q.select(4).await.unwrap();
        q.toggle_shuffle();
        let order: Vec<String> = q.visible().map(|t| t.title.clone()).collect();
        assert_eq!(q.track_at(q.cursor().unwrap()).unwrap().title, "Track 4");

        q.set_repeat(RepeatMode::All);
        for _ in 0..3 {
            q.advance(Direction::Next).await.unwrap();
        }
        let again: Vec<String> = q.visible().map(|t| t.title.clone()).collect();
        assert_eq!(order, again);

        q.toggle_shuffle();
        let plain: Vec<String> = q.visible().map(|t| t.title.clone()).collect();
        let expected: Vec<String> = (0..8).map(|i| format!("Track {}", i)).collect();
        assert_eq!(plain, expected);
    }

    #[tokio::test]
    async fn test_appended_tracks_keep_cursor() {
        let mut q = queue(3);
        q.select(1).await.unwrap();
        q.set_tracks(tracks(6));
        assert_eq!(q.len(), 6);
        assert_eq!(q.cursor(), Some(1));

        q.set_tracks(vec![TrackDescriptor::new("Other", "x")]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.cursor(), None);
    }

    #[tokio::test]
    async fn test_end_of_queue_stops() {
        let mut q = queue(2);
        q.select(1).await.unwrap();
        q.on_track_ended().await.unwrap();
        assert_eq!(q.state(), TransportState::Stopped);
        assert_eq!(q.cursor(), Some(1));
    }

    #[tokio::test]
    async fn test_volume_clamped_and_timeline() {
        let mut q = queue(1);
        q.set_volume(180).await.unwrap();
        assert_eq!(q.volume(), 100);
        assert!(q.toggle_mute().await.unwrap());
        q.on_duration_changed(185_000);
        q.on_position_changed(61_500);
        assert_eq!(q.format_timeline(), "01:01 / 03:05");
    }

    #[test]
    fn test_selected_set() {
        let mut sel = SelectedSet::new();
        let ts = tracks(3);
        assert!(sel.add(ts[0].clone()));
        assert!(sel.add(ts[1].clone()));
        assert!(!sel.add(ts[0].clone()));
        assert!(sel.add(ts[2].clone()));
        sel.set_cursor(Some(2));
        assert_eq!(sel.remove(0).map(|t| t.title), Some("Track 0".to_string()));
        assert_eq!(sel.cursor(), Some(1));
        sel.remove(1);
        assert_eq!(sel.cursor(), None);
        sel.clear();
        assert!(sel.is_empty());
    }
}
