/// mpv IPC driver and the `Player` implementation built on it.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, writes → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_tx channel
/// ```
///
/// `MpvPlayer` owns the driver and spawns mpv on the first `load`, so the
/// daemon can run (browse, list, save) without mpv installed.
use async_trait::async_trait;
use hearthis_core::{platform, PlaybackError, Player};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property ids, matched in property-change events.
pub const OBS_TIME_POS: u64 = 1;
pub const OBS_DURATION: u64 = 2;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An unsolicited mpv message (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

/// What the playback queue cares about in an mpv event.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerSignal {
    Position(u64),
    Duration(u64),
    Loaded,
    Ended,
    Failed(String),
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `end-file` reasons other than eof/error (stop, quit, redirect) are
    /// side effects of our own commands and map to nothing.
    pub fn signal(&self) -> Option<PlayerSignal> {
        if let Some((id, data)) = self.as_property_change() {
            let ms = data.as_f64().filter(|s| *s >= 0.0).map(secs_to_ms)?;
            return match id {
                OBS_TIME_POS => Some(PlayerSignal::Position(ms)),
                OBS_DURATION => Some(PlayerSignal::Duration(ms)),
                _ => None,
            };
        }
        match self.event_name()? {
            "file-loaded" => return Some(PlayerSignal::Loaded),
            "end-file" => {}
            _ => return None,
        }
        match self.raw.get("reason").and_then(|r| r.as_str()) {
            Some("eof") => Some(PlayerSignal::Ended),
            Some("error") => {
                let msg = self
                    .raw
                    .get("file_error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error");
                Some(PlayerSignal::Failed(msg.to_string()))
            }
            _ => None,
        }
    }
}

/// Holds back signals that belong to the file playing before the latest
/// `loadfile`: an eof already queued for the old track must not advance past
/// the one the user just picked.
#[derive(Debug, Default)]
pub struct LoadGate {
    pending: bool,
}

impl LoadGate {
    pub fn begin(&mut self) {
        self.pending = true;
    }

    pub fn admit(&mut self, signal: &PlayerSignal) -> bool {
        match signal {
            PlayerSignal::Loaded | PlayerSignal::Failed(_) => {
                self.pending = false;
                true
            }
            _ => !self.pending,
        }
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round() as u64
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn observe_properties(&self) {
        for (id, name) in [(OBS_TIME_POS, "time-pos"), (OBS_DURATION, "duration")] {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self, volume: u8, muted: bool) -> anyhow::Result<()> {
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", mpv_binary.display());

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(format!("--volume={}", volume.min(100)))
            .arg(format!("--mute={}", if muted { "yes" } else { "no" }))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: u8,
        muted: bool,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process(volume, muted)?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: u8,
        muted: bool,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process(volume, muted)?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    debug!("mpv reader: event receiver gone");
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Playback collaborator backed by an mpv process.
pub struct MpvPlayer {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    event_tx: mpsc::Sender<MpvEvent>,
    gate: LoadGate,
    volume: u8,
    muted: bool,
}

impl MpvPlayer {
    pub fn new(event_tx: mpsc::Sender<MpvEvent>) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            event_tx,
            gate: LoadGate::default(),
            volume: 50,
            muted: false,
        }
    }

    /// Forget the connection if the process has died; false in that case.
    pub fn check_alive(&mut self) -> bool {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died");
            self.handle = None;
            return false;
        }
        true
    }

    /// False for a signal left over from the previously loaded file.
    pub fn admit(&mut self, signal: &PlayerSignal) -> bool {
        self.gate.admit(signal)
    }

    pub async fn shutdown(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.send(json!(["quit"])).await;
        }
        self.driver.kill().await;
    }

    async fn connect(&mut self) -> Result<MpvHandle, PlaybackError> {
        if let Some(h) = &self.handle {
            return Ok(h.clone());
        }
        let handle = self
            .driver
            .spawn_and_connect(self.volume, self.muted, self.event_tx.clone())
            .await
            .map_err(|e| PlaybackError::LoadFailed(format!("mpv unavailable: {}", e)))?;
        handle.observe_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Send to a running mpv; with no process there is nothing to control.
    async fn command(&mut self, command: Value) -> Result<(), PlaybackError> {
        let Some(handle) = self.handle.clone() else {
            return Ok(());
        };
        match handle.send(command).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.check_alive();
                Err(PlaybackError::TransportFailed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Player for MpvPlayer {
    async fn load(&mut self, stream_locator: &str) -> Result<(), PlaybackError> {
        self.gate.begin();
        let handle = self.connect().await?;
        handle
            .send(json!(["loadfile", stream_locator]))
            .await
            .map_err(|e| PlaybackError::LoadFailed(e.to_string()))?;
        Ok(())
    }

    async fn play(&mut self) -> Result<(), PlaybackError> {
        self.command(json!(["set_property", "pause", false])).await
    }

    async fn pause(&mut self) -> Result<(), PlaybackError> {
        self.command(json!(["set_property", "pause", true])).await
    }

    async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.command(json!(["stop"])).await
    }

    async fn set_volume(&mut self, volume: u8) -> Result<(), PlaybackError> {
        self.volume = volume.min(100);
        self.command(json!(["set_property", "volume", self.volume])).await
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), PlaybackError> {
        self.muted = muted;
        self.command(json!(["set_property", "mute", muted])).await
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        let secs = position_ms as f64 / 1000.0;
        self.command(json!(["seek", secs, "absolute"])).await
    }
}
