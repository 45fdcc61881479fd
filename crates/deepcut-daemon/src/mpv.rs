/// mpv-backed playback engine.
///
/// Architecture:
///
/// ```text
///   MpvEngine::load()
///         │
///         ├── ensure_handle() ── MpvDriver::spawn_and_connect()
///         │        ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         │        ├── reader_task   ← reads JSON lines from socket
///         │        │                      ├── response (has request_id) → matched oneshot::Sender
///         │        │                      └── event / property-change   → event channel
///         │        └── pump_events   ← folds events into the shared Session
///         │
///         └── Session  ── StatusSink pushes → player core
/// ```
///
/// One mpv process (`--idle=yes`) serves every session; a session is one
/// `loadfile ... replace`.  Events of superseded playlist entries are
/// recognised by `playlist_entry_id` and ignored.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{EngineStatus, LoadError, PlaybackEngine, StatusSink};

#[cfg(unix)]
pub type IpcStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_TIME_POS: u64 = 1;
pub const OBS_DURATION: u64 = 2;
pub const OBS_PAUSE: u64 = 3;
pub const OBS_CORE_IDLE: u64 = 4;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `end-file` reason: "eof", "stop", "quit", "error", "redirect".
    pub fn reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
    closed: Arc<AtomicBool>,
}

impl MpvHandle {
    /// False once the IPC connection has been closed from either side.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

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

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace whatever is playing with `url`.  Returns the playlist entry id
    /// when the mpv version reports one.
    pub async fn load_file(&self, url: &str) -> anyhow::Result<Option<i64>> {
        let resp = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(resp["data"]["playlist_entry_id"].as_i64())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn seek_to_ms(&self, ms: u64) -> anyhow::Result<()> {
        let secs = ms as f64 / 1000.0;
        self.send(json!(["seek", secs, "absolute"])).await?;
        Ok(())
    }

    pub async fn get_property(&self, name: &str) -> anyhow::Result<Value> {
        let resp = self.send(json!(["get_property", name])).await?;
        Ok(resp["data"].clone())
    }

    /// Register observe_property for everything the session tracks.
    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        let props = [
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_PAUSE, "pause"),
            (OBS_CORE_IDLE, "core-idle"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// Split `stream` and start the reader/writer tasks on it.
pub fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let closed = Arc::new(AtomicBool::new(false));

    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx, closed.clone()));

    MpvHandle { tx: cmd_tx, closed }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(socket_name: String) -> Self {
        Self {
            socket_name,
            process: None,
        }
    }

    /// True when we spawned mpv and it has since exited.
    pub fn process_exited(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_some(),
            None => false,
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        // Kill stale process
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        info!("mpv: spawning new process");
        let mpv_binary = deepcut_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--no-terminal")
            .arg(deepcut_proto::platform::mpv_socket_arg(&self.socket_name))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(&mut self) -> anyhow::Result<IpcStream> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                let stream = tokio::net::UnixStream::connect(&socket_path).await?;
                info!("mpv: connected to IPC socket");
                return Ok(stream);
            }
        }
        anyhow::bail!("mpv IPC socket did not appear")
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(&mut self) -> anyhow::Result<IpcStream> {
        use tokio::net::windows::named_pipe::ClientOptions;

        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(client);
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let close_reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "mpv IPC connection closed".to_string(),
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
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break "mpv event receiver dropped".to_string();
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                break format!("mpv IPC read error: {}", e);
            }
        }
    };

    debug!("mpv reader: {}", close_reason);
    closed.store(true, Ordering::Relaxed);
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", close_reason)));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
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

// ── session ───────────────────────────────────────────────────────────────────

/// Property values mirrored from mpv property-change events.
#[derive(Debug, Default, Clone, Copy)]
struct Observed {
    time_pos_ms: Option<u64>,
    duration_ms: Option<u64>,
    pause: bool,
    core_idle: Option<bool>,
}

impl Observed {
    fn status(&self, loaded: bool) -> EngineStatus {
        EngineStatus {
            position_ms: self.time_pos_ms.unwrap_or(0),
            duration_ms: self.duration_ms.unwrap_or(0),
            is_playing: loaded && !self.pause && self.core_idle != Some(true),
            is_loaded: loaded,
        }
    }
}

fn secs_to_ms(data: &Value) -> Option<u64> {
    data.as_f64()
        .filter(|s| s.is_finite())
        .map(|s| (s.max(0.0) * 1000.0).round() as u64)
}

/// State of the single mpv session, shared between the engine and the
/// event pump of the current connection.
#[derive(Debug, Default)]
struct Session {
    /// Id of the connection whose pump may resolve `loading`.
    connection: u64,
    sink: Option<StatusSink>,
    loading: Option<oneshot::Sender<Result<(), String>>>,
    entry_id: Option<i64>,
    loaded: bool,
    observed: Observed,
    last_pushed: Option<EngineStatus>,
    granularity_ms: u64,
}

impl Session {
    fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    fn release(&mut self) {
        self.sink = None;
        self.loading = None;
        self.entry_id = None;
        self.loaded = false;
        self.observed = Observed::default();
        self.last_pushed = None;
    }

    fn apply(&mut self, evt: &MpvEvent) {
        if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_TIME_POS => self.observed.time_pos_ms = secs_to_ms(data),
                OBS_DURATION => self.observed.duration_ms = secs_to_ms(data),
                OBS_PAUSE => self.observed.pause = data.as_bool().unwrap_or(false),
                OBS_CORE_IDLE => self.observed.core_idle = data.as_bool(),
                _ => return,
            }
            self.maybe_push(false);
            return;
        }

        match evt.event_name() {
            Some("file-loaded") => {
                if let Some(tx) = self.loading.take() {
                    let _ = tx.send(Ok(()));
                }
                if self.is_open() {
                    self.loaded = true;
                    self.maybe_push(true);
                }
            }
            Some("end-file") => {
                if self.is_superseded(evt) {
                    debug!(
                        "mpv: ignoring end-file of superseded entry {:?}",
                        evt.playlist_entry_id()
                    );
                    return;
                }
                match evt.reason() {
                    Some("eof") => self.finish(),
                    Some("error") => {
                        let reason = evt
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown error")
                            .to_string();
                        if let Some(tx) = self.loading.take() {
                            let _ = tx.send(Err(reason));
                        } else if self.loaded {
                            warn!("mpv: playback aborted: {}", reason);
                            let mut status = self.observed.status(true);
                            status.is_playing = false;
                            if let Some(mut sink) = self.sink.take() {
                                sink.push(status);
                            }
                            self.loaded = false;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn is_superseded(&self, evt: &MpvEvent) -> bool {
        matches!(
            (evt.playlist_entry_id(), self.entry_id),
            (Some(got), Some(current)) if got != current
        )
    }

    fn finish(&mut self) {
        if !self.loaded {
            return;
        }
        if let Some(sink) = self.sink.take() {
            let mut status = self.observed.status(true);
            status.is_playing = false;
            status.position_ms = status.position_ms.max(status.duration_ms);
            info!("mpv: session {} finished", sink.generation());
            sink.finish(status);
        }
        self.loaded = false;
        self.entry_id = None;
    }

    fn maybe_push(&mut self, force: bool) {
        if !self.loaded {
            return;
        }
        let status = self.observed.status(true);
        let due = force
            || match self.last_pushed {
                None => true,
                Some(prev) => {
                    prev.is_playing != status.is_playing
                        || prev.duration_ms != status.duration_ms
                        || prev.position_ms.abs_diff(status.position_ms) >= self.granularity_ms
                }
            };
        if !due {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if sink.push(status) {
                self.last_pushed = Some(status);
            }
        }
    }
}

fn lock(session: &std::sync::Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pump_events(
    mut event_rx: mpsc::Receiver<MpvEvent>,
    session: Arc<std::sync::Mutex<Session>>,
    connection: u64,
) {
    while let Some(evt) = event_rx.recv().await {
        debug!("mpv event: {}", evt.raw);
        lock(&session).apply(&evt);
    }
    let mut s = lock(&session);
    if s.connection != connection {
        return;
    }
    if s.loading.take().is_some() {
        debug!("mpv: connection {} closed while loading", connection);
    }
    if let Some(mut sink) = s.sink.take() {
        warn!("mpv: connection {} closed during session {}", connection, sink.generation());
        sink.push(s.observed.status(false));
    }
    s.release();
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    session: Arc<std::sync::Mutex<Session>>,
    connections: u64,
}

impl MpvEngine {
    pub fn new(socket_name: String, position_granularity_ms: u64) -> Self {
        let session = Session {
            granularity_ms: position_granularity_ms,
            ..Session::default()
        };
        Self {
            driver: MpvDriver::new(socket_name),
            handle: None,
            session: Arc::new(std::sync::Mutex::new(session)),
            connections: 0,
        }
    }

    /// Wire an already-connected IPC stream into this engine.
    pub async fn attach<S>(&mut self, stream: S) -> MpvHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = start_io_tasks(stream, event_tx);

        self.connections += 1;
        let connection = self.connections;
        {
            let mut s = lock(&self.session);
            s.release();
            s.connection = connection;
        }
        tokio::spawn(pump_events(event_rx, self.session.clone(), connection));

        handle.observe_properties().await;
        self.handle = Some(handle.clone());
        handle
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.driver.process_exited() {
            warn!("mpv: process exited");
            self.handle = None;
        }
        if let Some(h) = self.live_handle() {
            return Ok(h);
        }
        if self.handle.take().is_some() {
            warn!("mpv: IPC connection lost, respawning");
        }
        let stream = self.driver.spawn_and_connect().await?;
        Ok(self.attach(stream).await)
    }

    fn live_handle(&self) -> Option<MpvHandle> {
        self.handle.clone().filter(|h| h.is_alive())
    }

    fn session_handle(&self) -> Option<MpvHandle> {
        if lock(&self.session).is_open() {
            self.live_handle()
        } else {
            None
        }
    }
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    async fn load(&mut self, url: &str, sink: StatusSink) -> Result<(), LoadError> {
        if let Err(e) = self.unload().await {
            debug!("mpv: releasing previous session failed: {}", e);
        }

        let handle = self
            .ensure_handle()
            .await
            .map_err(|e| LoadError::EngineUnavailable(e.to_string()))?;

        let (loaded_tx, loaded_rx) = oneshot::channel();
        {
            let mut s = lock(&self.session);
            s.release();
            s.sink = Some(sink);
            s.loading = Some(loaded_tx);
        }

        info!("mpv: loading {}", url);
        match handle.load_file(url).await {
            Ok(entry_id) => lock(&self.session).entry_id = entry_id,
            Err(e) => {
                lock(&self.session).release();
                return Err(LoadError::Rejected(e.to_string()));
            }
        }

        match loaded_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => {
                lock(&self.session).release();
                let _ = handle.stop().await;
                Err(LoadError::Open {
                    url: url.to_string(),
                    reason,
                })
            }
            Err(_) => {
                lock(&self.session).release();
                Err(LoadError::EngineUnavailable(
                    "mpv connection closed while loading".to_string(),
                ))
            }
        }
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match self.session_handle() {
            Some(h) => h.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        match self.session_handle() {
            Some(h) => h.set_pause(false).await,
            None => Ok(()),
        }
    }

    async fn seek(&mut self, ms: u64) -> anyhow::Result<()> {
        match self.session_handle() {
            Some(h) => h.seek_to_ms(ms).await,
            None => Ok(()),
        }
    }

    async fn poll_status(&mut self) -> Option<EngineStatus> {
        let handle = self.session_handle()?;
        let time_pos = handle.get_property("time-pos").await.ok();
        let pause = handle.get_property("pause").await.ok();

        let mut s = lock(&self.session);
        if !s.is_open() {
            return None;
        }
        if let Some(ms) = time_pos.as_ref().and_then(secs_to_ms) {
            s.observed.time_pos_ms = Some(ms);
        }
        if let Some(paused) = pause.as_ref().and_then(Value::as_bool) {
            s.observed.pause = paused;
        }
        Some(s.observed.status(s.loaded))
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        let was_open = {
            let mut s = lock(&self.session);
            let open = s.is_open();
            s.release();
            open
        };
        if was_open {
            if let Some(h) = self.live_handle() {
                h.stop().await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        let result = self.unload().await;
        self.handle = None;
        self.driver.kill().await;
        result
    }
}
