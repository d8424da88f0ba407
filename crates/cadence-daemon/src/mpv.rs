/// mpv JSON IPC driver and the `PlaybackEngine` built on it.
///
/// ```text
///   MpvDriver::spawn()
///         │
///         ├── writer_task   ← IpcRequest via mpsc → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── reply (request_id) → waiting oneshot
///                                └── event              → MpvEvent channel
///                                                          │
///   MpvEngine forwarder  ← EventTranslator ←──────────────┘
///         └── EngineEvent → event loop
/// ```
///
/// Unix uses a domain socket, Windows a named pipe `\\.\pipe\<name>`.
use async_trait::async_trait;
use cadence_proto::protocol::EngineHealth;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, PlaybackEngine};
use crate::error::{EngineError, EngineResult};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observed properties ───────────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_DURATION: u64 = 3;

const OBSERVED: [(u64, &str); 3] = [
    (OBS_PAUSE, "pause"),
    (OBS_TIME_POS, "time-pos"),
    (OBS_DURATION, "duration"),
];

type Reply = anyhow::Result<Value>;
type ReplyMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

struct IpcRequest {
    req_id: u64,
    line: String,
    reply: oneshot::Sender<Reply>,
}

/// An unsolicited message from mpv (event or property change).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn property_change(&self) -> Option<(u64, &Value)> {
        if self.name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn playlist_entry_id(&self) -> Option<u64> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable sender side of the IPC connection.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<IpcRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        line.push('\n');

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                req_id,
                line,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply dropped for req={}", req_id))?
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    pub async fn observe_properties(&self) {
        for (id, name) in OBSERVED {
            if let Err(e) = self.send(json!(["observe_property", id, name])).await {
                warn!("mpv: observe_property {} failed: {}", name, e);
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: cadence_proto::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill().await;
        }
    }

    /// Start a fresh idle mpv and connect its IPC channel.
    pub async fn spawn(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        let binary = cadence_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", binary.display());

        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(cadence_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume_percent(volume)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Some(handle) = self.try_connect(event_tx.clone()).await {
                info!("mpv: IPC connected");
                return Ok(handle);
            }
        }
        self.kill().await;
        anyhow::bail!("mpv IPC endpoint did not appear")
    }

    #[cfg(unix)]
    async fn try_connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let stream = tokio::net::UnixStream::connect(&self.socket_name).await.ok()?;
        Some(start_io(stream, event_tx))
    }

    #[cfg(windows)]
    async fn try_connect(&self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let path = format!(r"\\.\pipe\{}", self.socket_name);
        let pipe = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&path)
            .ok()?;
        Some(start_io(pipe, event_tx))
    }
}

fn volume_percent(volume: f32) -> i64 {
    (volume * 100.0).clamp(0.0, 100.0).round() as i64
}

fn start_io<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let replies: ReplyMap = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::channel::<IpcRequest>(64);

    tokio::spawn(writer_task(write_half, rx, replies.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), replies, event_tx));

    MpvHandle { tx }
}

// ── io tasks ──────────────────────────────────────────────────────────────────

async fn fail_all(replies: &ReplyMap, reason: &str) {
    for (_, tx) in replies.lock().await.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

/// Route one line: replies to their waiter, everything else to `event_tx`.
async fn route_line(line: &str, replies: &ReplyMap, event_tx: &mpsc::Sender<MpvEvent>) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("mpv reader: bad json '{}': {}", line, e);
            return;
        }
    };

    let Some(req_id) = value.get("request_id").and_then(Value::as_u64) else {
        let _ = event_tx.send(MpvEvent { raw: value }).await;
        return;
    };

    let Some(waiter) = replies.lock().await.remove(&req_id) else {
        debug!("mpv reader: reply for unknown req={}", req_id);
        return;
    };
    let reply = match value.get("error").and_then(Value::as_str) {
        Some("success") => Ok(value),
        other => Err(anyhow::anyhow!("mpv error: {}", other.unwrap_or("unknown"))),
    };
    let _ = waiter.send(reply);
}

async fn reader_task<R>(mut reader: BufReader<R>, replies: ReplyMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: closed");
                fail_all(&replies, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    route_line(trimmed, &replies, &event_tx).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: {}", e);
                fail_all(&replies, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<IpcRequest>, replies: ReplyMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register first so a fast reply finds its waiter
        replies.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.line.as_bytes()).await {
            warn!("mpv writer: {}", e);
            if let Some(tx) = replies.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Maps raw mpv messages to engine signals.
///
/// `current_entry` is the playlist entry of the last accepted `loadfile`
/// (0 = unknown).  `end-file` and `file-loaded` for other entries belong to a
/// replaced source and are dropped.  `file-loaded` carries no entry id, so the
/// one announced by the preceding `start-file` is used.
#[derive(Debug, Default)]
pub struct EventTranslator {
    opening: u64,
}

impl EventTranslator {
    pub fn translate(&mut self, evt: &MpvEvent, current_entry: u64) -> Option<EngineEvent> {
        if evt.name() == Some("start-file") {
            self.opening = evt.playlist_entry_id().unwrap_or(0);
            return None;
        }
        if evt.name() == Some("file-loaded")
            && current_entry != 0
            && self.opening != 0
            && self.opening != current_entry
        {
            debug!("mpv: file-loaded for replaced entry {}", self.opening);
            return None;
        }
        translate(evt, current_entry)
    }
}

fn translate(evt: &MpvEvent, current_entry: u64) -> Option<EngineEvent> {
    if let Some((id, data)) = evt.property_change() {
        return match id {
            OBS_PAUSE => Some(EngineEvent::Pause(data.as_bool().unwrap_or(false))),
            OBS_TIME_POS => Some(EngineEvent::TimePos(data.as_f64())),
            OBS_DURATION => Some(EngineEvent::Duration(data.as_f64())),
            _ => None,
        };
    }

    match evt.name()? {
        "file-loaded" => Some(EngineEvent::Started),
        "end-file" => {
            if let Some(entry) = evt.playlist_entry_id() {
                if current_entry != 0 && entry != current_entry {
                    debug!("mpv: end-file for replaced entry {}", entry);
                    return None;
                }
            }
            match evt.raw.get("reason").and_then(Value::as_str).unwrap_or("") {
                "eof" => Some(EngineEvent::Ended),
                "error" => {
                    let detail = evt
                        .raw
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("playback error");
                    Some(EngineEvent::Failed(detail.to_string()))
                }
                // stop / quit / redirect: replaced or shut down on purpose
                _ => None,
            }
        }
        _ => None,
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    events: mpsc::Sender<EngineEvent>,
    current_entry: Arc<AtomicU64>,
    volume: f32,
}

impl MpvEngine {
    pub fn new(events: mpsc::Sender<EngineEvent>, volume: f32) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            events,
            current_entry: Arc::new(AtomicU64::new(0)),
            volume,
        }
    }

    async fn health(&self, health: EngineHealth) {
        let _ = self.events.send(EngineEvent::Health(health)).await;
    }

    async fn ensure_handle(&mut self) -> EngineResult<MpvHandle> {
        // no Dead report here: it would reach the core after the new load
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, respawning");
            self.handle = None;
        }
        if let Some(handle) = self.handle.as_ref() {
            return Ok(handle.clone());
        }

        self.health(EngineHealth::Starting).await;
        let (raw_tx, mut raw_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = match self.driver.spawn(self.volume, raw_tx).await {
            Ok(h) => h,
            Err(e) => {
                self.health(EngineHealth::Dead).await;
                return Err(EngineError::Unavailable(e.to_string()));
            }
        };

        let events = self.events.clone();
        let current_entry = self.current_entry.clone();
        tokio::spawn(async move {
            let mut translator = EventTranslator::default();
            while let Some(evt) = raw_rx.recv().await {
                let entry = current_entry.load(Ordering::Relaxed);
                if let Some(signal) = translator.translate(&evt, entry) {
                    if events.send(signal).await.is_err() {
                        break;
                    }
                }
            }
        });

        handle.observe_properties().await;
        self.health(EngineHealth::Running).await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    async fn load(&mut self, url: &str, volume: f32) -> EngineResult<()> {
        let handle = self.ensure_handle().await?;
        // replace stops the current file; a bad source surfaces as end-file error
        let reply = handle.send(json!(["loadfile", url, "replace"])).await?;
        let entry = reply
            .get("data")
            .and_then(|d| d.get("playlist_entry_id"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.current_entry.store(entry, Ordering::Relaxed);
        self.volume = volume;
        handle.set_property("volume", json!(volume_percent(volume))).await?;
        handle.set_property("pause", json!(false)).await?;
        Ok(())
    }

    async fn set_pause(&mut self, paused: bool) -> EngineResult<()> {
        let handle = self.ensure_handle().await?;
        handle.set_property("pause", json!(paused)).await?;
        Ok(())
    }

    async fn seek_to(&mut self, secs: f64) -> EngineResult<()> {
        let handle = self.ensure_handle().await?;
        handle.set_property("time-pos", json!(secs)).await?;
        Ok(())
    }

    async fn set_volume(&mut self, volume: f32) -> EngineResult<()> {
        self.volume = volume;
        // no process yet: the value is applied at spawn
        if let Some(handle) = self.handle.as_ref() {
            handle
                .set_property("volume", json!(volume_percent(volume)))
                .await?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> EngineResult<()> {
        if let Some(handle) = self.handle.as_ref() {
            handle.send(json!(["stop"])).await?;
        }
        self.current_entry.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn check_alive(&mut self) -> bool {
        if self.handle.is_none() {
            return true;
        }
        if self.driver.process_alive() {
            return true;
        }
        self.handle = None;
        false
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.send(json!(["quit"])).await;
        }
        self.driver.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_file_loaded_of_replaced_entry_is_dropped() {
        let mut t = EventTranslator::default();
        let loaded = evt(json!({"event": "file-loaded"}));

        // entry 3 was superseded by entry 4 before it finished opening
        assert_eq!(t.translate(&evt(json!({"event": "start-file", "playlist_entry_id": 3})), 4), None);
        assert_eq!(t.translate(&loaded, 4), None);

        assert_eq!(t.translate(&evt(json!({"event": "start-file", "playlist_entry_id": 4})), 4), None);
        assert_eq!(t.translate(&loaded, 4), Some(EngineEvent::Started));
    }

    #[test]
    fn test_property_changes() {
        let e = evt(json!({"event": "property-change", "id": OBS_TIME_POS, "name": "time-pos", "data": 12.5}));
        assert_eq!(translate(&e, 0), Some(EngineEvent::TimePos(Some(12.5))));

        let e = evt(json!({"event": "property-change", "id": OBS_DURATION, "name": "duration"}));
        assert_eq!(translate(&e, 0), Some(EngineEvent::Duration(None)));

        let e = evt(json!({"event": "property-change", "id": OBS_PAUSE, "data": true}));
        assert_eq!(translate(&e, 0), Some(EngineEvent::Pause(true)));

        let e = evt(json!({"event": "property-change", "id": 99, "data": 1}));
        assert_eq!(translate(&e, 0), None);
    }

    #[test]
    fn test_end_file_reasons() {
        let eof = evt(json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 4}));
        assert_eq!(translate(&eof, 4), Some(EngineEvent::Ended));

        let err = evt(json!({"event": "end-file", "reason": "error", "file_error": "loading failed", "playlist_entry_id": 4}));
        assert_eq!(
            translate(&err, 4),
            Some(EngineEvent::Failed("loading failed".into()))
        );

        let stop = evt(json!({"event": "end-file", "reason": "stop", "playlist_entry_id": 4}));
        assert_eq!(translate(&stop, 4), None);
    }

    #[test]
    fn test_end_file_of_replaced_entry_is_dropped() {
        let eof = evt(json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 3}));
        assert_eq!(translate(&eof, 4), None);
        // unknown current entry: accept
        assert_eq!(translate(&eof, 0), Some(EngineEvent::Ended));
    }

    #[test]
    fn test_file_loaded_is_started() {
        let e = evt(json!({"event": "file-loaded"}));
        assert_eq!(translate(&e, 0), Some(EngineEvent::Started));
        assert_eq!(translate(&evt(json!({"event": "idle"})), 0), None);
    }

    #[tokio::test]
    async fn test_route_line_splits_replies_and_events() {
        let replies: ReplyMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let (tx, rx) = oneshot::channel();
        replies.lock().await.insert(7, tx);

        route_line(r#"{"request_id": 7, "error": "success", "data": null}"#, &replies, &event_tx).await;
        route_line(r#"{"event": "file-loaded"}"#, &replies, &event_tx).await;
        route_line("not json", &replies, &event_tx).await;

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(event_rx.recv().await.unwrap().name(), Some("file-loaded"));
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_line_error_reply() {
        let replies: ReplyMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _event_rx) = mpsc::channel(4);
        let (tx, rx) = oneshot::channel();
        replies.lock().await.insert(9, tx);
        route_line(r#"{"request_id": 9, "error": "property unavailable"}"#, &replies, &event_tx).await;
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("property unavailable"));
    }
}
