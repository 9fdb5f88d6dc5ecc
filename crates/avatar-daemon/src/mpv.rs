/// mpv-backed video display with separated reader/writer IPC tasks.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → DisplaySignal channel
/// ```
///
/// The window is kept open between clips (`--keep-open`, `--force-window`),
/// so the last frame stays on screen while the next file loads.  End of a
/// clip is detected through the observed `eof-reached` property, readiness
/// through `playback-restart`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::display::{Display, DisplaySignal, Frame};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `eof-reached`.
pub const OBS_EOF_REACHED: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value>>,
}

/// Translate an unsolicited mpv message into a display signal.  mpv events
/// do not name the file they belong to, so `Ended` and `Ready` go out
/// anonymous and the stage decides whether they are current.
fn signal_for(raw: &Value) -> Option<DisplaySignal> {
    match raw.get("event")?.as_str()? {
        "property-change" => {
            let id = raw.get("id")?.as_u64()?;
            let reached = raw.get("data").and_then(Value::as_bool).unwrap_or(false);
            (id == OBS_EOF_REACHED && reached).then_some(DisplaySignal::Ended(None))
        }
        "playback-restart" => Some(DisplaySignal::Ready(None)),
        "end-file" if raw.get("reason").and_then(Value::as_str) == Some("error") => {
            let detail = raw
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Some(DisplaySignal::Failed(detail.to_string()))
        }
        _ => None,
    }
}

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> Result<Value> {
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

    pub async fn load(&self, target: &str) -> Result<()> {
        self.send(json!(["loadfile", target, "replace"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn set_loop(&self, looped: bool) -> Result<()> {
        let value = if looped { "inf" } else { "no" };
        self.send(json!(["set_property", "loop-file", value])).await?;
        Ok(())
    }

    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        match self
            .send(json!(["observe_property", OBS_EOF_REACHED, "eof-reached"]))
            .await
        {
            Ok(_) => debug!("mpv: observing eof-reached"),
            Err(e) => warn!("mpv: observe_property eof-reached failed: {}", e),
        }
    }
}

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: avatar_proto::platform::mpv_socket_name(),
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

    fn command(&self) -> Result<tokio::process::Command> {
        let mpv_binary = avatar_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--keep-open=yes")
            .arg("--image-display-duration=inf")
            .arg("--no-osc")
            .arg("--osd-level=0")
            .arg("--no-input-default-bindings")
            .arg("--title=avatar")
            .arg(avatar_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        signal_tx: mpsc::Sender<DisplaySignal>,
    ) -> Result<MpvHandle> {
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning display window");
        self.process = Some(self.command()?.spawn()?);

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
        Ok(start_io_tasks(BufReader::new(read_half), write_half, signal_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        signal_tx: mpsc::Sender<DisplaySignal>,
    ) -> Result<MpvHandle> {
        self.kill().await;

        info!("mpv: spawning display window");
        self.process = Some(self.command()?.spawn()?);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, signal_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    signal_tx: mpsc::Sender<DisplaySignal>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel, shared between writer (inserts) and reader (resolves)
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, signal_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    signal_tx: mpsc::Sender<DisplaySignal>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
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
                        let result = match val["error"].as_str() {
                            Some("success") => Ok(val),
                            other => Err(anyhow::anyhow!(
                                "mpv error: {}",
                                other.unwrap_or("unknown error")
                            )),
                        };
                        let _ = tx.send(result);
                    }
                } else if let Some(signal) = signal_for(&val) {
                    debug!("mpv reader: {:?}", signal);
                    if signal_tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
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
        // Register before writing so the reader can match the reply
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

/// `Display` implementation driving a local mpv window.  The window is
/// (re)spawned lazily when a command finds the process gone.
pub struct MpvDisplay {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    signal_tx: mpsc::Sender<DisplaySignal>,
}

impl MpvDisplay {
    pub fn new(signal_tx: mpsc::Sender<DisplaySignal>) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            signal_tx,
        }
    }

    async fn handle(&mut self) -> Result<MpvHandle> {
        if let Some(handle) = &self.handle {
            if self.driver.process_alive() {
                return Ok(handle.clone());
            }
            warn!("mpv: display process gone, respawning");
        }
        let handle = self.driver.spawn_and_connect(self.signal_tx.clone()).await?;
        handle.observe_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl Display for MpvDisplay {
    async fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        let mpv = self.handle().await?;
        match frame {
            // keep-open leaves the last frame up; pausing pins it there
            Frame::LastRendered => mpv.set_pause(true).await,
            Frame::Fallback(image) => {
                if !image.exists() {
                    warn!("mpv: fallback image {} missing", image.display());
                    return Ok(());
                }
                mpv.set_loop(false).await?;
                mpv.load(&image.to_string_lossy()).await?;
                mpv.set_pause(false).await
            }
        }
    }

    async fn hide_frame(&mut self) -> Result<()> {
        // The new clip is already on screen once mpv restarted playback
        Ok(())
    }

    async fn play_clip(&mut self, url: &str, looped: bool) -> Result<()> {
        let mpv = self.handle().await?;
        mpv.set_loop(looped).await?;
        mpv.load(url).await?;
        mpv.set_pause(false).await
    }

    async fn shutdown(&mut self) {
        if let Some(mpv) = self.handle.take() {
            let _ = mpv.send(json!(["quit"])).await;
        }
        self.driver.kill().await;
    }
}
