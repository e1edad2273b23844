/// mpv media transport over JSON IPC.
///
/// ```text
///   MpvTransport::spawn()
///         │
///         ├── writer  ← IpcRequest via mpsc, one JSON line each → socket
///         └── reader  ← JSON lines from socket
///                          ├── has request_id → matching oneshot reply
///                          └── event          → TransportEvent channel
/// ```
///
/// Position, duration and pause state are not polled: `pause`, `time-pos`
/// and `duration` are registered with `observe_property` once after connect
/// and mpv pushes a `property-change` line whenever one changes.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::playback::{Transport, TransportError, TransportEvent};

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

const OBS_PAUSE: u64 = 1;
const OBS_TIME_POS: u64 = 2;
const OBS_DURATION: u64 = 3;

type Reply = oneshot::Sender<Result<Value, TransportError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct IpcRequest {
    id: u64,
    line: String,
    reply: Reply,
}

pub struct MpvTransport {
    requests: mpsc::Sender<IpcRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    /// Killed on drop.
    _child: Option<tokio::process::Child>,
    socket: Option<PathBuf>,
}

impl MpvTransport {
    /// Start an idle mpv and connect to its IPC socket.  Property changes
    /// arrive on the returned receiver.
    #[cfg(unix)]
    pub async fn spawn(
        volume: f32,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        use podcast_proto::platform;
        use tokio::net::UnixStream;

        let binary = platform::find_mpv_binary().ok_or(TransportError::NotReady)?;
        let socket = platform::mpv_socket_path();
        let _ = tokio::fs::remove_file(&socket).await;

        let child = tokio::process::Command::new(&binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(format!("--input-ipc-server={}", socket.display()))
            .arg(format!(
                "--volume={}",
                (volume * 100.0).clamp(0.0, 100.0).round() as i64
            ))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!("[mpv] spawned {:?} pid={:?}", binary, child.id());

        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !socket.exists() {
            warn!("[mpv] IPC socket {:?} never appeared", socket);
            return Err(TransportError::NotReady);
        }

        let stream = UnixStream::connect(&socket).await?;
        info!("[mpv] connected to {:?}", socket);

        let (events_tx, events_rx) = mpsc::channel(64);
        let mut transport = Self::from_stream(stream, events_tx);
        transport._child = Some(child);
        transport.socket = Some(socket);
        transport.observe_properties().await;
        Ok((transport, events_rx))
    }

    #[cfg(not(unix))]
    pub async fn spawn(
        _volume: f32,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        Err(TransportError::NotReady)
    }

    /// Wire the reader and writer tasks onto an already-connected stream.
    #[cfg_attr(not(unix), allow(dead_code))]
    fn from_stream<S>(stream: S, events_tx: mpsc::Sender<TransportEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (requests, requests_rx) = mpsc::channel(64);

        tokio::spawn(writer(write_half, requests_rx, Arc::clone(&pending)));
        tokio::spawn(reader(
            BufReader::new(read_half),
            Arc::clone(&pending),
            events_tx,
        ));

        Self {
            requests,
            pending,
            next_id: AtomicU64::new(1),
            _child: None,
            socket: None,
        }
    }

    /// Send one command and wait for mpv's reply.  A reply whose `error` is
    /// not `"success"` becomes [`TransportError::Rejected`].
    async fn command(&self, command: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": id }))
            .map_err(|e| TransportError::Ipc(e.to_string()))?;
        line.push('\n');

        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(IpcRequest { id, line, reply })
            .await
            .map_err(|_| TransportError::NotReady)?;

        let response = match tokio::time::timeout(IPC_TIMEOUT, reply_rx).await {
            Ok(reply) => reply
                .map_err(|_| TransportError::Ipc(format!("reply dropped for request {}", id)))??,
            Err(_) => {
                // a late reply is logged as unknown by the reader
                self.pending.lock().await.remove(&id);
                return Err(TransportError::Ipc(format!("timeout for request {}", id)));
            }
        };

        match response.get("error").and_then(Value::as_str) {
            Some("success") => Ok(response.get("data").cloned().unwrap_or(Value::Null)),
            other => Err(TransportError::Rejected(
                other.unwrap_or("unknown error").to_string(),
            )),
        }
    }

    async fn observe_properties(&self) {
        for (id, name) in [
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
        ] {
            match self.command(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("[mpv] observing {} as {}", name, id),
                Err(e) => warn!("[mpv] observe_property {} failed: {}", name, e),
            }
        }
    }
}

impl Drop for MpvTransport {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = std::fs::remove_file(socket);
        }
    }
}

impl Transport for MpvTransport {
    async fn load(&self, url: &str) -> Result<(), TransportError> {
        debug!("[mpv] loadfile {}", url);
        self.command(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    async fn play(&self) -> Result<(), TransportError> {
        self.command(json!(["set_property", "pause", false])).await?;
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        self.command(json!(["set_property", "pause", true])).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.command(json!(["stop"])).await?;
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<(), TransportError> {
        self.command(json!(["seek", seconds, "absolute"])).await?;
        Ok(())
    }
}

/// Translate an unsolicited mpv line into a transport event.
fn parse_event(raw: &Value) -> Option<TransportEvent> {
    match raw.get("event")?.as_str()? {
        "property-change" => {
            let data = raw.get("data").unwrap_or(&Value::Null);
            match raw.get("id")?.as_u64()? {
                OBS_PAUSE => data.as_bool().map(TransportEvent::Paused),
                OBS_TIME_POS => data.as_f64().map(TransportEvent::Position),
                OBS_DURATION => Some(TransportEvent::Duration(data.as_f64())),
                _ => None,
            }
        }
        // "stop" and "redirect" come from our own loadfile/stop commands
        "end-file" => match raw.get("reason").and_then(Value::as_str) {
            Some("eof") | Some("error") => Some(TransportEvent::Ended),
            _ => None,
        },
        _ => None,
    }
}

async fn reader<R>(mut reader: BufReader<R>, pending: PendingMap, events_tx: mpsc::Sender<TransportEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "connection closed".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read error: {}", e),
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!("[mpv] skipping malformed line {:?}: {}", trimmed, e);
                continue;
            }
        };

        if let Some(id) = raw.get("request_id").and_then(Value::as_u64) {
            match pending.lock().await.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(Ok(raw));
                }
                None => debug!("[mpv] reply for unknown request {}", id),
            }
        } else if let Some(event) = parse_event(&raw) {
            if events_tx.send(event).await.is_err() {
                debug!("[mpv] event receiver gone");
            }
        }
    };

    debug!("[mpv] reader exiting: {}", reason);
    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err(TransportError::Ipc(reason.clone())));
    }
}

async fn writer<W>(mut writer: W, mut requests: mpsc::Receiver<IpcRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = requests.recv().await {
        // register first so the reader can always match the reply
        pending.lock().await.insert(req.id, req.reply);
        debug!("[mpv] → {}", req.line.trim());
        if let Err(e) = writer.write_all(req.line.as_bytes()).await {
            warn!("[mpv] write failed: {}", e);
            if let Some(reply) = pending.lock().await.remove(&req.id) {
                let _ = reply.send(Err(TransportError::Io(e)));
            }
            break;
        }
    }
    debug!("[mpv] writer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Answers every command; refuses to unpause and reports the seek target
    /// as a time-pos change before replying.
    async fn fake_mpv(stream: DuplexStream) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["request_id"].as_u64().unwrap();
            let cmd = &req["command"];
            if cmd[0] == "seek" {
                let event = json!({"event": "property-change", "id": OBS_TIME_POS, "name": "time-pos", "data": cmd[1]});
                write_half
                    .write_all(format!("{}\n", event).as_bytes())
                    .await
                    .unwrap();
            }
            let error = if cmd[0] == "set_property" && cmd[1] == "pause" && cmd[2] == false {
                "property unavailable"
            } else {
                "success"
            };
            let reply = json!({"request_id": id, "error": error, "data": null});
            write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_parse_property_changes() {
        let ev = |v: Value| parse_event(&v);
        assert_eq!(
            ev(json!({"event":"property-change","id":OBS_TIME_POS,"data":12.5})),
            Some(TransportEvent::Position(12.5))
        );
        assert_eq!(
            ev(json!({"event":"property-change","id":OBS_DURATION,"data":null})),
            Some(TransportEvent::Duration(None))
        );
        assert_eq!(
            ev(json!({"event":"property-change","id":OBS_PAUSE,"data":true})),
            Some(TransportEvent::Paused(true))
        );
        // time-pos is null while idle
        assert_eq!(
            ev(json!({"event":"property-change","id":OBS_TIME_POS,"data":null})),
            None
        );
    }

    #[test]
    fn test_parse_end_file_reasons() {
        assert_eq!(
            parse_event(&json!({"event":"end-file","reason":"eof"})),
            Some(TransportEvent::Ended)
        );
        assert_eq!(parse_event(&json!({"event":"end-file","reason":"stop"})), None);
        assert_eq!(parse_event(&json!({"event":"file-loaded"})), None);
    }

    #[tokio::test]
    async fn test_commands_and_events_over_ipc() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(fake_mpv(server));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let transport = MpvTransport::from_stream(client, events_tx);

        transport.load("http://localhost:8000/audio/a.mp3").await.unwrap();
        transport.seek(42.0).await.unwrap();
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Position(42.0)));

        match transport.play().await {
            Err(TransportError::Rejected(reason)) => assert_eq!(reason, "property unavailable"),
            other => panic!("expected rejection, got {:?}", other),
        }
        transport.pause().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_connection_drops() {
        let (client, server) = tokio::io::duplex(4096);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let transport = MpvTransport::from_stream(client, events_tx);
        drop(server);
        assert!(transport.stop().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_is_forgotten() {
        let (client, _server) = tokio::io::duplex(4096);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let transport = MpvTransport::from_stream(client, events_tx);

        match transport.stop().await {
            Err(TransportError::Ipc(reason)) => assert!(reason.contains("timeout"), "{}", reason),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(transport.pending.lock().await.is_empty());
    }
}
