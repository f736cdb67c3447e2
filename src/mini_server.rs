//! HTTP/1.1 Mini-Server — a hand-rolled socket-level server multiplexing
//! the four transports classified by [`crate::classifier`] onto one child's
//! stdin/stdout pipe. Built on raw `TcpListener`/`AsyncRead`/`AsyncWrite`
//! rather than a framework: the classifier needs to see request shape
//! before any body is committed to, responses need manual chunked writes
//! for SSE, and malformed/TLS-looking bytes need to be rejected before any
//! HTTP parsing is attempted at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classifier::{self, Transport};
use crate::error::{BridgeError, Result};
use crate::http::{self, RequestHead};
use crate::router::{self, JsonRpcId, PendingRequest, Router};
use crate::session::SessionRegistry;

/// How a stream connection's egress traffic is framed. Set once when the
/// stream is opened and never changes for that connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// `event: message\ndata: <line>\n\n` per message.
    Sse,
    /// `<line>\n` per message, no SSE framing.
    Raw,
}

impl StreamFormat {
    fn render(self, payload: &str) -> Vec<u8> {
        match self {
            StreamFormat::Sse => http::render_chunk(http::sse_event(payload).as_bytes()),
            StreamFormat::Raw => http::render_chunk(http::raw_line(payload).as_bytes()),
        }
    }

    fn keepalive(self) -> Vec<u8> {
        match self {
            StreamFormat::Sse => http::render_chunk(b": keepalive\n\n"),
            StreamFormat::Raw => http::render_chunk(b"\n"),
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            StreamFormat::Sse => "text/event-stream",
            StreamFormat::Raw => "application/x-ndjson",
        }
    }
}

/// Where a response (or stream of responses) destined for one connection
/// should be delivered. Registered under the connection's id so the
/// Request Router can find it again once the child answers.
enum ConnectionSink {
    /// A synchronous POST: exactly one JSON-RPC value, delivered once.
    Sync(oneshot::Sender<Value>),
    /// A long-lived stream (SSE, NDJSON, or streamable-upgrade): raw bytes
    /// written directly onto the socket's write half, framed per `format`.
    Stream(mpsc::Sender<Vec<u8>>, StreamFormat),
}

/// Tracks live connection sinks so the Request Router can deliver
/// egress traffic without knowing anything about sockets.
#[derive(Default)]
pub struct ConnectionRegistry {
    sinks: Mutex<HashMap<String, ConnectionSink>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_sync(&self, id: String, tx: oneshot::Sender<Value>) {
        self.sinks.lock().await.insert(id, ConnectionSink::Sync(tx));
    }

    pub async fn register_stream(&self, id: String, tx: mpsc::Sender<Vec<u8>>, format: StreamFormat) {
        self.sinks.lock().await.insert(id, ConnectionSink::Stream(tx, format));
    }

    pub async fn remove(&self, id: &str) {
        self.sinks.lock().await.remove(id);
    }

    /// Delivers a value to exactly one connection (used for `Sync` and
    /// session-bound dispatch). Returns `false` if the connection is gone.
    pub async fn deliver(&self, id: &str, value: Value) -> bool {
        let sink = self.sinks.lock().await.remove(id);
        match sink {
            Some(ConnectionSink::Sync(tx)) => tx.send(value).is_ok(),
            Some(ConnectionSink::Stream(tx, format)) => {
                let payload = format.render(&value.to_string());
                let ok = tx.send(payload).await.is_ok();
                if ok {
                    self.sinks
                        .lock()
                        .await
                        .insert(id.to_string(), ConnectionSink::Stream(tx, format));
                }
                ok
            }
            None => false,
        }
    }

    /// Broadcasts a notification to every live streaming connection, framed
    /// per each connection's own format.
    pub async fn broadcast(&self, value: &Value) {
        let sinks = self.sinks.lock().await;
        let line = value.to_string();
        for sink in sinks.values() {
            if let ConnectionSink::Stream(tx, format) = sink {
                let _ = tx.send(format.render(&line)).await;
            }
        }
    }
}

/// Shared state one Mini-Server instance needs to serve connections for a
/// single bridged child.
pub struct MiniServerState {
    pub child_id: String,
    pub bearer_token: Option<String>,
    pub host: String,
    pub port: u16,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub stdin_tx: mpsc::UnboundedSender<String>,
}

/// Runs the accept loop until the listener errors or the cancellation
/// token fires. Each connection is handled on its own task so one slow or
/// malicious client never blocks another.
pub async fn serve(
    listener: TcpListener,
    state: Arc<MiniServerState>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(child = %state.child_id, "mini-server shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let state = state.clone();
                        let conn_id = Uuid::new_v4().to_string();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, conn_id.clone(), state).await {
                                debug!(conn = %conn_id, peer = %addr, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(child = %state.child_id, error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn read_request_head(socket: &mut TcpStream) -> Result<(RequestHead, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket
            .read(&mut chunk)
            .await
            .map_err(|e| BridgeError::ProtocolGarbage("conn".to_string(), e.to_string()))?;
        if n == 0 {
            return Err(BridgeError::ProtocolGarbage(
                "conn".to_string(),
                "connection closed before headers completed".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if buf.len() >= 3 && http::looks_like_tls(&buf) {
            return Err(BridgeError::ProtocolGarbage(
                "conn".to_string(),
                "TLS ClientHello on plaintext port".to_string(),
            ));
        }

        if buf.len() > http::MAX_REQUEST_BYTES {
            return Err(BridgeError::ProtocolGarbage(
                "conn".to_string(),
                "request exceeded maximum size before headers completed".to_string(),
            ));
        }

        if let Some(header_end) = http::find_header_end(&buf) {
            let head = http::parse_head(&buf[..header_end])
                .ok_or_else(|| BridgeError::MalformedBody("conn".to_string(), "unparseable request line".to_string()))?;
            let rest = buf[header_end..].to_vec();
            return Ok((head, rest));
        }
    }
}

async fn read_body(socket: &mut TcpStream, head: &RequestHead, already: Vec<u8>) -> Result<Vec<u8>> {
    let content_length = head.content_length();
    if content_length == 0 {
        return Ok(already);
    }
    if content_length > http::MAX_REQUEST_BYTES {
        return Err(BridgeError::ProtocolGarbage(
            "conn".to_string(),
            "declared content-length exceeds maximum".to_string(),
        ));
    }

    let mut body = already;
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(65536)];
        let n = socket
            .read(&mut chunk)
            .await
            .map_err(|e| BridgeError::ProtocolGarbage("conn".to_string(), e.to_string()))?;
        if n == 0 {
            return Err(BridgeError::MalformedBody(
                "conn".to_string(),
                "connection closed before body completed".to_string(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

fn body_session_id(body: &Value) -> Option<String> {
    body.get("sessionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn unauthorized(expected: &Option<String>, head: &RequestHead) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let provided = head
        .header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "));
    provided != Some(expected.as_str())
}

async fn handle_connection(
    mut socket: TcpStream,
    conn_id: String,
    state: Arc<MiniServerState>,
) -> Result<()> {
    let (head, already_read) = read_request_head(&mut socket).await?;

    if unauthorized(&state.bearer_token, &head) {
        let body = http::render_short_response("401 Unauthorized", "application/json", b"{}");
        let _ = socket.write_all(&body).await;
        return Ok(());
    }

    let query = head.query.clone();

    let body_bytes = if head.method.eq_ignore_ascii_case("POST") {
        read_body(&mut socket, &head, already_read).await?
    } else {
        already_read
    };

    let parsed_body: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };

    let body_has_id = parsed_body
        .as_ref()
        .map(router::is_notification)
        .map(|is_notif| !is_notif)
        .unwrap_or(false);
    let body_session_id = parsed_body.as_ref().and_then(body_session_id);

    let transport = classifier::classify(
        &head,
        &query,
        parsed_body.is_some(),
        body_has_id,
        body_session_id.as_deref(),
    );

    match transport {
        Transport::Preflight => {
            socket.write_all(&http::render_preflight_response()).await.ok();
        }
        Transport::NotFound => {
            let body = http::render_short_response("404 Not Found", "application/json", b"{}");
            socket.write_all(&body).await.ok();
        }
        Transport::Sse { session_id } => {
            serve_stream(&mut socket, &conn_id, session_id, StreamFormat::Sse, true, &state).await?;
        }
        Transport::NdjsonStream { session_id } => {
            serve_stream(&mut socket, &conn_id, session_id, StreamFormat::Raw, false, &state).await?;
        }
        Transport::StreamableUpgrade => {
            let body = parsed_body.expect("classifier guarantees body present");
            forward_to_child(&state, &body, Some(&conn_id)).await?;
            serve_stream(&mut socket, &conn_id, None, StreamFormat::Sse, false, &state).await?;
        }
        Transport::SessionMessage { session_id } => {
            let body = parsed_body.expect("classifier guarantees body present");
            state.sessions.touch(&session_id, None).await;
            record_initialize_name(&state, &session_id, &body).await;
            forward_to_child(&state, &body, None).await?;
            let resp = http::render_short_response("202 Accepted", "application/json", b"{}");
            socket.write_all(&resp).await.ok();
        }
        Transport::Sync => {
            let body = parsed_body.expect("classifier guarantees body present");
            let (tx, rx) = oneshot::channel();
            state.connections.register_sync(conn_id.clone(), tx).await;
            if let Some(id) = body.get("id").and_then(JsonRpcId::from_value) {
                if state.router.is_shadowed(&id) {
                    state.connections.remove(&conn_id).await;
                    let err = router::reserved_id_error(body.get("id").unwrap());
                    let payload = err.to_string();
                    let resp = http::render_short_response("200 OK", "application/json", payload.as_bytes());
                    socket.write_all(&resp).await.ok();
                    return Ok(());
                }
                state
                    .router
                    .register(id, PendingRequest::Sync { connection_id: conn_id.clone() }, None)
                    .await;
            }
            forward_to_child(&state, &body, None).await?;

            match rx.await {
                Ok(value) => {
                    let payload = value.to_string();
                    let resp = http::render_short_response("200 OK", "application/json", payload.as_bytes());
                    socket.write_all(&resp).await.ok();
                }
                Err(_) => {
                    let resp = http::render_short_response("504 Gateway Timeout", "application/json", b"{}");
                    socket.write_all(&resp).await.ok();
                }
            }
        }
        Transport::Notification => {
            let body = parsed_body.expect("classifier guarantees body present");
            forward_to_child(&state, &body, None).await?;
            let resp = http::render_short_response("202 Accepted", "application/json", b"{}");
            socket.write_all(&resp).await.ok();
        }
    }

    Ok(())
}

async fn record_initialize_name(state: &MiniServerState, session_id: &str, body: &Value) {
    if router::is_initialize_request(body) {
        state.sessions.mark_initialized(session_id).await;
        if let Some(name) = router::extract_client_info_name(body) {
            state.sessions.set_name(session_id, name, true).await;
        }
    }
}

async fn forward_to_child(state: &MiniServerState, body: &Value, stream_conn: Option<&str>) -> Result<()> {
    if let (Some(conn_id), Some(id)) = (stream_conn, body.get("id").and_then(JsonRpcId::from_value)) {
        state
            .router
            .register(id, PendingRequest::Stream { connection_id: conn_id.to_string() }, None)
            .await;
    }
    let line = router::ensure_trailing_newline(body.to_string());
    state
        .stdin_tx
        .send(line)
        .map_err(|_| BridgeError::StdinWriteError(state.child_id.clone(), "child stdin channel closed".to_string()))
}

/// How often a keepalive is written onto an idle stream connection.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

async fn serve_stream(
    socket: &mut TcpStream,
    conn_id: &str,
    session_id: Option<String>,
    format: StreamFormat,
    emit_endpoint_event: bool,
    state: &Arc<MiniServerState>,
) -> Result<()> {
    let session_id = session_id.unwrap_or_else(|| conn_id.to_string());
    state.sessions.touch(&session_id, Some(conn_id)).await;

    socket
        .write_all(&http::render_stream_header(format.content_type(), &session_id))
        .await
        .map_err(|e| BridgeError::WriteError(conn_id.to_string(), e.to_string()))?;

    if emit_endpoint_event {
        let url = format!("http://{}:{}/message?sessionId={}", state.host, state.port, session_id);
        let event = http::render_chunk(http::sse_endpoint_event(&url).as_bytes());
        socket
            .write_all(&event)
            .await
            .map_err(|e| BridgeError::WriteError(conn_id.to_string(), e.to_string()))?;
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    state.connections.register_stream(conn_id.to_string(), tx, format).await;

    let mut discard = [0u8; 256];
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    loop {
        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        if socket.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            read = socket.read(&mut discard) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            _ = keepalive.tick() => {
                if socket.write_all(&format.keepalive()).await.is_err() {
                    break;
                }
            }
        }
    }

    state.connections.remove(conn_id).await;
    state.sessions.unbind_connection(conn_id).await;
    let _ = socket.write_all(&http::render_final_chunk()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_registry_sync_delivery() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register_sync("c1".to_string(), tx).await;
        let delivered = registry.deliver("c1", serde_json::json!({"ok": true})).await;
        assert!(delivered);
        assert_eq!(rx.await.unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_connection_registry_delivery_to_missing_connection() {
        let registry = ConnectionRegistry::new();
        let delivered = registry.deliver("ghost", serde_json::json!({})).await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_connection_registry_stream_broadcast() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register_stream("c1".to_string(), tx, StreamFormat::Sse).await;
        registry.broadcast(&serde_json::json!({"n": 1})).await;
        let bytes = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: message"));
        assert!(text.contains("\"n\":1"));
    }

    #[tokio::test]
    async fn test_connection_registry_raw_stream_framing() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register_stream("c1".to_string(), tx, StreamFormat::Raw).await;
        registry.broadcast(&serde_json::json!({"n": 1})).await;
        let bytes = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("event:"));
        assert!(text.contains("\"n\":1"));
    }

    #[test]
    fn test_unauthorized_rejects_missing_header() {
        let head = RequestHead {
            method: "GET".into(),
            path: "/".into(),
            query: HashMap::new(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert!(unauthorized(&Some("secret".to_string()), &head));
    }

    #[test]
    fn test_unauthorized_accepts_matching_bearer() {
        let head = RequestHead {
            method: "GET".into(),
            path: "/".into(),
            query: HashMap::new(),
            version: "HTTP/1.1".into(),
            headers: vec![("Authorization".to_string(), "Bearer secret".to_string())],
        };
        assert!(!unauthorized(&Some("secret".to_string()), &head));
    }

    #[test]
    fn test_unauthorized_allows_all_when_unset() {
        let head = RequestHead {
            method: "GET".into(),
            path: "/".into(),
            query: HashMap::new(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert!(!unauthorized(&None, &head));
    }
}
