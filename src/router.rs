//! Request Router — correlates JSON-RPC requests crossing the HTTP boundary
//! with responses coming back on the child's stdout, by id when possible
//! and by session/broadcast otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// JSON-RPC ids may be a string, an integer, or (rarely) a float. `Value`'s
/// own equality is almost right but treats `1` and `1.0` differently from
/// how most JSON-RPC peers intend id matching, so this type normalizes
/// numeric ids before comparing.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcId {
    String(String),
    Number(f64),
}

impl JsonRpcId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(JsonRpcId::String(s.clone())),
            Value::Number(n) => n.as_f64().map(JsonRpcId::Number),
            _ => None,
        }
    }

    /// The reserved ids used by the discovery handshake.
    pub fn is_reserved(&self) -> bool {
        matches!(self, JsonRpcId::Number(n) if *n == 1.0 || *n == 2.0)
    }
}

impl std::hash::Hash for JsonRpcId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            JsonRpcId::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            JsonRpcId::Number(n) => {
                1u8.hash(state);
                n.to_bits().hash(state);
            }
        }
    }
}
impl Eq for JsonRpcId {}

/// A request awaiting a response from the child, and how to deliver it.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    /// A synchronous POST: send exactly one HTTP response then close.
    Sync { connection_id: String },
    /// A streamable-upgrade or session-bound POST: write a chunk onto the
    /// connection's open stream, then continue (the stream itself outlives
    /// any single response).
    Stream { connection_id: String },
}

/// Tracks outstanding id-keyed requests and id-to-session routing for one
/// bridged child's egress traffic.
#[derive(Default)]
pub struct Router {
    pending_by_id: Mutex<HashMap<JsonRpcId, PendingRequest>>,
    id_to_session: Mutex<HashMap<JsonRpcId, String>>,
    discovery_in_flight: AtomicBool,
}

/// What the router decided to do with one line of child stdout.
pub enum Dispatch {
    /// Deliver to exactly this pending request.
    ToPending(PendingRequest),
    /// No exact id match; deliver to this session's live SSE connection.
    ToSession(String),
    /// No id or session match; broadcast as a notification to every active
    /// SSE connection.
    Broadcast,
}

impl Router {
    pub fn new() -> Self {
        Self {
            pending_by_id: Mutex::new(HashMap::new()),
            id_to_session: Mutex::new(HashMap::new()),
            discovery_in_flight: AtomicBool::new(false),
        }
    }

    pub fn begin_discovery(&self) {
        self.discovery_in_flight.store(true, Ordering::SeqCst);
    }

    pub fn end_discovery(&self) {
        self.discovery_in_flight.store(false, Ordering::SeqCst);
    }

    fn discovery_active(&self) -> bool {
        self.discovery_in_flight.load(Ordering::SeqCst)
    }

    /// Registers an inbound request's id so the matching response can be
    /// routed back. Overwrites any prior pending entry for the same id —
    /// on a duplicate id the most recent caller wins.
    pub async fn register(&self, id: JsonRpcId, pending: PendingRequest, session: Option<String>) {
        if let Some(old) = self
            .pending_by_id
            .lock()
            .await
            .insert(id.clone(), pending)
        {
            warn!("duplicate JSON-RPC id registered, replacing prior pending request");
            let _ = old;
        }
        if let Some(session) = session {
            self.id_to_session.lock().await.insert(id, session);
        }
    }

    /// Returns `true` if `id` must be rejected locally because discovery is
    /// in flight and this id is one of the two reserved handshake ids.
    pub fn is_shadowed(&self, id: &JsonRpcId) -> bool {
        self.discovery_active() && id.is_reserved()
    }

    /// Resolves how to dispatch one line of output from the child.
    pub async fn dispatch_line(&self, line: &str) -> Dispatch {
        let parsed: Option<Value> = serde_json::from_str(line).ok();
        let id = parsed
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(JsonRpcId::from_value);

        let Some(id) = id else {
            debug!("child output carried no id, broadcasting as notification");
            return Dispatch::Broadcast;
        };

        if let Some(pending) = self.pending_by_id.lock().await.remove(&id) {
            self.id_to_session.lock().await.remove(&id);
            return Dispatch::ToPending(pending);
        }

        if let Some(session) = self.id_to_session.lock().await.remove(&id) {
            return Dispatch::ToSession(session);
        }

        Dispatch::Broadcast
    }

    pub async fn pending_count(&self) -> usize {
        self.pending_by_id.lock().await.len()
    }
}

/// Extracts the `clientInfo.name` field from an `initialize` request body,
/// if present.
pub fn extract_client_info_name(body: &Value) -> Option<String> {
    body.get("params")?
        .get("clientInfo")?
        .get("name")?
        .as_str()
        .map(|s| s.to_string())
}

pub fn is_initialize_request(body: &Value) -> bool {
    body.get("method").and_then(|m| m.as_str()) == Some("initialize")
}

pub fn is_notification(body: &Value) -> bool {
    body.get("id").is_none()
}

/// Ensures a line written to the child's stdin ends with exactly one `\n`.
pub fn ensure_trailing_newline(mut line: String) -> String {
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

/// Builds the local JSON-RPC error response for a request whose id collided
/// with a reserved discovery id.
pub fn reserved_id_error(id: &Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32600,
            "message": "id reserved for tool discovery"
        }
    })
}

pub type SharedRouter = Arc<Router>;
