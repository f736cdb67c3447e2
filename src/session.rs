//! Session Registry — logical client identity that survives reconnecting
//! TCP sockets, keyed by an opaque `sessionId`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// How long an uninitialized session (never completed the MCP `initialize`
/// handshake) is kept around after its connection drops before eviction.
const UNINITIALIZED_GRACE: Duration = Duration::from_secs(5);

/// Absolute ceiling on how long any uninitialized session can linger,
/// regardless of reconnect attempts, before the sweep reclaims it.
const UNINITIALIZED_HARD_LIMIT: Duration = Duration::from_secs(30);

/// How long an initialized session is kept around after its connection
/// drops, to tolerate the client reconnecting with the same session id.
const INITIALIZED_GRACE: Duration = Duration::from_secs(60 * 60);

/// A logical client, identified by `sessionId`, independent of which TCP
/// connection currently carries its traffic.
#[derive(Debug, Clone)]
pub struct LogicalSession {
    pub session_id: String,
    /// Display name, once resolved. Sticky: once set from `clientInfo.name`
    /// it is never overwritten by a weaker source (User-Agent).
    pub display_name: Option<String>,
    pub name_is_sticky: bool,
    pub initialized: bool,
    pub last_seen: Instant,
    /// The connection id currently serving this session's SSE stream, if any.
    pub bound_connection: Option<String>,
}

impl LogicalSession {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            display_name: None,
            name_is_sticky: false,
            initialized: false,
            last_seen: Instant::now(),
            bound_connection: None,
        }
    }

    fn grace_deadline(&self) -> Duration {
        if self.initialized {
            INITIALIZED_GRACE
        } else {
            UNINITIALIZED_GRACE
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        let since = now.duration_since(self.last_seen);
        if !self.initialized && since > UNINITIALIZED_HARD_LIMIT {
            return true;
        }
        since > self.grace_deadline()
    }
}

/// Tracks every logical session for one bridged child.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, LogicalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Touches (creating if necessary) the session, recording activity and
    /// optionally binding it to a live SSE connection.
    pub async fn touch(&self, session_id: &str, connection: Option<&str>) {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LogicalSession::new(session_id.to_string()));
        entry.last_seen = Instant::now();
        if let Some(conn) = connection {
            entry.bound_connection = Some(conn.to_string());
        }
    }

    /// Marks a session as having completed the `initialize` handshake,
    /// extending its grace period on disconnect.
    pub async fn mark_initialized(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.initialized = true;
        }
    }

    /// Sets the display name if the new source is at least as strong as the
    /// existing one. `sticky` sources (client-reported `clientInfo.name`)
    /// always win and latch; a non-sticky source (User-Agent) only fills in
    /// an unset name and never overwrites a sticky one.
    pub async fn set_name(&self, session_id: &str, name: String, sticky: bool) {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LogicalSession::new(session_id.to_string()));
        if entry.name_is_sticky && !sticky {
            return;
        }
        entry.display_name = Some(clean_name(&name));
        entry.name_is_sticky = entry.name_is_sticky || sticky;
    }

    pub async fn unbind_connection(&self, connection: &str) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.bound_connection.as_deref() == Some(connection) {
                session.bound_connection = None;
            }
        }
    }

    /// Removes sessions past their grace period. Returns the ids evicted.
    pub async fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.bound_connection.is_none() && s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            debug!(session = %id, "evicted expired session");
        }
        expired
    }

    /// Active clients, deduplicated by session id, sorted by display name
    /// (falling back to the session id for unnamed sessions).
    pub async fn active_clients(&self) -> Vec<LogicalSession> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<LogicalSession> = sessions
            .values()
            .filter(|s| s.bound_connection.is_some())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let key_a = a.display_name.clone().unwrap_or_else(|| a.session_id.clone());
            let key_b = b.display_name.clone().unwrap_or_else(|| b.session_id.clone());
            key_a.cmp(&key_b)
        });
        out
    }

    pub async fn get(&self, session_id: &str) -> Option<LogicalSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}

/// Cleans up a raw name source (MCP `clientInfo.name` or a User-Agent
/// header) into something presentable, recognizing a handful of common
/// client identities and otherwise taking a reasonable head substring.
pub fn clean_name(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();

    if lower.contains("claude") {
        return "Claude".to_string();
    }
    if lower.contains("chatwise") {
        return "ChatWise".to_string();
    }
    if lower.contains("flowdown") {
        return "FlowDown".to_string();
    }
    if lower.contains("chrome") {
        return "Chrome".to_string();
    }
    if lower.contains("safari") && !lower.contains("chrome") {
        return "Safari".to_string();
    }
    if lower.contains("firefox") {
        return "Firefox".to_string();
    }
    if lower.to_lowercase().starts_with("mozilla") {
        return "Browser".to_string();
    }

    if let Some((head, _)) = raw.split_once('/') {
        if !head.is_empty() {
            return head.to_string();
        }
    }

    if raw.contains('.') && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        if let Some(last) = raw.rsplit('.').next() {
            let mut chars = last.chars();
            if let Some(first) = chars.next() {
                return first.to_ascii_uppercase().to_string() + chars.as_str();
            }
        }
    }

    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_touch_creates_session() {
        let registry = SessionRegistry::new();
        registry.touch("s1", None).await;
        assert!(registry.get("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_sticky_name_not_overwritten_by_weak_source() {
        let registry = SessionRegistry::new();
        registry.set_name("s1", "Claude Desktop".to_string(), true).await;
        registry.set_name("s1", "curl/8.0".to_string(), false).await;
        let session = registry.get("s1").await.unwrap();
        assert_eq!(session.display_name.unwrap(), "Claude");
    }

    #[tokio::test]
    async fn test_weak_source_fills_unset_name() {
        let registry = SessionRegistry::new();
        registry.set_name("s1", "curl/8.0".to_string(), false).await;
        let session = registry.get("s1").await.unwrap();
        assert_eq!(session.display_name.unwrap(), "curl");
    }

    #[tokio::test]
    async fn test_sweep_evicts_uninitialized_after_hard_limit() {
        let registry = SessionRegistry::new();
        registry.touch("s1", None).await;
        {
            let mut sessions = registry.sessions.lock().await;
            let s = sessions.get_mut("s1").unwrap();
            s.last_seen = Instant::now() - Duration::from_secs(31);
        }
        let evicted = registry.sweep().await;
        assert_eq!(evicted, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_keeps_bound_session_regardless_of_age() {
        let registry = SessionRegistry::new();
        registry.touch("s1", Some("conn1")).await;
        {
            let mut sessions = registry.sessions.lock().await;
            let s = sessions.get_mut("s1").unwrap();
            s.last_seen = Instant::now() - Duration::from_secs(120);
        }
        let evicted = registry.sweep().await;
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn test_active_clients_sorted_by_name() {
        let registry = SessionRegistry::new();
        registry.touch("s1", Some("c1")).await;
        registry.set_name("s1", "Zebra".to_string(), true).await;
        registry.touch("s2", Some("c2")).await;
        registry.set_name("s2", "Alpha".to_string(), true).await;
        let clients = registry.active_clients().await;
        assert_eq!(clients[0].display_name.as_deref(), Some("Alpha"));
        assert_eq!(clients[1].display_name.as_deref(), Some("Zebra"));
    }

    #[test]
    fn test_clean_name_recognizes_claude() {
        assert_eq!(clean_name("Claude-Desktop/1.2"), "Claude");
    }

    #[test]
    fn test_clean_name_browser_user_agent() {
        assert_eq!(
            clean_name("Mozilla/5.0 (Macintosh) Chrome/120.0"),
            "Chrome"
        );
    }

    #[test]
    fn test_clean_name_head_before_slash() {
        assert_eq!(clean_name("MyTool/2.0"), "MyTool");
    }

    #[test]
    fn test_clean_name_reverse_dns_last_segment() {
        assert_eq!(clean_name("com.example.widget"), "Widget");
    }
}
