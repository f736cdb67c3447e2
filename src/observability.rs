//! Observability Hooks — broadcast channels so observers (a UI, a test, a
//! metrics exporter) can watch a bridge's lifecycle without the bridge ever
//! blocking on a slow or absent subscriber.

use tokio::sync::broadcast;

use crate::config::ToolInfo;
use crate::orchestrator::BridgeStatus;

/// Capacity of each broadcast channel. A slow subscriber that falls behind
/// this many events starts missing the oldest ones rather than stalling
/// the bridge — `tokio::sync::broadcast`'s documented lagging behavior.
const CHANNEL_CAPACITY: usize = 256;

/// One line appended to a child's log (its own stderr, or a bridge-internal
/// note), tagged with a source for display.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub child_id: String,
    pub source: LogSource,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    ChildStderr,
    Bridge,
}

#[derive(Debug, Clone)]
pub struct StatusChange {
    pub child_id: String,
    pub status: BridgeStatus,
}

#[derive(Debug, Clone)]
pub struct ActiveClientsChange {
    pub child_id: String,
    pub client_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolsChange {
    pub child_id: String,
    pub tools: Vec<ToolInfo>,
}

/// The four hooks a `BridgeSet` (or an individual `BridgeInstance`) exposes
/// to observers. Each is an independent broadcast channel so a subscriber
/// interested only in status changes doesn't pay for log volume.
pub struct ObservabilityHooks {
    pub log: broadcast::Sender<LogLine>,
    pub status: broadcast::Sender<StatusChange>,
    pub active_clients: broadcast::Sender<ActiveClientsChange>,
    pub tools: broadcast::Sender<ToolsChange>,
}

impl Default for ObservabilityHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilityHooks {
    pub fn new() -> Self {
        Self {
            log: broadcast::channel(CHANNEL_CAPACITY).0,
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            active_clients: broadcast::channel(CHANNEL_CAPACITY).0,
            tools: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Sends are fire-and-forget: `send` only errors when there are zero
    /// receivers, which simply means nobody is watching right now.
    pub fn emit_log(&self, child_id: &str, source: LogSource, line: String) {
        let _ = self.log.send(LogLine {
            child_id: child_id.to_string(),
            source,
            line,
        });
    }

    pub fn emit_status(&self, child_id: &str, status: BridgeStatus) {
        let _ = self.status.send(StatusChange {
            child_id: child_id.to_string(),
            status,
        });
    }

    pub fn emit_active_clients(&self, child_id: &str, client_names: Vec<String>) {
        let _ = self.active_clients.send(ActiveClientsChange {
            child_id: child_id.to_string(),
            client_names,
        });
    }

    pub fn emit_tools(&self, child_id: &str, tools: Vec<ToolInfo>) {
        let _ = self.tools.send(ToolsChange {
            child_id: child_id.to_string(),
            tools,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let hooks = ObservabilityHooks::new();
        hooks.emit_log("gh", LogSource::Bridge, "started".to_string());
        hooks.emit_status("gh", BridgeStatus::Starting);
    }

    #[tokio::test]
    async fn test_subscriber_receives_status_change() {
        let hooks = ObservabilityHooks::new();
        let mut rx = hooks.status.subscribe();
        hooks.emit_status("gh", BridgeStatus::Running);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.child_id, "gh");
        assert_eq!(event.status, BridgeStatus::Running);
    }

    #[tokio::test]
    async fn test_subscriber_receives_tools_change() {
        let hooks = ObservabilityHooks::new();
        let mut rx = hooks.tools.subscribe();
        hooks.emit_tools(
            "gh",
            vec![ToolInfo {
                name: "search".to_string(),
                description: String::new(),
                params: Default::default(),
            }],
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tools.len(), 1);
    }
}
