//! Transport Classifier — decides which of the four transports an inbound
//! HTTP request belongs to, from the request line, headers, and query string
//! alone (the body has not necessarily been read yet when this runs).

use std::collections::HashMap;

use crate::http::RequestHead;

/// The transport an inbound request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// CORS preflight — always answered locally with a 204, never forwarded.
    Preflight,
    /// Long-lived GET that should be upgraded to an SSE event stream.
    Sse { session_id: Option<String> },
    /// Long-lived GET without an SSE `Accept` header — upgraded to a Raw
    /// NDJSON stream instead (one JSON line per message, no SSE framing).
    NdjsonStream { session_id: Option<String> },
    /// POST carrying a JSON-RPC message tied to an existing SSE session via
    /// `sessionId` (query or body) — accepted with 202, dispatched async.
    SessionMessage { session_id: String },
    /// POST with an `Accept: text/event-stream` header and no existing
    /// session — the "streamable HTTP" upgrade: the response to *this*
    /// request becomes the event stream.
    StreamableUpgrade,
    /// Synchronous POST: request carries a JSON-RPC `id`, no SSE upgrade, no
    /// session — the HTTP response is exactly the matching JSON-RPC reply.
    Sync,
    /// POST carrying a JSON-RPC notification (no `id`) — accepted with 202,
    /// nothing is returned to this caller.
    Notification,
    /// Doesn't match any transport shape.
    NotFound,
}

fn header<'a>(head: &'a RequestHead, name: &str) -> Option<&'a str> {
    head.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn wants_event_stream(head: &RequestHead) -> bool {
    header(head, "accept")
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn query_param<'a>(query: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    query.get(name).map(|s| s.as_str())
}

fn is_sse_path(path: &str) -> bool {
    matches!(path, "/" | "/sse" | "/events")
}

/// Classifies a request. `has_body` and `body_has_id` describe the POST
/// body without requiring the classifier itself to own parsing: the caller
/// has already attempted a best-effort JSON-RPC parse by the time it needs
/// a `Sync` vs `Notification` answer.
pub fn classify(
    head: &RequestHead,
    query: &HashMap<String, String>,
    body_present: bool,
    body_has_id: bool,
    body_session_id: Option<&str>,
) -> Transport {
    if head.method.eq_ignore_ascii_case("OPTIONS") {
        return Transport::Preflight;
    }

    if head.method.eq_ignore_ascii_case("GET") && is_sse_path(&head.path) {
        let session_id = query_param(query, "sessionId").map(|s| s.to_string());
        if wants_event_stream(head) {
            return Transport::Sse { session_id };
        }
        return Transport::NdjsonStream { session_id };
    }

    if head.method.eq_ignore_ascii_case("POST") {
        let session_id = query_param(query, "sessionId")
            .or(body_session_id)
            .map(|s| s.to_string());

        if let Some(session_id) = session_id {
            if body_present {
                return Transport::SessionMessage { session_id };
            }
            return Transport::NotFound;
        }

        if wants_event_stream(head) && body_present {
            return Transport::StreamableUpgrade;
        }

        if body_present {
            return if body_has_id {
                Transport::Sync
            } else {
                Transport::Notification
            };
        }
        return Transport::NotFound;
    }

    Transport::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, path: &str, headers: Vec<(&str, &str)>) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            path: path.to_string(),
            query: HashMap::new(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_options_is_preflight() {
        let h = head("OPTIONS", "/sse", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), false, false, None),
            Transport::Preflight
        );
    }

    #[test]
    fn test_get_sse_with_accept_header_upgrades() {
        let h = head("GET", "/sse", vec![("Accept", "text/event-stream")]);
        assert_eq!(
            classify(&h, &HashMap::new(), false, false, None),
            Transport::Sse { session_id: None }
        );
    }

    #[test]
    fn test_get_sse_without_accept_header_upgrades_to_ndjson() {
        let h = head("GET", "/sse", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), false, false, None),
            Transport::NdjsonStream { session_id: None }
        );
    }

    #[test]
    fn test_post_with_query_session_id_is_session_message() {
        let h = head("POST", "/messages", vec![]);
        let mut query = HashMap::new();
        query.insert("sessionId".to_string(), "abc".to_string());
        assert_eq!(
            classify(&h, &query, true, true, None),
            Transport::SessionMessage {
                session_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_post_with_sse_accept_no_session_is_streamable_upgrade() {
        let h = head("POST", "/", vec![("Accept", "text/event-stream")]);
        assert_eq!(
            classify(&h, &HashMap::new(), true, true, None),
            Transport::StreamableUpgrade
        );
    }

    #[test]
    fn test_post_plain_with_id_is_sync() {
        let h = head("POST", "/", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), true, true, None),
            Transport::Sync
        );
    }

    #[test]
    fn test_post_plain_without_id_is_notification() {
        let h = head("POST", "/", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), true, false, None),
            Transport::Notification
        );
    }

    #[test]
    fn test_unmatched_request_is_not_found() {
        let h = head("PUT", "/", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), false, false, None),
            Transport::NotFound
        );
    }

    #[test]
    fn test_post_no_body_no_session_not_found() {
        let h = head("POST", "/", vec![]);
        assert_eq!(
            classify(&h, &HashMap::new(), false, false, None),
            Transport::NotFound
        );
    }
}
