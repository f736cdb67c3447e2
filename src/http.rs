//! Minimal HTTP/1.1 wire types and parsing, hand-rolled because the
//! Mini-Server needs byte-level control over framing (arbitrarily
//! fragmented reads, chunked writes, TLS-garbage rejection) that a full
//! framework hides behind its own connection loop.

use std::collections::HashMap;

/// Maximum bytes accepted from a single connection before headers are found
/// or a declared body is fully read. Guards against a client drip-feeding
/// an unbounded request.
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// The first three bytes of a TLS ClientHello record: content type 0x16
/// (handshake), major version 0x03, any minor version. A connection that
/// starts this way is TLS, not plaintext HTTP, and must be rejected before
/// any HTTP parsing is attempted.
pub fn looks_like_tls(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03
}

/// The parsed request line and headers of an HTTP/1.1 request, before the
/// body (if any) has necessarily been read in full.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => self.version == "HTTP/1.1",
        }
    }
}

/// Splits `path?query` into its path and a parsed query-string map.
pub fn split_path_query(target: &str) -> (String, HashMap<String, String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(urldecode(k), urldecode(v));
    }
    map
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Locates the end of the header block (`\r\n\r\n` or a bare `\n\n`) in a
/// buffer, returning the index just past it.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find_subslice(buf, b"\n\n").map(|pos| pos + 2)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses the request line and headers out of the header block bytes
/// (everything up to, but not including, the blank line).
pub fn parse_head(block: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(block).ok()?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let (path, query) = split_path_query(&target);

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some(RequestHead {
        method,
        path,
        query,
        version,
        headers,
    })
}

/// CORS headers attached to every response the Mini-Server produces,
/// matching the wide-open policy a local developer tool needs (no browser
/// origin is known ahead of time).
pub const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, OPTIONS, DELETE\r\n\
Access-Control-Allow-Headers: *\r\n";

/// Additional CORS header on stream responses so a browser client can read
/// the session id back from a cross-origin fetch.
pub const EXPOSE_SESSION_HEADER: &str = "Access-Control-Expose-Headers: X-Mcp-Session-Id\r\n";

/// Renders a fixed-length response with `Connection: close`.
pub fn render_short_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\n{CORS_HEADERS}Content-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut out = header.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Renders the 204 response answering a CORS preflight.
pub fn render_preflight_response() -> Vec<u8> {
    format!("HTTP/1.1 204 No Content\r\n{CORS_HEADERS}Content-Length: 0\r\n\r\n").into_bytes()
}

/// Renders the header block that opens a chunked stream response (SSE or
/// NDJSON), with the session id exposed to the client in a custom header so
/// a reconnecting client can read it back.
pub fn render_stream_header(content_type: &str, session_id: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n{CORS_HEADERS}{EXPOSE_SESSION_HEADER}Content-Type: {content_type}\r\nX-Mcp-Session-Id: {session_id}\r\nTransfer-Encoding: chunked\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n"
    )
    .into_bytes()
}

/// Wraps a single payload as one HTTP chunk.
pub fn render_chunk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// The terminating zero-length chunk.
pub fn render_final_chunk() -> Vec<u8> {
    b"0\r\n\r\n".to_vec()
}

/// Wraps a JSON-RPC line payload as an SSE `message` event.
pub fn sse_event(payload: &str) -> String {
    format!("event: message\ndata: {payload}\n\n")
}

/// The first event an SSE stream sends, telling the client where to POST
/// follow-up messages.
pub fn sse_endpoint_event(url: &str) -> String {
    format!("event: endpoint\ndata: {url}\n\n")
}

/// Frames a JSON-RPC line payload for a Raw NDJSON stream.
pub fn raw_line(payload: &str) -> String {
    format!("{payload}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_tls_detects_client_hello() {
        assert!(looks_like_tls(&[0x16, 0x03, 0x01, 0x00, 0x00]));
    }

    #[test]
    fn test_looks_like_tls_rejects_plain_http() {
        assert!(!looks_like_tls(b"GET / "));
    }

    #[test]
    fn test_find_header_end_crlf() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODY";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[end..], b"BODY");
    }

    #[test]
    fn test_parse_head_basic() {
        let buf = b"POST /mcp?sessionId=abc HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nAccept: text/event-stream\r\n\r\n";
        let end = find_header_end(buf).unwrap();
        let head = parse_head(&buf[..end - 4]).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/mcp");
        assert_eq!(head.content_length(), 5);
        assert!(head.header("accept").unwrap().contains("text/event-stream"));
    }

    #[test]
    fn test_split_path_query() {
        let (path, query) = split_path_query("/mcp?sessionId=abc%20def&x=1");
        assert_eq!(path, "/mcp");
        assert_eq!(query.get("sessionId").unwrap(), "abc def");
        assert_eq!(query.get("x").unwrap(), "1");
    }

    #[test]
    fn test_keep_alive_defaults_by_version() {
        let head10 = RequestHead {
            method: "GET".into(),
            path: "/".into(),
            query: HashMap::new(),
            version: "HTTP/1.0".into(),
            headers: vec![],
        };
        assert!(!head10.keep_alive());

        let head11 = RequestHead {
            method: "GET".into(),
            path: "/".into(),
            query: HashMap::new(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert!(head11.keep_alive());
    }

    #[test]
    fn test_render_chunk_format() {
        let chunk = render_chunk(b"hi");
        assert_eq!(chunk, b"2\r\nhi\r\n");
    }

    #[test]
    fn test_sse_event_format() {
        assert_eq!(sse_event("{}"), "event: message\ndata: {}\n\n");
    }

    #[test]
    fn test_sse_endpoint_event_format() {
        assert_eq!(
            sse_endpoint_event("http://127.0.0.1:9000/message?sessionId=s1"),
            "event: endpoint\ndata: http://127.0.0.1:9000/message?sessionId=s1\n\n"
        );
    }

    #[test]
    fn test_raw_line_format() {
        assert_eq!(raw_line("{}"), "{}\n");
    }

    #[test]
    fn test_render_stream_header_exposes_session_header() {
        let header = render_stream_header("text/event-stream", "s1");
        let text = String::from_utf8(header).unwrap();
        assert!(text.contains("Access-Control-Expose-Headers: X-Mcp-Session-Id"));
    }
}
