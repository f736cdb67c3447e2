//! Tool Discovery — runs the MCP `initialize`/`tools/list` handshake
//! against a child, either inline (once a `BridgeInstance` is running and no
//! static tool list was configured) or standalone (`validate`, used to
//! sanity-check a config before committing to it).

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{ChildConfig, ToolInfo};
use crate::error::{BridgeError, Result};
use crate::mini_server::ConnectionRegistry;
use crate::router::{ensure_trailing_newline, JsonRpcId, PendingRequest, Router};
use crate::supervisor;

/// Delay after a child reaches `Running` before discovery fires, giving the
/// child's own startup logging a moment to flush before its output channel
/// is dedicated to handshake traffic.
pub const DISCOVERY_DELAY: Duration = Duration::from_secs(1);

/// Hard timeout for the standalone `validate` path.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

const INITIALIZE_ID: i64 = 1;
const TOOLS_LIST_ID: i64 = 2;

fn initialize_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": INITIALIZE_ID,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "mcproxy", "version": env!("CARGO_PKG_VERSION") }
        }
    })
}

fn tools_list_request() -> Value {
    json!({ "jsonrpc": "2.0", "id": TOOLS_LIST_ID, "method": "tools/list" })
}

/// Flattens an MCP tool's `inputSchema.properties` into a `name -> type`
/// map. Any property whose `type` is missing or not a recognized JSON
/// Schema primitive is recorded as `"any"`.
fn flatten_schema(tool: &Value) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    let Some(properties) = tool
        .get("inputSchema")
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object())
    else {
        return out;
    };
    for (name, schema) in properties {
        let ty = schema
            .get("type")
            .and_then(|t| t.as_str())
            .filter(|t| matches!(*t, "string" | "number" | "integer" | "boolean" | "object" | "array"))
            .unwrap_or("any");
        out.insert(name.clone(), ty.to_string());
    }
    out
}

fn parse_tools(response: &Value) -> Vec<ToolInfo> {
    let Some(tools) = response
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(|t| t.as_array())
    else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?.to_string();
            let description = tool
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            Some(ToolInfo {
                name,
                description,
                params: flatten_schema(tool),
            })
        })
        .collect()
}

async fn read_response(
    reader: &mut BufReader<tokio::process::ChildStdout>,
    expected_id: i64,
) -> Result<Value> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| BridgeError::ProtocolGarbage("discovery".to_string(), e.to_string()))?;
        if n == 0 {
            return Err(BridgeError::ChildExited(
                "discovery".to_string(),
                "stdout closed during handshake".to_string(),
            ));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if value.get("id").and_then(|i| i.as_i64()) == Some(expected_id) {
            return Ok(value);
        }
    }
}

async fn handshake(
    stdin: &mut tokio::process::ChildStdin,
    stdout: &mut BufReader<tokio::process::ChildStdout>,
) -> Result<Vec<ToolInfo>> {
    let init_line = ensure_trailing_newline(initialize_request().to_string());
    stdin
        .write_all(init_line.as_bytes())
        .await
        .map_err(|e| BridgeError::StdinWriteError("discovery".to_string(), e.to_string()))?;
    read_response(stdout, INITIALIZE_ID).await?;

    let list_line = ensure_trailing_newline(tools_list_request().to_string());
    stdin
        .write_all(list_line.as_bytes())
        .await
        .map_err(|e| BridgeError::StdinWriteError("discovery".to_string(), e.to_string()))?;
    let response = read_response(stdout, TOOLS_LIST_ID).await?;

    Ok(parse_tools(&response))
}

async fn send_and_await(
    router: &Router,
    connections: &ConnectionRegistry,
    stdin_tx: &mpsc::UnboundedSender<String>,
    id: i64,
    request: Value,
    child_id: &str,
) -> Result<Value> {
    let (tx, rx) = oneshot::channel();
    let conn_id = format!("discovery:{child_id}:{id}");
    connections.register_sync(conn_id.clone(), tx).await;
    router
        .register(
            JsonRpcId::Number(id as f64),
            PendingRequest::Sync {
                connection_id: conn_id.clone(),
            },
            None,
        )
        .await;

    stdin_tx
        .send(ensure_trailing_newline(request.to_string()))
        .map_err(|_| BridgeError::StdinWriteError(child_id.to_string(), "stdin channel closed".to_string()))?;

    match timeout(VALIDATE_TIMEOUT, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(BridgeError::ChildExited(
            child_id.to_string(),
            "stdin closed during handshake".to_string(),
        )),
        Err(_) => {
            connections.remove(&conn_id).await;
            Err(BridgeError::ValidateTimeout(child_id.to_string(), VALIDATE_TIMEOUT.as_secs()))
        }
    }
}

/// Runs discovery against an already-running child over its live Mini-Server
/// pipe. The `Router`'s discovery-in-flight flag (set by the caller) is
/// what keeps a genuine network request from colliding with ids 1 and 2
/// while this runs.
pub async fn run_live_discovery(
    router: &Router,
    connections: &ConnectionRegistry,
    stdin_tx: &mpsc::UnboundedSender<String>,
    child_id: &str,
) -> Result<Vec<ToolInfo>> {
    info!(child = %child_id, "running tool discovery");
    send_and_await(router, connections, stdin_tx, INITIALIZE_ID, initialize_request(), child_id).await?;
    let response = send_and_await(
        router,
        connections,
        stdin_tx,
        TOOLS_LIST_ID,
        tools_list_request(),
        child_id,
    )
    .await?;
    let tools = parse_tools(&response);
    info!(child = %child_id, count = tools.len(), "tool discovery complete");
    Ok(tools)
}

/// Spawns a standalone child purely to run the handshake, with a hard
/// timeout, then tears it down regardless of outcome. Used to validate a
/// config before committing to it (e.g. from a CLI `validate` subcommand).
pub async fn validate(config: &ChildConfig) -> Result<Vec<ToolInfo>> {
    let mut handle = supervisor::spawn(config)?;

    let result = timeout(VALIDATE_TIMEOUT, handshake(&mut handle.stdin, &mut handle.stdout)).await;

    supervisor::terminate(&mut handle, &config.id).await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            warn!(child = %config.id, "validate handshake timed out");
            Err(BridgeError::ValidateTimeout(
                config.id.clone(),
                VALIDATE_TIMEOUT.as_secs(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_schema_recognizes_primitives() {
        let tool = json!({
            "name": "search",
            "inputSchema": {
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" },
                    "weird": { "type": "funky" },
                    "untyped": {}
                }
            }
        });
        let flat = flatten_schema(&tool);
        assert_eq!(flat.get("query").unwrap(), "string");
        assert_eq!(flat.get("limit").unwrap(), "integer");
        assert_eq!(flat.get("weird").unwrap(), "any");
        assert_eq!(flat.get("untyped").unwrap(), "any");
    }

    #[test]
    fn test_parse_tools_from_response() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [
                    { "name": "search", "description": "search things", "inputSchema": { "properties": { "q": { "type": "string" } } } }
                ]
            }
        });
        let tools = parse_tools(&response);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].params.get("q").unwrap(), "string");
    }

    #[test]
    fn test_parse_tools_empty_on_missing_result() {
        let response = json!({ "jsonrpc": "2.0", "id": 2, "error": { "code": -1, "message": "nope" } });
        assert!(parse_tools(&response).is_empty());
    }

    #[tokio::test]
    async fn test_validate_missing_command_returns_command_not_found() {
        let config = ChildConfig {
            id: "ghost".to_string(),
            name: String::new(),
            enabled: true,
            command: "/no/such/binary".to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            bearer_token: None,
            tools: vec![],
            disabled_tools: Default::default(),
        };
        let result = validate(&config).await;
        assert!(matches!(result, Err(BridgeError::CommandNotFound(_, _))));
    }
}
