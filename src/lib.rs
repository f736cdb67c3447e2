//! MCProxy — bridges stdio MCP child processes to HTTP/SSE/streamable-HTTP
//! network clients.
//!
//! Each configured child gets its own [`orchestrator::BridgeInstance`]: a
//! supervised process, a line-framed stdio pump, and an embedded HTTP/1.1
//! server multiplexing network transports onto that one upstream JSON-RPC
//! pipe. [`registry::BridgeSet`] owns a whole config's worth of these at
//! once.

pub mod classifier;
pub mod config;
pub mod discovery;
pub mod error;
pub mod framer;
pub mod http;
pub mod mini_server;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;

pub use config::{BridgeSetConfig, ChildConfig, ToolInfo};
pub use error::{BridgeError, Result};
pub use observability::{ActiveClientsChange, LogLine, LogSource, ObservabilityHooks, StatusChange, ToolsChange};
pub use orchestrator::{BridgeInstance, BridgeStatus};
pub use registry::BridgeSet;
