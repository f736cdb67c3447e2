//! Error types for MCProxy bridge operations.

use thiserror::Error;

/// Main error type for MCProxy bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Duplicate child id found in config.
    #[error("duplicate child id: {0}")]
    DuplicateId(String),

    /// Invalid configuration for a named child.
    #[error("invalid config for child '{0}': {1}")]
    InvalidConfig(String, String),

    /// No executable candidate could be resolved/executed for the child's command token.
    #[error("command not found for child '{0}': {1}")]
    CommandNotFound(String, String),

    /// The OS refused to spawn the child process.
    #[error("spawn failed for child '{0}': {1}")]
    SpawnFailed(String, String),

    /// Configured port is below 1024 and is therefore restricted.
    #[error("port {1} restricted for child '{0}' (must be >= 1024, or 0 for ephemeral)")]
    PortRestricted(String, u16),

    /// The configured port is already bound by another process.
    #[error("port {1} already in use for child '{0}'")]
    PortInUse(String, u16),

    /// Bind failed for a reason other than restriction or conflict.
    #[error("bind failed for child '{0}': {1}")]
    BindFailed(String, String),

    /// The child process exited.
    #[error("child '{0}' exited with status {1}")]
    ChildExited(String, String),

    /// The validate-handshake path exceeded its wall-clock budget.
    #[error("validate handshake timed out for '{0}' after {1}s")]
    ValidateTimeout(String, u64),

    /// A network connection produced malformed or oversized HTTP/TLS bytes.
    #[error("protocol garbage on connection {0}: {1}")]
    ProtocolGarbage(String, String),

    /// A request body could not be parsed as the expected shape (valid JSON
    /// but not a JSON-RPC envelope, or invalid JSON entirely).
    #[error("malformed request body on connection {0}: {1}")]
    MalformedBody(String, String),

    /// Writing a response to a client connection failed.
    #[error("write failed on connection {0}: {1}")]
    WriteError(String, String),

    /// Writing a line to a child's stdin failed.
    #[error("stdin write failed for child '{0}': {1}")]
    StdinWriteError(String, String),

    /// The bridge is not running (e.g. a call arrived after shutdown).
    #[error("bridge '{0}' is not running")]
    NotRunning(String),
}

/// Result type alias for MCProxy bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display() {
        let err = BridgeError::DuplicateId("gh".to_string());
        assert_eq!(err.to_string(), "duplicate child id: gh");
    }

    #[test]
    fn test_port_restricted_display() {
        let err = BridgeError::PortRestricted("gh".to_string(), 80);
        assert!(err.to_string().contains("restricted"));
        assert!(err.to_string().contains("80"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = BridgeError::InvalidConfig("gh".to_string(), "command is empty".to_string());
        assert_eq!(
            err.to_string(),
            "invalid config for child 'gh': command is empty"
        );
    }
}
