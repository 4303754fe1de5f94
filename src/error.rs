//! Error types for the tool-server fleet

use thiserror::Error;

use crate::protocol::codes;

/// Errors surfaced by the protocol, connection, and routing layers
#[derive(Debug, Error, Clone)]
pub enum McpError {
    /// Connection error (spawn failure, handshake failure)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol error (malformed JSON, schema violation)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Transport error (pipe closed, subprocess gone)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The server returned an explicit error envelope
    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    /// The target server is not connected
    #[error("Server '{server}' unavailable")]
    ServerUnavailable { server: String },

    /// No registered server provides the requested capability
    #[error("Capability not found: {capability}")]
    CapabilityNotFound { capability: String },

    /// Invalid request
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// No response arrived within the call's timeout
    #[error("Request timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// The request was cancelled by connection teardown
    #[error("Operation cancelled")]
    Cancelled,
}

impl McpError {
    /// Create a new Connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new Server error
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Create a new ServerUnavailable error
    pub fn server_unavailable(server: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            server: server.into(),
        }
    }

    /// Create a new CapabilityNotFound error
    pub fn capability_not_found(capability: impl Into<String>) -> Self {
        Self::CapabilityNotFound {
            capability: capability.into(),
        }
    }

    /// Create a new InvalidRequest error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// The wire code this error surfaces as
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol { .. } => codes::PARSE_ERROR,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::Server { code, .. } => *code,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::CapabilityNotFound { .. } => codes::CAPABILITY_NOT_FOUND,
            Self::Serialization { .. } => codes::INTERNAL_ERROR,
            Self::Connection { .. }
            | Self::Transport { .. }
            | Self::ServerUnavailable { .. }
            | Self::Cancelled => codes::SERVER_UNAVAILABLE,
        }
    }

    /// Whether retrying the operation could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::ServerUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_mapping() {
        assert_eq!(McpError::protocol("bad").code(), -32700);
        assert_eq!(McpError::invalid_request("bad").code(), -32600);
        assert_eq!(McpError::server(-32601, "nope").code(), -32601);
        assert_eq!(McpError::timeout(5).code(), -32002);
        assert_eq!(McpError::server_unavailable("echo").code(), -32000);
        assert_eq!(McpError::capability_not_found("shell").code(), -32001);
    }

    #[test]
    fn retryability() {
        assert!(McpError::transport("pipe closed").is_retryable());
        assert!(McpError::timeout(5).is_retryable());
        assert!(McpError::server_unavailable("echo").is_retryable());
        assert!(!McpError::protocol("bad json").is_retryable());
        assert!(!McpError::invalid_request("bad").is_retryable());
    }
}
