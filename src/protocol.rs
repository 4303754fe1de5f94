//! JSON-RPC 2.0 message types and the initialization handshake.
//!
//! Messages are classified once at parse time into a closed sum type;
//! ambiguous or malformed shapes fail to parse instead of being
//! re-inferred downstream.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::McpError;

/// Protocol version advertised in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC version
pub const JSONRPC_VERSION: &str = "2.0";

/// Request ID (can be string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Number ID
    Number(i64),
}

impl RequestId {
    /// Generate a fresh unique string ID
    pub fn fresh() -> Self {
        Self::String(Uuid::new_v4().to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A parsed JSON-RPC message.
///
/// The variant is fixed at parse time from the fields present: a request
/// carries `method` + `id`, a notification `method` without `id`, a
/// response `result`, and an error response `error`. Each variant rejects
/// unknown fields, so a message carrying both `result` and `error` (or
/// `method` alongside `result`) fails to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Notification message (no id, no response expected)
    Notification(Notification),
    /// Successful response
    Response(Response),
    /// Error response
    Error(ErrorResponse),
}

impl Message {
    /// Parse one newline-delimited JSON message
    pub fn parse(line: &str) -> Result<Self, McpError> {
        serde_json::from_str(line.trim())
            .map_err(|e| McpError::protocol(format!("invalid JSON-RPC message: {}", e)))
    }

    /// Serialize as a single newline-terminated line
    pub fn to_line(&self) -> Result<String, McpError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Get the correlation ID if present
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(res) => Some(&res.id),
            Self::Error(err) => err.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Get the method name if present
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            _ => None,
        }
    }

    /// Short label for the message shape, for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
        }
    }

    /// Check if this is a request
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Check if this is a response (success or error)
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    /// Check if this is a notification
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification(_))
    }
}

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Optional parameters; omitted from the wire when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with a fresh unique ID
    pub fn new(method: impl Into<String>) -> Self {
        Self::with_id(RequestId::fresh(), method)
    }

    /// Create a request with an explicit ID
    pub fn with_id(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters to the request
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Optional parameters; omitted from the wire when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Create a new notification
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Successful JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID this response corresponds to
    pub id: RequestId,
    /// Result payload
    pub result: Value,
}

impl Response {
    /// Create a success response echoing the originating ID
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result,
        }
    }
}

/// JSON-RPC error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID this response corresponds to; null for parse errors
    pub id: Option<RequestId>,
    /// Error payload
    pub error: RpcError,
}

impl ErrorResponse {
    /// Create an error response
    pub fn new(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Wire error codes
pub mod codes {
    /// Parse error
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Server unavailable (MCP)
    pub const SERVER_UNAVAILABLE: i32 = -32000;
    /// Capability not found (MCP)
    pub const CAPABILITY_NOT_FOUND: i32 = -32001;
    /// Request timeout (MCP)
    pub const TIMEOUT: i32 = -32002;
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create a new error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Add data to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error")
    }

    /// Invalid request (-32600)
    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid request")
    }

    /// Method not found (-32601)
    pub fn method_not_found() -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
    }

    /// Invalid params (-32602)
    pub fn invalid_params() -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params")
    }

    /// Internal error (-32603)
    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    /// Server unavailable (-32000)
    pub fn server_unavailable() -> Self {
        Self::new(codes::SERVER_UNAVAILABLE, "Server unavailable")
    }

    /// Capability not found (-32001)
    pub fn capability_not_found() -> Self {
        Self::new(codes::CAPABILITY_NOT_FOUND, "Capability not found")
    }

    /// Request timeout (-32002)
    pub fn timeout() -> Self {
        Self::new(codes::TIMEOUT, "Request timeout")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Well-known method names
pub mod methods {
    /// Initialize handshake
    pub const INITIALIZE: &str = "initialize";
    /// Initialized notification, sent after a successful handshake
    pub const INITIALIZED: &str = "initialized";
    /// List tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Call tool
    pub const TOOLS_CALL: &str = "tools/call";
    /// Ping
    pub const PING: &str = "ping";
}

/// Client identity advertised in the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name
    pub name: String,
    /// Client version
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "toolbus".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server identity returned by the `initialize` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server name
    pub name: String,
    /// Server version
    pub version: String,
}

/// Capabilities advertised by a server in its `initialize` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCapabilities {
    /// Tool capabilities
    pub tools: Option<Value>,
    /// Resource capabilities
    pub resources: Option<Value>,
    /// Prompt capabilities
    pub prompts: Option<Value>,
    /// Experimental features
    pub experimental: Option<Value>,
}

impl ServerCapabilities {
    /// Whether the server advertised nothing at all
    pub fn is_empty(&self) -> bool {
        self.tools.is_none()
            && self.resources.is_none()
            && self.prompts.is_none()
            && self.experimental.is_none()
    }
}

/// Result payload of a successful `initialize` call
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server speaks
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Advertised server capabilities
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Tool descriptor returned by `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default)]
    pub description: Option<String>,
    /// Input schema (JSON Schema)
    #[serde(default)]
    pub input_schema: Value,
}

/// Build the `initialize` handshake request
pub fn initialize_request(client: &ClientInfo) -> Request {
    Request::new(methods::INITIALIZE).with_params(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": client.name,
            "version": client.version,
        },
        "capabilities": {
            "roots": { "listChanged": true },
            "sampling": {},
            "tools": {},
        },
    }))
}

/// Build the `initialized` notification that must follow the handshake
pub fn initialized_notification() -> Notification {
    Notification::new(methods::INITIALIZED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_preserves_fields() {
        let req = Request::with_id("req-7", methods::TOOLS_CALL)
            .with_params(json!({"name": "echo", "arguments": {"n": 1}}));
        let line = Message::Request(req.clone()).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let parsed = Message::parse(&line).unwrap();
        let Message::Request(parsed) = parsed else {
            panic!("expected a request");
        };
        assert_eq!(parsed.id, req.id);
        assert_eq!(parsed.method, req.method);
        assert_eq!(parsed.params, req.params);
    }

    #[test]
    fn absent_params_are_omitted_from_the_wire() {
        let req = Request::with_id(1i64, methods::TOOLS_LIST);
        let line = Message::Request(req).to_line().unwrap();
        assert!(!line.contains("params"));

        let Message::Request(parsed) = Message::parse(&line).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(parsed.params, None);
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Request::new("ping");
        let b = Request::new("ping");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn classification_by_shape() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(msg.is_request());

        let msg = Message::parse(r#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.id(), None);

        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(matches!(msg, Message::Response(_)));

        let msg =
            Message::parse(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
                .unwrap();
        assert!(matches!(msg, Message::Error(_)));
    }

    #[test]
    fn ambiguous_shapes_are_rejected() {
        // result and error together
        assert!(
            Message::parse(
                r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":-1,"message":"x"}}"#
            )
            .is_err()
        );
        // method alongside result
        assert!(Message::parse(r#"{"jsonrpc":"2.0","id":1,"method":"x","result":{}}"#).is_err());
        // missing jsonrpc tag
        assert!(Message::parse(r#"{"id":1,"method":"x"}"#).is_err());
    }

    #[test]
    fn invalid_json_is_a_protocol_error() {
        let err = Message::parse("{not json").unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
        assert_eq!(err.code(), codes::PARSE_ERROR);
    }

    #[test]
    fn error_code_constructors() {
        assert_eq!(RpcError::parse_error().code, -32700);
        assert_eq!(RpcError::invalid_request().code, -32600);
        assert_eq!(RpcError::method_not_found().code, -32601);
        assert_eq!(RpcError::invalid_params().code, -32602);
        assert_eq!(RpcError::internal_error().code, -32603);
        assert_eq!(RpcError::server_unavailable().code, -32000);
        assert_eq!(RpcError::capability_not_found().code, -32001);
        assert_eq!(RpcError::timeout().code, -32002);
    }

    #[test]
    fn initialize_handshake_shape() {
        let req = initialize_request(&ClientInfo::default());
        assert_eq!(req.method, methods::INITIALIZE);
        let params = req.params.unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "toolbus");
        assert_eq!(params["capabilities"]["roots"]["listChanged"], true);

        let notif = initialized_notification();
        assert_eq!(notif.method, methods::INITIALIZED);
        let line = Message::Notification(notif).to_line().unwrap();
        assert!(!line.contains("\"id\""));
    }

    #[test]
    fn initialize_result_parses_capabilities() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "echo", "version": "1.0.0"}
        }))
        .unwrap();
        assert!(!result.capabilities.is_empty());
        assert_eq!(result.server_info.unwrap().name, "echo");

        let bare: InitializeResult = serde_json::from_value(json!({})).unwrap();
        assert!(bare.capabilities.is_empty());
    }
}
