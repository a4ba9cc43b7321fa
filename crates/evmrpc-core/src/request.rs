//! JSON-RPC 2.0 wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request id: number, string or null.
///
/// `Null` doubles as "not assigned yet"; transports replace it with a
/// number drawn from their [`IdGenerator`](crate::id::IdGenerator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    #[default]
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// Method name of subscription push notifications.
pub const SUBSCRIPTION_METHOD: &str = "eth_subscription";

fn default_version() -> String {
    "2.0".into()
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default)]
    pub id: RpcId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request with positional parameters.
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Value::Array(params),
            id: id.into(),
        }
    }

    /// Create a request without an id; the transport assigns one.
    pub fn method(method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self::new(RpcId::Null, method, params)
    }

    /// Replace the id, returning the previous one.
    pub fn swap_id(&mut self, id: RpcId) -> RpcId {
        std::mem::replace(&mut self.id, id)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Generic node-side failure, used by several clients for transient faults.
    pub const UNKNOWN: i64 = -1;
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Server-defined range, used by nodes for request limits.
    pub const LIMIT_EXCEEDED: i64 = -32005;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `true` for the codes a node uses to signal a transient condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            Self::UNKNOWN | Self::LIMIT_EXCEEDED | Self::INTERNAL_ERROR
        )
    }
}

/// A JSON-RPC 2.0 response, or a subscription push notification.
///
/// Pushes carry `method` = `"eth_subscription"` and `params`; ordinary
/// responses carry `id` plus exactly one of `result` / `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcResponse {
    /// A successful response carrying `result`.
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
            method: None,
            params: None,
        }
    }

    /// An error response carrying `error`.
    pub fn failure(id: RpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
            method: None,
            params: None,
        }
    }

    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    /// Returns `true` for an unsolicited push (has `method`).
    pub fn is_notification(&self) -> bool {
        self.method.is_some()
    }

    /// Typed view of an `eth_subscription` push.
    pub fn notification(&self) -> Option<SubscriptionNotification> {
        if self.method.as_deref() != Some(SUBSCRIPTION_METHOD) {
            return None;
        }
        self.params
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }

    /// Unwrap the result value or return an error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// The `params` object of an `eth_subscription` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    pub subscription: String,
    #[serde(default)]
    pub result: Value,
}
