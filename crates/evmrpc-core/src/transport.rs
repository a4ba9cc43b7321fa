//! The `RpcTransport` trait, implemented by every transport.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId};

/// Provider health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Provider is responding normally.
    Healthy,
    /// Provider is responding but degraded (reconnecting, partial failures).
    Degraded,
    /// Provider is not responding or has been closed.
    Unhealthy,
    /// Health status is unknown (not yet checked).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
/// Typed helpers live on [`RpcTransportExt`].
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    ///
    /// A request whose id is [`RpcId::Null`] gets one assigned.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a batch of JSON-RPC requests.
    ///
    /// Default implementation sends them sequentially; override for true batching.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(req).await?);
        }
        Ok(responses)
    }

    /// Identity and request policy of this transport.
    fn config(&self) -> &TransportConfig;

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's identifier (sanitized URL or name).
    fn url(&self) -> &str;

    /// Release connections and background tasks.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Typed convenience calls available on every transport.
#[async_trait]
pub trait RpcTransportExt: RpcTransport {
    /// Call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let req = JsonRpcRequest::new(RpcId::Null, method, params);
        let resp = self.send(req).await?;
        let result = resp
            .into_result()
            .map_err(|e| TransportError::rpc(e, self.url(), method))?;
        serde_json::from_value(result).map_err(TransportError::from)
    }
}

impl<T: RpcTransport + ?Sized> RpcTransportExt for T {}
