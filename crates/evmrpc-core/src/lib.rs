//! evmrpc-core — foundation traits and types for evmrpc.
//!
//! # Overview
//!
//! evmrpc is a JSON-RPC transport layer for Ethereum-compatible nodes.
//! The core crate defines:
//!
//! - [`RpcTransport`]: the central async trait every transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`]: closed error taxonomy with a retry classifier
//! - [`TransportConfig`] / [`MethodFilter`]: per-transport identity and policy
//! - [`RequestExecutor`]: method filter + retry + timeout, written once
//! - [`FallbackTransport`]: ranked multi-transport failover
//! - [`CancelExt`]: caller-driven cancellation of any transport future

pub mod cancel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod id;
pub mod policy;
pub mod request;
pub mod transport;

pub use cancel::{CancelExt, CancellationToken};
pub use config::{polling_interval, MethodFilter, TransportConfig, TransportKind};
pub use endpoint::{sanitize_url, split_credentials, Credentials};
pub use error::{ErrorKind, TransportError};
pub use executor::RequestExecutor;
pub use fallback::{FallbackConfig, FallbackTransport, RankConfig, RankWeights, TransportStats};
pub use id::IdGenerator;
pub use policy::RetryPolicy;
pub use request::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam, SubscriptionNotification,
    SUBSCRIPTION_METHOD,
};
pub use transport::{HealthStatus, RpcTransport, RpcTransportExt};
