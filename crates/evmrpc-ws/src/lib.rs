//! evmrpc-ws — WebSocket JSON-RPC transport.
//!
//! # Features
//! - Request multiplexing over a single connection
//! - `eth_subscribe` streams delivered through callbacks or a channel
//! - `net_version` keep-alive probes
//! - Reconnect with replay of live subscriptions

pub mod client;
pub mod subscriptions;

pub use client::{ConnectionState, ReconnectConfig, Subscription, WsClientConfig, WsRpcClient};
pub use subscriptions::{DataCallback, ErrorCallback, SubscriptionId};
