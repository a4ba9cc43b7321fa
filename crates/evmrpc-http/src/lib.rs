//! evmrpc-http — HTTP JSON-RPC transport.
//!
//! [`HttpRpcClient`] sends each call as a POST, with method filtering,
//! retry/backoff and per-attempt timeouts from `evmrpc-core`. With
//! [`BatchConfig`] set, concurrent calls are coalesced into JSON array
//! requests by a [`BatchScheduler`].

pub mod batch;
pub mod client;

pub use batch::{BatchConfig, BatchScheduler};
pub use client::{
    HttpClientConfig, HttpRequestInfo, HttpResponseInfo, HttpRpcClient, RequestHook, ResponseHook,
};
