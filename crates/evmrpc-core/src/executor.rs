//! Request orchestration shared by every concrete transport.
//!
//! A transport supplies one function that performs a single physical
//! attempt; [`RequestExecutor`] wraps it with method filtering, id
//! assignment, per-attempt timeout, retry/backoff and raw-mode handling.

use std::future::Future;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::id::IdGenerator;
use crate::policy::RetryPolicy;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, Clone)]
pub struct RequestExecutor {
    config: TransportConfig,
    retry: RetryPolicy,
    ids: IdGenerator,
    url: String,
}

impl RequestExecutor {
    /// `url` must already be sanitized; it is embedded in RPC errors.
    pub fn new(config: TransportConfig, ids: IdGenerator, url: impl Into<String>) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry_count, config.retry_delay),
            config,
            ids,
            url: url.into(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Reject methods the filter disallows.
    pub fn check_method(&self, method: &str) -> Result<(), TransportError> {
        if self.config.methods.is_allowed(method) {
            Ok(())
        } else {
            tracing::debug!(method, transport = %self.config.key, "method rejected by filter");
            Err(TransportError::MethodNotSupported {
                method: method.to_string(),
            })
        }
    }

    /// Fill in the protocol version and id when absent.
    pub fn prepare(&self, req: &mut JsonRpcRequest) {
        if req.jsonrpc.is_empty() {
            req.jsonrpc = "2.0".into();
        }
        if req.id.is_null() {
            req.id = self.ids.next_rpc_id();
        }
    }

    /// Run one logical call.
    ///
    /// `attempt` performs a single physical attempt. A response carrying an
    /// `error` object is treated as a failed attempt so the retry policy can
    /// classify it; in raw mode the final node error is handed back inside
    /// an `Ok` response instead.
    pub async fn run<F, Fut>(
        &self,
        mut req: JsonRpcRequest,
        mut attempt: F,
    ) -> Result<JsonRpcResponse, TransportError>
    where
        F: FnMut(JsonRpcRequest) -> Fut,
        Fut: Future<Output = Result<JsonRpcResponse, TransportError>>,
    {
        self.check_method(&req.method)?;
        self.prepare(&mut req);
        tracing::debug!(method = %req.method, id = %req.id, url = %self.url, "sending request");

        let id = req.id.clone();
        let req = &req;
        let url = self.url.as_str();
        let result = self
            .retry
            .execute(self.config.timeout, move |_| {
                let fut = attempt(req.clone());
                async move {
                    let resp = fut.await?;
                    match resp.error {
                        Some(error) => Err(TransportError::rpc(
                            error,
                            url,
                            serde_json::to_string(req).unwrap_or_default(),
                        )),
                        None => Ok(resp),
                    }
                }
            })
            .await;

        match result {
            Err(TransportError::Rpc { error, .. }) if self.config.raw => {
                Ok(JsonRpcResponse::failure(id, error))
            }
            other => other,
        }
    }
}
