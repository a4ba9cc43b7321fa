//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Features:
//! - Method allow/deny filtering before any I/O
//! - Automatic retry with exponential backoff (honoring `Retry-After`)
//! - Per-attempt timeout
//! - Optional transparent batching through [`BatchScheduler`]
//! - Basic auth taken from the endpoint URL's userinfo

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use evmrpc_core::config::{TransportConfig, TransportKind};
use evmrpc_core::endpoint::{sanitize_url, split_credentials, Credentials};
use evmrpc_core::error::TransportError;
use evmrpc_core::executor::RequestExecutor;
use evmrpc_core::id::IdGenerator;
use evmrpc_core::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use evmrpc_core::transport::RpcTransport;

use crate::batch::{BatchConfig, BatchScheduler};

/// What the request hook sees before each POST.
#[derive(Debug)]
pub struct HttpRequestInfo<'a> {
    /// Sanitized endpoint.
    pub url: &'a str,
    pub body: &'a str,
}

/// What the response hook sees after each POST.
#[derive(Debug)]
pub struct HttpResponseInfo<'a> {
    /// Sanitized endpoint.
    pub url: &'a str,
    pub status: u16,
    pub elapsed: Duration,
}

pub type RequestHook = Arc<dyn Fn(&HttpRequestInfo<'_>) + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&HttpResponseInfo<'_>) + Send + Sync>;

/// Configuration for `HttpRpcClient`.
#[derive(Clone)]
pub struct HttpClientConfig {
    pub transport: TransportConfig,
    /// Coalesce concurrent calls into JSON array requests.
    pub batch: Option<BatchConfig>,
    /// Extra headers sent with every POST.
    pub headers: Vec<(String, String)>,
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    /// Share one generator between transports to keep ids disjoint.
    pub ids: IdGenerator,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::new(TransportKind::Http),
            batch: None,
            headers: Vec::new(),
            on_request: None,
            on_response: None,
            ids: IdGenerator::new(),
        }
    }
}

impl std::fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("transport", &self.transport)
            .field("batch", &self.batch)
            .field("headers", &self.headers.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

/// One endpoint, one POST per call, no policy. This is the point-to-point
/// primitive the batch scheduler sends through.
pub(crate) struct HttpEndpoint {
    endpoint: reqwest::Url,
    display_url: String,
    auth: Option<Credentials>,
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    on_request: Option<RequestHook>,
    on_response: Option<ResponseHook>,
    config: TransportConfig,
}

impl HttpEndpoint {
    async fn post<B, R>(&self, payload: &B) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_string(payload)?;
        if let Some(hook) = &self.on_request {
            hook(&HttpRequestInfo {
                url: &self.display_url,
                body: &body,
            });
        }

        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(creds) = &self.auth {
            builder = builder.basic_auth(&creds.username, creds.password.as_ref());
        }

        let started = Instant::now();
        let resp = builder.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = resp.status();

        if let Some(hook) = &self.on_response {
            hook(&HttpResponseInfo {
                url: &self.display_url,
                status: status.as_u16(),
                elapsed: started.elapsed(),
            });
        }

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
                url: self.display_url.clone(),
                retry_after,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.map_reqwest(e))?;
        serde_json::from_slice(&bytes).map_err(TransportError::from)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.config.timeout.as_millis() as u64,
            }
        } else {
            TransportError::Network(e.without_url().to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpEndpoint {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.post(&req).await
    }

    /// True HTTP batch: send all requests as a JSON array in one HTTP call.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }

        // Some nodes answer a rejected batch with a single error object.
        match self.post::<_, Value>(&reqs).await? {
            Value::Array(items) => items
                .into_iter()
                .map(|v| serde_json::from_value(v).map_err(TransportError::from))
                .collect(),
            Value::Object(mut obj) => match obj.remove("error") {
                Some(err) => {
                    let error: JsonRpcError = serde_json::from_value(err)?;
                    Err(TransportError::rpc(
                        error,
                        self.display_url.as_str(),
                        serde_json::to_string(&reqs).unwrap_or_default(),
                    ))
                }
                None => Err(TransportError::Deserialization(
                    "expected a JSON array in reply to a batch".into(),
                )),
            },
            other => Err(TransportError::Deserialization(format!(
                "unexpected batch reply: {other}"
            ))),
        }
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn url(&self) -> &str {
        &self.display_url
    }
}

/// HTTP JSON-RPC client with built-in reliability features.
pub struct HttpRpcClient {
    endpoint: Arc<HttpEndpoint>,
    executor: RequestExecutor,
    batch: Option<BatchScheduler>,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    ///
    /// Batching, when configured, spawns timer tasks and therefore needs
    /// a Tokio runtime at call time.
    pub fn new(url: impl AsRef<str>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let (endpoint, auth) = split_credentials(url.as_ref())?;
        let display_url = sanitize_url(endpoint.as_str());

        let http = reqwest::Client::builder()
            .timeout(config.transport.timeout)
            .connect_timeout(config.transport.timeout)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                TransportError::Config(format!("HTTP client build failed: {e}"))
            })?;

        let endpoint = Arc::new(HttpEndpoint {
            endpoint,
            display_url: display_url.clone(),
            auth,
            http,
            headers: config.headers,
            on_request: config.on_request,
            on_response: config.on_response,
            config: config.transport.clone(),
        });

        let batch = config.batch.map(|batch| {
            BatchScheduler::new(endpoint.clone(), batch, config.ids.clone())
        });

        Ok(Self {
            executor: RequestExecutor::new(config.transport, config.ids, display_url),
            endpoint,
            batch,
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl AsRef<str>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    /// The batch scheduler, if batching is enabled.
    pub fn batch_scheduler(&self) -> Option<&BatchScheduler> {
        self.batch.as_ref()
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let endpoint = &self.endpoint;
        let batch = self.batch.as_ref();
        self.executor
            .run(req, |req| async move {
                match batch {
                    Some(scheduler) => scheduler.schedule(req).await,
                    None => endpoint.send(req).await,
                }
            })
            .await
    }

    /// One POST with a JSON array body. No retry; replies are returned in
    /// the order the server sent them.
    async fn send_batch(
        &self,
        mut reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        for req in &mut reqs {
            self.executor.check_method(&req.method)?;
            self.executor.prepare(req);
        }
        self.endpoint.send_batch(reqs).await
    }

    fn config(&self) -> &TransportConfig {
        self.executor.config()
    }

    fn url(&self) -> &str {
        self.endpoint.url()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(batch) = &self.batch {
            batch.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_url() {
        let err = HttpRpcClient::default_for("").err().unwrap();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn url_is_sanitized() {
        let client =
            HttpRpcClient::default_for("https://user:pw@rpc.example.com/?api_key=abc").unwrap();
        assert!(!client.url().contains("pw"));
        assert!(!client.url().contains("abc"));
        assert!(client.endpoint.auth.is_some());
        assert!(client.endpoint.endpoint.password().is_none());
    }

    #[test]
    fn config_debug_hides_header_values() {
        let config = HttpClientConfig {
            headers: vec![("x-api-key".into(), "secret".into())],
            ..Default::default()
        };
        let dbg = format!("{config:?}");
        assert!(dbg.contains("x-api-key"));
        assert!(!dbg.contains("secret"));
    }
}
