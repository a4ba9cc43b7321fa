//! WebSocket JSON-RPC client with keep-alive, subscriptions and reconnect.
//!
//! One background task owns the socket. It writes the frames callers hand
//! it, reads replies and pushes, sends keep-alives and drives reconnects.
//! Everything it does stops together when the client's shutdown token is
//! cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use evmrpc_core::config::{TransportConfig, TransportKind};
use evmrpc_core::endpoint::{sanitize_url, split_credentials, Credentials};
use evmrpc_core::error::TransportError;
use evmrpc_core::executor::RequestExecutor;
use evmrpc_core::id::IdGenerator;
use evmrpc_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use evmrpc_core::transport::{HealthStatus, RpcTransport};

use crate::subscriptions::{DataCallback, ErrorCallback, SubscriptionId, SubscriptionRegistry};

const SUBSCRIBE: &str = "eth_subscribe";
const UNSUBSCRIBE: &str = "eth_unsubscribe";
const KEEP_ALIVE: &str = "net_version";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ResponseTx = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// What to do with the reply carrying a given wire id.
enum Pending {
    Call(ResponseTx),
    /// A fresh `eth_subscribe`; the reader binds the route on success.
    Subscribe { key: u64, tx: ResponseTx },
    /// Replay of a parked subscription after reconnect.
    Resubscribe { key: u64 },
    KeepAlive,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Reconnect behaviour after the socket drops.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Pause before each attempt.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub transport: TransportConfig,
    /// Interval between `net_version` probes; `None` disables them.
    pub keep_alive: Option<Duration>,
    pub reconnect: ReconnectConfig,
    pub ids: IdGenerator,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::new(TransportKind::WebSocket),
            keep_alive: Some(Duration::from_secs(30)),
            reconnect: ReconnectConfig::default(),
            ids: IdGenerator::new(),
        }
    }
}

/// State shared by the client, its subscriptions and the connection task.
struct Shared {
    display_url: String,
    timeout: Duration,
    ids: IdGenerator,
    pending: PendingMap,
    subs: SubscriptionRegistry,
    frames: mpsc::UnboundedSender<String>,
    state: watch::Receiver<ConnectionState>,
}

/// Removes a pending entry when the waiting call goes away.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.id);
    }
}

impl Shared {
    /// One request/response exchange over the live socket.
    async fn request(
        &self,
        mut req: JsonRpcRequest,
        pending: impl FnOnce(ResponseTx) -> Pending,
    ) -> Result<JsonRpcResponse, TransportError> {
        let state = *self.state.borrow();
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(TransportError::Shutdown),
            _ => return Err(TransportError::SocketClosed),
        }

        let wire = self.ids.next_id();
        let caller_id = req.swap_id(RpcId::Number(wire));
        let frame = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(wire, pending(tx));
        let _guard = PendingGuard {
            pending: &self.pending,
            id: wire,
        };
        // The socket may have dropped after the first check; the
        // disconnect sweep would then have missed this entry.
        match *self.state.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(TransportError::Shutdown),
            _ => return Err(TransportError::SocketClosed),
        }
        self.frames
            .send(frame)
            .map_err(|_| TransportError::Shutdown)?;

        let mut resp = rx.await.map_err(|_| TransportError::SocketClosed)??;
        resp.id = caller_id;
        Ok(resp)
    }
}

/// A live `eth_subscribe` stream.
pub struct Subscription {
    key: u64,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Current server-side id. Changes after a reconnect replay; `None`
    /// while parked.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.shared.subs.server_id(self.key)
    }

    /// Stop receiving pushes and tell the node.
    ///
    /// Local bookkeeping is removed before `eth_unsubscribe` goes out, so
    /// no push is delivered after this is called even if the node call
    /// fails. Returns the node's boolean answer.
    pub async fn unsubscribe(self) -> Result<bool, TransportError> {
        let Some(server_id) = self.shared.subs.remove(self.key) else {
            return Ok(false);
        };
        let req = JsonRpcRequest::method(UNSUBSCRIBE, vec![Value::String(server_id.0)]);
        let resp = tokio::time::timeout(
            self.shared.timeout,
            self.shared.request(req, Pending::Call),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            ms: self.shared.timeout.as_millis() as u64,
        })??;
        let url = self.shared.display_url.as_str();
        let result = resp
            .into_result()
            .map_err(|e| TransportError::rpc(e, url, UNSUBSCRIBE))?;
        Ok(result.as_bool().unwrap_or(false))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id())
            .finish()
    }
}

/// WebSocket JSON-RPC client.
pub struct WsRpcClient {
    shared: Arc<Shared>,
    executor: RequestExecutor,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsRpcClient {
    /// Dial `url` and start the connection task.
    pub async fn connect(url: impl AsRef<str>, config: WsClientConfig) -> Result<Self, TransportError> {
        let (endpoint, auth) = split_credentials(url.as_ref())?;
        let endpoint = endpoint.to_string();
        let display_url = sanitize_url(&endpoint);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tracing::info!(url = %display_url, "connecting via WebSocket");
        let ws = dial(&endpoint, auth.as_ref(), config.transport.timeout).await.map_err(|e| {
            tracing::warn!(url = %display_url, error = %e, "WebSocket dial failed");
            e
        })?;
        let _ = state_tx.send(ConnectionState::Connected);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            display_url: display_url.clone(),
            timeout: config.transport.timeout,
            ids: config.ids.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subs: SubscriptionRegistry::new(),
            frames: frames_tx,
            state: state_rx,
        });

        let shutdown = CancellationToken::new();
        let conn = Connection {
            url: endpoint,
            auth,
            display_url: display_url.clone(),
            keep_alive: config.keep_alive,
            reconnect: config.reconnect.clone(),
            timeout: config.transport.timeout,
            ids: config.ids.clone(),
            pending: shared.pending.clone(),
            subs: shared.subs.clone(),
            state: state_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(conn.run(ws, frames_rx));

        Ok(Self {
            executor: RequestExecutor::new(config.transport, config.ids, display_url),
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Number of live subscriptions, parked ones included.
    pub fn subscription_count(&self) -> usize {
        self.shared.subs.len()
    }

    /// Open an `eth_subscribe` stream.
    ///
    /// `params` are the full subscribe params, e.g. `["newHeads"]` or
    /// `["logs", {filter}]`. `on_data` receives each push; `on_error` is
    /// called once each time the connection drops under the subscription
    /// and once if a replay after reconnect is refused.
    pub async fn subscribe<D, E>(
        &self,
        params: Vec<Value>,
        on_data: D,
        on_error: E,
    ) -> Result<Subscription, TransportError>
    where
        D: Fn(Value) + Send + Sync + 'static,
        E: Fn(TransportError) + Send + Sync + 'static,
    {
        self.subscribe_with(params, Arc::new(on_data), Arc::new(on_error))
            .await
    }

    /// Like [`subscribe`](Self::subscribe), delivering pushes and errors
    /// through a channel.
    pub async fn subscribe_channel(
        &self,
        params: Vec<Value>,
    ) -> Result<
        (
            Subscription,
            mpsc::UnboundedReceiver<Result<Value, TransportError>>,
        ),
        TransportError,
    > {
        let (tx, rx) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        let sub = self
            .subscribe(
                params,
                move |value| {
                    let _ = data_tx.send(Ok(value));
                },
                move |err| {
                    let _ = tx.send(Err(err));
                },
            )
            .await?;
        Ok((sub, rx))
    }

    async fn subscribe_with(
        &self,
        params: Vec<Value>,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<Subscription, TransportError> {
        self.executor.check_method(SUBSCRIBE)?;

        let subs = &self.shared.subs;
        let key = subs.insert(params.clone(), on_data, on_error);
        let mut registration = Registration {
            subs,
            key,
            keep: false,
        };

        let req = JsonRpcRequest::method(SUBSCRIBE, params);
        let resp = tokio::time::timeout(
            self.shared.timeout,
            self.shared.request(req, |tx| Pending::Subscribe { key, tx }),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            ms: self.shared.timeout.as_millis() as u64,
        })??;

        let url = self.shared.display_url.as_str();
        match resp.into_result() {
            Ok(Value::String(id)) => {
                tracing::debug!(subscription = %id, url, "subscribed");
                registration.keep = true;
                Ok(Subscription {
                    key,
                    shared: self.shared.clone(),
                })
            }
            Ok(other) => Err(TransportError::Deserialization(format!(
                "subscription id must be a string, got {other}"
            ))),
            Err(e) => Err(TransportError::rpc(e, url, SUBSCRIBE)),
        }
    }
}

/// Drops a subscription that never finished confirming.
struct Registration<'a> {
    subs: &'a SubscriptionRegistry,
    key: u64,
    keep: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.subs.remove(self.key);
        }
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let shared = &self.shared;
        self.executor
            .run(req, |req| async move { shared.request(req, Pending::Call).await })
            .await
    }

    fn config(&self) -> &TransportConfig {
        self.executor.config()
    }

    fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Connected => HealthStatus::Healthy,
            ConnectionState::Closed => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    fn url(&self) -> &str {
        &self.shared.display_url
    }

    /// Stop the connection task. Waiting callers get
    /// [`TransportError::Shutdown`].
    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Open the socket. Credentials go out as an `Authorization: Basic`
/// header on the handshake.
async fn dial(
    url: &str,
    auth: Option<&Credentials>,
    timeout: Duration,
) -> Result<WsStream, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Config(format!("invalid WebSocket URL: {e}")))?;
    if let Some(creds) = auth {
        request.headers_mut().insert(AUTHORIZATION, basic_auth(creds)?);
    }
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::WebSocket(e.to_string())),
        Err(_) => Err(TransportError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    }
}

fn basic_auth(creds: &Credentials) -> Result<HeaderValue, TransportError> {
    let pair = format!(
        "{}:{}",
        creds.username,
        creds.password.as_deref().unwrap_or_default()
    );
    let mut value = HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(pair)))
        .map_err(|e| TransportError::Config(format!("invalid credentials: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

enum Exit {
    Shutdown,
    Disconnected,
}

/// The socket-owning task.
struct Connection {
    url: String,
    auth: Option<Credentials>,
    display_url: String,
    keep_alive: Option<Duration>,
    reconnect: ReconnectConfig,
    timeout: Duration,
    ids: IdGenerator,
    pending: PendingMap,
    subs: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, ws: WsStream, mut frames: mpsc::UnboundedReceiver<String>) {
        let mut ws = ws;
        loop {
            match self.serve(ws, &mut frames).await {
                Exit::Shutdown => break,
                Exit::Disconnected => {
                    self.set_state(ConnectionState::Disconnected);
                    while frames.try_recv().is_ok() {}
                    self.fail_pending(TransportError::SocketClosed);

                    let parked = self.subs.park();
                    for on_error in &parked {
                        on_error(TransportError::SocketClosed);
                    }

                    if !self.reconnect.enabled {
                        tracing::warn!(url = %self.display_url, "WebSocket closed, reconnect disabled");
                        break;
                    }
                    match self.reconnect().await {
                        Some(fresh) => ws = fresh,
                        None => break,
                    }
                }
            }
        }

        self.fail_pending(TransportError::Shutdown);
        self.subs.clear();
        self.set_state(ConnectionState::Closed);
        tracing::debug!(url = %self.display_url, "WebSocket task stopped");
    }

    /// Pump one connection until it drops or shutdown is requested.
    async fn serve(&self, ws: WsStream, frames: &mut mpsc::UnboundedReceiver<String>) -> Exit {
        let (mut sink, mut stream) = ws.split();
        self.set_state(ConnectionState::Connected);

        for (key, params) in self.subs.parked() {
            let wire = self.ids.next_id();
            self.pending
                .lock()
                .unwrap()
                .insert(wire, Pending::Resubscribe { key });
            let frame = frame(wire, SUBSCRIBE, params);
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                tracing::warn!(url = %self.display_url, error = %e, "resubscribe write failed");
                return Exit::Disconnected;
            }
        }

        let mut keep_alive = self
            .keep_alive
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));

        loop {
            let outgoing = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
                next = frames.recv() => match next {
                    Some(frame) => frame,
                    None => return Exit::Shutdown,
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.handle_frame(text.as_str()) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!(url = %self.display_url, "WebSocket closed by peer");
                        return Exit::Disconnected;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(url = %self.display_url, error = %e, "WebSocket receive error");
                        return Exit::Disconnected;
                    }
                    Some(Ok(_)) => continue,
                },
                _ = async {
                    match keep_alive.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let wire = self.ids.next_id();
                    self.pending.lock().unwrap().insert(wire, Pending::KeepAlive);
                    tracing::trace!(url = %self.display_url, "keep-alive");
                    frame(wire, KEEP_ALIVE, vec![])
                }
            };

            if let Err(e) = sink.send(Message::Text(outgoing.into())).await {
                tracing::warn!(url = %self.display_url, error = %e, "WebSocket write failed");
                return Exit::Disconnected;
            }
        }
    }

    /// Route one incoming text frame. May return a frame to write back.
    fn handle_frame(&self, text: &str) -> Option<String> {
        let resp: JsonRpcResponse = match serde_json::from_str(text) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unparseable WebSocket frame");
                return None;
            }
        };

        if let Some(push) = resp.notification() {
            let id = SubscriptionId(push.subscription);
            if !self.subs.dispatch(&id, push.result) {
                tracing::debug!(subscription = %id, "push for unknown subscription");
            }
            return None;
        }

        let RpcId::Number(wire) = resp.id else {
            tracing::debug!(id = %resp.id, "reply with foreign id");
            return None;
        };
        let Some(entry) = self.pending.lock().unwrap().remove(&wire) else {
            tracing::debug!(id = wire, "reply for unknown or abandoned request");
            return None;
        };

        match entry {
            Pending::Call(tx) => {
                let _ = tx.send(Ok(resp));
                None
            }
            Pending::KeepAlive => None,
            Pending::Subscribe { key, tx } => {
                let orphan = match &resp.result {
                    Some(Value::String(id)) => self.bind_or_orphan(key, id),
                    _ => None,
                };
                let _ = tx.send(Ok(resp));
                orphan
            }
            Pending::Resubscribe { key } => match resp.result {
                Some(Value::String(id)) => {
                    tracing::info!(subscription = %id, url = %self.display_url, "resubscribed");
                    self.bind_or_orphan(key, &id)
                }
                result => {
                    let err = match resp.error {
                        Some(error) => TransportError::rpc(error, self.display_url.as_str(), SUBSCRIBE),
                        None => TransportError::Deserialization(format!(
                            "subscription id must be a string, got {}",
                            result.unwrap_or(Value::Null)
                        )),
                    };
                    tracing::warn!(url = %self.display_url, error = %err, "resubscribe refused");
                    if let Some(on_error) = self.subs.fail(key) {
                        on_error(err);
                    }
                    None
                }
            },
        }
    }

    /// Bind a confirmed subscription. If its owner already went away,
    /// return an `eth_unsubscribe` frame for the server-side leftover.
    fn bind_or_orphan(&self, key: u64, id: &str) -> Option<String> {
        if self.subs.bind(key, SubscriptionId(id.to_string())) {
            return None;
        }
        let wire = self.ids.next_id();
        self.pending.lock().unwrap().insert(wire, Pending::KeepAlive);
        Some(frame(wire, UNSUBSCRIBE, vec![Value::String(id.to_string())]))
    }

    async fn reconnect(&self) -> Option<WsStream> {
        self.set_state(ConnectionState::Reconnecting);
        for attempt in 1..=self.reconnect.max_attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.reconnect.delay) => {}
            }
            tracing::info!(url = %self.display_url, attempt, "reconnecting");
            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                res = dial(&self.url, self.auth.as_ref(), self.timeout) => res,
            };
            match dialed {
                Ok(ws) => return Some(ws),
                Err(e) => tracing::warn!(url = %self.display_url, attempt, error = %e, "reconnect failed"),
            }
        }
        tracing::error!(
            url = %self.display_url,
            attempts = self.reconnect.max_attempts,
            "giving up on WebSocket reconnect"
        );
        None
    }

    fn fail_pending(&self, err: TransportError) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            match entry {
                Pending::Call(tx) | Pending::Subscribe { tx, .. } => {
                    let _ = tx.send(Err(err.clone()));
                }
                Pending::Resubscribe { .. } | Pending::KeepAlive => {}
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(url = %self.display_url, from = %previous, to = %state, "connection state");
        }
    }
}

fn frame(id: u64, method: &str, params: Vec<Value>) -> String {
    serde_json::to_string(&JsonRpcRequest::new(id, method, params)).unwrap_or_default()
}
