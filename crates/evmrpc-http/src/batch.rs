//! Batch scheduler: coalesce concurrent requests into JSON array calls.
//!
//! Callers enqueue into one shared pending list. The list is flushed as a
//! single `send_batch` when it reaches `batch_size`, when the `wait` timer
//! armed by its first entry fires, or when [`BatchScheduler::flush`] is
//! called. Replies are matched back to callers by id, never by position.
//!
//! # Usage
//! ```rust,no_run
//! use evmrpc_http::{BatchConfig, HttpClientConfig, HttpRpcClient};
//! use std::time::Duration;
//!
//! let client = HttpRpcClient::new(
//!     "https://rpc.example.com",
//!     HttpClientConfig {
//!         batch: Some(BatchConfig { batch_size: 100, wait: Duration::from_millis(5) }),
//!         ..Default::default()
//!     },
//! );
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use evmrpc_core::error::TransportError;
use evmrpc_core::id::IdGenerator;
use evmrpc_core::CancellationToken;
use evmrpc_core::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use evmrpc_core::transport::RpcTransport;

type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;

/// Flush thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush as soon as this many requests are pending.
    pub batch_size: usize,
    /// Flush this long after the first request lands in an empty list.
    pub wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            wait: Duration::ZERO,
        }
    }
}

struct BatchItem {
    /// Carries the scheduler-assigned wire id.
    req: JsonRpcRequest,
    caller_id: RpcId,
    tx: ResponseSender,
}

#[derive(Default)]
struct Pending {
    items: Vec<BatchItem>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a stale timer never flushes a newer batch.
    generation: u64,
    closed: bool,
}

impl Pending {
    fn take(&mut self) -> Vec<BatchItem> {
        self.generation += 1;
        std::mem::take(&mut self.items)
    }
}

struct Inner {
    sender: Arc<dyn RpcTransport>,
    config: BatchConfig,
    ids: IdGenerator,
    pending: Mutex<Pending>,
    /// Cancelled by `close`; releases callers whose batch is on the wire.
    shutdown: CancellationToken,
}

/// Coalesces concurrent [`schedule`](Self::schedule) calls into batches.
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    /// `sender` performs the wire-level batch call (its `send_batch`).
    pub fn new(sender: Arc<dyn RpcTransport>, config: BatchConfig, ids: IdGenerator) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender,
                config: BatchConfig {
                    batch_size: config.batch_size.max(1),
                    ..config
                },
                ids,
                pending: Mutex::new(Pending::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue `req` and wait for its own reply.
    ///
    /// The wire id is replaced by a fresh one for the trip and the caller's
    /// id is restored on the reply. Dropping the returned future abandons
    /// the wait only; the request still goes out with its batch.
    pub async fn schedule(&self, mut req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let caller_id = req.swap_id(self.inner.ids.next_rpc_id());
        let (tx, rx) = oneshot::channel();

        let full = {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.closed {
                return Err(TransportError::Shutdown);
            }
            pending.items.push(BatchItem { req, caller_id, tx });

            if pending.items.len() >= self.inner.config.batch_size {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                Some(pending.take())
            } else {
                if pending.items.len() == 1 {
                    let generation = pending.generation;
                    let weak = Arc::downgrade(&self.inner);
                    let wait = self.inner.config.wait;
                    pending.timer = Some(tokio::spawn(flush_after(weak, wait, generation)));
                }
                None
            }
        };

        if let Some(batch) = full {
            self.inner.dispatch(batch);
        }

        rx.await.map_err(|_| TransportError::Shutdown)?
    }

    /// Send whatever is pending right now.
    pub fn flush(&self) {
        let batch = {
            let mut pending = self.inner.pending.lock().unwrap();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.take()
        };
        self.inner.dispatch(batch);
    }

    /// Number of requests waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().items.len()
    }

    /// Stop the scheduler. Queued callers, and callers whose batch is still
    /// awaiting its reply, receive [`TransportError::Shutdown`]; later calls
    /// are rejected. Calling it again is a no-op.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let drained = {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.closed {
                return;
            }
            pending.closed = true;
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.take()
        };
        for item in drained {
            let _ = item.tx.send(Err(TransportError::Shutdown));
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn flush_after(inner: Weak<Inner>, wait: Duration, generation: u64) {
    tokio::time::sleep(wait).await;
    let Some(inner) = inner.upgrade() else { return };
    let batch = {
        let mut pending = inner.pending.lock().unwrap();
        if pending.generation != generation {
            return;
        }
        pending.timer = None;
        pending.take()
    };
    inner.dispatch(batch);
}

impl Inner {
    /// Send one batch in the background and route each reply to its caller.
    fn dispatch(&self, batch: Vec<BatchItem>) {
        if batch.is_empty() {
            return;
        }
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let reqs: Vec<JsonRpcRequest> = batch.iter().map(|b| b.req.clone()).collect();
            tracing::debug!(size = reqs.len(), url = %sender.url(), "flushing batch");

            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(size = batch.len(), "batch abandoned on close");
                    for item in batch {
                        let _ = item.tx.send(Err(TransportError::Shutdown));
                    }
                    return;
                }
                sent = sender.send_batch(reqs) => sent,
            };

            match sent {
                Ok(responses) => {
                    let mut by_id: HashMap<RpcId, JsonRpcResponse> =
                        responses.into_iter().map(|r| (r.id.clone(), r)).collect();
                    for item in batch {
                        let result = match by_id.remove(&item.req.id) {
                            Some(mut resp) => {
                                resp.id = item.caller_id;
                                Ok(resp)
                            }
                            None => {
                                tracing::warn!(id = %item.caller_id, "batch reply missing entry");
                                Err(TransportError::MissingResponse { id: item.caller_id })
                            }
                        };
                        let _ = item.tx.send(result);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, size = batch.len(), "batch request failed");
                    for item in batch {
                        let _ = item.tx.send(Err(e.clone()));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evmrpc_core::config::TransportConfig;
    use evmrpc_core::{CancelExt, CancellationToken};
    use futures::future::join_all;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Echoes `"0x" + method` for every request, replying in reverse order.
    #[derive(Default)]
    struct EchoBatch {
        config: TransportConfig,
        batches: Mutex<Vec<usize>>,
        drop_method: Option<&'static str>,
        fail: bool,
        /// Never answer.
        stall: bool,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl RpcTransport for EchoBatch {
        async fn send(&self, _req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            unreachable!("scheduler only uses send_batch")
        }

        async fn send_batch(
            &self,
            reqs: Vec<JsonRpcRequest>,
        ) -> Result<Vec<JsonRpcResponse>, TransportError> {
            self.batches.lock().unwrap().push(reqs.len());
            self.sent.fetch_add(reqs.len(), Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(TransportError::Http {
                    status: 502,
                    body: "bad gateway".into(),
                    url: "mock".into(),
                    retry_after: None,
                });
            }
            Ok(reqs
                .into_iter()
                .rev()
                .filter(|r| Some(r.method.as_str()) != self.drop_method)
                .map(|r| JsonRpcResponse::success(r.id, Value::String(format!("0x{}", r.method))))
                .collect())
        }

        fn config(&self) -> &TransportConfig {
            &self.config
        }

        fn url(&self) -> &str {
            "mock://batch"
        }
    }

    fn scheduler(sender: Arc<EchoBatch>, batch_size: usize, wait: Duration) -> Arc<BatchScheduler> {
        Arc::new(BatchScheduler::new(
            sender,
            BatchConfig { batch_size, wait },
            IdGenerator::new(),
        ))
    }

    fn req(method: &str, id: u64) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method, vec![])
    }

    #[tokio::test]
    async fn each_caller_gets_its_own_reply() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 5, Duration::from_secs(3600));

        let calls = (0..5).map(|i| {
            let s = s.clone();
            async move { s.schedule(req(&format!("m{i}"), 100 + i)).await }
        });
        let results = join_all(calls).await;

        for (i, res) in results.into_iter().enumerate() {
            let resp = res.unwrap();
            assert_eq!(resp.id, RpcId::Number(100 + i as u64));
            assert_eq!(resp.result.unwrap(), format!("0xm{i}"));
        }
        assert_eq!(*sender.batches.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn batch_size_flushes_without_waiting_for_timer() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 3, Duration::from_secs(3600));

        let started = Instant::now();
        let calls = (0..3).map(|i| {
            let s = s.clone();
            async move { s.schedule(req("eth_chainId", i)).await }
        });
        let results = tokio::time::timeout(Duration::from_secs(5), join_all(calls))
            .await
            .expect("size trigger should flush immediately");
        assert!(results.iter().all(Result::is_ok));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*sender.batches.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 100, Duration::from_millis(20));

        let (a, b) = tokio::join!(
            s.schedule(req("eth_blockNumber", 1)),
            s.schedule(req("eth_gasPrice", 2)),
        );
        assert_eq!(a.unwrap().result.unwrap(), "0xeth_blockNumber");
        assert_eq!(b.unwrap().result.unwrap(), "0xeth_gasPrice");
        assert_eq!(*sender.batches.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn explicit_flush() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 100, Duration::from_secs(3600));

        let waiting = {
            let s = s.clone();
            tokio::spawn(async move { s.schedule(req("eth_chainId", 7)).await })
        };
        while s.pending_len() < 1 {
            tokio::task::yield_now().await;
        }
        s.flush();

        let resp = waiting.await.unwrap().unwrap();
        assert_eq!(resp.result.unwrap(), "0xeth_chainId");
        assert_eq!(s.pending_len(), 0);
    }

    #[tokio::test]
    async fn close_releases_callers_whose_batch_is_in_flight() {
        let sender = Arc::new(EchoBatch {
            stall: true,
            ..Default::default()
        });
        let s = scheduler(sender.clone(), 1, Duration::from_secs(3600));

        let waiting = {
            let s = s.clone();
            tokio::spawn(async move { s.schedule(req("eth_chainId", 1)).await })
        };
        while sender.sent.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(s.pending_len(), 0);

        s.close();
        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("close must release the in-flight caller")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn batch_dispatched_after_close_is_not_sent() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 100, Duration::from_secs(3600));
        s.close();

        s.inner.dispatch(vec![BatchItem {
            req: req("eth_chainId", 1),
            caller_id: RpcId::Number(1),
            tx: oneshot::channel().0,
        }]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }

    // JSON-RPC does not say what a server must do when it leaves an entry
    // out of a batch reply; the scheduler reports it to that caller only.
    #[tokio::test]
    async fn missing_reply_only_fails_its_caller() {
        let sender = Arc::new(EchoBatch {
            drop_method: Some("eth_lost"),
            ..Default::default()
        });
        let s = scheduler(sender, 3, Duration::from_secs(3600));

        let (a, b, c) = tokio::join!(
            s.schedule(req("eth_a", 1)),
            s.schedule(req("eth_lost", 2)),
            s.schedule(req("eth_c", 3)),
        );
        assert_eq!(a.unwrap().result.unwrap(), "0xeth_a");
        match b {
            Err(TransportError::MissingResponse { id }) => assert_eq!(id, RpcId::Number(2)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.unwrap().result.unwrap(), "0xeth_c");
    }

    #[tokio::test]
    async fn whole_batch_failure_reaches_every_caller() {
        let sender = Arc::new(EchoBatch {
            fail: true,
            ..Default::default()
        });
        let s = scheduler(sender, 2, Duration::from_secs(3600));
        let (a, b) = tokio::join!(s.schedule(req("eth_a", 1)), s.schedule(req("eth_b", 2)));
        for res in [a, b] {
            assert!(matches!(res, Err(TransportError::Http { status: 502, .. })));
        }
    }

    #[tokio::test]
    async fn duplicate_caller_ids_do_not_collide() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender, 2, Duration::from_secs(3600));
        let (a, b) = tokio::join!(s.schedule(req("eth_a", 1)), s.schedule(req("eth_b", 1)));
        assert_eq!(a.unwrap().result.unwrap(), "0xeth_a");
        assert_eq!(b.unwrap().result.unwrap(), "0xeth_b");
    }

    #[tokio::test]
    async fn close_releases_waiters_and_rejects_new_calls() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 100, Duration::from_secs(3600));

        let waiting = {
            let s = s.clone();
            tokio::spawn(async move { s.schedule(req("eth_chainId", 1)).await })
        };
        while s.pending_len() < 1 {
            tokio::task::yield_now().await;
        }
        s.close();
        s.close();

        assert!(matches!(waiting.await.unwrap(), Err(TransportError::Shutdown)));
        assert!(matches!(
            s.schedule(req("eth_chainId", 2)).await,
            Err(TransportError::Shutdown)
        ));
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_disturb_siblings() {
        let sender = Arc::new(EchoBatch::default());
        let s = scheduler(sender.clone(), 100, Duration::from_secs(3600));
        let token = CancellationToken::new();

        let cancelled = {
            let s = s.clone();
            let token = token.clone();
            tokio::spawn(async move { s.schedule(req("eth_a", 1)).with_cancel(&token).await })
        };
        let sibling = {
            let s = s.clone();
            tokio::spawn(async move { s.schedule(req("eth_b", 2)).await })
        };
        while s.pending_len() < 2 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        assert!(matches!(cancelled.await.unwrap(), Err(TransportError::Cancelled)));

        s.flush();
        assert_eq!(sibling.await.unwrap().unwrap().result.unwrap(), "0xeth_b");
        // The abandoned request still went out with its batch.
        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
    }
}
