//! Ranked fallback across several transports.
//!
//! Each call walks the current order snapshot and returns the first
//! success. Per-child latency and success/failure counts are folded into a
//! score on every ranking tick; the new order only affects later calls.

use std::cmp::Ordering as CmpOrdering;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{polling_interval, TransportConfig, TransportKind};
use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{HealthStatus, RpcTransport};

/// Relative weight of latency and stability in the ranking score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    pub latency: f64,
    pub stability: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            latency: 0.3,
            stability: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankConfig {
    /// How often the order is recomputed.
    pub interval: Duration,
    pub weights: RankWeights,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            interval: polling_interval(None),
            weights: RankWeights::default(),
        }
    }
}

/// Configuration for [`FallbackTransport`].
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub transport: TransportConfig,
    /// `None` keeps the construction order forever.
    pub rank: Option<RankConfig>,
}

impl FallbackConfig {
    /// Rank on the chain's polling cadence.
    pub fn for_block_time(block_time: Option<Duration>) -> Self {
        Self {
            rank: Some(RankConfig {
                interval: polling_interval(block_time),
                ..RankConfig::default()
            }),
            ..Self::default()
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::new(TransportKind::Fallback),
            rank: Some(RankConfig::default()),
        }
    }
}

/// Rolling observations for one child transport.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    /// Smoothed latency of successful attempts.
    pub latency: Duration,
    pub successes: u64,
    pub failures: u64,
}

impl TransportStats {
    fn record_success(&mut self, elapsed: Duration) {
        self.latency = if self.successes == 0 {
            elapsed
        } else {
            (self.latency + elapsed) / 2
        };
        self.successes += 1;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// successes / attempts, 0 before the first attempt.
    pub fn success_ratio(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Score every child: `w_l * (1 - latency / max_latency) + w_s * success_ratio`.
///
/// A child with no successes has no latency sample and gets no latency credit.
pub fn score(stats: &[TransportStats], weights: RankWeights) -> Vec<f64> {
    let max_latency = stats
        .iter()
        .map(|s| s.latency.as_secs_f64())
        .fold(0.0_f64, f64::max);

    stats
        .iter()
        .map(|s| {
            let latency_score = if max_latency > 0.0 && s.successes > 0 {
                (1.0 - s.latency.as_secs_f64() / max_latency).max(0.0)
            } else {
                0.0
            };
            weights.latency * latency_score + weights.stability * s.success_ratio()
        })
        .collect()
}

/// A transport that tries its children in ranked order.
pub struct FallbackTransport {
    children: Vec<Arc<dyn RpcTransport>>,
    stats: Mutex<Vec<TransportStats>>,
    order: RwLock<Arc<Vec<usize>>>,
    config: FallbackConfig,
    shutdown: CancellationToken,
}

impl FallbackTransport {
    /// Build a fallback transport and, if ranking is enabled and a Tokio
    /// runtime is available, start the ranking task.
    pub fn new(
        children: Vec<Arc<dyn RpcTransport>>,
        config: FallbackConfig,
    ) -> Result<Arc<Self>, TransportError> {
        if children.is_empty() {
            return Err(TransportError::Config(
                "fallback transport needs at least one child transport".into(),
            ));
        }

        let n = children.len();
        let this = Arc::new(Self {
            children,
            stats: Mutex::new(vec![TransportStats::default(); n]),
            order: RwLock::new(Arc::new((0..n).collect())),
            config,
            shutdown: CancellationToken::new(),
        });

        if let Some(rank) = this.config.rank.clone() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak = Arc::downgrade(&this);
                    let shutdown = this.shutdown.clone();
                    handle.spawn(rank_loop(weak, rank.interval, shutdown));
                }
                Err(_) => {
                    tracing::warn!("no Tokio runtime; fallback ranking disabled");
                }
            }
        }

        Ok(this)
    }

    /// Number of child transports.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Current attempt order as child indices.
    pub fn order(&self) -> Vec<usize> {
        self.order.read().unwrap().as_ref().clone()
    }

    /// Current attempt order as child URLs.
    pub fn ordered_urls(&self) -> Vec<String> {
        self.order()
            .into_iter()
            .map(|i| self.children[i].url().to_string())
            .collect()
    }

    /// Snapshot of every child's stats, by construction index.
    pub fn stats(&self) -> Vec<TransportStats> {
        self.stats.lock().unwrap().clone()
    }

    /// Recompute scores and swap in the new order.
    pub fn rank_now(&self) {
        let weights = self
            .config
            .rank
            .as_ref()
            .map(|r| r.weights)
            .unwrap_or_default();
        let scores = score(&self.stats.lock().unwrap(), weights);

        let current = self.order();
        let mut next = current.clone();
        next.sort_by(|a, b| {
            scores[*b]
                .partial_cmp(&scores[*a])
                .unwrap_or(CmpOrdering::Equal)
        });

        if next != current {
            tracing::info!(order = ?next, scores = ?scores, "fallback order changed");
            *self.order.write().unwrap() = Arc::new(next);
        }
    }

    fn record_success(&self, idx: usize, elapsed: Duration) {
        self.stats.lock().unwrap()[idx].record_success(elapsed);
    }

    fn record_failure(&self, idx: usize) {
        self.stats.lock().unwrap()[idx].record_failure();
    }
}

async fn rank_loop(transport: Weak<FallbackTransport>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(transport) = transport.upgrade() else { break };
        transport.rank_now();
    }
    tracing::debug!("fallback ranking stopped");
}

impl Drop for FallbackTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RpcTransport for FallbackTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        if !self.config.transport.methods.is_allowed(&req.method) {
            return Err(TransportError::MethodNotSupported { method: req.method });
        }

        let order = self.order.read().unwrap().clone();
        let mut last_error = None;

        for &idx in order.iter() {
            let child = &self.children[idx];
            let started = Instant::now();
            match child.send(req.clone()).await {
                Ok(resp) => {
                    self.record_success(idx, started.elapsed());
                    return Ok(resp);
                }
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) => {
                    self.record_failure(idx);
                    tracing::warn!(
                        url = %child.url(),
                        method = %req.method,
                        error = %e,
                        "transport failed, falling back"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::Config("no child transports".into())))
    }

    fn config(&self) -> &TransportConfig {
        &self.config.transport
    }

    fn health(&self) -> HealthStatus {
        let unhealthy = self
            .children
            .iter()
            .filter(|c| c.health() == HealthStatus::Unhealthy)
            .count();
        match unhealthy {
            0 => HealthStatus::Healthy,
            n if n == self.children.len() => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    fn url(&self) -> &str {
        "fallback"
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        let results = join_all(self.children.iter().map(|child| child.close())).await;
        let mut errors = Vec::new();
        for (child, result) in self.children.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(url = %child.url(), error = %e, "failed to close transport");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Close(errors))
        }
    }
}
