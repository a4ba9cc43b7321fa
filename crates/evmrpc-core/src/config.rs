//! Per-transport identity and policy.

use std::time::Duration;

/// Allow/deny list of JSON-RPC methods.
///
/// `exclude` always wins. An empty `include` allows everything that is not
/// excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl MethodFilter {
    pub fn include<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: methods.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn exclude<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Vec::new(),
            exclude: methods.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, method: &str) -> bool {
        if self.exclude.iter().any(|m| m == method) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|m| m == method)
    }
}

/// What kind of transport a config belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
    Fallback,
    Custom,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::WebSocket => write!(f, "webSocket"),
            Self::Fallback => write!(f, "fallback"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Identity and request policy of one transport. Read-only once the
/// transport is built.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub name: String,
    pub key: String,
    pub kind: TransportKind,
    pub methods: MethodFilter,
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// Base delay of the exponential backoff.
    pub retry_delay: Duration,
    /// Bound on each physical attempt.
    pub timeout: Duration,
    /// Return node errors inside `Ok` responses instead of as `Err`.
    pub raw: bool,
}

impl TransportConfig {
    pub fn new(kind: TransportKind) -> Self {
        let (key, name) = match kind {
            TransportKind::Http => ("http", "HTTP JSON-RPC"),
            TransportKind::WebSocket => ("webSocket", "WebSocket JSON-RPC"),
            TransportKind::Fallback => ("fallback", "Fallback"),
            TransportKind::Custom => ("custom", "Custom Provider"),
        };
        Self {
            name: name.into(),
            key: key.into(),
            kind,
            methods: MethodFilter::default(),
            retry_count: 3,
            retry_delay: Duration::from_millis(150),
            timeout: Duration::from_secs(10),
            raw: false,
        }
    }

    pub fn with_methods(mut self, methods: MethodFilter) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(TransportKind::Custom)
    }
}

const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(4);

/// Default polling cadence for a chain: half its block time, kept within
/// 500ms..4s. Unknown block time falls back to 4s.
pub fn polling_interval(block_time: Option<Duration>) -> Duration {
    match block_time {
        Some(bt) => (bt / 2).clamp(MIN_POLLING_INTERVAL, MAX_POLLING_INTERVAL),
        None => MAX_POLLING_INTERVAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_allows_everything() {
        let f = MethodFilter::default();
        assert!(f.is_allowed("eth_call"));
    }

    #[test]
    fn include_restricts() {
        let f = MethodFilter::include(["eth_chainId"]);
        assert!(f.is_allowed("eth_chainId"));
        assert!(!f.is_allowed("eth_sendTransaction"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = MethodFilter {
            include: vec!["eth_call".into(), "eth_getLogs".into()],
            exclude: vec!["eth_getLogs".into()],
        };
        assert!(f.is_allowed("eth_call"));
        assert!(!f.is_allowed("eth_getLogs"));
    }

    #[test]
    fn polling_interval_bounds() {
        assert_eq!(polling_interval(None), Duration::from_secs(4));
        assert_eq!(polling_interval(Some(Duration::from_secs(12))), Duration::from_secs(4));
        assert_eq!(polling_interval(Some(Duration::from_secs(2))), Duration::from_secs(1));
        assert_eq!(
            polling_interval(Some(Duration::from_millis(250))),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn defaults() {
        let c = TransportConfig::new(TransportKind::Http);
        assert_eq!(c.key, "http");
        assert_eq!(c.retry_count, 3);
        assert_eq!(c.retry_delay, Duration::from_millis(150));
        assert!(!c.raw);
    }
}
