//! Feed client configuration.
//!
//! Defaults are production-tuned; every knob can be overridden from the
//! environment (`FEED_*` variables) without touching call sites.

use std::time::Duration;

/// Configuration for the connection pool and subscribe protocol.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Maximum number of pair subscriptions per physical connection
    /// (upstream hub cap).
    pub max_pairs_per_connection: usize,
    /// Timeout for each hub call (`SubscribeToExchangeDeltas`,
    /// `QueryExchangeState`). A call that never resolves must not wedge the
    /// subscribe queue.
    pub call_timeout_ms: u64,
    /// Delay before retrying `connect()` on a connection that reported
    /// `Disconnected` (or whose initial connect attempt failed).
    pub reconnect_wait_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_pairs_per_connection: 20,
            call_timeout_ms: 10_000,
            reconnect_wait_ms: 100,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("FEED_MAX_PAIRS_PER_CONNECTION") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.max_pairs_per_connection = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FEED_CALL_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                cfg.call_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FEED_RECONNECT_WAIT_MS") {
            if let Ok(ms) = v.parse() {
                cfg.reconnect_wait_ms = ms;
            }
        }

        cfg
    }

    #[inline]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[inline]
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.max_pairs_per_connection, 20);
        assert_eq!(cfg.call_timeout(), Duration::from_secs(10));
    }
}
