//! Per-subject event throttling over the shared store.
//!
//! The decision lives in the store (one atomic read-modify-write per call)
//! so that multiple process replicas pace each other. The key prefix carries
//! the connector type, keeping independent connectors on independent clocks.

use crate::cache::SharedStore;
use crate::cex::utc_now_secs;
use tracing::warn;

pub struct Throttler {
    period: f64,
    key_prefix: String,
    store: SharedStore,
}

impl Throttler {
    /// `scope` identifies the owning connector type, e.g. `BinanceSpot`.
    pub fn new(period: f64, store: SharedStore, scope: &str) -> Self {
        Self {
            period,
            key_prefix: format!("arbitrage:throttle:{}", scope),
            store,
        }
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    fn key(&self, name: &str, tag: &str) -> String {
        format!("{}:{}#{}", self.key_prefix, name, tag)
    }

    /// True iff the subject has not passed within the last `period` seconds;
    /// passing atomically stamps the subject. Fails closed: a store error
    /// drops the event rather than bursting under a protective limit.
    pub async fn may_pass(&self, name: &str, tag: &str) -> bool {
        if self.period <= 0.0 {
            return true;
        }
        let key = self.key(name, tag);
        match self
            .store
            .check_and_stamp(&key, utc_now_secs(), self.period)
            .await
        {
            Ok(passed) => passed,
            Err(e) => {
                warn!(key = %key, error = %e, "throttler store error in may_pass");
                false
            }
        }
    }

    /// Seconds until the next call may pass (0 when it may pass now).
    pub async fn soon_timeout(&self, name: &str, tag: &str) -> f64 {
        let key = self.key(name, tag);
        match self.store.last_stamp(&key).await {
            Ok(Some(last)) => (self.period - (utc_now_secs() - last)).max(0.0),
            Ok(None) => 0.0,
            Err(e) => {
                warn!(key = %key, error = %e, "throttler store error in soon_timeout");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn throttler(period: f64) -> Throttler {
        Throttler::new(period, MemoryStore::shared(), "TestConnector")
    }

    #[tokio::test]
    async fn test_first_pass_allowed_second_denied() {
        let t = throttler(60.0);
        for name in ["name1", "name2", "name3"] {
            assert!(t.may_pass(name, "").await);
        }
        for name in ["name1", "name2", "name3"] {
            assert!(!t.may_pass(name, "").await);
        }
    }

    #[tokio::test]
    async fn test_tag_isolation() {
        let t = throttler(60.0);
        assert!(t.may_pass("sym", "book").await);
        assert!(t.may_pass("sym", "depth").await);
        assert!(!t.may_pass("sym", "book").await);
        assert!(!t.may_pass("sym", "depth").await);
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let store = MemoryStore::shared();
        let spot = Throttler::new(60.0, store.clone(), "BinanceSpot");
        let perp = Throttler::new(60.0, store, "BinancePerpetual");
        assert!(spot.may_pass("BTC/USDT", "book").await);
        assert!(perp.may_pass("BTC/USDT", "book").await);
        assert!(!spot.may_pass("BTC/USDT", "book").await);
        assert!(!perp.may_pass("BTC/USDT", "book").await);
    }

    #[tokio::test]
    async fn test_soon_timeout() {
        let t = throttler(10.0);
        assert_eq!(t.soon_timeout("n", "").await, 0.0);
        assert!(t.may_pass("n", "").await);
        let left = t.soon_timeout("n", "").await;
        assert!(left > 9.0 && left <= 10.0, "got {}", left);
    }

    #[tokio::test]
    async fn test_zero_period_always_passes() {
        let t = throttler(0.0);
        assert!(t.may_pass("n", "").await);
        assert!(t.may_pass("n", "").await);
    }
}
