//! REST rate limiting: per-(exchange, kind) weight windows and 429 retry
//! with capped backoff.
//!
//! The weight tracker is process-global; limits below come from the official
//! docs and lean conservative where the exchange publishes none.

use crate::cex::{ExchangeId, MarketKind};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_WEIGHT_ESTIMATE: f64 = 1.0;
pub const MAX_RETRIES_429: u32 = 2;
pub const MAX_DELAY_429_SECS: u64 = 120;
pub const BACKOFF_MULTIPLIER: f64 = 1.5;
const WINDOW_SECS: f64 = 60.0;

// Binance weight per minute, echoed back in a response header.
const BINANCE_LIMIT: f64 = 6000.0;
const BINANCE_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";
// OKX: 20 req/s per endpoint; 1200/min as a conservative request budget.
const OKX_LIMIT: f64 = 1200.0;
// The narrow 100 req/min budgets.
const NARROW_LIMIT: f64 = 100.0;

/// (limit per window, weight header) for the pair.
pub fn limit_for(exchange: ExchangeId, _kind: MarketKind) -> (f64, Option<&'static str>) {
    match exchange {
        ExchangeId::Binance => (BINANCE_LIMIT, Some(BINANCE_WEIGHT_HEADER)),
        ExchangeId::Okx => (OKX_LIMIT, None),
        _ => (NARROW_LIMIT, None),
    }
}

struct WindowState {
    window_start: Instant,
    used_weight: f64,
}

/// In-process weight usage per (exchange, kind) over a sliding window.
pub struct WeightTracker {
    window: Duration,
    state: Mutex<HashMap<(ExchangeId, MarketKind), WindowState>>,
}

impl WeightTracker {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: Duration::from_secs_f64(window_secs),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide tracker shared by every connector.
    pub fn global() -> &'static WeightTracker {
        static TRACKER: OnceLock<WeightTracker> = OnceLock::new();
        TRACKER.get_or_init(|| WeightTracker::new(WINDOW_SECS))
    }

    /// Sleeps out the window remainder when the estimate would cross the
    /// budget. The lock is held only to inspect and update the window.
    pub async fn wait_if_needed(
        &self,
        exchange: ExchangeId,
        kind: MarketKind,
        estimated_weight: f64,
    ) {
        let (limit, _) = limit_for(exchange, kind);
        let sleep_for = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let entry = state.entry((exchange, kind)).or_insert(WindowState {
                window_start: now,
                used_weight: 0.0,
            });
            let elapsed = now.duration_since(entry.window_start);
            if elapsed >= self.window {
                entry.window_start = now;
                entry.used_weight = 0.0;
                None
            } else if entry.used_weight + estimated_weight >= limit {
                Some(self.window - elapsed)
            } else {
                None
            }
        };
        if let Some(dur) = sleep_for {
            debug!(
                exchange = %exchange,
                kind = %kind,
                sleep_ms = dur.as_millis() as u64,
                "weight budget exhausted, waiting out the window"
            );
            tokio::time::sleep(dur).await;
            let mut state = self.state.lock();
            state.insert(
                (exchange, kind),
                WindowState {
                    window_start: Instant::now(),
                    used_weight: 0.0,
                },
            );
        }
    }

    pub fn add_used(&self, exchange: ExchangeId, kind: MarketKind, weight: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry((exchange, kind)).or_insert(WindowState {
            window_start: now,
            used_weight: 0.0,
        });
        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.used_weight = 0.0;
        }
        entry.used_weight += weight;
    }

    pub fn used(&self, exchange: ExchangeId, kind: MarketKind) -> f64 {
        let state = self.state.lock();
        state
            .get(&(exchange, kind))
            .map(|entry| entry.used_weight)
            .unwrap_or(0.0)
    }
}

/// GET with weight wait before the call, 429 retry with capped backoff, and
/// weight accounting from the response header where the exchange sends one.
pub async fn request_with_retry(
    tracker: &WeightTracker,
    http: &reqwest::Client,
    exchange: ExchangeId,
    kind: MarketKind,
    url: &str,
    params: &[(String, String)],
    timeout: Duration,
) -> Result<reqwest::Response> {
    let mut attempt: u32 = 0;
    let mut delay_429 = 0.0f64;

    loop {
        tracker
            .wait_if_needed(exchange, kind, DEFAULT_WEIGHT_ESTIMATE)
            .await;
        let resp = http
            .get(url)
            .query(params)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if resp.status().as_u16() != 429 {
            if resp.status().is_success() {
                let (_, header_name) = limit_for(exchange, kind);
                let weight = header_name
                    .and_then(|name| resp.headers().get(name))
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<f64>().ok())
                    .unwrap_or(DEFAULT_WEIGHT_ESTIMATE);
                tracker.add_used(exchange, kind, weight);
            }
            return Ok(resp);
        }

        attempt += 1;
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60)
            .min(MAX_DELAY_429_SECS);
        delay_429 = if attempt == 1 {
            retry_after as f64
        } else {
            (delay_429 * BACKOFF_MULTIPLIER).min(MAX_DELAY_429_SECS as f64)
        };
        if attempt > MAX_RETRIES_429 {
            return Err(anyhow!(
                "GET {} rate limited (429) after {} retries",
                url,
                MAX_RETRIES_429
            ));
        }
        warn!(
            exchange = %exchange,
            kind = %kind,
            url,
            attempt,
            delay_secs = delay_429,
            "429 from exchange, backing off"
        );
        tokio::time::sleep(Duration::from_secs_f64(delay_429)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_table() {
        assert_eq!(
            limit_for(ExchangeId::Binance, MarketKind::Spot),
            (6000.0, Some("X-MBX-USED-WEIGHT-1M"))
        );
        assert_eq!(
            limit_for(ExchangeId::Binance, MarketKind::Perpetual).0,
            6000.0
        );
        assert_eq!(limit_for(ExchangeId::Okx, MarketKind::Spot), (1200.0, None));
        for ex in [
            ExchangeId::Htx,
            ExchangeId::Gate,
            ExchangeId::Kucoin,
            ExchangeId::Mexc,
            ExchangeId::Bitfinex,
        ] {
            assert_eq!(limit_for(ex, MarketKind::Spot), (100.0, None));
            assert_eq!(limit_for(ex, MarketKind::Perpetual), (100.0, None));
        }
    }

    #[tokio::test]
    async fn test_accounting_per_pair() {
        let tracker = WeightTracker::new(60.0);
        tracker.add_used(ExchangeId::Gate, MarketKind::Spot, 3.0);
        tracker.add_used(ExchangeId::Gate, MarketKind::Spot, 2.0);
        tracker.add_used(ExchangeId::Gate, MarketKind::Perpetual, 7.0);
        assert_eq!(tracker.used(ExchangeId::Gate, MarketKind::Spot), 5.0);
        assert_eq!(tracker.used(ExchangeId::Gate, MarketKind::Perpetual), 7.0);
        assert_eq!(tracker.used(ExchangeId::Okx, MarketKind::Spot), 0.0);
    }

    #[tokio::test]
    async fn test_window_reset_clears_usage() {
        // Tiny window so the reset branch is exercised without mock clocks.
        let tracker = WeightTracker::new(0.01);
        tracker.add_used(ExchangeId::Mexc, MarketKind::Spot, 99.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.add_used(ExchangeId::Mexc, MarketKind::Spot, 1.0);
        assert_eq!(tracker.used(ExchangeId::Mexc, MarketKind::Spot), 1.0);
    }

    #[tokio::test]
    async fn test_under_budget_does_not_wait() {
        let tracker = WeightTracker::new(60.0);
        let started = Instant::now();
        tracker
            .wait_if_needed(ExchangeId::Binance, MarketKind::Spot, 1.0)
            .await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_over_budget_waits_out_window() {
        let tracker = WeightTracker::new(0.05);
        tracker.add_used(ExchangeId::Htx, MarketKind::Spot, 100.0);
        let started = Instant::now();
        tracker
            .wait_if_needed(ExchangeId::Htx, MarketKind::Spot, 1.0)
            .await;
        // Must have slept roughly the window remainder, then reset.
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(tracker.used(ExchangeId::Htx, MarketKind::Spot), 0.0);
    }
}
