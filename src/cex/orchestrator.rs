//! Orchestrator: bridges live records to the hot cache and the throttled
//! snapshot table.
//!
//! One instance serves one (exchange, kind, symbol). Prices always land in
//! the cache with the configured TTL; a snapshot row is additionally written
//! when the DB-write interval has elapsed, keyed by the aligned bucket so
//! the table holds at most one row per bucket. Depth, candles, funding, and
//! withdraw publishes are cache-only; the retrievers mirror the publishers.

use crate::cache::SharedStore;
use crate::cex::{utc_now_secs, ExchangeId, MarketKind};
use crate::db::{Db, SnapshotRecord};
use crate::models::{BookDepth, CandleStick, CurrencyPair, FundingRate, FundingRatePoint, WithdrawInfo};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

const KEY_PREFIX: &str = "arbitrage:orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStrategy {
    Replace,
    /// Merging preserves the side (or candles) the new payload does not carry.
    Merge,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cache TTL in seconds; also the default DB-write interval.
    pub cache_timeout: f64,
    pub align_to_minutes: i64,
    pub db_write_interval: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_timeout: 15.0,
            align_to_minutes: 1,
            db_write_interval: 15.0,
        }
    }
}

/// Floors a UTC second to the `align_to_minutes` bucket edge.
pub fn align_utc(utc: f64, align_to_minutes: i64) -> f64 {
    let interval = (align_to_minutes * 60) as f64;
    (utc / interval).floor() * interval
}

pub struct Orchestrator {
    db: Db,
    store: SharedStore,
    exchange_id: ExchangeId,
    kind: MarketKind,
    symbol: String,
    config: OrchestratorConfig,
    last_db_save: Mutex<Option<f64>>,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        store: SharedStore,
        exchange_id: ExchangeId,
        kind: MarketKind,
        symbol: &str,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            store,
            exchange_id,
            kind,
            symbol: symbol.to_string(),
            config,
            last_db_save: Mutex::new(None),
        }
    }

    fn method_key(&self, method: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            KEY_PREFIX, method, self.exchange_id, self.kind, self.symbol
        )
    }

    /// Withdraw info is per exchange, not per symbol.
    fn withdraw_key(&self) -> String {
        format!("{}:withdraw:{}:{}", KEY_PREFIX, self.exchange_id, self.kind)
    }

    async fn cache_write<T: serde::Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(e) = self
                    .store
                    .set_ex(key, &raw, self.config.cache_timeout.max(1.0) as u64)
                    .await
                {
                    warn!(key, error = %e, "orchestrator cache write failed");
                }
            }
            Err(e) => warn!(key, error = %e, "orchestrator cache encode failed"),
        }
    }

    async fn cache_read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "orchestrator cache read failed");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Price (cache + snapshot)
    // ------------------------------------------------------------------

    /// Always writes the cache; additionally upserts an aligned snapshot row
    /// when the DB-write interval has elapsed since the last snapshot.
    pub async fn publish_price(&self, pair: &CurrencyPair) -> Result<()> {
        let key = self.method_key("price");
        self.cache_write(&key, pair).await;

        let now = utc_now_secs();
        let due = {
            let last = self.last_db_save.lock();
            last.map_or(true, |stamp| now >= stamp + self.config.db_write_interval)
        };
        if !due {
            return Ok(());
        }
        let aligned = align_utc(pair.utc.unwrap_or(now), self.config.align_to_minutes);
        self.db
            .upsert_snapshot(&SnapshotRecord {
                exchange_id: self.exchange_id.as_str().to_string(),
                kind: self.kind.as_str().to_string(),
                symbol: self.symbol.clone(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                ratio: pair.ratio,
                utc: pair.utc,
                align_to_minutes: self.config.align_to_minutes,
                aligned_timestamp: aligned,
            })
            .await?;
        *self.last_db_save.lock() = Some(now);
        Ok(())
    }

    /// Cache first; on miss the most recent snapshot row re-warms the cache.
    pub async fn get_price(&self) -> Result<Option<CurrencyPair>> {
        let key = self.method_key("price");
        if let Some(pair) = self.cache_read::<CurrencyPair>(&key).await {
            return Ok(Some(pair));
        }
        let record = self
            .db
            .latest_snapshot(
                self.exchange_id.as_str(),
                self.kind.as_str(),
                &self.symbol,
                self.config.align_to_minutes,
            )
            .await?;
        let Some(record) = record else {
            return Ok(None);
        };
        let pair = CurrencyPair {
            base: record.base,
            quote: record.quote,
            ratio: record.ratio,
            utc: record.utc,
        };
        self.cache_write(&key, &pair).await;
        Ok(Some(pair))
    }

    // ------------------------------------------------------------------
    // Depth / candles / funding / withdraw (cache only)
    // ------------------------------------------------------------------

    pub async fn publish_book_depth(
        &self,
        depth: &BookDepth,
        strategy: PublishStrategy,
    ) -> Result<()> {
        let key = self.method_key("depth");
        let merged = match strategy {
            PublishStrategy::Replace => depth.clone(),
            PublishStrategy::Merge => {
                let mut merged = depth.clone();
                if let Some(existing) = self.cache_read::<BookDepth>(&key).await {
                    if merged.bids.is_empty() {
                        merged.bids = existing.bids;
                    }
                    if merged.asks.is_empty() {
                        merged.asks = existing.asks;
                    }
                }
                merged
            }
        };
        self.cache_write(&key, &merged).await;
        Ok(())
    }

    pub async fn get_depth(&self) -> Result<Option<BookDepth>> {
        Ok(self.cache_read(&self.method_key("depth")).await)
    }

    /// Idempotent by `utc_open_time`: candles for an existing open edge
    /// replace that entry, new edges are inserted in time order.
    pub async fn publish_candlesticks(
        &self,
        candles: &[CandleStick],
        strategy: PublishStrategy,
    ) -> Result<()> {
        let key = self.method_key("klines");
        let mut merged: Vec<CandleStick> = match strategy {
            PublishStrategy::Replace => Vec::new(),
            PublishStrategy::Merge => self.cache_read(&key).await.unwrap_or_default(),
        };
        for candle in candles {
            match merged
                .iter_mut()
                .find(|c| c.utc_open_time == candle.utc_open_time)
            {
                Some(slot) => *slot = candle.clone(),
                None => merged.push(candle.clone()),
            }
        }
        merged.sort_by(|a, b| a.utc_open_time.total_cmp(&b.utc_open_time));
        self.cache_write(&key, &merged).await;
        Ok(())
    }

    pub async fn get_klines(&self, limit: Option<usize>) -> Result<Option<Vec<CandleStick>>> {
        let candles: Option<Vec<CandleStick>> = self.cache_read(&self.method_key("klines")).await;
        Ok(candles.map(|mut list| {
            if let Some(n) = limit {
                if list.len() > n {
                    let cut = list.len() - n;
                    list.drain(..cut);
                }
            }
            list
        }))
    }

    pub async fn publish_funding_rate(&self, funding: &FundingRate) -> Result<()> {
        self.cache_write(&self.method_key("funding"), funding).await;
        Ok(())
    }

    pub async fn get_funding_rate(&self) -> Result<Option<FundingRate>> {
        Ok(self.cache_read(&self.method_key("funding")).await)
    }

    pub async fn publish_funding_history(&self, history: &[FundingRatePoint]) -> Result<()> {
        self.cache_write(&self.method_key("funding_history"), &history)
            .await;
        Ok(())
    }

    pub async fn get_funding_rate_history(&self) -> Result<Option<Vec<FundingRatePoint>>> {
        Ok(self.cache_read(&self.method_key("funding_history")).await)
    }

    pub async fn publish_withdraw_info(
        &self,
        info: &HashMap<String, Vec<WithdrawInfo>>,
    ) -> Result<()> {
        self.cache_write(&self.withdraw_key(), info).await;
        Ok(())
    }

    pub async fn get_withdraw_info(&self) -> Result<Option<HashMap<String, Vec<WithdrawInfo>>>> {
        Ok(self.cache_read(&self.withdraw_key()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::models::BidAsk;

    fn orchestrator(db: &Db, store: &SharedStore, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            db.clone(),
            store.clone(),
            ExchangeId::Binance,
            MarketKind::Spot,
            "BTC/USDT",
            config,
        )
    }

    fn pair(ratio: f64, utc: f64) -> CurrencyPair {
        CurrencyPair {
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            ratio,
            utc: Some(utc),
        }
    }

    #[test]
    fn test_align_utc() {
        assert_eq!(align_utc(125.0, 1), 120.0);
        assert_eq!(align_utc(120.0, 1), 120.0);
        assert_eq!(align_utc(3599.0, 5), 3300.0);
        assert_eq!(align_utc(0.0, 1), 0.0);
    }

    #[tokio::test]
    async fn test_publish_then_get_price_from_cache() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = orchestrator(&db, &store, OrchestratorConfig::default());
        let published = pair(50000.5, 1000.0);
        orch.publish_price(&published).await.unwrap();
        let got = orch.get_price().await.unwrap().unwrap();
        assert_eq!(got, published);
    }

    #[tokio::test]
    async fn test_get_price_falls_back_to_snapshot_and_rewarms() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = orchestrator(&db, &store, OrchestratorConfig::default());
        orch.publish_price(&pair(60000.0, 2000.0)).await.unwrap();

        // Expire the cache entry; the snapshot row must back it up.
        let key = "arbitrage:orchestrator:price:binance:spot:BTC/USDT";
        store.delete(key).await.unwrap();
        let got = orch.get_price().await.unwrap().unwrap();
        assert_eq!(got.ratio, 60000.0);
        assert_eq!(got.utc, Some(2000.0));
        // Re-warmed.
        assert!(store.get(key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_price_empty_returns_none() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = orchestrator(&db, &store, OrchestratorConfig::default());
        assert!(orch.get_price().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_bucket_dedupe() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let config = OrchestratorConfig {
            db_write_interval: 0.0,
            ..Default::default()
        };
        let orch = orchestrator(&db, &store, config);
        // Same one-minute bucket: single row, updated ratio.
        orch.publish_price(&pair(100.0, 1000.0)).await.unwrap();
        orch.publish_price(&pair(101.0, 1010.0)).await.unwrap();
        assert_eq!(db.count_snapshots("binance", "spot", "BTC/USDT").await.unwrap(), 1);
        let latest = db
            .latest_snapshot("binance", "spot", "BTC/USDT", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.ratio, 101.0);
        assert_eq!(latest.aligned_timestamp, 960.0);

        // Next bucket: second row.
        orch.publish_price(&pair(102.0, 1030.0)).await.unwrap();
        assert_eq!(db.count_snapshots("binance", "spot", "BTC/USDT").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_db_write_interval_dedupes_snapshots() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let config = OrchestratorConfig {
            db_write_interval: 3600.0,
            ..Default::default()
        };
        let orch = orchestrator(&db, &store, config);
        // Different buckets, but within the write interval: one row only.
        orch.publish_price(&pair(100.0, 1000.0)).await.unwrap();
        orch.publish_price(&pair(101.0, 2000.0)).await.unwrap();
        assert_eq!(db.count_snapshots("binance", "spot", "BTC/USDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_depth_merge_preserves_unmatched_side() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = orchestrator(&db, &store, OrchestratorConfig::default());
        let bids_only = BookDepth {
            symbol: "BTC/USDT".to_string(),
            bids: vec![BidAsk { price: 100.0, quantity: 1.0 }],
            asks: vec![],
            exchange_symbol: None,
            last_update_id: None,
            utc: Some(1.0),
        };
        orch.publish_book_depth(&bids_only, PublishStrategy::Replace)
            .await
            .unwrap();
        let asks_only = BookDepth {
            symbol: "BTC/USDT".to_string(),
            bids: vec![],
            asks: vec![BidAsk { price: 101.0, quantity: 2.0 }],
            exchange_symbol: None,
            last_update_id: None,
            utc: Some(2.0),
        };
        orch.publish_book_depth(&asks_only, PublishStrategy::Merge)
            .await
            .unwrap();
        let merged = orch.get_depth().await.unwrap().unwrap();
        assert_eq!(merged.bids.len(), 1);
        assert_eq!(merged.asks.len(), 1);

        // Replace drops the other side.
        orch.publish_book_depth(&asks_only, PublishStrategy::Replace)
            .await
            .unwrap();
        let replaced = orch.get_depth().await.unwrap().unwrap();
        assert!(replaced.bids.is_empty());
    }

    #[tokio::test]
    async fn test_candlestick_merge_is_idempotent_by_open_time() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = orchestrator(&db, &store, OrchestratorConfig::default());
        let candle = |ts: f64, close: f64| CandleStick {
            utc_open_time: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            coin_volume: 1.0,
            usd_volume: None,
        };
        orch.publish_candlesticks(&[candle(60.0, 1.0), candle(120.0, 2.0)], PublishStrategy::Merge)
            .await
            .unwrap();
        // Same open edge published again: replaced, not duplicated.
        orch.publish_candlesticks(&[candle(120.0, 3.0)], PublishStrategy::Merge)
            .await
            .unwrap();
        let klines = orch.get_klines(None).await.unwrap().unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[1].close, 3.0);

        let limited = orch.get_klines(Some(1)).await.unwrap().unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].utc_open_time, 120.0);
    }

    #[tokio::test]
    async fn test_funding_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let store = MemoryStore::shared();
        let orch = Orchestrator::new(
            db,
            store,
            ExchangeId::Okx,
            MarketKind::Perpetual,
            "BTC/USDT",
            OrchestratorConfig::default(),
        );
        let fr = FundingRate {
            symbol: "BTC/USDT".to_string(),
            rate: 0.0001,
            next_funding_utc: 1_700_000_000.0,
            next_rate: None,
            index_price: None,
            utc: Some(1_699_999_000.0),
        };
        orch.publish_funding_rate(&fr).await.unwrap();
        assert_eq!(orch.get_funding_rate().await.unwrap().unwrap(), fr);

        let history = vec![FundingRatePoint {
            funding_time_utc: 1_700_000_000.0,
            rate: 0.0002,
        }];
        orch.publish_funding_history(&history).await.unwrap();
        assert_eq!(
            orch.get_funding_rate_history().await.unwrap().unwrap(),
            history
        );
    }
}
