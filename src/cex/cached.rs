//! Cache facades over the connectors.
//!
//! Each accessor builds a deterministic key, tries the shared store, and
//! calls through on a miss. A call that returns nothing stores the negative
//! sentinel so repeated lookups do not re-hit the exchange; a call that
//! errors bypasses the cache entirely. Streaming is forwarded verbatim.

use crate::cache::{SharedStore, NEGATIVE_SENTINEL};
use crate::cex::{
    MarketKind, PerpetualConnector, SpotConnector, StreamCallback, DEFAULT_FUNDING_HISTORY_LIMIT,
    DEFAULT_KLINE_LIMIT,
};
use crate::models::{
    BookDepth, CandleStick, CurrencyPair, FundingRate, FundingRatePoint, PerpetualTicker, Ticker,
    WithdrawInfo,
};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// `{exchange_id}:{kind}:{method}[:{args…}]`
fn cache_key(exchange_id: &str, kind: MarketKind, method: &str, parts: &[&str]) -> String {
    if parts.is_empty() {
        format!("{}:{}:{}", exchange_id, kind, method)
    } else {
        format!("{}:{}:{}:{}", exchange_id, kind, method, parts.join(":"))
    }
}

fn norm_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

fn pairs_key_part(symbols: Option<&[String]>) -> String {
    match symbols {
        None => "all".to_string(),
        Some(list) => {
            let mut parts: Vec<String> = list.iter().map(|s| norm_symbol(s)).collect();
            parts.sort();
            parts.join(",")
        }
    }
}

struct CacheSide {
    store: SharedStore,
    timeout_secs: i64,
}

impl CacheSide {
    /// Outer `None` = miss; inner `None` = cached negative result.
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<Option<T>> {
        if self.timeout_secs <= 0 {
            return None;
        }
        match self.store.get(key).await {
            Ok(Some(raw)) => {
                if raw == NEGATIVE_SENTINEL {
                    return Some(None);
                }
                match serde_json::from_str(&raw) {
                    Ok(value) => Some(Some(value)),
                    // Stale shape: fall through to the connector.
                    Err(_) => None,
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache get failed");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: Option<&T>) {
        if self.timeout_secs <= 0 {
            return;
        }
        let raw = match value {
            Some(value) => match serde_json::to_string(value) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key, error = %e, "cache encode failed");
                    return;
                }
            },
            None => NEGATIVE_SENTINEL.to_string(),
        };
        if let Err(e) = self.store.set_ex(key, &raw, self.timeout_secs as u64).await {
            warn!(key, error = %e, "cache set failed");
        }
    }
}

pub struct CachedSpotConnector {
    inner: Arc<dyn SpotConnector>,
    cache: CacheSide,
}

impl CachedSpotConnector {
    pub fn new(inner: Arc<dyn SpotConnector>, store: SharedStore, cache_timeout_secs: i64) -> Self {
        Self {
            inner,
            cache: CacheSide {
                store,
                timeout_secs: cache_timeout_secs,
            },
        }
    }

    fn key(&self, method: &str, parts: &[&str]) -> String {
        cache_key(self.inner.exchange_id().as_str(), MarketKind::Spot, method, parts)
    }

    pub fn exchange_id(&self) -> crate::cex::ExchangeId {
        self.inner.exchange_id()
    }

    pub async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        let key = self.key("ticker", &[]);
        if let Some(Some(hit)) = self.cache.read::<Vec<Ticker>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_all_tickers().await?;
        self.cache.write(&key, Some(&out)).await;
        Ok(out)
    }

    pub async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let sym = norm_symbol(pair_code);
        let key = self.key("price", &[&sym]);
        if let Some(hit) = self.cache.read::<CurrencyPair>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_price(pair_code).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let part = pairs_key_part(symbols);
        let key = self.key("pairs", &[&part]);
        if let Some(Some(hit)) = self.cache.read::<Vec<CurrencyPair>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_pairs(symbols).await?;
        self.cache.write(&key, Some(&out)).await;
        Ok(out)
    }

    pub async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>> {
        let sym = norm_symbol(symbol);
        let limit_part = limit.to_string();
        let key = self.key("depth", &[&sym, &limit_part]);
        if let Some(hit) = self.cache.read::<BookDepth>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_depth(symbol, limit).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>> {
        let n = limit.unwrap_or(DEFAULT_KLINE_LIMIT);
        let sym = norm_symbol(symbol);
        let n_part = n.to_string();
        let key = self.key("klines", &[&sym, &n_part]);
        if let Some(hit) = self.cache.read::<Vec<CandleStick>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_klines(symbol, limit).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    /// Not cached: withdraw tables change rarely but carry per-account state
    /// on some exchanges.
    pub async fn get_withdraw_info(&self) -> Result<Option<HashMap<String, Vec<WithdrawInfo>>>> {
        self.inner.get_withdraw_info().await
    }

    pub async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.inner.start(cb, symbols, depth).await
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub fn subscribe(&self, tokens: &[String]) {
        self.inner.subscribe(tokens)
    }

    pub fn unsubscribe(&self, tokens: &[String]) {
        self.inner.unsubscribe(tokens)
    }
}

pub struct CachedPerpetualConnector {
    inner: Arc<dyn PerpetualConnector>,
    cache: CacheSide,
}

impl CachedPerpetualConnector {
    pub fn new(
        inner: Arc<dyn PerpetualConnector>,
        store: SharedStore,
        cache_timeout_secs: i64,
    ) -> Self {
        Self {
            inner,
            cache: CacheSide {
                store,
                timeout_secs: cache_timeout_secs,
            },
        }
    }

    fn key(&self, method: &str, parts: &[&str]) -> String {
        cache_key(
            self.inner.exchange_id().as_str(),
            MarketKind::Perpetual,
            method,
            parts,
        )
    }

    pub fn exchange_id(&self) -> crate::cex::ExchangeId {
        self.inner.exchange_id()
    }

    pub async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        let key = self.key("ticker", &[]);
        if let Some(Some(hit)) = self.cache.read::<Vec<PerpetualTicker>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_all_perpetuals().await?;
        self.cache.write(&key, Some(&out)).await;
        Ok(out)
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let sym = norm_symbol(symbol);
        let key = self.key("price", &[&sym]);
        if let Some(hit) = self.cache.read::<CurrencyPair>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_price(symbol).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let part = pairs_key_part(symbols);
        let key = self.key("pairs", &[&part]);
        if let Some(Some(hit)) = self.cache.read::<Vec<CurrencyPair>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_pairs(symbols).await?;
        self.cache.write(&key, Some(&out)).await;
        Ok(out)
    }

    pub async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>> {
        let sym = norm_symbol(symbol);
        let limit_part = limit.to_string();
        let key = self.key("depth", &[&sym, &limit_part]);
        if let Some(hit) = self.cache.read::<BookDepth>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_depth(symbol, limit).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>> {
        let n = limit.unwrap_or(DEFAULT_KLINE_LIMIT);
        let sym = norm_symbol(symbol);
        let n_part = n.to_string();
        let key = self.key("klines", &[&sym, &n_part]);
        if let Some(hit) = self.cache.read::<Vec<CandleStick>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_klines(symbol, limit).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let sym = norm_symbol(symbol);
        let key = self.key("funding", &[&sym]);
        if let Some(hit) = self.cache.read::<FundingRate>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_funding_rate(symbol).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn get_funding_rate_history(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<FundingRatePoint>>> {
        let n = limit.unwrap_or(DEFAULT_FUNDING_HISTORY_LIMIT);
        let sym = norm_symbol(symbol);
        let n_part = n.to_string();
        let key = self.key("funding_history", &[&sym, &n_part]);
        if let Some(hit) = self.cache.read::<Vec<FundingRatePoint>>(&key).await {
            return Ok(hit);
        }
        let out = self.inner.get_funding_rate_history(symbol, limit).await?;
        self.cache.write(&key, out.as_ref()).await;
        Ok(out)
    }

    pub async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.inner.start(cb, symbols, depth).await
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub fn subscribe(&self, tokens: &[String]) {
        self.inner.subscribe(tokens)
    }

    pub fn unsubscribe(&self, tokens: &[String]) {
        self.inner.unsubscribe(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::cex::ExchangeId;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSpot {
        price_calls: AtomicUsize,
        price: Option<f64>,
        fail: bool,
    }

    #[async_trait]
    impl SpotConnector for CountingSpot {
        fn exchange_id(&self) -> ExchangeId {
            ExchangeId::Binance
        }

        async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
            Ok(vec![])
        }

        async fn get_price(&self, _pair_code: &str) -> Result<Option<CurrencyPair>> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("exchange down");
            }
            Ok(self.price.map(|ratio| CurrencyPair {
                base: "BTC".to_string(),
                quote: "USDT".to_string(),
                ratio,
                utc: Some(1000.0),
            }))
        }

        async fn get_pairs(&self, _symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
            Ok(vec![])
        }

        async fn get_depth(&self, _symbol: &str, _limit: usize) -> Result<Option<BookDepth>> {
            Ok(None)
        }

        async fn get_klines(
            &self,
            _symbol: &str,
            _limit: Option<usize>,
        ) -> Result<Option<Vec<CandleStick>>> {
            Ok(None)
        }

        async fn start(
            &self,
            _cb: Arc<dyn StreamCallback>,
            _symbols: Option<&[String]>,
            _depth: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
        fn subscribe(&self, _tokens: &[String]) {}
        fn unsubscribe(&self, _tokens: &[String]) {}
    }

    #[test]
    fn test_cache_key_layout() {
        assert_eq!(
            cache_key("binance", MarketKind::Spot, "ticker", &[]),
            "binance:spot:ticker"
        );
        assert_eq!(
            cache_key("gate", MarketKind::Perpetual, "depth", &["BTCUSDT", "100"]),
            "gate:perpetual:depth:BTCUSDT:100"
        );
        assert_eq!(
            pairs_key_part(Some(&["ETH/USDT".to_string(), "BTC/USDT".to_string()])),
            "BTCUSDT,ETHUSDT"
        );
        assert_eq!(pairs_key_part(None), "all");
    }

    #[tokio::test]
    async fn test_price_fetched_once_within_ttl() {
        let inner = Arc::new(CountingSpot {
            price: Some(50000.0),
            ..Default::default()
        });
        let cached = CachedSpotConnector::new(inner.clone(), MemoryStore::shared(), 60);
        let first = cached.get_price("BTC/USDT").await.unwrap().unwrap();
        let second = cached.get_price("BTC/USDT").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.price_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_result_cached_as_sentinel() {
        let inner = Arc::new(CountingSpot::default());
        let store = MemoryStore::shared();
        let cached = CachedSpotConnector::new(inner.clone(), store.clone(), 60);
        assert!(cached.get_price("XXX/BTC").await.unwrap().is_none());
        assert!(cached.get_price("XXX/BTC").await.unwrap().is_none());
        assert_eq!(inner.price_calls.load(Ordering::SeqCst), 1);
        let raw = store.get("binance:spot:price:XXXBTC").await.unwrap();
        assert_eq!(raw.as_deref(), Some(NEGATIVE_SENTINEL));
    }

    #[tokio::test]
    async fn test_error_bypasses_cache() {
        let inner = Arc::new(CountingSpot {
            fail: true,
            ..Default::default()
        });
        let store = MemoryStore::shared();
        let cached = CachedSpotConnector::new(inner.clone(), store.clone(), 60);
        assert!(cached.get_price("BTC/USDT").await.is_err());
        assert!(cached.get_price("BTC/USDT").await.is_err());
        // Both calls hit the connector; nothing was cached.
        assert_eq!(inner.price_calls.load(Ordering::SeqCst), 2);
        assert!(store.get("binance:spot:price:BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let inner = Arc::new(CountingSpot {
            price: Some(1.0),
            ..Default::default()
        });
        let cached = CachedSpotConnector::new(inner.clone(), MemoryStore::shared(), 0);
        cached.get_price("BTC/USDT").await.unwrap();
        cached.get_price("BTC/USDT").await.unwrap();
        assert_eq!(inner.price_calls.load(Ordering::SeqCst), 2);
    }
}
