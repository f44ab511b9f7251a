//! Exchange connectors: uniform contract over eight heterogeneous REST +
//! WebSocket protocols, two market kinds each.
//!
//! A connector owns its symbol mapping, REST accessors (routed through the
//! process-wide rate-limit layer), and a WebSocket state machine whose
//! decoded events pass through the cross-process throttler before reaching
//! the user callback.

pub mod binance;
pub mod bitfinex;
pub mod bybit;
pub mod cached;
pub mod gate;
pub mod htx;
pub mod kucoin;
pub mod mexc;
pub mod okx;
pub mod orchestrator;
pub mod rest_limit;
pub mod subscriptions;
pub mod symbol_map;
pub mod throttler;
pub mod ws;

use crate::cache::SharedStore;
use crate::models::{
    BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint,
    PerpetualTicker, Ticker, WithdrawInfo,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_THROTTLE_TIMEOUT: f64 = 1.0;
pub const DEFAULT_DEPTH_LIMIT: usize = 100;
pub const DEFAULT_KLINE_LIMIT: usize = 60;
pub const DEFAULT_FUNDING_HISTORY_LIMIT: usize = 100;
/// Batch interval for subscribe/unsubscribe; reconnect-style connectors use
/// the longer interval because a flush costs a full stop/start cycle.
pub const DEFAULT_SUBSCRIPTION_BATCH_SECS: f64 = 4.0;
pub const RECONNECT_SUBSCRIPTION_BATCH_SECS: f64 = 15.0;

/// Kinds that do not push candles over WebSocket.
pub const WS_KLINES_UNSUPPORTED: &[(ExchangeId, MarketKind)] = &[
    (ExchangeId::Mexc, MarketKind::Spot),
    (ExchangeId::Mexc, MarketKind::Perpetual),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
    Kucoin,
    Htx,
    Mexc,
    Gate,
    Bitfinex,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 8] = [
        ExchangeId::Binance,
        ExchangeId::Bybit,
        ExchangeId::Okx,
        ExchangeId::Kucoin,
        ExchangeId::Htx,
        ExchangeId::Mexc,
        ExchangeId::Gate,
        ExchangeId::Bitfinex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
            ExchangeId::Kucoin => "kucoin",
            ExchangeId::Htx => "htx",
            ExchangeId::Mexc => "mexc",
            ExchangeId::Gate => "gate",
            ExchangeId::Bitfinex => "bitfinex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Some(ExchangeId::Binance),
            "bybit" => Some(ExchangeId::Bybit),
            "okx" => Some(ExchangeId::Okx),
            "kucoin" => Some(ExchangeId::Kucoin),
            "htx" | "huobi" => Some(ExchangeId::Htx),
            "mexc" => Some(ExchangeId::Mexc),
            "gate" | "gateio" => Some(ExchangeId::Gate),
            "bitfinex" => Some(ExchangeId::Bitfinex),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketKind {
    Spot,
    Perpetual,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Perpetual => "perpetual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Some(MarketKind::Spot),
            "perpetual" | "perp" | "linear" => Some(MarketKind::Perpetual),
            _ => None,
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of real-time events from a streaming connector. At most one of
/// the three slots is set per call.
pub trait StreamCallback: Send + Sync {
    fn handle(
        &self,
        book: Option<BookTicker>,
        depth: Option<BookDepth>,
        kline: Option<CandleStick>,
    );
}

/// Construction-time knobs shared by every connector.
#[derive(Clone)]
pub struct ConnectorOptions {
    pub testing: bool,
    pub throttle_timeout: f64,
    pub store: SharedStore,
    pub http: reqwest::Client,
}

impl ConnectorOptions {
    pub fn new(store: SharedStore) -> Self {
        Self {
            testing: false,
            throttle_timeout: DEFAULT_THROTTLE_TIMEOUT,
            store,
            http: reqwest::Client::new(),
        }
    }

    pub fn testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    pub fn throttle_timeout(mut self, secs: f64) -> Self {
        self.throttle_timeout = secs;
        self
    }
}

#[async_trait]
pub trait SpotConnector: Send + Sync {
    fn exchange_id(&self) -> ExchangeId;

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>>;
    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>>;
    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>>;
    async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>>;
    async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>>;

    async fn get_withdraw_info(&self) -> Result<Option<HashMap<String, Vec<WithdrawInfo>>>> {
        Ok(None)
    }

    /// Opens the transport and begins emitting events. Errors if already
    /// active or if the symbol set resolves to nothing subscribable.
    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()>;

    /// Idempotent; closes the transport without waiting for a clean
    /// protocol shutdown and leaves `start` callable again.
    async fn stop(&self);

    /// Queue symbols for subscription; flushed by the batch timer.
    fn subscribe(&self, tokens: &[String]);
    fn unsubscribe(&self, tokens: &[String]);
}

#[async_trait]
pub trait PerpetualConnector: Send + Sync {
    fn exchange_id(&self) -> ExchangeId;

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>>;
    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>>;
    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>>;
    async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>>;
    async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>>;
    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>>;
    async fn get_funding_rate_history(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<FundingRatePoint>>>;

    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()>;
    async fn stop(&self);

    fn subscribe(&self, tokens: &[String]);
    fn unsubscribe(&self, tokens: &[String]);
}

/// Factory keyed by the (exchange, kind) tag; replaces the dynamic class
/// registry of earlier designs.
pub fn spot_connector(exchange: ExchangeId, opts: ConnectorOptions) -> Arc<dyn SpotConnector> {
    match exchange {
        ExchangeId::Binance => binance::BinanceSpotConnector::new(opts),
        ExchangeId::Bybit => bybit::BybitSpotConnector::new(opts),
        ExchangeId::Okx => okx::OkxSpotConnector::new(opts),
        ExchangeId::Kucoin => kucoin::KucoinSpotConnector::new(opts),
        ExchangeId::Htx => htx::HtxSpotConnector::new(opts),
        ExchangeId::Mexc => mexc::MexcSpotConnector::new(opts),
        ExchangeId::Gate => gate::GateSpotConnector::new(opts),
        ExchangeId::Bitfinex => bitfinex::BitfinexSpotConnector::new(opts),
    }
}

pub fn perpetual_connector(
    exchange: ExchangeId,
    opts: ConnectorOptions,
) -> Arc<dyn PerpetualConnector> {
    match exchange {
        ExchangeId::Binance => binance::BinancePerpetualConnector::new(opts),
        ExchangeId::Bybit => bybit::BybitPerpetualConnector::new(opts),
        ExchangeId::Okx => okx::OkxPerpetualConnector::new(opts),
        ExchangeId::Kucoin => kucoin::KucoinPerpetualConnector::new(opts),
        ExchangeId::Htx => htx::HtxPerpetualConnector::new(opts),
        ExchangeId::Mexc => mexc::MexcPerpetualConnector::new(opts),
        ExchangeId::Gate => gate::GatePerpetualConnector::new(opts),
        ExchangeId::Bitfinex => bitfinex::BitfinexPerpetualConnector::new(opts),
    }
}

// ---------------------------------------------------------------------------
// Shared wire helpers
// ---------------------------------------------------------------------------

/// Quotes treated as a stable proxy for USD when filling `usd_volume`.
pub const USD_PROXY_QUOTES: &[&str] = &["USDT", "USDC", "DAI", "UST"];

pub(crate) fn is_usd_proxy(quote: &str) -> bool {
    USD_PROXY_QUOTES.contains(&quote)
}

pub(crate) fn utc_now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Reads a float out of a JSON value that may be a number or a string.
pub(crate) fn json_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s
            .parse::<u64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as u64)),
        _ => None,
    }
}

/// Parses `[[price, qty], …]` ladders (values may be strings or numbers).
pub(crate) fn levels_from_pairs(rows: &Value) -> Vec<crate::models::BidAsk> {
    let mut out = Vec::new();
    if let Value::Array(rows) = rows {
        for row in rows {
            if let Value::Array(cells) = row {
                if cells.len() >= 2 {
                    if let (Some(price), Some(quantity)) =
                        (json_f64(&cells[0]), json_f64(&cells[1]))
                    {
                        out.push(crate::models::BidAsk { price, quantity });
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_id_parse_round_trip() {
        for ex in ExchangeId::ALL {
            assert_eq!(ExchangeId::parse(ex.as_str()), Some(ex));
        }
        assert_eq!(ExchangeId::parse("HTX"), Some(ExchangeId::Htx));
        assert!(ExchangeId::parse("nasdaq").is_none());
    }

    #[test]
    fn test_market_kind_parse() {
        assert_eq!(MarketKind::parse("spot"), Some(MarketKind::Spot));
        assert_eq!(MarketKind::parse("linear"), Some(MarketKind::Perpetual));
        assert!(MarketKind::parse("margin").is_none());
    }

    #[test]
    fn test_ws_klines_unsupported_is_mexc_only() {
        assert!(WS_KLINES_UNSUPPORTED.contains(&(ExchangeId::Mexc, MarketKind::Spot)));
        assert!(WS_KLINES_UNSUPPORTED.contains(&(ExchangeId::Mexc, MarketKind::Perpetual)));
        assert!(!WS_KLINES_UNSUPPORTED.contains(&(ExchangeId::Gate, MarketKind::Perpetual)));
    }

    #[test]
    fn test_json_f64_accepts_strings_and_numbers() {
        assert_eq!(json_f64(&serde_json::json!("50000.5")), Some(50000.5));
        assert_eq!(json_f64(&serde_json::json!(42)), Some(42.0));
        assert_eq!(json_f64(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_levels_from_pairs() {
        let rows = serde_json::json!([["100.5", "2"], [99.0, 1.5], ["bad"]]);
        let levels = levels_from_pairs(&rows);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 100.5);
        assert_eq!(levels[1].quantity, 1.5);
    }
}
