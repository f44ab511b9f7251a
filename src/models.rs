//! Normalized market-data records shared by all connectors.
//!
//! Every connector parses its exchange-specific wire format into these types;
//! nothing downstream of a connector ever sees a raw exchange payload.
//! Timestamps are UTC epoch seconds; `None` means the source supplied none.

use serde::{Deserialize, Serialize};

/// Builds the canonical `BASE/QUOTE` pair code.
pub fn pair_code(base: &str, quote: &str) -> String {
    format!("{}/{}", base, quote)
}

/// Spot instrument descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub is_spot_enabled: bool,
    pub is_margin_enabled: bool,
    pub exchange_symbol: Option<String>,
}

/// Perpetual (linear) contract descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualTicker {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub exchange_symbol: String,
    /// Settlement currency, e.g. USDT.
    pub settlement: String,
}

/// Top-of-book bid/ask pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub symbol: String,
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
    #[serde(default)]
    pub last_update_id: Option<u64>,
    #[serde(default)]
    pub utc: Option<f64>,
}

impl BookTicker {
    pub fn mid_price(&self) -> f64 {
        (self.bid_price + self.ask_price) * 0.5
    }
}

/// One level of an order book ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BidAsk {
    pub price: f64,
    pub quantity: f64,
}

/// Multi-level bid/ask ladder. Bids descend by price, asks ascend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDepth {
    pub symbol: String,
    pub bids: Vec<BidAsk>,
    pub asks: Vec<BidAsk>,
    #[serde(default)]
    pub exchange_symbol: Option<String>,
    #[serde(default)]
    pub last_update_id: Option<u64>,
    #[serde(default)]
    pub utc: Option<f64>,
}

impl BookDepth {
    pub fn best_bid(&self) -> Option<&BidAsk> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BidAsk> {
        self.asks.first()
    }
}

/// OHLCV bar for a fixed interval (1m in this system).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleStick {
    /// UTC second of the bar's open edge.
    pub utc_open_time: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub coin_volume: f64,
    /// Filled only when the quote is a USD proxy (USDT/USDC/DAI/UST).
    #[serde(default)]
    pub usd_volume: Option<f64>,
}

/// A priced pair: `ratio` units of quote per unit of base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
    pub ratio: f64,
    #[serde(default)]
    pub utc: Option<f64>,
}

impl CurrencyPair {
    pub fn code(&self) -> String {
        pair_code(&self.base, &self.quote)
    }
}

/// Current funding rate plus the next funding time for a perpetual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    pub next_funding_utc: f64,
    #[serde(default)]
    pub next_rate: Option<f64>,
    #[serde(default)]
    pub index_price: Option<f64>,
    #[serde(default)]
    pub utc: Option<f64>,
}

/// Single point of funding rate history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingRatePoint {
    pub funding_time_utc: f64,
    pub rate: f64,
}

/// Withdraw/deposit availability for one coin on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawInfo {
    pub ex_code: String,
    pub coin: String,
    pub network_names: Vec<String>,
    pub withdraw_enabled: bool,
    pub deposit_enabled: bool,
    #[serde(default)]
    pub fixed_withdraw_fee: Option<f64>,
    #[serde(default)]
    pub withdraw_min: Option<f64>,
    #[serde(default)]
    pub withdraw_max: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_code() {
        assert_eq!(pair_code("BTC", "USDT"), "BTC/USDT");
        let pair = CurrencyPair {
            base: "ETH".to_string(),
            quote: "USDT".to_string(),
            ratio: 3000.0,
            utc: None,
        };
        assert_eq!(pair.code(), "ETH/USDT");
    }

    #[test]
    fn test_book_ticker_mid() {
        let book = BookTicker {
            symbol: "BTC/USDT".to_string(),
            bid_price: 50000.0,
            bid_qty: 1.0,
            ask_price: 50010.0,
            ask_qty: 2.0,
            last_update_id: Some(7),
            utc: Some(1_700_000_000.0),
        };
        assert!((book.mid_price() - 50005.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_currency_pair_json_round_trip() {
        let pair = CurrencyPair {
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            ratio: 50000.5,
            utc: Some(1000.0),
        };
        let raw = serde_json::to_string(&pair).unwrap();
        let back: CurrencyPair = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, pair);
    }

    #[test]
    fn test_depth_json_round_trip_without_optionals() {
        // `None` fields may be missing entirely in stored JSON.
        let raw = r#"{"symbol":"BTC/USDT","bids":[{"price":99.0,"quantity":1.0}],"asks":[{"price":101.0,"quantity":2.0}]}"#;
        let depth: BookDepth = serde_json::from_str(raw).unwrap();
        assert_eq!(depth.symbol, "BTC/USDT");
        assert_eq!(depth.best_bid().unwrap().price, 99.0);
        assert_eq!(depth.best_ask().unwrap().quantity, 2.0);
        assert!(depth.utc.is_none());
        let again: BookDepth =
            serde_json::from_str(&serde_json::to_string(&depth).unwrap()).unwrap();
        assert_eq!(again, depth);
    }

    #[test]
    fn test_funding_rate_round_trip() {
        let fr = FundingRate {
            symbol: "BTC/USDT".to_string(),
            rate: 0.0001,
            next_funding_utc: 1_700_000_000.0,
            next_rate: None,
            index_price: Some(50000.0),
            utc: Some(1_699_999_000.0),
        };
        let back: FundingRate =
            serde_json::from_str(&serde_json::to_string(&fr).unwrap()).unwrap();
        assert_eq!(back, fr);
    }
}
