//! MEXC connectors: spot and contract perpetual.
//!
//! The spot "stream" is REST-polled: the browser WS pushes protobuf frames
//! this core does not decode, so book and depth are polled per symbol at the
//! throttler's pace. The perpetual side uses the JSON contract WS
//! (`sub.ticker` / `sub.depth`). Neither kind ships WS candles.

use crate::cex::rest_limit::{self, WeightTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::cex::subscriptions::{SubscriptionBatcher, SubscriptionSink};
use crate::cex::symbol_map::SymbolIndex;
use crate::cex::throttler::Throttler;
use crate::cex::ws::{self, EventQueue, FrameCodec, StreamCore, EVENT_QUEUE_CAPACITY};
use crate::cex::{
    is_usd_proxy, json_f64, json_u64, levels_from_pairs, utc_now_secs, ConnectorOptions,
    ExchangeId, MarketKind, PerpetualConnector, SpotConnector, StreamCallback,
    DEFAULT_FUNDING_HISTORY_LIMIT, DEFAULT_KLINE_LIMIT, DEFAULT_SUBSCRIPTION_BATCH_SECS,
};
use crate::models::{
    pair_code, BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint,
    PerpetualTicker, Ticker,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const SPOT_API: &str = "https://api.mexc.com";
const CONTRACT_API: &str = "https://api.mexc.com";
const CONTRACT_WS: &str = "wss://contract.mexc.com/edge";

const SPOT_DEPTH_API_MAX: usize = 5000;
const CONTRACT_DEPTH_API_MAX: usize = 100;
const SPOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SPOT_POLL_DEPTH_LIMIT: usize = 20;
const SPOT_POLL_DEPTH_LEVELS: usize = 10;
const CONTRACT_SUBSCRIBE_ALL_CAP: usize = 200;

const SPOT_QUOTES: &[&str] = &["USDT", "USDC", "BTC", "ETH"];

fn spot_native_to_symbol(native: &str) -> Option<String> {
    let upper = native.to_uppercase();
    for quote in SPOT_QUOTES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(pair_code(base, quote));
            }
        }
    }
    None
}

fn contract_to_symbol(native: &str) -> String {
    // BTC_USDT -> BTC/USDT
    native.replace('_', "/")
}

fn symbol_to_contract(symbol: &str) -> String {
    symbol.replace('/', "_")
}

/// Spot error payloads carry a non-success `code`.
fn check_spot_code(data: &Value) -> Result<()> {
    if let Some(code) = data.get("code").and_then(Value::as_i64) {
        if code != 200 && code != 0 {
            bail!(
                "mexc API error {}: {}",
                code,
                data["msg"].as_str().unwrap_or("unknown")
            );
        }
    }
    Ok(())
}

/// Contract responses wrap in `{success, code, data}`.
fn unwrap_contract(data: Value) -> Result<Value> {
    if data["success"].as_bool() == Some(false) {
        bail!(
            "mexc contract API error {}: {}",
            data["code"].as_i64().unwrap_or(0),
            data["msg"].as_str().unwrap_or("unknown")
        );
    }
    Ok(data.get("data").cloned().unwrap_or(data))
}

fn ticker_aliases(t: &Ticker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    if let Some(native) = &t.exchange_symbol {
        keys.push(native.clone());
    }
}

fn perp_aliases(t: &PerpetualTicker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(t.symbol.replace('/', "_"));
    keys.push(t.exchange_symbol.clone());
}

fn parse_spot_symbols(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in data["symbols"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["status"].as_str() != Some("1") {
            continue;
        }
        let native = item["symbol"].as_str().unwrap_or("");
        if native.is_empty() {
            continue;
        }
        let base = item["baseAsset"].as_str().unwrap_or("");
        let quote = item["quoteAsset"].as_str().unwrap_or("");
        let symbol = if base.is_empty() || quote.is_empty() {
            match spot_native_to_symbol(native) {
                Some(symbol) => symbol,
                None => continue,
            }
        } else {
            pair_code(base, quote)
        };
        let (base, quote) = symbol.split_once('/').unwrap_or(("", ""));
        out.push(Ticker {
            symbol: symbol.clone(),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: item["isMarginTradingAllowed"].as_bool().unwrap_or(false),
            exchange_symbol: Some(native.to_string()),
        });
    }
    out
}

fn parse_contracts(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let native = item["symbol"].as_str().unwrap_or("");
        if native.is_empty() {
            continue;
        }
        // state 0 = live
        if item.get("state").and_then(Value::as_i64).unwrap_or(0) != 0 {
            continue;
        }
        let base = item["baseCoin"].as_str().unwrap_or("");
        let quote = item["quoteCoin"].as_str().unwrap_or("");
        let symbol = contract_to_symbol(native);
        let (base, quote) = if base.is_empty() || quote.is_empty() {
            match symbol.split_once('/') {
                Some((b, q)) => (b.to_string(), q.to_string()),
                None => continue,
            }
        } else {
            (base.to_string(), quote.to_string())
        };
        let settlement = item["settleCoin"].as_str().unwrap_or(&quote).to_string();
        out.push(PerpetualTicker {
            symbol: pair_code(&base, &quote),
            base,
            quote,
            exchange_symbol: native.to_string(),
            settlement,
        });
    }
    out
}

/// Contract klines arrive as parallel arrays.
fn parse_contract_klines(data: &Value, quote: &str, limit: usize) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let times = data["time"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    let field = |name: &str, idx: usize| -> f64 {
        data[name]
            .as_array()
            .and_then(|col| col.get(idx))
            .and_then(json_f64)
            .unwrap_or(0.0)
    };
    let mut out = Vec::new();
    for (idx, ts) in times.iter().take(limit).enumerate() {
        let Some(ts) = json_f64(ts) else { continue };
        let close = field("close", idx);
        let volume = field("vol", idx);
        out.push(CandleStick {
            utc_open_time: ts,
            open: field("open", idx),
            high: field("high", idx),
            low: field("low", idx),
            close,
            coin_volume: volume,
            usd_volume: if usd { Some(volume * close) } else { None },
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Spot (REST-polled streaming)
// ---------------------------------------------------------------------------

pub struct MexcSpotConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl MexcSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "MexcSpot");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", SPOT_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Mexc,
            MarketKind::Spot,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp.json::<Value>().await.with_context(|| format!("decode {}", url))?;
        check_spot_code(&data)?;
        Ok(data)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_json("/api/v3/exchangeInfo", &[]).await?;
                Ok(SymbolIndex::build(parse_spot_symbols(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        Ok(idx.get_any([symbol, no_slash.as_str()]).cloned())
    }

    /// One polling pass over the desired set; each symbol is gated by the
    /// same throttle tags a WS connector would use.
    async fn poll_once(&self) {
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let depth_enabled = self.core.depth_enabled();
        let desired = self.core.desired_symbols();
        let tickers: Vec<Ticker> = match &desired {
            None => idx.items().to_vec(),
            Some(list) => idx
                .items()
                .iter()
                .filter(|t| list.contains(&t.symbol))
                .cloned()
                .collect(),
        };
        for ticker in tickers {
            if !self.core.is_active() {
                return;
            }
            let Some(native) = ticker.exchange_symbol.clone() else { continue };
            if self.throttler.may_pass(&ticker.symbol, "book").await {
                match self
                    .get_json(
                        "/api/v3/ticker/bookTicker",
                        &[("symbol".to_string(), native.clone())],
                    )
                    .await
                {
                    Ok(data) if data["symbol"].as_str() == Some(native.as_str()) => {
                        cb.handle(
                            Some(BookTicker {
                                symbol: ticker.symbol.clone(),
                                bid_price: json_f64(&data["bidPrice"]).unwrap_or(0.0),
                                bid_qty: json_f64(&data["bidQty"]).unwrap_or(0.0),
                                ask_price: json_f64(&data["askPrice"]).unwrap_or(0.0),
                                ask_qty: json_f64(&data["askQty"]).unwrap_or(0.0),
                                last_update_id: None,
                                utc: Some(utc_now_secs()),
                            }),
                            None,
                            None,
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(symbol = %ticker.symbol, error = %e, "mexc spot book poll failed");
                        continue;
                    }
                }
            }
            if depth_enabled && self.throttler.may_pass(&ticker.symbol, "depth").await {
                match self
                    .get_json(
                        "/api/v3/depth",
                        &[
                            ("symbol".to_string(), native.clone()),
                            ("limit".to_string(), SPOT_POLL_DEPTH_LIMIT.to_string()),
                        ],
                    )
                    .await
                {
                    Ok(data) => {
                        let mut bids = levels_from_pairs(&data["bids"]);
                        let mut asks = levels_from_pairs(&data["asks"]);
                        bids.truncate(SPOT_POLL_DEPTH_LEVELS);
                        asks.truncate(SPOT_POLL_DEPTH_LEVELS);
                        if bids.is_empty() && asks.is_empty() {
                            continue;
                        }
                        cb.handle(
                            None,
                            Some(BookDepth {
                                symbol: ticker.symbol.clone(),
                                bids,
                                asks,
                                exchange_symbol: Some(native.clone()),
                                last_update_id: json_u64(&data["lastUpdateId"]),
                                utc: Some(utc_now_secs()),
                            }),
                            None,
                        );
                    }
                    Err(e) => {
                        debug!(symbol = %ticker.symbol, error = %e, "mexc spot depth poll failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SpotConnector for MexcSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Mexc
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(pair_code).await? else {
            return Ok(None);
        };
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let data = self
            .get_json("/api/v3/ticker/price", &[("symbol".to_string(), native.clone())])
            .await?;
        let row = if data.is_array() {
            data.as_array()
                .and_then(|rows| {
                    rows.iter()
                        .find(|row| row["symbol"].as_str() == Some(native.as_str()))
                })
                .cloned()
        } else if data["symbol"].as_str() == Some(native.as_str()) {
            Some(data)
        } else {
            None
        };
        let Some(price) = row.as_ref().and_then(|row| json_f64(&row["price"])) else {
            return Ok(None);
        };
        Ok(Some(CurrencyPair {
            base: ticker.base,
            quote: ticker.quote,
            ratio: price,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let idx = self.symbols().await?;
        let data = self.get_json("/api/v3/ticker/24hr", &[]).await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => std::slice::from_ref(&data),
        };
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.replace('/', "")).collect());
        let mut out = Vec::new();
        for row in rows {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(last) = json_f64(&row["lastPrice"]) else { continue };
            out.push(CurrencyPair {
                base: ticker.base.clone(),
                quote: ticker.quote.clone(),
                ratio: last,
                utc: Some(utc_now_secs()),
            });
        }
        Ok(out)
    }

    async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>> {
        if limit == 0 {
            return Ok(None);
        }
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let data = self
            .get_json(
                "/api/v3/depth",
                &[
                    ("symbol".to_string(), native.clone()),
                    ("limit".to_string(), limit.min(SPOT_DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        let mut bids = levels_from_pairs(&data["bids"]);
        let mut asks = levels_from_pairs(&data["asks"]);
        if bids.is_empty() && asks.is_empty() {
            return Ok(None);
        }
        bids.truncate(limit);
        asks.truncate(limit);
        Ok(Some(BookDepth {
            symbol: ticker.symbol,
            bids,
            asks,
            exchange_symbol: Some(native),
            last_update_id: json_u64(&data["lastUpdateId"]),
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>> {
        let n = limit.unwrap_or(DEFAULT_KLINE_LIMIT);
        if n == 0 {
            return Ok(None);
        }
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let rows = self
            .get_json(
                "/api/v3/klines",
                &[
                    (
                        "symbol".to_string(),
                        ticker.exchange_symbol.clone().unwrap_or_default(),
                    ),
                    ("interval".to_string(), "1m".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let usd = is_usd_proxy(&ticker.quote);
        let mut candles = Vec::new();
        for row in rows.as_array().map(Vec::as_slice).unwrap_or(&[]).iter().take(n) {
            let cells = match row.as_array() {
                Some(cells) if cells.len() >= 6 => cells,
                _ => continue,
            };
            let (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) = (
                json_f64(&cells[0]),
                json_f64(&cells[1]),
                json_f64(&cells[2]),
                json_f64(&cells[3]),
                json_f64(&cells[4]),
                json_f64(&cells[5]),
            ) else {
                continue;
            };
            candles.push(CandleStick {
                utc_open_time: ts / 1000.0,
                open: o,
                high: h,
                low: l,
                close: c,
                coin_volume: v,
                usd_volume: if usd { Some(v * c) } else { None },
            });
        }
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.core.try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let idx = match self.symbols().await {
            Ok(idx) => idx,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        let any = match symbols {
            None => !idx.is_empty(),
            Some(wanted) => idx.items().iter().any(|t| wanted.contains(&t.symbol)),
        };
        if !any {
            self.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.core.attach_task(tokio::spawn(async move {
            loop {
                me.poll_once().await;
                tokio::time::sleep(SPOT_POLL_INTERVAL).await;
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.batch.cancel();
        self.core.stop();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for MexcSpotConnector {
    // The poll loop reads the desired set every pass, so applying a batch is
    // just a set mutation.
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
    }
}

// ---------------------------------------------------------------------------
// Contract perpetual
// ---------------------------------------------------------------------------

pub struct MexcPerpetualConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl MexcPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "MexcPerpetual");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_data(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", CONTRACT_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Mexc,
            MarketKind::Perpetual,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        unwrap_contract(resp.json::<Value>().await.with_context(|| format!("decode {}", url))?)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_data("/api/v1/contract/detail", &[]).await?;
                Ok(SymbolIndex::build(parse_contracts(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let underscored = symbol_to_contract(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, underscored.as_str(), no_slash.as_str()])
            .cloned())
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "mexc contract: undecodable frame");
                return;
            }
        };
        let channel = msg["channel"].as_str().unwrap_or("");
        if channel == "ping" {
            self.core.send_json(&json!({"method": "pong"}));
            return;
        }
        if channel == "pong" || msg.get("error").map_or(false, |e| !e.is_null()) {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let data = &msg["data"];
        let native = msg["symbol"]
            .as_str()
            .or_else(|| data["symbol"].as_str())
            .unwrap_or("");
        let Some(ticker) = idx.get(native) else { return };
        let symbol = ticker.symbol.clone();

        if channel == "push.ticker" && data.is_object() {
            if self.throttler.may_pass(&symbol, "book").await {
                let ts = json_f64(&data["timestamp"]).or_else(|| json_f64(&msg["ts"]));
                cb.handle(
                    Some(BookTicker {
                        symbol,
                        bid_price: json_f64(&data["bid1"]).unwrap_or(0.0),
                        bid_qty: 0.0,
                        ask_price: json_f64(&data["ask1"]).unwrap_or(0.0),
                        ask_qty: 0.0,
                        last_update_id: ts.map(|ms| ms as u64),
                        utc: ts.map(|ms| ms / 1000.0),
                    }),
                    None,
                    None,
                );
            }
        } else if (channel == "push.depth" || channel == "push.depth.step") && data.is_object() {
            if self.throttler.may_pass(&symbol, "depth").await {
                let bids = levels_from_pairs(&data["bids"]);
                let asks = levels_from_pairs(&data["asks"]);
                if bids.is_empty() && asks.is_empty() {
                    return;
                }
                let ts = json_f64(&data["ct"]).or_else(|| json_f64(&msg["ts"]));
                cb.handle(
                    None,
                    Some(BookDepth {
                        symbol,
                        bids,
                        asks,
                        exchange_symbol: Some(native.to_string()),
                        last_update_id: json_u64(&data["version"]),
                        utc: ts.map(|ms| ms / 1000.0),
                    }),
                    None,
                );
            }
        }
    }

    fn sub_frames(&self, native: &str, depth: bool) -> Vec<Value> {
        let mut frames = vec![json!({"method": "sub.ticker", "param": {"symbol": native}})];
        if depth {
            frames.push(json!({"method": "sub.depth", "param": {"symbol": native}}));
        }
        frames
    }

    fn unsub_frames(&self, native: &str, depth: bool) -> Vec<Value> {
        let mut frames = vec![json!({"method": "unsub.ticker", "param": {"symbol": native}})];
        if depth {
            frames.push(json!({"method": "unsub.depth", "param": {"symbol": native}}));
        }
        frames
    }
}

#[async_trait]
impl PerpetualConnector for MexcPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Mexc
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                &format!("/api/v1/contract/fair_price/{}", ticker.exchange_symbol),
                &[],
            )
            .await?;
        let price = json_f64(&data["fairPrice"]).or_else(|| json_f64(&data["indexPrice"]));
        let Some(price) = price else {
            return Ok(None);
        };
        Ok(Some(CurrencyPair {
            base: ticker.base,
            quote: ticker.quote,
            ratio: price,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let idx = self.symbols().await?;
        let data = self.get_data("/api/v1/contract/ticker", &[]).await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => std::slice::from_ref(&data),
        };
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| symbol_to_contract(s)).collect());
        let mut out = Vec::new();
        for row in rows {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let price = json_f64(&row["lastPrice"])
                .or_else(|| json_f64(&row["fairPrice"]))
                .or_else(|| json_f64(&row["indexPrice"]));
            let Some(price) = price else { continue };
            out.push(CurrencyPair {
                base: ticker.base.clone(),
                quote: ticker.quote.clone(),
                ratio: price,
                utc: Some(utc_now_secs()),
            });
        }
        Ok(out)
    }

    async fn get_depth(&self, symbol: &str, limit: usize) -> Result<Option<BookDepth>> {
        if limit == 0 {
            return Ok(None);
        }
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                &format!("/api/v1/contract/depth/{}", ticker.exchange_symbol),
                &[(
                    "limit".to_string(),
                    limit.min(CONTRACT_DEPTH_API_MAX).to_string(),
                )],
            )
            .await?;
        let mut bids = levels_from_pairs(&data["bids"]);
        let mut asks = levels_from_pairs(&data["asks"]);
        if bids.is_empty() && asks.is_empty() {
            return Ok(None);
        }
        bids.truncate(limit);
        asks.truncate(limit);
        Ok(Some(BookDepth {
            symbol: ticker.symbol,
            bids,
            asks,
            exchange_symbol: Some(ticker.exchange_symbol),
            last_update_id: json_u64(&data["version"]),
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>> {
        let n = limit.unwrap_or(DEFAULT_KLINE_LIMIT);
        if n == 0 {
            return Ok(None);
        }
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                &format!("/api/v1/contract/kline/{}", ticker.exchange_symbol),
                &[("interval".to_string(), "Min1".to_string())],
            )
            .await?;
        let candles = parse_contract_klines(&data, &ticker.quote, n);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                &format!("/api/v1/contract/funding_rate/{}", ticker.exchange_symbol),
                &[],
            )
            .await?;
        let Some(rate) = json_f64(&data["fundingRate"]) else {
            return Ok(None);
        };
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc: json_f64(&data["nextSettleTime"])
                .map(|ms| ms / 1000.0)
                .unwrap_or(0.0),
            next_rate: None,
            index_price: None,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_funding_rate_history(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<FundingRatePoint>>> {
        let n = limit.unwrap_or(DEFAULT_FUNDING_HISTORY_LIMIT);
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                "/api/v1/contract/funding_rate/history",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("page_size".to_string(), n.to_string()),
                ],
            )
            .await?;
        let Some(rows) = data["resultList"].as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let (Some(ts), Some(rate)) =
                (json_f64(&row["settleTime"]), json_f64(&row["fundingRate"]))
            else {
                continue;
            };
            out.push(FundingRatePoint {
                funding_time_utc: ts / 1000.0,
                rate,
            });
        }
        Ok(Some(out))
    }

    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.core.try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let idx = match self.symbols().await {
            Ok(idx) => idx,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        let natives: Vec<String> = match symbols {
            None => idx
                .items()
                .iter()
                .map(|t| t.exchange_symbol.clone())
                .take(CONTRACT_SUBSCRIBE_ALL_CAP)
                .collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if natives.is_empty() {
            self.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(CONTRACT_WS, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for native in &natives {
            for frame in self.sub_frames(native, depth) {
                worker.sender.send_json(&frame);
            }
        }
        self.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                me.route_frame(&frame).await;
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.batch.cancel();
        self.core.stop();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for MexcPerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in &tokens {
            let underscored = symbol_to_contract(token);
            if let Some(t) = idx.get_any([token.as_str(), underscored.as_str()]) {
                for frame in self.sub_frames(&t.exchange_symbol, depth) {
                    self.core.send_json(&frame);
                }
            }
        }
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in &tokens {
            let underscored = symbol_to_contract(token);
            if let Some(t) = idx.get_any([token.as_str(), underscored.as_str()]) {
                for frame in self.unsub_frames(&t.exchange_symbol, depth) {
                    self.core.send_json(&frame);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversions() {
        assert_eq!(spot_native_to_symbol("BTCUSDT").as_deref(), Some("BTC/USDT"));
        assert_eq!(spot_native_to_symbol("XUSDC").as_deref(), Some("X/USDC"));
        assert_eq!(spot_native_to_symbol("USDT"), None);
        assert_eq!(contract_to_symbol("BTC_USDT"), "BTC/USDT");
        assert_eq!(symbol_to_contract("BTC/USDT"), "BTC_USDT");
    }

    #[test]
    fn test_check_spot_code() {
        assert!(check_spot_code(&serde_json::json!({"symbol": "BTCUSDT"})).is_ok());
        assert!(check_spot_code(&serde_json::json!({"code": 200})).is_ok());
        let err = check_spot_code(&serde_json::json!({"code": 700002, "msg": "signature"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_unwrap_contract() {
        let ok = serde_json::json!({"success": true, "code": 0, "data": [{"symbol": "BTC_USDT"}]});
        let data = unwrap_contract(ok).unwrap();
        assert!(data.is_array());
        let err = serde_json::json!({"success": false, "code": 1001, "msg": "contract not exists"});
        assert!(unwrap_contract(err).is_err());
    }

    #[test]
    fn test_parse_contracts_skips_suspended() {
        let data = serde_json::json!([
            {"symbol": "BTC_USDT", "baseCoin": "BTC", "quoteCoin": "USDT", "settleCoin": "USDT", "state": 0},
            {"symbol": "OLD_USDT", "baseCoin": "OLD", "quoteCoin": "USDT", "state": 2}
        ]);
        let perps = parse_contracts(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(perps[0].settlement, "USDT");
    }

    #[test]
    fn test_parse_contract_klines_parallel_arrays() {
        let data = serde_json::json!({
            "time": [1700000000, 1700000060],
            "open": [100.0, 105.0],
            "high": [110.0, 106.0],
            "low": [90.0, 104.0],
            "close": [105.0, 105.5],
            "vol": [2.0, 1.0]
        });
        let candles = parse_contract_klines(&data, "USDT", 60);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].utc_open_time, 1_700_000_000.0);
        assert_eq!(candles[0].usd_volume, Some(210.0));
        assert_eq!(candles[1].close, 105.5);
        // Limit applies to the shared time axis.
        assert_eq!(parse_contract_klines(&data, "USDT", 1).len(), 1);
    }
}
