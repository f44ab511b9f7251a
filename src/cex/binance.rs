//! Binance connectors: spot and USD-M perpetual.
//!
//! REST is the plain public API; streaming uses the combined multi-stream
//! endpoint (`…/stream?streams=btcusdt@bookTicker/btcusdt@depth20@100ms`).
//! The combined URL is fixed at connect time, so subscription changes are
//! applied by a stop/start cycle on the batch timer (reconnect-style, 15 s).

use crate::cex::rest_limit::{self, WeightTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::cex::subscriptions::{SubscriptionBatcher, SubscriptionSink};
use crate::cex::symbol_map::SymbolIndex;
use crate::cex::throttler::Throttler;
use crate::cex::ws::{self, EventQueue, FrameCodec, StreamCore, EVENT_QUEUE_CAPACITY};
use crate::cex::{
    is_usd_proxy, json_f64, json_u64, levels_from_pairs, utc_now_secs, ConnectorOptions,
    ExchangeId, MarketKind, PerpetualConnector, SpotConnector, StreamCallback,
    DEFAULT_FUNDING_HISTORY_LIMIT, DEFAULT_KLINE_LIMIT, RECONNECT_SUBSCRIPTION_BATCH_SECS,
};
use crate::models::{
    BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint, pair_code,
    PerpetualTicker, Ticker, WithdrawInfo,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const SPOT_API: &str = "https://api.binance.com";
const SPOT_API_TESTNET: &str = "https://testnet.binance.vision";
const SPOT_WS: &str = "wss://stream.binance.com:9443";
const FAPI: &str = "https://fapi.binance.com";
const FAPI_TESTNET: &str = "https://testnet.binancefuture.com";
const FSTREAM_WS: &str = "wss://fstream.binance.com";
const FSTREAM_WS_TESTNET: &str = "wss://stream.binancefuture.com";

const SPOT_DEPTH_API_MAX: usize = 5000;
const PERP_DEPTH_API_MAX: usize = 500;

fn ticker_aliases(t: &Ticker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    if let Some(native) = &t.exchange_symbol {
        keys.push(native.clone());
        keys.push(native.to_uppercase());
    }
}

fn perp_aliases(t: &PerpetualTicker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(t.exchange_symbol.clone());
}

fn stream_url(ws_base: &str, natives: &[String], depth: bool) -> String {
    let mut streams = Vec::with_capacity(natives.len() * 2);
    for native in natives {
        let lower = native.to_lowercase();
        streams.push(format!("{}@bookTicker", lower));
        if depth {
            streams.push(format!("{}@depth20@100ms", lower));
        }
    }
    format!("{}/stream?streams={}", ws_base, streams.join("/"))
}

fn parse_spot_tickers(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in data["symbols"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["status"].as_str() != Some("TRADING") {
            continue;
        }
        let base = item["baseAsset"].as_str().unwrap_or("");
        let quote = item["quoteAsset"].as_str().unwrap_or("");
        let native = item["symbol"].as_str().unwrap_or("");
        if base.is_empty() || quote.is_empty() || native.is_empty() {
            continue;
        }
        out.push(Ticker {
            symbol: pair_code(base, quote),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: item["isMarginTradingAllowed"].as_bool().unwrap_or(false),
            exchange_symbol: Some(native.to_string()),
        });
    }
    out
}

fn parse_perpetuals(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for item in data["symbols"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["status"].as_str() != Some("TRADING")
            || item["contractType"].as_str() != Some("PERPETUAL")
        {
            continue;
        }
        let base = item["baseAsset"].as_str().unwrap_or("");
        let quote = item["quoteAsset"].as_str().unwrap_or("");
        let native = item["symbol"].as_str().unwrap_or("");
        if base.is_empty() || quote.is_empty() || native.is_empty() {
            continue;
        }
        out.push(PerpetualTicker {
            symbol: pair_code(base, quote),
            base: base.to_string(),
            quote: quote.to_string(),
            exchange_symbol: native.to_string(),
            settlement: quote.to_string(),
        });
    }
    out
}

fn parse_depth(data: &Value, symbol: &str, native: &str) -> Option<BookDepth> {
    let bids = levels_from_pairs(&data["bids"]);
    let asks = levels_from_pairs(&data["asks"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(BookDepth {
        symbol: symbol.to_string(),
        bids,
        asks,
        exchange_symbol: Some(native.to_string()),
        last_update_id: json_u64(&data["lastUpdateId"]),
        utc: Some(utc_now_secs()),
    })
}

/// Kline rows: `[open_time, o, h, l, c, volume, …]`, times in ms.
fn parse_klines(rows: &Value, quote: &str) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let mut out = Vec::new();
    for row in rows.as_array().map(Vec::as_slice).unwrap_or(&[]) {
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
        out.push(CandleStick {
            utc_open_time: ts / 1000.0,
            open: o,
            high: h,
            low: l,
            close: c,
            coin_volume: v,
            usd_volume: if usd { Some(v * c) } else { None },
        });
    }
    out
}

fn parse_funding_rate(data: &Value, symbol: &str) -> Option<FundingRate> {
    let rate = json_f64(&data["lastFundingRate"])?;
    let next_utc = json_f64(&data["nextFundingTime"]).map(|ms| ms / 1000.0).unwrap_or(0.0);
    Some(FundingRate {
        symbol: symbol.to_string(),
        rate,
        next_funding_utc: next_utc,
        next_rate: None,
        index_price: json_f64(&data["indexPrice"]),
        utc: Some(utc_now_secs()),
    })
}

/// Combined-stream frames carry `{stream, data}`; raw frames carry `e`.
fn split_stream_frame(msg: &Value) -> (String, &Value) {
    if msg.get("stream").is_some() {
        (
            msg["stream"].as_str().unwrap_or("").to_string(),
            msg.get("data").unwrap_or(msg),
        )
    } else {
        (msg["e"].as_str().unwrap_or("").to_string(), msg)
    }
}

fn book_from_stream(data: &Value, symbol: &str) -> BookTicker {
    BookTicker {
        symbol: symbol.to_string(),
        bid_price: json_f64(&data["b"]).unwrap_or(0.0),
        bid_qty: json_f64(&data["B"]).unwrap_or(0.0),
        ask_price: json_f64(&data["a"]).unwrap_or(0.0),
        ask_qty: json_f64(&data["A"]).unwrap_or(0.0),
        last_update_id: json_u64(&data["u"]),
        utc: json_f64(&data["E"]).map(|ms| ms / 1000.0),
    }
}

fn depth_from_stream(data: &Value, symbol: &str, native: &str) -> Option<BookDepth> {
    let bids = levels_from_pairs(&data["b"]);
    let asks = levels_from_pairs(&data["a"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(BookDepth {
        symbol: symbol.to_string(),
        bids,
        asks,
        exchange_symbol: Some(native.to_string()),
        last_update_id: json_u64(&data["u"]),
        utc: json_f64(&data["E"]).map(|ms| ms / 1000.0),
    })
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct BinanceSpotConnector {
    opts: ConnectorOptions,
    base: &'static str,
    ws_base: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl BinanceSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "BinanceSpot");
        let conn = Arc::new(Self {
            base: if opts.testing { SPOT_API_TESTNET } else { SPOT_API },
            ws_base: SPOT_WS,
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(RECONNECT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Binance,
            MarketKind::Spot,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        resp.json::<Value>().await.with_context(|| format!("decode {}", url))
    }

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_json("/api/v3/exchangeInfo", &[]).await?;
                Ok(SymbolIndex::build(parse_spot_tickers(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<(String, Ticker)>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        let found = idx.get_any([symbol, no_slash.as_str(), no_slash.to_uppercase().as_str()]);
        Ok(found.and_then(|t| t.exchange_symbol.clone().map(|native| (native, t.clone()))))
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "binance spot: undecodable frame");
                return;
            }
        };
        // Subscription acks carry "result"/"id" only.
        if msg.get("result").is_some() || msg.get("id").is_some() {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let (stream, data) = split_stream_frame(&msg);
        let sym_key = data["s"].as_str().unwrap_or("").to_uppercase();
        let Some(ticker) = idx.get(&sym_key) else { return };
        let symbol = ticker.symbol.clone();
        let native = ticker.exchange_symbol.clone().unwrap_or(sym_key);

        if stream.contains("bookTicker") || data["e"].as_str() == Some("bookTicker") {
            if self.throttler.may_pass(&symbol, "book").await {
                cb.handle(Some(book_from_stream(data, &symbol)), None, None);
            }
        } else if stream.contains("depth") || data["e"].as_str() == Some("depthUpdate") {
            if self.throttler.may_pass(&symbol, "depth").await {
                if let Some(depth) = depth_from_stream(data, &symbol, &native) {
                    cb.handle(None, Some(depth), None);
                }
            }
        }
    }

    async fn resolve_natives(&self, symbols: Option<&[String]>) -> Result<Vec<String>> {
        let idx = self.symbols().await?;
        let natives: Vec<String> = match symbols {
            None => idx
                .items()
                .iter()
                .filter_map(|t| t.exchange_symbol.clone())
                .collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol))
                .filter_map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        Ok(natives)
    }
}

#[async_trait]
impl SpotConnector for BinanceSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let Some((native, ticker)) = self.native_symbol(pair_code).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                "/api/v3/ticker/price",
                &[("symbol".to_string(), native)],
            )
            .await?;
        let Some(price) = json_f64(&data["price"]) else {
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
        // One page of all tickers keeps this a single call regardless of the
        // requested subset.
        let data = self.get_json("/api/v3/ticker/price", &[]).await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => std::slice::from_ref(&data),
        };
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.replace('/', "").to_uppercase()).collect());
        let mut out = Vec::new();
        for row in rows {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(price) = json_f64(&row["price"]) else { continue };
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
        let Some((native, ticker)) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                "/api/v3/depth",
                &[
                    ("symbol".to_string(), native.clone()),
                    ("limit".to_string(), limit.min(SPOT_DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        Ok(parse_depth(&data, &ticker.symbol, &native))
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
        let Some((native, ticker)) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let rows = self
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol".to_string(), native),
                    ("interval".to_string(), "1m".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&rows, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_withdraw_info(&self) -> Result<Option<HashMap<String, Vec<WithdrawInfo>>>> {
        // Capital endpoints require signed requests; not exposed here.
        Ok(None)
    }

    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.core
            .try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let natives = match self.resolve_natives(symbols).await {
            Ok(natives) => natives,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        if natives.is_empty() {
            self.core.rollback_begin();
            anyhow::bail!("no symbols to subscribe");
        }
        let url = stream_url(self.ws_base, &natives, depth);
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(&url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
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
impl SubscriptionSink for BinanceSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
    }

    /// Combined-stream URLs cannot be changed in place: reconnect with the
    /// updated desired set.
    async fn after_subscription_flush(&self) {
        if !self.core.is_active() {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let depth = self.core.depth_enabled();
        let desired = self.core.desired_symbols();
        self.core.stop();
        if let Err(e) = self.start(cb, desired.as_deref(), depth).await {
            warn!(error = %e, "binance spot: restart after subscription flush failed");
        }
    }
}

// ---------------------------------------------------------------------------
// USD-M perpetual
// ---------------------------------------------------------------------------

pub struct BinancePerpetualConnector {
    opts: ConnectorOptions,
    base: &'static str,
    ws_base: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl BinancePerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler =
            Throttler::new(opts.throttle_timeout, opts.store.clone(), "BinancePerpetual");
        let conn = Arc::new(Self {
            base: if opts.testing { FAPI_TESTNET } else { FAPI },
            ws_base: if opts.testing { FSTREAM_WS_TESTNET } else { FSTREAM_WS },
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(RECONNECT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Binance,
            MarketKind::Perpetual,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        resp.json::<Value>().await.with_context(|| format!("decode {}", url))
    }

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_json("/fapi/v1/exchangeInfo", &[]).await?;
                Ok(SymbolIndex::build(parse_perpetuals(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, no_slash.as_str(), no_slash.to_uppercase().as_str()])
            .cloned())
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "binance perpetual: undecodable frame");
                return;
            }
        };
        if msg.get("result").is_some() || msg.get("id").is_some() {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let (stream, data) = split_stream_frame(&msg);
        let sym_key = data["s"].as_str().unwrap_or("").to_uppercase();
        let Some(ticker) = idx.get(&sym_key) else { return };
        let symbol = ticker.symbol.clone();
        let native = ticker.exchange_symbol.clone();

        if stream.contains("bookTicker") || data["e"].as_str() == Some("bookTicker") {
            if self.throttler.may_pass(&symbol, "book").await {
                cb.handle(Some(book_from_stream(data, &symbol)), None, None);
            }
        } else if stream.contains("depth") || data["e"].as_str() == Some("depthUpdate") {
            if self.throttler.may_pass(&symbol, "depth").await {
                if let Some(depth) = depth_from_stream(data, &symbol, &native) {
                    cb.handle(None, Some(depth), None);
                }
            }
        }
    }

    async fn resolve_natives(&self, symbols: Option<&[String]>) -> Result<Vec<String>> {
        let idx = self.symbols().await?;
        let natives: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        Ok(natives)
    }
}

#[async_trait]
impl PerpetualConnector for BinancePerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                "/fapi/v1/ticker/price",
                &[("symbol".to_string(), ticker.exchange_symbol.clone())],
            )
            .await?;
        let Some(price) = json_f64(&data["price"]) else {
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
        let data = self.get_json("/fapi/v1/ticker/price", &[]).await?;
        let Some(rows) = data.as_array() else {
            return Ok(Vec::new());
        };
        let mut price_map: HashMap<&str, f64> = HashMap::new();
        for row in rows {
            if let (Some(native), Some(price)) = (row["symbol"].as_str(), json_f64(&row["price"])) {
                price_map.insert(native, price);
            }
        }
        let natives: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => {
                let mut resolved = Vec::new();
                for s in wanted {
                    let no_slash = s.replace('/', "").to_uppercase();
                    if let Some(t) = idx.get_any([s.as_str(), no_slash.as_str()]) {
                        resolved.push(t.exchange_symbol.clone());
                    }
                }
                resolved
            }
        };
        let mut out = Vec::new();
        for native in natives {
            let Some(&price) = price_map.get(native.as_str()) else { continue };
            let Some(ticker) = idx.get(&native) else { continue };
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
            .get_json(
                "/fapi/v1/depth",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol.clone()),
                    ("limit".to_string(), limit.min(PERP_DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        Ok(parse_depth(&data, &ticker.symbol, &ticker.exchange_symbol))
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
                "/fapi/v1/klines",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("interval".to_string(), "1m".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&rows, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                "/fapi/v1/premiumIndex",
                &[("symbol".to_string(), ticker.exchange_symbol)],
            )
            .await?;
        Ok(parse_funding_rate(&data, &ticker.symbol))
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
        let rows = self
            .get_json(
                "/fapi/v1/fundingRate",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let Some(rows) = rows.as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let (Some(ts), Some(rate)) =
                (json_f64(&row["fundingTime"]), json_f64(&row["fundingRate"]))
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
        self.core
            .try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let natives = match self.resolve_natives(symbols).await {
            Ok(natives) => natives,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        if natives.is_empty() {
            self.core.rollback_begin();
            anyhow::bail!("no symbols to subscribe");
        }
        let url = stream_url(self.ws_base, &natives, depth);
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(&url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
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
impl SubscriptionSink for BinancePerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
    }

    async fn after_subscription_flush(&self) {
        if !self.core.is_active() {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let depth = self.core.depth_enabled();
        let desired = self.core.desired_symbols();
        self.core.stop();
        if let Err(e) = self.start(cb, desired.as_deref(), depth).await {
            warn!(error = %e, "binance perpetual: restart after subscription flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        let url = stream_url(SPOT_WS, &["BTCUSDT".to_string(), "ETHUSDT".to_string()], true);
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/btcusdt@depth20@100ms/ethusdt@bookTicker/ethusdt@depth20@100ms"
        );
        let url = stream_url(FSTREAM_WS, &["BTCUSDT".to_string()], false);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@bookTicker"
        );
    }

    #[test]
    fn test_parse_spot_tickers_skips_non_trading() {
        let data = serde_json::json!({"symbols": [
            {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT"},
            {"symbol": "OLDUSDT", "status": "BREAK", "baseAsset": "OLD", "quoteAsset": "USDT"}
        ]});
        let tickers = parse_spot_tickers(&data);
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers[0].symbol, "BTC/USDT");
        assert_eq!(tickers[0].exchange_symbol.as_deref(), Some("BTCUSDT"));
        assert!(tickers[0].is_spot_enabled);
    }

    #[test]
    fn test_parse_perpetuals_requires_perpetual_contract() {
        let data = serde_json::json!({"symbols": [
            {"symbol": "BTCUSDT", "status": "TRADING", "contractType": "PERPETUAL",
             "baseAsset": "BTC", "quoteAsset": "USDT"},
            {"symbol": "BTCUSDT_240927", "status": "TRADING", "contractType": "CURRENT_QUARTER",
             "baseAsset": "BTC", "quoteAsset": "USDT"}
        ]});
        let perps = parse_perpetuals(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].settlement, "USDT");
    }

    #[test]
    fn test_parse_depth_orders_and_ids() {
        let data = serde_json::json!({
            "lastUpdateId": 42,
            "bids": [["50000.0", "1.5"], ["49999.0", "2.0"]],
            "asks": [["50001.0", "0.5"]]
        });
        let depth = parse_depth(&data, "BTC/USDT", "BTCUSDT").unwrap();
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.last_update_id, Some(42));
        assert!(depth.bids[0].price > depth.bids[1].price);
    }

    #[test]
    fn test_parse_klines_usd_volume_only_for_usd_quotes() {
        let rows = serde_json::json!([
            [1700000000000i64, "100", "110", "90", "105", "2.0", 0, 0, 0, 0, 0, 0]
        ]);
        let usdt = parse_klines(&rows, "USDT");
        assert_eq!(usdt.len(), 1);
        assert_eq!(usdt[0].utc_open_time, 1_700_000_000.0);
        assert_eq!(usdt[0].usd_volume, Some(210.0));
        let btc = parse_klines(&rows, "BTC");
        assert_eq!(btc[0].usd_volume, None);
    }

    #[test]
    fn test_parse_funding_rate() {
        let data = serde_json::json!({
            "lastFundingRate": "0.0001",
            "nextFundingTime": 1700000000000i64,
            "indexPrice": "50000.1"
        });
        let fr = parse_funding_rate(&data, "BTC/USDT").unwrap();
        assert_eq!(fr.rate, 0.0001);
        assert_eq!(fr.next_funding_utc, 1_700_000_000.0);
        assert_eq!(fr.index_price, Some(50000.1));
        assert!(parse_funding_rate(&serde_json::json!({}), "X").is_none());
    }

    #[test]
    fn test_combined_stream_routing_shapes() {
        let msg: Value = serde_json::from_str(
            r#"{"stream":"btcusdt@bookTicker","data":{"u":12345,"s":"BTCUSDT","b":"50000.00","B":"1.5","a":"50001.00","A":"2.0","E":1700000000000}}"#,
        )
        .unwrap();
        let (stream, data) = split_stream_frame(&msg);
        assert_eq!(stream, "btcusdt@bookTicker");
        let book = book_from_stream(data, "BTC/USDT");
        assert_eq!(book.bid_price, 50000.0);
        assert_eq!(book.ask_qty, 2.0);
        assert_eq!(book.last_update_id, Some(12345));
        assert_eq!(book.utc, Some(1_700_000_000.0));
    }

    #[test]
    fn test_depth_from_stream_drops_empty() {
        let data = serde_json::json!({"b": [], "a": [], "u": 1});
        assert!(depth_from_stream(&data, "BTC/USDT", "BTCUSDT").is_none());
        let data = serde_json::json!({"b": [["1.0","2.0"]], "a": [], "u": 1, "E": 1700000000000i64});
        let depth = depth_from_stream(&data, "BTC/USDT", "BTCUSDT").unwrap();
        assert_eq!(depth.bids.len(), 1);
        assert!(depth.asks.is_empty());
    }
}
