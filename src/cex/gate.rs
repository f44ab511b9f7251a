//! Gate.io connectors (spot and USDT-settled perpetual).
//!
//! Futures order-book updates often arrive one side at a time; a per-symbol
//! side buffer keeps the last-seen bids and asks so every emitted depth has
//! both sides. Futures also push 1m candles (`futures.candlesticks`), the
//! only WS candle source in this core.

use crate::cex::rest_limit::{self, WeightTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::cex::subscriptions::{SubscriptionBatcher, SubscriptionSink};
use crate::cex::symbol_map::SymbolIndex;
use crate::cex::throttler::Throttler;
use crate::cex::ws::{self, EventQueue, FrameCodec, StreamCore, EVENT_QUEUE_CAPACITY};
use crate::cex::{
    is_usd_proxy, json_f64, json_u64, utc_now_secs, ConnectorOptions, ExchangeId, MarketKind,
    PerpetualConnector, SpotConnector, StreamCallback, DEFAULT_FUNDING_HISTORY_LIMIT,
    DEFAULT_KLINE_LIMIT, DEFAULT_SUBSCRIPTION_BATCH_SECS,
};
use crate::models::{
    BidAsk, BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint,
    PerpetualTicker, Ticker,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

const SPOT_API: &str = "https://api.gateio.ws/api/v4";
const SPOT_WS: &str = "wss://api.gateio.ws/ws/v4/";
const SPOT_WS_TESTNET: &str = "wss://ws-testnet.gate.io/v4/ws/spot";
const FUTURES_API: &str = "https://fx-api.gateio.ws/api/v4";
const FUTURES_WS: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const FUTURES_WS_TESTNET: &str = "wss://fx-ws-testnet.gateio.ws/v4/ws/usdt";

const SETTLE: &str = "usdt";
const DEPTH_API_MAX: usize = 100;
/// Funding settles every 8 hours.
const FUNDING_INTERVAL_SECS: f64 = 8.0 * 3600.0;

fn gate_to_symbol(native: &str) -> String {
    // BTC_USDT -> BTC/USDT
    native.replace('_', "/").to_uppercase()
}

fn symbol_to_gate(symbol: &str) -> String {
    symbol.replace('/', "_").to_uppercase()
}

fn ticker_aliases(t: &Ticker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(t.symbol.replace('/', "_"));
    if let Some(native) = &t.exchange_symbol {
        keys.push(native.clone());
        keys.push(native.to_uppercase());
    }
}

fn perp_aliases(t: &PerpetualTicker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(t.symbol.replace('/', "_"));
    keys.push(t.exchange_symbol.clone());
}

fn parse_currency_pairs(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["trade_status"].as_str() == Some("untradable") {
            continue;
        }
        let base = item["base"].as_str().unwrap_or("");
        let quote = item["quote"].as_str().unwrap_or("");
        let native = item["id"].as_str().unwrap_or("");
        if base.is_empty() || quote.is_empty() || native.is_empty() {
            continue;
        }
        out.push(Ticker {
            symbol: gate_to_symbol(native),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: false,
            exchange_symbol: Some(native.to_string()),
        });
    }
    out
}

fn parse_contracts(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["in_delisting"].as_bool().unwrap_or(false) {
            continue;
        }
        let name = item["name"].as_str().unwrap_or("");
        let Some((base, quote)) = name.split_once('_') else { continue };
        out.push(PerpetualTicker {
            symbol: gate_to_symbol(name),
            base: base.to_string(),
            quote: quote.to_string(),
            exchange_symbol: name.to_string(),
            settlement: quote.to_string(),
        });
    }
    out
}

/// Ladder rows arrive either as `[price, size]` pairs or `{p, s}` objects.
fn levels_from_gate_rows(rows: &Value) -> Vec<BidAsk> {
    let mut out = Vec::new();
    for row in rows.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        match row {
            Value::Array(cells) if cells.len() >= 2 => {
                if let (Some(price), Some(quantity)) = (json_f64(&cells[0]), json_f64(&cells[1])) {
                    out.push(BidAsk { price, quantity });
                }
            }
            Value::Object(_) => {
                if let (Some(price), Some(quantity)) = (json_f64(&row["p"]), json_f64(&row["s"])) {
                    out.push(BidAsk { price, quantity });
                }
            }
            _ => {}
        }
    }
    out
}

/// Candle rows: list form `[t, o, h, l, c, v]` or object form `{t, o, h, l, c, v}`.
fn parse_candles(data: &Value, quote: &str) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let mut out = Vec::new();
    for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let (ts, o, h, l, c, v) = match row {
            Value::Array(cells) if cells.len() >= 6 => (
                json_f64(&cells[0]),
                json_f64(&cells[1]),
                json_f64(&cells[2]),
                json_f64(&cells[3]),
                json_f64(&cells[4]),
                json_f64(&cells[5]),
            ),
            Value::Object(_) => (
                json_f64(&row["t"]),
                json_f64(&row["o"]),
                json_f64(&row["h"]),
                json_f64(&row["l"]),
                json_f64(&row["c"]),
                json_f64(&row["v"]),
            ),
            _ => continue,
        };
        let (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) = (ts, o, h, l, c, v) else {
            continue;
        };
        let utc_open = if ts > 1e12 { ts / 1000.0 } else { ts };
        out.push(CandleStick {
            utc_open_time: utc_open,
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

fn channel_frame(channel: &str, event: &str, payload: Vec<Value>) -> Value {
    json!({
        "time": utc_now_secs() as i64,
        "channel": channel,
        "event": event,
        "payload": payload,
    })
}

/// Last-seen sides for futures depth updates that arrive one side at a time.
#[derive(Default)]
struct SideBuffer {
    bids: Option<Vec<BidAsk>>,
    asks: Option<Vec<BidAsk>>,
    last_update_id: Option<u64>,
    utc: Option<f64>,
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct GateSpotConnector {
    opts: ConnectorOptions,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl GateSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "GateSpot");
        let conn = Arc::new(Self {
            ws_url: if opts.testing { SPOT_WS_TESTNET } else { SPOT_WS },
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
            ExchangeId::Gate,
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
                let data = self.get_json("/spot/currency_pairs", &[]).await?;
                if !data.is_array() {
                    bail!(
                        "gate API error: {}",
                        data["message"].as_str().unwrap_or("unexpected payload")
                    );
                }
                Ok(SymbolIndex::build(parse_currency_pairs(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let underscored = symbol_to_gate(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, underscored.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn apply_frames(&self, tokens: &[String], event: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in tokens {
            let underscored = token.replace('/', "_");
            let Some(native) = idx
                .get_any([token.as_str(), underscored.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            else {
                continue;
            };
            self.core
                .send_json(&channel_frame("spot.book_ticker", event, vec![json!(native)]));
            if depth {
                self.core.send_json(&channel_frame(
                    "spot.order_book_update",
                    event,
                    vec![json!(native), json!("100ms")],
                ));
            }
        }
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "gate spot: undecodable frame");
                return;
            }
        };
        if msg["event"].as_str() != Some("update") || msg.get("error").map_or(false, |e| !e.is_null())
        {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let channel = msg["channel"].as_str().unwrap_or("");
        let results = match &msg["result"] {
            Value::Array(rows) => rows.clone(),
            result @ Value::Object(_) => vec![result.clone()],
            _ => return,
        };
        for result in &results {
            let native = result["s"].as_str().unwrap_or("");
            let Some(ticker) = idx.get_any([native, native.to_uppercase().as_str()]) else {
                continue;
            };
            let symbol = ticker.symbol.clone();
            if channel == "spot.book_ticker" {
                if self.throttler.may_pass(&symbol, "book").await {
                    cb.handle(
                        Some(BookTicker {
                            symbol,
                            bid_price: json_f64(&result["b"]).unwrap_or(0.0),
                            bid_qty: json_f64(&result["B"]).unwrap_or(0.0),
                            ask_price: json_f64(&result["a"]).unwrap_or(0.0),
                            ask_qty: json_f64(&result["A"]).unwrap_or(0.0),
                            last_update_id: json_u64(&result["u"]),
                            utc: json_f64(&result["t"]).map(|ms| ms / 1000.0),
                        }),
                        None,
                        None,
                    );
                }
            } else if channel == "spot.order_book_update" {
                if self.throttler.may_pass(&symbol, "depth").await {
                    let bids = levels_from_gate_rows(&result["b"]);
                    let asks = levels_from_gate_rows(&result["a"]);
                    if bids.is_empty() && asks.is_empty() {
                        continue;
                    }
                    cb.handle(
                        None,
                        Some(BookDepth {
                            symbol,
                            bids,
                            asks,
                            exchange_symbol: ticker.exchange_symbol.clone(),
                            last_update_id: json_u64(&result["u"]),
                            utc: json_f64(&result["t"]).map(|ms| ms / 1000.0),
                        }),
                        None,
                    );
                }
            }
        }
    }
}

#[async_trait]
impl SpotConnector for GateSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Gate
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
            .get_json(
                "/spot/tickers",
                &[("currency_pair".to_string(), native.clone())],
            )
            .await?;
        let row = match &data {
            Value::Array(rows) => rows.first().cloned(),
            Value::Object(_) if data.get("currency_pair").is_some() => Some(data.clone()),
            _ => None,
        };
        let Some(row) = row else {
            return Ok(None);
        };
        if !row["currency_pair"]
            .as_str()
            .map_or(false, |cp| cp.eq_ignore_ascii_case(&native))
        {
            return Ok(None);
        }
        let Some(last) = json_f64(&row["last"]) else {
            return Ok(None);
        };
        Ok(Some(CurrencyPair {
            base: ticker.base,
            quote: ticker.quote,
            ratio: last,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let idx = self.symbols().await?;
        // One request for all tickers keeps Gate's ~100 req/min budget safe.
        let data = self.get_json("/spot/tickers", &[]).await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => std::slice::from_ref(&data),
        };
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.to_uppercase()).collect());
        let mut out = Vec::new();
        for row in rows {
            let native = row["currency_pair"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                let symbol = gate_to_symbol(native);
                let native_upper = native.to_uppercase();
                if !wanted.iter().any(|w| w == &symbol || w == &native_upper) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(last) = json_f64(&row["last"]) else { continue };
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
                "/spot/order_book",
                &[
                    ("currency_pair".to_string(), native.clone()),
                    ("limit".to_string(), limit.min(DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        let bids = levels_from_gate_rows(&data["bids"]);
        let asks = levels_from_gate_rows(&data["asks"]);
        if bids.is_empty() && asks.is_empty() {
            return Ok(None);
        }
        Ok(Some(BookDepth {
            symbol: ticker.symbol,
            bids,
            asks,
            exchange_symbol: Some(native),
            last_update_id: json_u64(&data["id"]),
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
            .get_json(
                "/spot/candlesticks",
                &[
                    (
                        "currency_pair".to_string(),
                        ticker.exchange_symbol.clone().unwrap_or_default(),
                    ),
                    ("interval".to_string(), "1m".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_candles(&data, &ticker.quote);
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
        if natives.is_empty() {
            self.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(self.ws_url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for native in &natives {
            worker
                .sender
                .send_json(&channel_frame("spot.book_ticker", "subscribe", vec![json!(native)]));
            if depth {
                worker.sender.send_json(&channel_frame(
                    "spot.order_book_update",
                    "subscribe",
                    vec![json!(native), json!("100ms")],
                ));
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
impl SubscriptionSink for GateSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        self.apply_frames(&tokens, "subscribe");
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        self.apply_frames(&tokens, "unsubscribe");
    }
}

// ---------------------------------------------------------------------------
// USDT perpetual
// ---------------------------------------------------------------------------

pub struct GatePerpetualConnector {
    opts: ConnectorOptions,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    depth_sides: Mutex<HashMap<String, SideBuffer>>,
    weak: OnceLock<Weak<Self>>,
}

impl GatePerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "GatePerpetual");
        let conn = Arc::new(Self {
            ws_url: if opts.testing { FUTURES_WS_TESTNET } else { FUTURES_WS },
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            depth_sides: Mutex::new(HashMap::new()),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", FUTURES_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Gate,
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
                let data = self
                    .get_json(&format!("/futures/{}/contracts", SETTLE), &[])
                    .await?;
                if !data.is_array() {
                    bail!(
                        "gate API error: {}",
                        data["message"].as_str().unwrap_or("unexpected payload")
                    );
                }
                Ok(SymbolIndex::build(parse_contracts(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let underscored = symbol_to_gate(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, underscored.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn apply_frames(&self, tokens: &[String], event: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in tokens {
            let underscored = token.replace('/', "_");
            let Some(t) = idx.get_any([token.as_str(), underscored.as_str()]) else {
                continue;
            };
            let contract = &t.exchange_symbol;
            self.core
                .send_json(&channel_frame("futures.book_ticker", event, vec![json!(contract)]));
            if depth {
                self.core.send_json(&channel_frame(
                    "futures.order_book_update",
                    event,
                    vec![json!(contract), json!("100ms"), json!("100")],
                ));
            }
            self.core.send_json(&channel_frame(
                "futures.candlesticks",
                event,
                vec![json!(contract), json!("1m")],
            ));
        }
    }

    /// Folds a one-sided update into the buffer and returns the merged
    /// snapshot. The buffer is dropped once both sides have been seen.
    fn merge_depth_sides(
        &self,
        symbol: &str,
        bids: Vec<BidAsk>,
        asks: Vec<BidAsk>,
        update_id: Option<u64>,
        utc: Option<f64>,
    ) -> Option<(Vec<BidAsk>, Vec<BidAsk>, Option<u64>, Option<f64>)> {
        let mut sides = self.depth_sides.lock();
        let entry = sides.entry(symbol.to_string()).or_default();
        if !bids.is_empty() {
            entry.bids = Some(bids);
            entry.last_update_id = update_id;
            entry.utc = utc;
        }
        if !asks.is_empty() {
            entry.asks = Some(asks);
            entry.last_update_id = update_id;
            entry.utc = utc;
        }
        let merged_bids = entry.bids.clone().unwrap_or_default();
        let merged_asks = entry.asks.clone().unwrap_or_default();
        if merged_bids.is_empty() && merged_asks.is_empty() {
            return None;
        }
        let out = (merged_bids.clone(), merged_asks.clone(), entry.last_update_id, entry.utc);
        if !merged_bids.is_empty() && !merged_asks.is_empty() {
            sides.remove(symbol);
        }
        Some(out)
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "gate futures: undecodable frame");
                return;
            }
        };
        if msg["event"].as_str() != Some("update") || msg.get("error").map_or(false, |e| !e.is_null())
        {
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let channel = msg["channel"].as_str().unwrap_or("");

        if channel == "futures.candlesticks" {
            let rows = match msg["result"].as_array() {
                Some(rows) => rows.clone(),
                None => return,
            };
            for result in &rows {
                // The contract rides in `n` as "1m_BTC_USDT".
                let n = result["n"].as_str().unwrap_or("");
                let contract = n.split_once('_').map(|(_, rest)| rest).unwrap_or(n);
                let Some(ticker) = idx.get(contract) else { continue };
                if !self.throttler.may_pass(&ticker.symbol, "kline").await {
                    continue;
                }
                let (Some(ts), Some(o), Some(h), Some(l), Some(c)) = (
                    json_f64(&result["t"]),
                    json_f64(&result["o"]),
                    json_f64(&result["h"]),
                    json_f64(&result["l"]),
                    json_f64(&result["c"]),
                ) else {
                    continue;
                };
                cb.handle(
                    None,
                    None,
                    Some(CandleStick {
                        utc_open_time: if ts > 1e12 { ts / 1000.0 } else { ts },
                        open: o,
                        high: h,
                        low: l,
                        close: c,
                        coin_volume: json_f64(&result["v"]).unwrap_or(0.0),
                        usd_volume: None,
                    }),
                );
            }
            return;
        }

        let results = match &msg["result"] {
            Value::Array(rows) => rows.clone(),
            result @ Value::Object(_) => vec![result.clone()],
            _ => return,
        };
        for result in &results {
            let contract = result["s"].as_str().unwrap_or("");
            let Some(ticker) = idx.get(contract) else { continue };
            let symbol = ticker.symbol.clone();
            if channel == "futures.book_ticker" {
                if self.throttler.may_pass(&symbol, "book").await {
                    cb.handle(
                        Some(BookTicker {
                            symbol,
                            bid_price: json_f64(&result["b"]).unwrap_or(0.0),
                            bid_qty: json_f64(&result["B"]).unwrap_or(0.0),
                            ask_price: json_f64(&result["a"]).unwrap_or(0.0),
                            ask_qty: json_f64(&result["A"]).unwrap_or(0.0),
                            last_update_id: json_u64(&result["u"]),
                            utc: json_f64(&result["t"]).map(|ms| ms / 1000.0),
                        }),
                        None,
                        None,
                    );
                }
            } else if channel == "futures.order_book_update" {
                if self.throttler.may_pass(&symbol, "depth").await {
                    let bids = levels_from_gate_rows(&result["b"]);
                    let asks = levels_from_gate_rows(&result["a"]);
                    let Some((bids, asks, update_id, utc)) = self.merge_depth_sides(
                        &symbol,
                        bids,
                        asks,
                        json_u64(&result["u"]),
                        json_f64(&result["t"]).map(|ms| ms / 1000.0),
                    ) else {
                        continue;
                    };
                    cb.handle(
                        None,
                        Some(BookDepth {
                            symbol,
                            bids,
                            asks,
                            exchange_symbol: Some(contract.to_string()),
                            last_update_id: update_id,
                            utc,
                        }),
                        None,
                    );
                }
            }
        }
    }
}

#[async_trait]
impl PerpetualConnector for GatePerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Gate
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
                &format!("/futures/{}/tickers", SETTLE),
                &[("contract".to_string(), ticker.exchange_symbol.clone())],
            )
            .await?;
        let row = match &data {
            Value::Array(rows) => rows.first().cloned(),
            Value::Object(_) => Some(data.clone()),
            _ => None,
        };
        let Some(row) = row else {
            return Ok(None);
        };
        if !row["contract"]
            .as_str()
            .map_or(false, |c| c.eq_ignore_ascii_case(&ticker.exchange_symbol))
        {
            return Ok(None);
        }
        let Some(last) = json_f64(&row["last"]) else {
            return Ok(None);
        };
        Ok(Some(CurrencyPair {
            base: ticker.base,
            quote: ticker.quote,
            ratio: last,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let idx = self.symbols().await?;
        let data = self
            .get_json(&format!("/futures/{}/tickers", SETTLE), &[])
            .await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => std::slice::from_ref(&data),
        };
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.to_uppercase()).collect());
        let mut out = Vec::new();
        for row in rows {
            let contract = row["contract"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                let symbol = gate_to_symbol(contract);
                let contract_upper = contract.to_uppercase();
                if !wanted.iter().any(|w| w == &symbol || w == &contract_upper) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(contract) else { continue };
            let Some(last) = json_f64(&row["last"]) else { continue };
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
        let data = self
            .get_json(
                &format!("/futures/{}/order_book", SETTLE),
                &[
                    ("contract".to_string(), ticker.exchange_symbol.clone()),
                    ("limit".to_string(), limit.min(DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        let bids = levels_from_gate_rows(&data["bids"]);
        let asks = levels_from_gate_rows(&data["asks"]);
        if bids.is_empty() && asks.is_empty() {
            return Ok(None);
        }
        Ok(Some(BookDepth {
            symbol: ticker.symbol,
            bids,
            asks,
            exchange_symbol: Some(ticker.exchange_symbol),
            last_update_id: json_u64(&data["id"]),
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
            .get_json(
                &format!("/futures/{}/candlesticks", SETTLE),
                &[
                    ("contract".to_string(), ticker.exchange_symbol.clone()),
                    ("interval".to_string(), "1m".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_candles(&data, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                &format!("/futures/{}/funding_rate", SETTLE),
                &[
                    ("contract".to_string(), ticker.exchange_symbol.clone()),
                    ("limit".to_string(), "1".to_string()),
                ],
            )
            .await?;
        let row = data.as_array().and_then(|rows| rows.first());
        let (rate, next_funding_utc) = match row {
            Some(row) => {
                let rate = json_f64(&row["r"]).unwrap_or(0.0);
                let next = json_f64(&row["t"])
                    .map(|t| t + FUNDING_INTERVAL_SECS)
                    .unwrap_or(0.0);
                (rate, next)
            }
            // A contract with no funding rows yet still maps on the exchange.
            None => (0.0, 0.0),
        };
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc,
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
            .get_json(
                &format!("/futures/{}/funding_rate", SETTLE),
                &[
                    ("contract".to_string(), ticker.exchange_symbol),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let Some(rows) = data.as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let (Some(ts), Some(rate)) = (json_f64(&row["t"]), json_f64(&row["r"])) else {
                continue;
            };
            out.push(FundingRatePoint {
                funding_time_utc: ts,
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
        let contracts: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if contracts.is_empty() {
            self.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(self.ws_url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for contract in &contracts {
            worker
                .sender
                .send_json(&channel_frame("futures.book_ticker", "subscribe", vec![json!(contract)]));
            if depth {
                worker.sender.send_json(&channel_frame(
                    "futures.order_book_update",
                    "subscribe",
                    vec![json!(contract), json!("100ms"), json!("100")],
                ));
            }
            worker.sender.send_json(&channel_frame(
                "futures.candlesticks",
                "subscribe",
                vec![json!(contract), json!("1m")],
            ));
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
        self.depth_sides.lock().clear();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for GatePerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        self.apply_frames(&tokens, "subscribe");
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        self.apply_frames(&tokens, "unsubscribe");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversions() {
        assert_eq!(gate_to_symbol("BTC_USDT"), "BTC/USDT");
        assert_eq!(gate_to_symbol("btc_usdt"), "BTC/USDT");
        assert_eq!(symbol_to_gate("BTC/USDT"), "BTC_USDT");
    }

    #[test]
    fn test_levels_from_gate_rows_both_shapes() {
        let pairs = serde_json::json!([["50000", "1.5"], ["49999", "2"]]);
        let levels = levels_from_gate_rows(&pairs);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 50000.0);

        let objects = serde_json::json!([{"p": "50000", "s": 15}, {"p": "p", "s": "s"}]);
        let levels = levels_from_gate_rows(&objects);
        // The header-shaped row is skipped.
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].quantity, 15.0);
    }

    #[test]
    fn test_parse_candles_list_and_object_rows() {
        let list_rows = serde_json::json!([["1700000000", "100", "110", "90", "105", "2"]]);
        let candles = parse_candles(&list_rows, "USDT");
        assert_eq!(candles[0].utc_open_time, 1_700_000_000.0);
        assert_eq!(candles[0].usd_volume, Some(210.0));

        let object_rows = serde_json::json!([
            {"t": 1700000000, "o": "100", "h": "110", "l": "90", "c": "105", "v": 2}
        ]);
        let candles = parse_candles(&object_rows, "BTC");
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].usd_volume, None);
    }

    #[test]
    fn test_parse_contracts_skips_delisting() {
        let data = serde_json::json!([
            {"name": "BTC_USDT", "in_delisting": false},
            {"name": "OLD_USDT", "in_delisting": true},
            {"name": "NOPAIR"}
        ]);
        let perps = parse_contracts(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
    }

    #[test]
    fn test_side_buffer_merges_one_sided_updates() {
        let store = crate::cache::MemoryStore::shared();
        let conn = GatePerpetualConnector::new(ConnectorOptions::new(store));

        let bid = vec![BidAsk { price: 100.0, quantity: 1.0 }];
        let ask = vec![BidAsk { price: 101.0, quantity: 2.0 }];

        // First update carries only bids: emitted with the bid side alone.
        let (bids, asks, _, _) = conn
            .merge_depth_sides("BTC/USDT", bid.clone(), vec![], Some(1), Some(1.0))
            .unwrap();
        assert_eq!(bids.len(), 1);
        assert!(asks.is_empty());

        // Ask-only update completes the pair; buffer is cleared afterwards.
        let (bids, asks, update_id, _) = conn
            .merge_depth_sides("BTC/USDT", vec![], ask, Some(2), Some(2.0))
            .unwrap();
        assert_eq!(bids.len(), 1);
        assert_eq!(asks.len(), 1);
        assert_eq!(update_id, Some(2));
        assert!(conn.depth_sides.lock().is_empty());

        // Next bid-only update starts a fresh buffer.
        let (_, asks, _, _) = conn
            .merge_depth_sides("BTC/USDT", bid, vec![], Some(3), Some(3.0))
            .unwrap();
        assert!(asks.is_empty());
    }

    #[test]
    fn test_channel_frame_shape() {
        let frame = channel_frame("spot.book_ticker", "subscribe", vec![json!("BTC_USDT")]);
        assert_eq!(frame["channel"], "spot.book_ticker");
        assert_eq!(frame["event"], "subscribe");
        assert_eq!(frame["payload"][0], "BTC_USDT");
        assert!(frame["time"].as_i64().unwrap() > 0);
    }
}
