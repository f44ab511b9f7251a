//! OKX connectors (spot and perpetual swap).
//!
//! Shared public WebSocket (`bbo-tbt` for top-of-book, `books5` for depth;
//! `books5` frames are full five-level snapshots). Instrument ids are
//! `BTC-USDT` for spot and `BTC-USDT-SWAP` for perpetuals.

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
    BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint,
    PerpetualTicker, Ticker,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

const REST: &str = "https://www.okx.com";
const WS_PUBLIC: &str = "wss://ws.okx.com:8443/ws/v5/public";
const WS_PUBLIC_TESTNET: &str = "wss://wspap.okx.com:8443/ws/v5/public";

const DEPTH_API_MAX: usize = 400;
/// Subscribing "all" spot instruments is capped to keep the frame sane.
const SPOT_SUBSCRIBE_ALL_CAP: usize = 200;

fn inst_to_symbol(inst_id: &str) -> String {
    // BTC-USDT -> BTC/USDT
    inst_id.replacen('-', "/", 1)
}

fn symbol_to_inst(symbol: &str) -> String {
    symbol.replace('/', "-")
}

fn swap_to_symbol(inst_id: &str) -> String {
    // BTC-USDT-SWAP -> BTC/USDT
    let trimmed = inst_id.strip_suffix("-SWAP").unwrap_or(inst_id);
    trimmed.replacen('-', "/", 1)
}

fn symbol_to_swap(symbol: &str) -> String {
    format!("{}-SWAP", symbol.replace('/', "-"))
}

/// Envelope `{code, msg, data}`; code "0" is success.
fn unwrap_okx(data: Value) -> Result<Value> {
    if data["code"].as_str() != Some("0") {
        bail!("okx API error: {}", data["msg"].as_str().unwrap_or("unknown"));
    }
    Ok(data["data"].clone())
}

fn ticker_aliases(t: &Ticker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(t.symbol.replace('/', "-"));
    if let Some(native) = &t.exchange_symbol {
        keys.push(native.clone());
    }
}

fn perp_aliases(t: &PerpetualTicker, keys: &mut Vec<String>) {
    keys.push(t.symbol.clone());
    keys.push(t.symbol.replace('/', ""));
    keys.push(symbol_to_swap(&t.symbol));
    keys.push(t.exchange_symbol.clone());
}

fn parse_spot_instruments(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["state"].as_str() != Some("live") {
            continue;
        }
        let inst_id = item["instId"].as_str().unwrap_or("");
        if inst_id.is_empty() {
            continue;
        }
        let base = item["baseCcy"].as_str().unwrap_or("");
        let quote = item["quoteCcy"].as_str().unwrap_or("");
        let symbol = inst_to_symbol(inst_id);
        let (base, quote) = if base.is_empty() || quote.is_empty() {
            match symbol.split_once('/') {
                Some((b, q)) => (b.to_string(), q.to_string()),
                None => continue,
            }
        } else {
            (base.to_string(), quote.to_string())
        };
        out.push(Ticker {
            symbol,
            base,
            quote,
            is_spot_enabled: true,
            is_margin_enabled: false,
            exchange_symbol: Some(inst_id.to_string()),
        });
    }
    out
}

fn parse_swap_instruments(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if item["state"].as_str() != Some("live") {
            continue;
        }
        let inst_id = item["instId"].as_str().unwrap_or("");
        if !inst_id.ends_with("-SWAP") {
            continue;
        }
        let uly = item["uly"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| inst_id.trim_end_matches("-SWAP").to_string());
        let (base, quote) = match uly.split_once('-') {
            Some((b, q)) => (b.to_string(), q.to_string()),
            None => (uly.clone(), "USDT".to_string()),
        };
        out.push(PerpetualTicker {
            symbol: swap_to_symbol(inst_id),
            base,
            quote: quote.clone(),
            exchange_symbol: inst_id.to_string(),
            settlement: quote,
        });
    }
    out
}

/// Candle rows `[ts, o, h, l, c, vol, …]`, ts in ms.
fn parse_candles(data: &Value, quote: &str) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let mut out = Vec::new();
    for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
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

fn parse_book(data: &Value, symbol: &str, inst_id: &str) -> Option<BookDepth> {
    let book = data.as_array().and_then(|rows| rows.first())?;
    let bids = levels_from_pairs(&book["bids"]);
    let asks = levels_from_pairs(&book["asks"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(BookDepth {
        symbol: symbol.to_string(),
        bids,
        asks,
        exchange_symbol: Some(inst_id.to_string()),
        last_update_id: json_u64(&book["ts"]),
        utc: Some(utc_now_secs()),
    })
}

fn book_ticker_from_bbo(data: &Value, symbol: &str) -> BookTicker {
    BookTicker {
        symbol: symbol.to_string(),
        bid_price: json_f64(&data["bidPx"]).unwrap_or(0.0),
        bid_qty: json_f64(&data["bidSz"]).unwrap_or(0.0),
        ask_price: json_f64(&data["askPx"]).unwrap_or(0.0),
        ask_qty: json_f64(&data["askSz"]).unwrap_or(0.0),
        last_update_id: json_u64(&data["ts"]),
        utc: json_f64(&data["ts"]).map(|ms| ms / 1000.0),
    }
}

fn subscribe_args(inst_ids: &[String], depth: bool) -> Vec<Value> {
    let mut args = Vec::with_capacity(inst_ids.len() * 2);
    for inst_id in inst_ids {
        args.push(json!({"channel": "bbo-tbt", "instId": inst_id}));
        if depth {
            args.push(json!({"channel": "books5", "instId": inst_id}));
        }
    }
    args
}

/// Shared WS routing; `lookup` resolves an instId to the canonical symbol.
async fn route_frame(
    raw: &str,
    core: &StreamCore,
    throttler: &Throttler,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let msg: Value = match serde_json::from_str(raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "okx: undecodable frame");
            return;
        }
    };
    if msg.get("event").is_some() {
        // subscribe/unsubscribe acks and errors
        return;
    }
    let Some(cb) = core.callback() else { return };
    let channel = msg["arg"]["channel"].as_str().unwrap_or("");
    let arg_inst = msg["arg"]["instId"].as_str().unwrap_or("");
    let rows = match msg["data"].as_array() {
        Some(rows) => rows,
        None => return,
    };
    for data in rows {
        let inst_id = data["instId"].as_str().unwrap_or(arg_inst);
        let Some(symbol) = lookup(inst_id) else { continue };
        if channel == "bbo-tbt" {
            if throttler.may_pass(&symbol, "book").await {
                cb.handle(Some(book_ticker_from_bbo(data, &symbol)), None, None);
            }
        } else if channel.starts_with("books") {
            if throttler.may_pass(&symbol, "depth").await {
                let bids = levels_from_pairs(&data["bids"]);
                let asks = levels_from_pairs(&data["asks"]);
                if bids.is_empty() && asks.is_empty() {
                    continue;
                }
                cb.handle(
                    None,
                    Some(BookDepth {
                        symbol: symbol.clone(),
                        bids,
                        asks,
                        exchange_symbol: Some(inst_id.to_string()),
                        last_update_id: json_u64(&data["ts"]),
                        utc: json_f64(&data["ts"]).map(|ms| ms / 1000.0),
                    }),
                    None,
                );
            }
        }
    }
}

macro_rules! okx_get {
    ($self:ident, $kind:expr, $path:expr, $params:expr) => {{
        let url = format!("{}{}", REST, $path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &$self.opts.http,
            ExchangeId::Okx,
            $kind,
            &url,
            $params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp
            .json::<Value>()
            .await
            .with_context(|| format!("decode {}", url))?;
        unwrap_okx(data)
    }};
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct OkxSpotConnector {
    opts: ConnectorOptions,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl OkxSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "OkxSpot");
        let conn = Arc::new(Self {
            ws_url: if opts.testing { WS_PUBLIC_TESTNET } else { WS_PUBLIC },
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

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = okx_get!(
                    self,
                    MarketKind::Spot,
                    "/api/v5/public/instruments",
                    &[("instType".to_string(), "SPOT".to_string())]
                )?;
                Ok(SymbolIndex::build(parse_spot_instruments(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let dashed = symbol.replace('/', "-");
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, dashed.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn apply_frames(&self, tokens: &[String], op: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        let mut inst_ids = Vec::new();
        for token in tokens {
            let dashed = token.replace('/', "-");
            if let Some(native) = idx
                .get_any([token.as_str(), dashed.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                inst_ids.push(native);
            }
        }
        if !inst_ids.is_empty() {
            self.core
                .send_json(&json!({"op": op, "args": subscribe_args(&inst_ids, depth)}));
        }
    }
}

#[async_trait]
impl SpotConnector for OkxSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(pair_code).await? else {
            return Ok(None);
        };
        let inst_id = ticker.exchange_symbol.clone().unwrap_or_default();
        let data = okx_get!(
            self,
            MarketKind::Spot,
            "/api/v5/market/ticker",
            &[("instId".to_string(), inst_id)]
        )?;
        let Some(row) = data.as_array().and_then(|rows| rows.first()) else {
            return Ok(None);
        };
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
        let data = okx_get!(
            self,
            MarketKind::Spot,
            "/api/v5/market/tickers",
            &[("instType".to_string(), "SPOT".to_string())]
        )?;
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| symbol_to_inst(s)).collect());
        let mut out = Vec::new();
        for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let inst_id = row["instId"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == inst_id) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(inst_id) else { continue };
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
        let inst_id = ticker.exchange_symbol.clone().unwrap_or_default();
        let data = okx_get!(
            self,
            MarketKind::Spot,
            "/api/v5/market/books",
            &[
                ("instId".to_string(), inst_id.clone()),
                ("sz".to_string(), limit.min(DEPTH_API_MAX).to_string()),
            ]
        )?;
        Ok(parse_book(&data, &ticker.symbol, &inst_id))
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
        let data = okx_get!(
            self,
            MarketKind::Spot,
            "/api/v5/market/candles",
            &[
                ("instId".to_string(), ticker.exchange_symbol.clone().unwrap_or_default()),
                ("bar".to_string(), "1m".to_string()),
                ("limit".to_string(), n.to_string()),
            ]
        )?;
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
        let inst_ids: Vec<String> = match symbols {
            None => idx
                .items()
                .iter()
                .filter_map(|t| t.exchange_symbol.clone())
                .take(SPOT_SUBSCRIBE_ALL_CAP)
                .collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol))
                .filter_map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if inst_ids.is_empty() {
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
        worker
            .sender
            .send_json(&json!({"op": "subscribe", "args": subscribe_args(&inst_ids, depth)}));
        self.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                let lookup = |inst_id: &str| {
                    me.symbols.get().and_then(|idx| idx.get(inst_id)).map(|t| t.symbol.clone())
                };
                route_frame(&frame, &me.core, &me.throttler, lookup).await;
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
impl SubscriptionSink for OkxSpotConnector {
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
// Perpetual swap
// ---------------------------------------------------------------------------

pub struct OkxPerpetualConnector {
    opts: ConnectorOptions,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl OkxPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "OkxPerpetual");
        let conn = Arc::new(Self {
            ws_url: if opts.testing { WS_PUBLIC_TESTNET } else { WS_PUBLIC },
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

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = okx_get!(
                    self,
                    MarketKind::Perpetual,
                    "/api/v5/public/instruments",
                    &[("instType".to_string(), "SWAP".to_string())]
                )?;
                Ok(SymbolIndex::build(parse_swap_instruments(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let swap = symbol_to_swap(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, swap.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn apply_frames(&self, tokens: &[String], op: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        let mut inst_ids = Vec::new();
        for token in tokens {
            let swap = symbol_to_swap(token);
            if let Some(t) = idx.get_any([token.as_str(), swap.as_str()]) {
                inst_ids.push(t.exchange_symbol.clone());
            }
        }
        if !inst_ids.is_empty() {
            self.core
                .send_json(&json!({"op": op, "args": subscribe_args(&inst_ids, depth)}));
        }
    }
}

#[async_trait]
impl PerpetualConnector for OkxPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/market/ticker",
            &[("instId".to_string(), ticker.exchange_symbol.clone())]
        )?;
        let Some(row) = data.as_array().and_then(|rows| rows.first()) else {
            return Ok(None);
        };
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
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/market/tickers",
            &[("instType".to_string(), "SWAP".to_string())]
        )?;
        let wanted: Option<Vec<String>> = symbols.map(|list| {
            list.iter()
                .map(|s| if s.contains('/') { symbol_to_swap(s) } else { s.clone() })
                .collect()
        });
        let mut out = Vec::new();
        for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let inst_id = row["instId"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == inst_id) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(inst_id) else { continue };
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
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/market/books",
            &[
                ("instId".to_string(), ticker.exchange_symbol.clone()),
                ("sz".to_string(), limit.min(DEPTH_API_MAX).to_string()),
            ]
        )?;
        Ok(parse_book(&data, &ticker.symbol, &ticker.exchange_symbol))
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
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/market/candles",
            &[
                ("instId".to_string(), ticker.exchange_symbol.clone()),
                ("bar".to_string(), "1m".to_string()),
                ("limit".to_string(), n.to_string()),
            ]
        )?;
        let candles = parse_candles(&data, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/public/funding-rate",
            &[("instId".to_string(), ticker.exchange_symbol.clone())]
        )?;
        let Some(row) = data.as_array().and_then(|rows| rows.first()) else {
            return Ok(None);
        };
        let Some(rate) = json_f64(&row["fundingRate"]) else {
            return Ok(None);
        };
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc: json_f64(&row["nextFundingTime"])
                .map(|ms| ms / 1000.0)
                .unwrap_or(0.0),
            next_rate: json_f64(&row["nextFundingRate"]),
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
        let data = okx_get!(
            self,
            MarketKind::Perpetual,
            "/api/v5/public/funding-rate-history",
            &[
                ("instId".to_string(), ticker.exchange_symbol),
                ("limit".to_string(), n.to_string()),
            ]
        )?;
        let Some(rows) = data.as_array() else {
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
        self.core.try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let idx = match self.symbols().await {
            Ok(idx) => idx,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        let inst_ids: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if inst_ids.is_empty() {
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
        worker
            .sender
            .send_json(&json!({"op": "subscribe", "args": subscribe_args(&inst_ids, depth)}));
        self.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                let lookup = |inst_id: &str| {
                    me.symbols.get().and_then(|idx| idx.get(inst_id)).map(|t| t.symbol.clone())
                };
                route_frame(&frame, &me.core, &me.throttler, lookup).await;
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
impl SubscriptionSink for OkxPerpetualConnector {
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
        assert_eq!(inst_to_symbol("BTC-USDT"), "BTC/USDT");
        assert_eq!(symbol_to_inst("BTC/USDT"), "BTC-USDT");
        assert_eq!(swap_to_symbol("BTC-USDT-SWAP"), "BTC/USDT");
        assert_eq!(symbol_to_swap("BTC/USDT"), "BTC-USDT-SWAP");
    }

    #[test]
    fn test_unwrap_okx() {
        let ok = serde_json::json!({"code": "0", "data": [1]});
        assert_eq!(unwrap_okx(ok).unwrap(), serde_json::json!([1]));
        let err = serde_json::json!({"code": "51000", "msg": "instId error"});
        assert!(unwrap_okx(err).unwrap_err().to_string().contains("instId error"));
    }

    #[test]
    fn test_parse_swap_instruments_filters_non_swap() {
        let data = serde_json::json!([
            {"instId": "BTC-USDT-SWAP", "state": "live", "uly": "BTC-USDT"},
            {"instId": "BTC-USDT-240927", "state": "live", "uly": "BTC-USDT"},
            {"instId": "ETH-USDT-SWAP", "state": "suspend", "uly": "ETH-USDT"}
        ]);
        let perps = parse_swap_instruments(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(perps[0].settlement, "USDT");
    }

    #[test]
    fn test_parse_book_from_rest() {
        let data = serde_json::json!([{
            "bids": [["50000", "1", "0", "1"], ["49999", "2", "0", "1"]],
            "asks": [["50001", "1", "0", "1"]],
            "ts": "1700000000000"
        }]);
        let depth = parse_book(&data, "BTC/USDT", "BTC-USDT").unwrap();
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.last_update_id, Some(1_700_000_000_000));
    }

    #[test]
    fn test_book_ticker_from_bbo() {
        let data = serde_json::json!({
            "bidPx": "50000.1", "bidSz": "2", "askPx": "50000.9", "askSz": "3",
            "ts": "1700000000500"
        });
        let book = book_ticker_from_bbo(&data, "BTC/USDT");
        assert_eq!(book.bid_price, 50000.1);
        assert_eq!(book.ask_qty, 3.0);
        assert_eq!(book.utc, Some(1_700_000_000.5));
    }

    #[test]
    fn test_subscribe_args_depth_toggle() {
        let args = subscribe_args(&["BTC-USDT".to_string()], true);
        assert_eq!(args.len(), 2);
        assert_eq!(args[1]["channel"], "books5");
        let args = subscribe_args(&["BTC-USDT".to_string()], false);
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["channel"], "bbo-tbt");
    }

    #[test]
    fn test_parse_candles_usd_volume() {
        let data = serde_json::json!([
            ["1700000000000", "100", "110", "90", "105", "2", "210", "210", "1"]
        ]);
        let candles = parse_candles(&data, "USDT");
        assert_eq!(candles[0].usd_volume, Some(210.0));
        assert_eq!(parse_candles(&data, "ETH")[0].usd_volume, None);
    }
}
