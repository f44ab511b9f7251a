//! Bitfinex connectors: spot (exchange pairs) and derivatives (perpetual).
//!
//! REST rows are positional arrays. WS data frames are `[chanId, payload]`;
//! the chanId→symbol mapping is learned from `subscribed` events. Spot books
//! use `[price, count, amount]` semantics (count 0 removes the level, the
//! amount sign picks the side) folded into a live book so emitted depths are
//! full snapshots. Deriv `status` frames price from mark, falling back to
//! the spot index. Quote `UST` is canonical `USDT`.

use crate::cex::rest_limit::{self, WeightTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::cex::subscriptions::{SubscriptionBatcher, SubscriptionSink};
use crate::cex::symbol_map::SymbolIndex;
use crate::cex::throttler::Throttler;
use crate::cex::ws::{self, EventQueue, FrameCodec, StreamCore, EVENT_QUEUE_CAPACITY};
use crate::cex::{
    json_f64, utc_now_secs, ConnectorOptions, ExchangeId, MarketKind, PerpetualConnector,
    SpotConnector, StreamCallback, DEFAULT_FUNDING_HISTORY_LIMIT, DEFAULT_KLINE_LIMIT,
    DEFAULT_SUBSCRIPTION_BATCH_SECS,
};
use crate::models::{
    pair_code, BidAsk, BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate,
    FundingRatePoint, PerpetualTicker, Ticker,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

const API: &str = "https://api-pub.bitfinex.com/v2";
const WS: &str = "wss://api-pub.bitfinex.com/ws/2";

const DEPTH_API_MAX: usize = 100;
const WS_BOOK_LEN: usize = 25;

// Deriv status array positions.
const STATUS_MTS: usize = 1;
const STATUS_DERIV_PRICE: usize = 3;
const STATUS_SPOT_PRICE: usize = 4;
const STATUS_NEXT_FUNDING_MTS: usize = 8;
const STATUS_CURRENT_FUNDING: usize = 12;
const STATUS_MARK_PRICE: usize = 15;

const QUOTES: &[&str] = &["USDT", "UST", "USD", "EUR", "BTC", "ETH"];

/// tBTCUSD -> BTC/USD, tETHUST -> ETH/USDT.
fn bfx_to_symbol(native: &str) -> Option<String> {
    let stripped = native.strip_prefix('t').unwrap_or(native);
    for quote in QUOTES {
        if let Some(base) = stripped.strip_suffix(quote) {
            if base.is_empty() {
                return None;
            }
            let quote = if *quote == "UST" { "USDT" } else { quote };
            return Some(pair_code(base, quote));
        }
    }
    None
}

/// BTC/USDT -> tBTCUST.
fn symbol_to_bfx(symbol: &str) -> String {
    let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USD"));
    let quote = if quote == "USDT" { "UST" } else { quote };
    format!("t{}{}", base, quote)
}

/// tBTCF0:USTF0 -> BTC/USDT.
fn deriv_to_symbol(key: &str) -> Option<String> {
    let (base_part, quote_part) = key.split_once(':')?;
    let base = base_part
        .strip_prefix('t')
        .unwrap_or(base_part)
        .strip_suffix("F0")?;
    let quote = quote_part.strip_suffix("F0")?;
    let quote = if quote == "UST" { "USDT" } else { quote };
    Some(pair_code(base, quote))
}

/// BTC/USDT -> tBTCF0:USTF0.
fn symbol_to_deriv(symbol: &str) -> String {
    let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USDT"));
    let quote = if quote == "USDT" { "UST" } else { quote };
    format!("t{}F0:{}F0", base, quote)
}

/// REST errors come back as `["error", code, message]`.
fn check_error_row(data: &Value) -> Result<()> {
    if let Some(rows) = data.as_array() {
        if rows.first().and_then(Value::as_str) == Some("error") {
            bail!(
                "bitfinex API error: {}",
                rows.get(2).and_then(Value::as_str).unwrap_or("unknown")
            );
        }
    }
    Ok(())
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
    keys.push(t.exchange_symbol.clone());
}

fn parse_pair_list(data: &Value) -> Vec<Ticker> {
    let raw = match data.as_array() {
        Some(rows) if rows.first().map_or(false, Value::is_array) => {
            rows[0].as_array().cloned().unwrap_or_default()
        }
        Some(rows) => rows.to_vec(),
        None => Vec::new(),
    };
    let mut out = Vec::new();
    for entry in raw {
        let Some(pair) = entry.as_str() else { continue };
        let native = if pair.starts_with('t') {
            pair.to_string()
        } else {
            format!("t{}", pair)
        };
        let Some(symbol) = bfx_to_symbol(&native) else { continue };
        let (base, quote) = symbol.split_once('/').unwrap_or(("", ""));
        out.push(Ticker {
            symbol: symbol.clone(),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: false,
            exchange_symbol: Some(native),
        });
    }
    out
}

fn parse_deriv_status_list(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let Some(key) = row.as_array().and_then(|cells| cells.first()).and_then(Value::as_str)
        else {
            continue;
        };
        if !key.contains("F0") {
            continue;
        }
        let Some(symbol) = deriv_to_symbol(key) else { continue };
        let (base, quote) = symbol.split_once('/').unwrap_or(("", ""));
        out.push(PerpetualTicker {
            symbol: symbol.clone(),
            base: base.to_string(),
            quote: quote.to_string(),
            exchange_symbol: key.to_string(),
            settlement: quote.to_string(),
        });
    }
    out
}

/// Raw book rows `[price, count, amount]`: positive amounts are bids.
fn parse_rest_book(data: &Value, symbol: &str, native: &str, limit: usize) -> Option<BookDepth> {
    let rows = data.as_array()?;
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    for row in rows {
        let cells = match row.as_array() {
            Some(cells) if cells.len() >= 3 => cells,
            _ => continue,
        };
        let (Some(price), Some(amount)) = (json_f64(&cells[0]), json_f64(&cells[2])) else {
            continue;
        };
        if amount > 0.0 {
            bids.push(BidAsk { price, quantity: amount });
        } else if amount < 0.0 {
            asks.push(BidAsk { price, quantity: -amount });
        }
    }
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    bids.truncate(limit);
    asks.truncate(limit);
    Some(BookDepth {
        symbol: symbol.to_string(),
        bids,
        asks,
        exchange_symbol: Some(native.to_string()),
        last_update_id: None,
        utc: Some(utc_now_secs()),
    })
}

/// Candle rows `[MTS, OPEN, CLOSE, HIGH, LOW, VOLUME]`.
fn parse_candles(data: &Value, quote: &str, limit: usize) -> Vec<CandleStick> {
    let usd = matches!(quote, "USD" | "UST" | "USDT");
    let mut out = Vec::new();
    for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]).iter().take(limit) {
        let cells = match row.as_array() {
            Some(cells) if cells.len() >= 6 => cells,
            _ => continue,
        };
        let (Some(ts), Some(o), Some(c), Some(h), Some(l), Some(v)) = (
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

/// Live spot book folding `[price, count, amount]` rows.
#[derive(Default)]
struct BfxBook {
    bids: BTreeMap<u64, f64>,
    asks: BTreeMap<u64, f64>,
}

impl BfxBook {
    fn apply_row(&mut self, price: f64, count: f64, amount: f64) {
        let bits = price.to_bits();
        if count == 0.0 {
            // amount 1 removes from bids, -1 from asks
            if amount > 0.0 {
                self.bids.remove(&bits);
            } else {
                self.asks.remove(&bits);
            }
        } else if amount > 0.0 {
            self.bids.insert(bits, amount);
        } else if amount < 0.0 {
            self.asks.insert(bits, -amount);
        }
    }

    fn apply(&mut self, payload: &Value) {
        match payload.as_array() {
            Some(rows) if rows.first().map_or(false, Value::is_array) => {
                // Snapshot: replace everything.
                self.bids.clear();
                self.asks.clear();
                for row in rows {
                    if let Some(cells) = row.as_array() {
                        if cells.len() >= 3 {
                            if let (Some(p), Some(c), Some(a)) =
                                (json_f64(&cells[0]), json_f64(&cells[1]), json_f64(&cells[2]))
                            {
                                self.apply_row(p, c, a);
                            }
                        }
                    }
                }
            }
            Some(cells) if cells.len() >= 3 => {
                if let (Some(p), Some(c), Some(a)) =
                    (json_f64(&cells[0]), json_f64(&cells[1]), json_f64(&cells[2]))
                {
                    self.apply_row(p, c, a);
                }
            }
            _ => {}
        }
    }

    fn to_depth(&self, symbol: &str, native: &str) -> Option<BookDepth> {
        if self.bids.is_empty() && self.asks.is_empty() {
            return None;
        }
        Some(BookDepth {
            symbol: symbol.to_string(),
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(&bits, &quantity)| BidAsk { price: f64::from_bits(bits), quantity })
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(&bits, &quantity)| BidAsk { price: f64::from_bits(bits), quantity })
                .collect(),
            exchange_symbol: Some(native.to_string()),
            last_update_id: None,
            utc: Some(utc_now_secs()),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BfxChannel {
    Ticker,
    Book,
    Status,
}

#[derive(Clone)]
struct ChannelInfo {
    channel: BfxChannel,
    native: String,
}

macro_rules! bfx_get {
    ($self:ident, $kind:expr, $path:expr, $params:expr) => {{
        let url = format!("{}{}", API, $path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &$self.opts.http,
            ExchangeId::Bitfinex,
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
        check_error_row(&data)?;
        Ok::<Value, anyhow::Error>(data)
    }};
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct BitfinexSpotConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    channels: Mutex<HashMap<i64, ChannelInfo>>,
    books: Mutex<HashMap<i64, BfxBook>>,
    weak: OnceLock<Weak<Self>>,
}

impl BitfinexSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "BitfinexSpot");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            channels: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
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
                let data: Value =
                    bfx_get!(self, MarketKind::Spot, "/conf/pub:list:pair:exchange", &[])?;
                Ok(SymbolIndex::build(parse_pair_list(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let bfx = symbol_to_bfx(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, bfx.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn subscribe_frames(&self, native: &str, depth: bool) -> Vec<Value> {
        let mut frames = vec![json!({"event": "subscribe", "channel": "ticker", "symbol": native})];
        if depth {
            frames.push(json!({
                "event": "subscribe",
                "channel": "book",
                "symbol": native,
                "prec": "P0",
                "len": WS_BOOK_LEN.to_string(),
            }));
        }
        frames
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "bitfinex spot: undecodable frame");
                return;
            }
        };
        if let Some(obj) = msg.as_object() {
            if obj.get("event").and_then(Value::as_str) == Some("subscribed") {
                let chan_id = obj.get("chanId").and_then(Value::as_i64).unwrap_or(-1);
                let channel = match obj.get("channel").and_then(Value::as_str) {
                    Some("ticker") => BfxChannel::Ticker,
                    Some("book") => BfxChannel::Book,
                    _ => return,
                };
                let native = obj
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.channels.lock().insert(chan_id, ChannelInfo { channel, native });
            } else if obj.get("event").and_then(Value::as_str) == Some("unsubscribed") {
                if let Some(chan_id) = obj.get("chanId").and_then(Value::as_i64) {
                    self.channels.lock().remove(&chan_id);
                    self.books.lock().remove(&chan_id);
                }
            }
            return;
        }
        let Some(cells) = msg.as_array() else { return };
        if cells.len() < 2 {
            return;
        }
        let Some(chan_id) = cells[0].as_i64() else { return };
        if cells[1].as_str() == Some("hb") {
            return;
        }
        let Some(info) = self.channels.lock().get(&chan_id).cloned() else { return };
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let Some(ticker) = idx.get(&info.native) else { return };
        let symbol = ticker.symbol.clone();
        let payload = &cells[1];

        match info.channel {
            BfxChannel::Ticker => {
                // [BID, BID_SIZE, ASK, ASK_SIZE, …, LAST_PRICE, …]
                let Some(fields) = payload.as_array() else { return };
                if fields.len() < 4 {
                    return;
                }
                if self.throttler.may_pass(&symbol, "book").await {
                    cb.handle(
                        Some(BookTicker {
                            symbol,
                            bid_price: json_f64(&fields[0]).unwrap_or(0.0),
                            bid_qty: json_f64(&fields[1]).unwrap_or(0.0),
                            ask_price: json_f64(&fields[2]).unwrap_or(0.0),
                            ask_qty: json_f64(&fields[3]).unwrap_or(0.0),
                            last_update_id: Some(chan_id as u64),
                            utc: Some(utc_now_secs()),
                        }),
                        None,
                        None,
                    );
                }
            }
            BfxChannel::Book => {
                let depth = {
                    let mut books = self.books.lock();
                    let book = books.entry(chan_id).or_default();
                    book.apply(payload);
                    book.to_depth(&symbol, &info.native)
                };
                if let Some(depth) = depth {
                    if self.throttler.may_pass(&symbol, "depth").await {
                        cb.handle(None, Some(depth), None);
                    }
                }
            }
            BfxChannel::Status => {}
        }
    }
}

#[async_trait]
impl SpotConnector for BitfinexSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bitfinex
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(pair_code).await? else {
            return Ok(None);
        };
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let data: Value = bfx_get!(
            self,
            MarketKind::Spot,
            "/tickers",
            &[("symbols".to_string(), native.clone())]
        )?;
        let last = data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Value::as_array)
            .filter(|row| row.len() >= 8)
            .and_then(|row| json_f64(&row[7]));
        let Some(last) = last else {
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Spot,
            "/tickers",
            &[("symbols".to_string(), "ALL".to_string())]
        )?;
        let wanted: Option<Vec<String>> = symbols.map(|list| {
            list.iter()
                .map(|s| if s.contains('/') { symbol_to_bfx(s) } else { s.clone() })
                .collect()
        });
        let mut out = Vec::new();
        for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let Some(cells) = row.as_array() else { continue };
            if cells.len() < 8 {
                continue;
            }
            let native = cells[0].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(last) = json_f64(&cells[7]) else { continue };
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Spot,
            &format!("/book/{}/P0", native),
            &[("len".to_string(), limit.min(DEPTH_API_MAX).to_string())]
        )?;
        Ok(parse_rest_book(&data, &ticker.symbol, &native, limit))
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
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let data: Value = bfx_get!(
            self,
            MarketKind::Spot,
            &format!("/candles/trade:1m:{}/hist", native),
            &[("limit".to_string(), n.to_string())]
        )?;
        let candles = parse_candles(&data, &ticker.quote, n);
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
        let worker = match ws::connect(WS, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for native in &natives {
            for frame in self.subscribe_frames(native, depth) {
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
        self.channels.lock().clear();
        self.books.lock().clear();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for BitfinexSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in &tokens {
            let bfx = symbol_to_bfx(token);
            if let Some(native) = idx
                .get_any([token.as_str(), bfx.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                for frame in self.subscribe_frames(&native, depth) {
                    self.core.send_json(&frame);
                }
            }
        }
    }

    /// Unsubscribe is chanId-addressed on this protocol.
    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let mut chan_ids = Vec::new();
        {
            let channels = self.channels.lock();
            for token in &tokens {
                let bfx = symbol_to_bfx(token);
                let Some(native) = idx
                    .get_any([token.as_str(), bfx.as_str()])
                    .and_then(|t| t.exchange_symbol.clone())
                else {
                    continue;
                };
                for (chan_id, info) in channels.iter() {
                    if info.native == native {
                        chan_ids.push(*chan_id);
                    }
                }
            }
        }
        for chan_id in chan_ids {
            self.core
                .send_json(&json!({"event": "unsubscribe", "chanId": chan_id}));
        }
    }
}

// ---------------------------------------------------------------------------
// Derivatives (perpetual)
// ---------------------------------------------------------------------------

pub struct BitfinexPerpetualConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    channels: Mutex<HashMap<i64, ChannelInfo>>,
    weak: OnceLock<Weak<Self>>,
}

impl BitfinexPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler =
            Throttler::new(opts.throttle_timeout, opts.store.clone(), "BitfinexPerpetual");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            core: StreamCore::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            channels: Mutex::new(HashMap::new()),
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
                let data: Value = bfx_get!(
                    self,
                    MarketKind::Perpetual,
                    "/status/deriv",
                    &[("keys".to_string(), "ALL".to_string())]
                )?;
                Ok(SymbolIndex::build(parse_deriv_status_list(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let deriv = symbol_to_deriv(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, deriv.as_str(), no_slash.as_str()])
            .cloned())
    }

    async fn status_row(&self, key: &str) -> Result<Option<Vec<Value>>> {
        let data: Value = bfx_get!(
            self,
            MarketKind::Perpetual,
            "/status/deriv",
            &[("keys".to_string(), key.to_string())]
        )?;
        Ok(data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Value::as_array)
            .cloned())
    }

    /// Mark price when present, derivative mid then spot index otherwise.
    fn price_from_status(row: &[Value]) -> Option<f64> {
        row.get(STATUS_MARK_PRICE)
            .and_then(json_f64)
            .or_else(|| row.get(STATUS_DERIV_PRICE).and_then(json_f64))
            .or_else(|| row.get(STATUS_SPOT_PRICE).and_then(json_f64))
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "bitfinex deriv: undecodable frame");
                return;
            }
        };
        if let Some(obj) = msg.as_object() {
            if obj.get("event").and_then(Value::as_str) == Some("subscribed")
                && obj.get("channel").and_then(Value::as_str) == Some("status")
            {
                let chan_id = obj.get("chanId").and_then(Value::as_i64).unwrap_or(-1);
                let native = obj
                    .get("key")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim_start_matches("deriv:")
                    .to_string();
                self.channels.lock().insert(
                    chan_id,
                    ChannelInfo {
                        channel: BfxChannel::Status,
                        native,
                    },
                );
            }
            return;
        }
        let Some(cells) = msg.as_array() else { return };
        if cells.len() < 2 || cells[1].as_str() == Some("hb") {
            return;
        }
        let Some(chan_id) = cells[0].as_i64() else { return };
        let Some(info) = self.channels.lock().get(&chan_id).cloned() else { return };
        let Some(cb) = self.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let Some(ticker) = idx.get(&info.native) else { return };
        let symbol = ticker.symbol.clone();
        let Some(row) = cells[1].as_array() else { return };
        if row.len() <= STATUS_DERIV_PRICE {
            return;
        }
        if !self.throttler.may_pass(&symbol, "book").await {
            return;
        }
        let Some(price) = Self::price_from_status(row) else { return };
        let mts = row.get(STATUS_MTS).and_then(json_f64);
        cb.handle(
            Some(BookTicker {
                symbol,
                bid_price: price,
                bid_qty: 0.0,
                ask_price: price,
                ask_qty: 0.0,
                last_update_id: mts.map(|ms| ms as u64),
                utc: mts.map(|ms| ms / 1000.0),
            }),
            None,
            None,
        );
    }
}

#[async_trait]
impl PerpetualConnector for BitfinexPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bitfinex
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let Some(row) = self.status_row(&ticker.exchange_symbol).await? else {
            return Ok(None);
        };
        let Some(price) = Self::price_from_status(&row) else {
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Perpetual,
            "/status/deriv",
            &[("keys".to_string(), "ALL".to_string())]
        )?;
        let wanted: Option<Vec<String>> = symbols.map(|list| {
            list.iter()
                .map(|s| if s.contains('/') { symbol_to_deriv(s) } else { s.clone() })
                .collect()
        });
        let mut out = Vec::new();
        for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let Some(cells) = row.as_array() else { continue };
            let key = cells.first().and_then(Value::as_str).unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == key) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(key) else { continue };
            let Some(price) = Self::price_from_status(cells) else { continue };
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Perpetual,
            &format!("/book/{}/P0", ticker.exchange_symbol),
            &[("len".to_string(), limit.min(DEPTH_API_MAX).to_string())]
        )?;
        Ok(parse_rest_book(&data, &ticker.symbol, &ticker.exchange_symbol, limit))
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Perpetual,
            &format!("/candles/trade:1m:{}/hist", ticker.exchange_symbol),
            &[("limit".to_string(), n.to_string())]
        )?;
        let candles = parse_candles(&data, &ticker.quote, n);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let Some(row) = self.status_row(&ticker.exchange_symbol).await? else {
            return Ok(None);
        };
        let Some(rate) = row.get(STATUS_CURRENT_FUNDING).and_then(json_f64) else {
            return Ok(None);
        };
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc: row
                .get(STATUS_NEXT_FUNDING_MTS)
                .and_then(json_f64)
                .map(|ms| ms / 1000.0)
                .unwrap_or(0.0),
            next_rate: None,
            index_price: row.get(STATUS_SPOT_PRICE).and_then(json_f64),
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
        let data: Value = bfx_get!(
            self,
            MarketKind::Perpetual,
            &format!("/status/deriv/{}/hist", ticker.exchange_symbol),
            &[("limit".to_string(), n.to_string())]
        )?;
        let Some(rows) = data.as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let Some(cells) = row.as_array() else { continue };
            let (Some(ts), Some(rate)) = (
                cells.get(STATUS_MTS).and_then(json_f64),
                cells.get(STATUS_CURRENT_FUNDING).and_then(json_f64),
            ) else {
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
        let keys: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if keys.is_empty() {
            self.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(WS, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for key in &keys {
            worker.sender.send_json(&json!({
                "event": "subscribe",
                "channel": "status",
                "key": format!("deriv:{}", key),
            }));
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
        self.channels.lock().clear();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for BitfinexPerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        for token in &tokens {
            let deriv = symbol_to_deriv(token);
            if let Some(t) = idx.get_any([token.as_str(), deriv.as_str()]) {
                self.core.send_json(&json!({
                    "event": "subscribe",
                    "channel": "status",
                    "key": format!("deriv:{}", t.exchange_symbol),
                }));
            }
        }
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let mut chan_ids = Vec::new();
        {
            let channels = self.channels.lock();
            for token in &tokens {
                let deriv = symbol_to_deriv(token);
                let Some(t) = idx.get_any([token.as_str(), deriv.as_str()]) else {
                    continue;
                };
                for (chan_id, info) in channels.iter() {
                    if info.native == t.exchange_symbol {
                        chan_ids.push(*chan_id);
                    }
                }
            }
        }
        for chan_id in chan_ids {
            self.core
                .send_json(&json!({"event": "unsubscribe", "chanId": chan_id}));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversions() {
        assert_eq!(bfx_to_symbol("tBTCUSD").as_deref(), Some("BTC/USD"));
        assert_eq!(bfx_to_symbol("tETHUST").as_deref(), Some("ETH/USDT"));
        assert_eq!(bfx_to_symbol("tXYZ"), None);
        assert_eq!(symbol_to_bfx("BTC/USDT"), "tBTCUST");
        assert_eq!(symbol_to_bfx("BTC/USD"), "tBTCUSD");
    }

    #[test]
    fn test_deriv_conversions() {
        assert_eq!(deriv_to_symbol("tBTCF0:USTF0").as_deref(), Some("BTC/USDT"));
        assert_eq!(symbol_to_deriv("BTC/USDT"), "tBTCF0:USTF0");
        assert_eq!(deriv_to_symbol("tBTCUSD"), None);
        for symbol in ["BTC/USDT", "ETH/USDT"] {
            assert_eq!(deriv_to_symbol(&symbol_to_deriv(symbol)).as_deref(), Some(symbol));
        }
    }

    #[test]
    fn test_check_error_row() {
        assert!(check_error_row(&serde_json::json!([["tBTCUSD", 1, 2]])).is_ok());
        let err = check_error_row(&serde_json::json!(["error", 10020, "symbol: invalid"]));
        assert!(err.unwrap_err().to_string().contains("symbol: invalid"));
    }

    #[test]
    fn test_parse_rest_book_splits_sides_by_amount_sign() {
        let data = serde_json::json!([
            [50000.0, 2, 1.5],
            [49999.0, 1, 2.0],
            [50001.0, 3, -1.0]
        ]);
        let depth = parse_rest_book(&data, "BTC/USD", "tBTCUSD", 100).unwrap();
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.asks[0].quantity, 1.0);
    }

    #[test]
    fn test_bfx_book_snapshot_and_removal() {
        let mut book = BfxBook::default();
        book.apply(&serde_json::json!([
            [50000.0, 2, 1.5],
            [50001.0, 1, -2.0]
        ]));
        assert!(book.to_depth("BTC/USD", "tBTCUSD").is_some());
        // count=0, amount=1 removes the bid level.
        book.apply(&serde_json::json!([50000.0, 0, 1]));
        let depth = book.to_depth("BTC/USD", "tBTCUSD").unwrap();
        assert!(depth.bids.is_empty());
        assert_eq!(depth.asks.len(), 1);
    }

    #[test]
    fn test_price_from_status_prefers_mark() {
        let mut row: Vec<Value> = vec![Value::Null; 16];
        row[STATUS_DERIV_PRICE] = serde_json::json!(50000.0);
        row[STATUS_MARK_PRICE] = serde_json::json!(50010.0);
        assert_eq!(BitfinexPerpetualConnector::price_from_status(&row), Some(50010.0));
        row[STATUS_MARK_PRICE] = Value::Null;
        assert_eq!(BitfinexPerpetualConnector::price_from_status(&row), Some(50000.0));
    }

    #[test]
    fn test_parse_deriv_status_list() {
        let data = serde_json::json!([
            ["tBTCF0:USTF0", 1700000000000i64, null, 50000.0],
            ["tETHUSD", 1700000000000i64, null, 3000.0]
        ]);
        let perps = parse_deriv_status_list(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(perps[0].exchange_symbol, "tBTCF0:USTF0");
    }

    #[test]
    fn test_parse_candles_order() {
        // [MTS, OPEN, CLOSE, HIGH, LOW, VOLUME]
        let data = serde_json::json!([[1700000000000i64, 100.0, 105.0, 110.0, 90.0, 2.0]]);
        let candles = parse_candles(&data, "UST", 60);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].high, 110.0);
        assert_eq!(candles[0].low, 90.0);
        assert_eq!(candles[0].usd_volume, Some(210.0));
    }
}
