//! Bybit connectors (spot and linear perpetual) over the v5 API.
//!
//! Streaming uses the public v5 endpoints with `orderbook.1` for top-of-book
//! and `orderbook.50` for depth. Both topics deliver a snapshot followed by
//! deltas; a per-topic live book folds them so every emitted event is a full
//! snapshot.

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

const API: &str = "https://api.bybit.com";
const API_TESTNET: &str = "https://api-testnet.bybit.com";
const WS_SPOT: &str = "wss://stream.bybit.com/v5/public/spot";
const WS_SPOT_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/public/spot";
const WS_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";
const WS_LINEAR_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

const BOOK_TOPIC_DEPTH: usize = 1;
const DEPTH_TOPIC_LEVELS: usize = 50;
const INSTRUMENTS_PAGE_LIMIT: usize = 200;
const FUNDING_HISTORY_API_MAX: usize = 200;

/// v5 responses wrap everything in `{retCode, retMsg, result}`.
fn unwrap_v5(data: Value) -> Result<Value> {
    if data["retCode"].as_i64() != Some(0) {
        bail!(
            "bybit API error: {}",
            data["retMsg"].as_str().unwrap_or("unknown")
        );
    }
    Ok(data["result"].clone())
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

fn parse_instruments_spot(result: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in result["list"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let base = item["baseCoin"].as_str().unwrap_or("");
        let quote = item["quoteCoin"].as_str().unwrap_or("");
        let native = item["symbol"].as_str().unwrap_or("");
        if base.is_empty() || quote.is_empty() || native.is_empty() {
            continue;
        }
        out.push(Ticker {
            symbol: pair_code(base, quote),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: item["marginTrading"].as_str().map_or(false, |m| m != "none"),
            exchange_symbol: Some(native.to_string()),
        });
    }
    out
}

fn parse_instruments_linear(result: &Value) -> (Vec<PerpetualTicker>, Option<String>) {
    let mut out = Vec::new();
    for item in result["list"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let base = item["baseCoin"].as_str().unwrap_or("");
        let quote = item["quoteCoin"].as_str().unwrap_or("");
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
    let cursor = result["nextPageCursor"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    (out, cursor)
}

/// Kline rows come newest first: `[startMs, o, h, l, c, volume, turnover]`.
fn parse_klines(result: &Value, quote: &str) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let mut out = Vec::new();
    for row in result["list"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let cells = match row.as_array() {
            Some(cells) if cells.len() >= 7 => cells,
            _ => continue,
        };
        let (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v), Some(turnover)) = (
            json_f64(&cells[0]),
            json_f64(&cells[1]),
            json_f64(&cells[2]),
            json_f64(&cells[3]),
            json_f64(&cells[4]),
            json_f64(&cells[5]),
            json_f64(&cells[6]),
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
            usd_volume: if usd { Some(turnover) } else { None },
        });
    }
    out
}

/// Folds orderbook snapshot/delta frames into a full book. Prices are
/// strictly positive so the IEEE bit pattern preserves numeric order.
#[derive(Default)]
struct LiveBook {
    bids: BTreeMap<u64, f64>,
    asks: BTreeMap<u64, f64>,
    last_update_id: Option<u64>,
}

impl LiveBook {
    fn apply(&mut self, data: &Value, snapshot: bool) {
        if snapshot {
            self.bids.clear();
            self.asks.clear();
        }
        Self::apply_side(&mut self.bids, &data["b"]);
        Self::apply_side(&mut self.asks, &data["a"]);
        self.last_update_id = json_u64(&data["u"]).or(self.last_update_id);
    }

    fn apply_side(side: &mut BTreeMap<u64, f64>, rows: &Value) {
        for row in rows.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let cells = match row.as_array() {
                Some(cells) if cells.len() >= 2 => cells,
                _ => continue,
            };
            let (Some(price), Some(qty)) = (json_f64(&cells[0]), json_f64(&cells[1])) else {
                continue;
            };
            if qty == 0.0 {
                side.remove(&price.to_bits());
            } else {
                side.insert(price.to_bits(), qty);
            }
        }
    }

    fn to_depth(&self, symbol: &str, native: &str, utc: Option<f64>) -> Option<BookDepth> {
        if self.bids.is_empty() && self.asks.is_empty() {
            return None;
        }
        let bids = self
            .bids
            .iter()
            .rev()
            .map(|(&bits, &quantity)| BidAsk {
                price: f64::from_bits(bits),
                quantity,
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .map(|(&bits, &quantity)| BidAsk {
                price: f64::from_bits(bits),
                quantity,
            })
            .collect();
        Some(BookDepth {
            symbol: symbol.to_string(),
            bids,
            asks,
            exchange_symbol: Some(native.to_string()),
            last_update_id: self.last_update_id,
            utc,
        })
    }

    fn to_book_ticker(&self, symbol: &str, utc: Option<f64>) -> Option<BookTicker> {
        let (&bid_bits, &bid_qty) = self.bids.iter().next_back()?;
        let (&ask_bits, &ask_qty) = self.asks.iter().next()?;
        Some(BookTicker {
            symbol: symbol.to_string(),
            bid_price: f64::from_bits(bid_bits),
            bid_qty,
            ask_price: f64::from_bits(ask_bits),
            ask_qty,
            last_update_id: self.last_update_id,
            utc,
        })
    }
}

fn topic_args(native: &str, depth: bool) -> Vec<String> {
    let mut args = vec![format!("orderbook.{}.{}", BOOK_TOPIC_DEPTH, native)];
    if depth {
        args.push(format!("orderbook.{}.{}", DEPTH_TOPIC_LEVELS, native));
    }
    args
}

/// `orderbook.{level}.{symbol}` → (level, symbol).
fn split_topic(topic: &str) -> Option<(usize, &str)> {
    let mut parts = topic.splitn(3, '.');
    if parts.next() != Some("orderbook") {
        return None;
    }
    let level = parts.next()?.parse().ok()?;
    Some((level, parts.next()?))
}

// Shared streaming machinery between the two kinds; the only differences are
// the instrument index lookups, done via closures over the callers' state.
struct BybitStream {
    core: StreamCore,
    books: Mutex<HashMap<String, LiveBook>>,
}

impl BybitStream {
    fn new() -> Self {
        Self {
            core: StreamCore::new(),
            books: Mutex::new(HashMap::new()),
        }
    }

    /// Routes a v5 frame; `lookup` maps a native symbol to the canonical one.
    async fn route(
        &self,
        raw: &str,
        throttler: &Throttler,
        lookup: impl Fn(&str) -> Option<String>,
    ) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "bybit: undecodable frame");
                return;
            }
        };
        let topic = msg["topic"].as_str().unwrap_or("");
        let Some((level, native)) = split_topic(topic) else { return };
        let Some(symbol) = lookup(native) else { return };
        let Some(cb) = self.core.callback() else { return };
        let data = &msg["data"];
        if data.is_null() {
            return;
        }
        let snapshot = msg["type"].as_str() == Some("snapshot");
        let utc = json_f64(&msg["ts"]).map(|ms| ms / 1000.0);

        let event = {
            let mut books = self.books.lock();
            let book = books.entry(topic.to_string()).or_default();
            book.apply(data, snapshot);
            if level == BOOK_TOPIC_DEPTH {
                book.to_book_ticker(&symbol, utc).map(Event::Book)
            } else {
                book.to_depth(&symbol, native, utc).map(Event::Depth)
            }
        };
        match event {
            Some(Event::Book(book)) => {
                if throttler.may_pass(&symbol, "book").await {
                    cb.handle(Some(book), None, None);
                }
            }
            Some(Event::Depth(depth)) => {
                if throttler.may_pass(&symbol, "depth").await {
                    cb.handle(None, Some(depth), None);
                }
            }
            None => {}
        }
    }

    fn stop(&self) {
        self.core.stop();
        self.books.lock().clear();
    }
}

enum Event {
    Book(BookTicker),
    Depth(BookDepth),
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct BybitSpotConnector {
    opts: ConnectorOptions,
    base: &'static str,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    stream: BybitStream,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl BybitSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "BybitSpot");
        let conn = Arc::new(Self {
            base: if opts.testing { API_TESTNET } else { API },
            ws_url: if opts.testing { WS_SPOT_TESTNET } else { WS_SPOT },
            throttler,
            symbols: OnceCell::new(),
            stream: BybitStream::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_v5(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Bybit,
            MarketKind::Spot,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp.json::<Value>().await.with_context(|| format!("decode {}", url))?;
        unwrap_v5(data)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let result = self
                    .get_v5(
                        "/v5/market/instruments-info",
                        &[
                            ("category".to_string(), "spot".to_string()),
                            ("status".to_string(), "Trading".to_string()),
                        ],
                    )
                    .await?;
                Ok(SymbolIndex::build(parse_instruments_spot(&result), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        Ok(idx.get_any([symbol, no_slash.as_str()]).cloned())
    }

    fn apply_frames(&self, tokens: &[String], op: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        let mut args = Vec::new();
        for token in tokens {
            let no_slash = token.replace('/', "");
            if let Some(native) = idx
                .get_any([token.as_str(), no_slash.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                args.extend(topic_args(&native, depth));
            }
        }
        if !args.is_empty() {
            self.stream.core.send_json(&json!({"op": op, "args": args}));
        }
    }
}

#[async_trait]
impl SpotConnector for BybitSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, pair_code: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(pair_code).await? else {
            return Ok(None);
        };
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let result = self
            .get_v5(
                "/v5/market/tickers",
                &[
                    ("category".to_string(), "spot".to_string()),
                    ("symbol".to_string(), native),
                ],
            )
            .await?;
        let Some(row) = result["list"].as_array().and_then(|l| l.first()) else {
            return Ok(None);
        };
        let Some(price) = json_f64(&row["lastPrice"]) else {
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
        let result = self
            .get_v5(
                "/v5/market/tickers",
                &[("category".to_string(), "spot".to_string())],
            )
            .await?;
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.replace('/', "")).collect());
        let mut out = Vec::new();
        for row in result["list"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(price) = json_f64(&row["lastPrice"]) else { continue };
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
        let native = ticker.exchange_symbol.clone().unwrap_or_default();
        let result = self
            .get_v5(
                "/v5/market/orderbook",
                &[
                    ("category".to_string(), "spot".to_string()),
                    ("symbol".to_string(), native.clone()),
                    ("limit".to_string(), limit.to_string()),
                ],
            )
            .await?;
        let mut book = LiveBook::default();
        book.apply(&result, true);
        Ok(book.to_depth(
            &ticker.symbol,
            &native,
            json_f64(&result["ts"]).map(|ms| ms / 1000.0).or(Some(utc_now_secs())),
        ))
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
        let result = self
            .get_v5(
                "/v5/market/kline",
                &[
                    ("category".to_string(), "spot".to_string()),
                    ("symbol".to_string(), ticker.exchange_symbol.clone().unwrap_or_default()),
                    ("interval".to_string(), "1".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&result, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn start(
        &self,
        cb: Arc<dyn StreamCallback>,
        symbols: Option<&[String]>,
        depth: bool,
    ) -> Result<()> {
        self.stream
            .core
            .try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let idx = match self.symbols().await {
            Ok(idx) => idx,
            Err(e) => {
                self.stream.core.rollback_begin();
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
            self.stream.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(self.ws_url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let mut args = Vec::new();
        for native in &natives {
            args.extend(topic_args(native, depth));
        }
        worker.sender.send_json(&json!({"op": "subscribe", "args": args}));
        self.stream.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.stream.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                let lookup = |native: &str| {
                    me.symbols.get().and_then(|idx| idx.get(native)).map(|t| t.symbol.clone())
                };
                me.stream.route(&frame, &me.throttler, lookup).await;
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.batch.cancel();
        self.stream.stop();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for BybitSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.stream.core.add_desired(&tokens);
        self.apply_frames(&tokens, "subscribe");
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.stream.core.remove_desired(&tokens);
        self.apply_frames(&tokens, "unsubscribe");
    }
}

// ---------------------------------------------------------------------------
// Linear perpetual
// ---------------------------------------------------------------------------

pub struct BybitPerpetualConnector {
    opts: ConnectorOptions,
    base: &'static str,
    ws_url: &'static str,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    stream: BybitStream,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl BybitPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "BybitPerpetual");
        let conn = Arc::new(Self {
            base: if opts.testing { API_TESTNET } else { API },
            ws_url: if opts.testing { WS_LINEAR_TESTNET } else { WS_LINEAR },
            throttler,
            symbols: OnceCell::new(),
            stream: BybitStream::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_v5(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Bybit,
            MarketKind::Perpetual,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp.json::<Value>().await.with_context(|| format!("decode {}", url))?;
        unwrap_v5(data)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let mut all = Vec::new();
                let mut cursor: Option<String> = None;
                loop {
                    let mut params = vec![
                        ("category".to_string(), "linear".to_string()),
                        ("status".to_string(), "Trading".to_string()),
                        ("limit".to_string(), INSTRUMENTS_PAGE_LIMIT.to_string()),
                    ];
                    if let Some(cursor) = &cursor {
                        params.push(("cursor".to_string(), cursor.clone()));
                    }
                    let result = self.get_v5("/v5/market/instruments-info", &params).await?;
                    let (page, next) = parse_instruments_linear(&result);
                    let empty = page.is_empty();
                    all.extend(page);
                    cursor = next;
                    if cursor.is_none() || empty {
                        break;
                    }
                }
                Ok(SymbolIndex::build(all, perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        Ok(idx.get_any([symbol, no_slash.as_str()]).cloned())
    }

    fn apply_frames(&self, tokens: &[String], op: &str) {
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        let mut args = Vec::new();
        for token in tokens {
            let no_slash = token.replace('/', "");
            if let Some(t) = idx.get_any([token.as_str(), no_slash.as_str()]) {
                args.extend(topic_args(&t.exchange_symbol, depth));
            }
        }
        if !args.is_empty() {
            self.stream.core.send_json(&json!({"op": op, "args": args}));
        }
    }

    async fn ticker_row(&self, native: &str) -> Result<Option<Value>> {
        let result = self
            .get_v5(
                "/v5/market/tickers",
                &[
                    ("category".to_string(), "linear".to_string()),
                    ("symbol".to_string(), native.to_string()),
                ],
            )
            .await?;
        Ok(result["list"].as_array().and_then(|l| l.first()).cloned())
    }
}

#[async_trait]
impl PerpetualConnector for BybitPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let Some(row) = self.ticker_row(&ticker.exchange_symbol).await? else {
            return Ok(None);
        };
        let Some(price) = json_f64(&row["lastPrice"]) else {
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
        let result = self
            .get_v5(
                "/v5/market/tickers",
                &[("category".to_string(), "linear".to_string())],
            )
            .await?;
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.replace('/', "")).collect());
        let mut out = Vec::new();
        for row in result["list"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let Some(price) = json_f64(&row["lastPrice"]) else { continue };
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
        let result = self
            .get_v5(
                "/v5/market/orderbook",
                &[
                    ("category".to_string(), "linear".to_string()),
                    ("symbol".to_string(), ticker.exchange_symbol.clone()),
                    ("limit".to_string(), limit.to_string()),
                ],
            )
            .await?;
        let mut book = LiveBook::default();
        book.apply(&result, true);
        Ok(book.to_depth(
            &ticker.symbol,
            &ticker.exchange_symbol,
            json_f64(&result["ts"]).map(|ms| ms / 1000.0).or(Some(utc_now_secs())),
        ))
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
        let result = self
            .get_v5(
                "/v5/market/kline",
                &[
                    ("category".to_string(), "linear".to_string()),
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("interval".to_string(), "1".to_string()),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&result, &ticker.quote);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let Some(row) = self.ticker_row(&ticker.exchange_symbol).await? else {
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
            next_rate: None,
            index_price: json_f64(&row["indexPrice"]),
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_funding_rate_history(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<Option<Vec<FundingRatePoint>>> {
        let n = limit
            .unwrap_or(DEFAULT_FUNDING_HISTORY_LIMIT)
            .min(FUNDING_HISTORY_API_MAX);
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let result = self
            .get_v5(
                "/v5/market/funding/history",
                &[
                    ("category".to_string(), "linear".to_string()),
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("limit".to_string(), n.to_string()),
                ],
            )
            .await?;
        let Some(rows) = result["list"].as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let (Some(ts), Some(rate)) = (
                json_f64(&row["fundingRateTimestamp"]),
                json_f64(&row["fundingRate"]),
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
        self.stream
            .core
            .try_begin(cb, depth, symbols.map(|s| s.to_vec()))?;
        let idx = match self.symbols().await {
            Ok(idx) => idx,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let natives: Vec<String> = match symbols {
            None => idx.items().iter().map(|t| t.exchange_symbol.clone()).collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .map(|t| t.exchange_symbol.clone())
                .collect(),
        };
        if natives.is_empty() {
            self.stream.core.rollback_begin();
            bail!("no symbols to subscribe");
        }
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(self.ws_url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let mut args = Vec::new();
        for native in &natives {
            args.extend(topic_args(native, depth));
        }
        worker.sender.send_json(&json!({"op": "subscribe", "args": args}));
        self.stream.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.stream.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                let lookup = |native: &str| {
                    me.symbols.get().and_then(|idx| idx.get(native)).map(|t| t.symbol.clone())
                };
                me.stream.route(&frame, &me.throttler, lookup).await;
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.batch.cancel();
        self.stream.stop();
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for BybitPerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.stream.core.add_desired(&tokens);
        self.apply_frames(&tokens, "subscribe");
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.stream.core.remove_desired(&tokens);
        self.apply_frames(&tokens, "unsubscribe");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_v5() {
        let ok = serde_json::json!({"retCode": 0, "retMsg": "OK", "result": {"list": []}});
        assert!(unwrap_v5(ok).is_ok());
        let err = serde_json::json!({"retCode": 10001, "retMsg": "params error"});
        assert!(unwrap_v5(err).unwrap_err().to_string().contains("params error"));
    }

    #[test]
    fn test_topic_split() {
        assert_eq!(split_topic("orderbook.50.BTCUSDT"), Some((50, "BTCUSDT")));
        assert_eq!(split_topic("orderbook.1.ETHUSDT"), Some((1, "ETHUSDT")));
        assert_eq!(split_topic("tickers.BTCUSDT"), None);
    }

    #[test]
    fn test_live_book_snapshot_then_delta() {
        let mut book = LiveBook::default();
        book.apply(
            &serde_json::json!({
                "b": [["50000", "1.0"], ["49999", "2.0"]],
                "a": [["50001", "1.5"]],
                "u": 1
            }),
            true,
        );
        // Delta: wipe one bid level, add an ask.
        book.apply(
            &serde_json::json!({
                "b": [["49999", "0"]],
                "a": [["50002", "3.0"]],
                "u": 2
            }),
            false,
        );
        let depth = book.to_depth("BTC/USDT", "BTCUSDT", Some(1.0)).unwrap();
        assert_eq!(depth.bids.len(), 1);
        assert_eq!(depth.asks.len(), 2);
        assert_eq!(depth.last_update_id, Some(2));
        // Bids descending, asks ascending.
        assert_eq!(depth.asks[0].price, 50001.0);
        assert_eq!(depth.asks[1].price, 50002.0);
        let book_ticker = book.to_book_ticker("BTC/USDT", Some(1.0)).unwrap();
        assert_eq!(book_ticker.bid_price, 50000.0);
        assert_eq!(book_ticker.ask_price, 50001.0);
        assert!(book_ticker.bid_price <= book_ticker.ask_price);
    }

    #[test]
    fn test_live_book_snapshot_replaces_state() {
        let mut book = LiveBook::default();
        book.apply(&serde_json::json!({"b": [["1", "1"]], "a": [], "u": 1}), true);
        book.apply(&serde_json::json!({"b": [["2", "2"]], "a": [], "u": 2}), true);
        let depth = book.to_depth("X/Y", "XY", None).unwrap();
        assert_eq!(depth.bids.len(), 1);
        assert_eq!(depth.bids[0].price, 2.0);
    }

    #[test]
    fn test_parse_instruments_linear_cursor() {
        let result = serde_json::json!({
            "list": [{"symbol": "BTCUSDT", "baseCoin": "BTC", "quoteCoin": "USDT"}],
            "nextPageCursor": "abc"
        });
        let (perps, cursor) = parse_instruments_linear(&result);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(cursor.as_deref(), Some("abc"));
        let (_, done) = parse_instruments_linear(&serde_json::json!({"list": [], "nextPageCursor": ""}));
        assert!(done.is_none());
    }

    #[test]
    fn test_parse_klines_turnover_as_usd_volume() {
        let result = serde_json::json!({"list": [
            ["1700000000000", "100", "110", "90", "105", "2.0", "210.0"]
        ]});
        let candles = parse_klines(&result, "USDT");
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].usd_volume, Some(210.0));
        assert_eq!(candles[0].coin_volume, 2.0);
        let no_usd = parse_klines(&result, "BTC");
        assert_eq!(no_usd[0].usd_volume, None);
    }
}
