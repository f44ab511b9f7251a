//! KuCoin connectors (spot and futures perpetual).
//!
//! The WebSocket endpoint is obtained from a `bullet-public` POST that
//! returns a token plus server list; subscribe frames are sent only after
//! the server's `welcome` frame. Futures symbols use `XBT` for BTC
//! (`XBTUSDTM`), translated at the mapping layer.

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
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

const SPOT_API: &str = "https://api.kucoin.com";
const FUTURES_API: &str = "https://api-futures.kucoin.com";

const FUNDING_HISTORY_LOOKBACK_DAYS: i64 = 31;
/// Subscribing "all" spot symbols is capped to keep the frame volume sane.
const SPOT_SUBSCRIBE_ALL_CAP: usize = 200;

static WS_CONNECT_SEQ: AtomicU64 = AtomicU64::new(0);

fn kucoin_to_symbol(native: &str) -> String {
    // BTC-USDT -> BTC/USDT
    native.replacen('-', "/", 1)
}

fn symbol_to_kucoin(symbol: &str) -> String {
    symbol.replace('/', "-")
}

/// XBTUSDTM -> BTC/USDT, ETHUSDTM -> ETH/USDT.
fn futures_to_symbol(native: &str) -> String {
    let upper = native.to_uppercase();
    for quote in ["USDT", "USDC"] {
        let suffixed = format!("{}M", quote);
        if let Some(base) = upper.strip_suffix(&suffixed) {
            let base = if base == "XBT" { "BTC" } else { base };
            return pair_code(base, quote);
        }
    }
    upper
}

/// BTC/USDT -> XBTUSDTM.
fn symbol_to_futures(symbol: &str) -> String {
    let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USDT"));
    let base = if base.eq_ignore_ascii_case("BTC") { "XBT" } else { base };
    format!("{}{}M", base, quote)
}

/// Envelope `{code, data}`; "200000" is success.
fn unwrap_kucoin(data: Value) -> Result<Value> {
    if data["code"].as_str() != Some("200000") {
        bail!(
            "kucoin API error: {}",
            data["msg"].as_str().unwrap_or("unknown")
        );
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
    keys.push(t.exchange_symbol.clone());
    keys.push(t.exchange_symbol.to_uppercase());
}

fn parse_spot_symbols(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        if !item["enableTrading"].as_bool().unwrap_or(true) {
            continue;
        }
        let native = item["symbol"].as_str().unwrap_or("");
        let base = item["baseCurrency"].as_str().unwrap_or("");
        let quote = item["quoteCurrency"].as_str().unwrap_or("");
        if native.is_empty() || base.is_empty() || quote.is_empty() {
            continue;
        }
        out.push(Ticker {
            symbol: kucoin_to_symbol(native),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: item["isMarginEnabled"].as_bool().unwrap_or(false),
            exchange_symbol: Some(native.to_string()),
        });
    }
    out
}

fn parse_contracts(data: &Value) -> Vec<PerpetualTicker> {
    let mut out = Vec::new();
    for item in data.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let native = item["symbol"].as_str().unwrap_or("");
        if native.is_empty() || !native.ends_with('M') {
            continue;
        }
        let symbol = futures_to_symbol(native);
        let (mut base, quote) = match symbol.split_once('/') {
            Some((b, q)) => (b.to_string(), q.to_string()),
            None => continue,
        };
        if let Some(base_ccy) = item["baseCurrency"].as_str() {
            if !base_ccy.is_empty() && base_ccy != "XBT" {
                base = base_ccy.to_string();
            }
        }
        out.push(PerpetualTicker {
            symbol: pair_code(&base, &quote),
            base,
            quote: quote.clone(),
            exchange_symbol: native.to_string(),
            settlement: quote,
        });
    }
    out
}

/// Spot candle rows: `[time(sec), open, close, high, low, volume, turnover]`.
fn parse_spot_candles(data: &Value, quote: &str, limit: usize) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
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
            utc_open_time: ts,
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

/// Futures candle rows: `[time(ms), open, high, low, close, volume]`.
fn parse_futures_candles(data: &Value, quote: &str, limit: usize) -> Vec<CandleStick> {
    let usd = is_usd_proxy(quote);
    let mut out = Vec::new();
    for row in data.as_array().map(Vec::as_slice).unwrap_or(&[]).iter().take(limit) {
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

fn ws_frame_id(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        (utc_now_secs() * 1000.0) as u64,
        WS_CONNECT_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn subscribe_frame(topic: &str) -> Value {
    json!({
        "id": ws_frame_id("sub"),
        "type": "subscribe",
        "topic": topic,
        "response": true,
    })
}

fn unsubscribe_frame(topic: &str) -> Value {
    json!({
        "id": ws_frame_id("unsub"),
        "type": "unsubscribe",
        "topic": topic,
    })
}

/// Fetches the WS endpoint via `bullet-public` and composes the URL.
async fn ws_endpoint(http: &reqwest::Client, api_base: &str, connect_prefix: &str) -> Result<String> {
    let url = format!("{}/api/v1/bullet-public", api_base);
    let resp = http
        .post(&url)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("POST {} failed", url))?;
    let resp = resp.error_for_status().with_context(|| format!("POST {}", url))?;
    let data = unwrap_kucoin(resp.json::<Value>().await.context("decode bullet-public")?)?;
    let token = data["token"].as_str().unwrap_or("");
    let endpoint = data["instanceServers"]
        .as_array()
        .and_then(|servers| servers.first())
        .and_then(|server| server["endpoint"].as_str())
        .unwrap_or("");
    if token.is_empty() || endpoint.is_empty() {
        bail!("kucoin bullet-public: missing token or instanceServers");
    }
    Ok(format!(
        "{}?token={}&connectId={}-{}",
        endpoint.trim_end_matches('/'),
        token,
        connect_prefix,
        (utc_now_secs() * 1000.0) as u64
    ))
}

/// Streaming state shared by the two kinds: subscribe frames are queued
/// until the server's `welcome` arrives.
struct KucoinStream {
    core: StreamCore,
    pending_frames: Mutex<Vec<Value>>,
}

impl KucoinStream {
    fn new() -> Self {
        Self {
            core: StreamCore::new(),
            pending_frames: Mutex::new(Vec::new()),
        }
    }

    fn queue_frames(&self, frames: Vec<Value>) {
        self.pending_frames.lock().extend(frames);
    }

    fn flush_pending(&self) {
        let frames: Vec<Value> = self.pending_frames.lock().drain(..).collect();
        for frame in frames {
            self.core.send_json(&frame);
        }
    }

    fn stop(&self) {
        self.core.stop();
        self.pending_frames.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct KucoinSpotConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    stream: KucoinStream,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl KucoinSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "KucoinSpot");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            stream: KucoinStream::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_data(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", SPOT_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Kucoin,
            MarketKind::Spot,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        unwrap_kucoin(resp.json::<Value>().await.with_context(|| format!("decode {}", url))?)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_data("/api/v2/symbols", &[]).await?;
                Ok(SymbolIndex::build(parse_spot_symbols(&data), ticker_aliases))
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

    fn topics_for(&self, native: &str, depth: bool) -> Vec<String> {
        let mut topics = vec![format!("/market/ticker:{}", native)];
        if depth {
            topics.push(format!("/market/level2Depth20:{}", native));
        }
        topics
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "kucoin spot: undecodable frame");
                return;
            }
        };
        match msg["type"].as_str() {
            Some("welcome") => {
                self.stream.flush_pending();
                return;
            }
            Some("ack") | Some("pong") => return,
            _ => {}
        }
        let Some(cb) = self.stream.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let topic = msg["topic"].as_str().unwrap_or("");
        let data = &msg["data"];
        if !data.is_object() {
            return;
        }
        let native = topic.rsplit(':').next().unwrap_or("");
        let Some(ticker) = idx.get(native) else { return };
        let symbol = ticker.symbol.clone();
        let utc = json_f64(&data["time"]).map(|ms| ms / 1000.0);

        if topic.contains("/market/ticker") {
            if self.throttler.may_pass(&symbol, "book").await {
                cb.handle(
                    Some(BookTicker {
                        symbol,
                        bid_price: json_f64(&data["bestBid"]).unwrap_or(0.0),
                        bid_qty: json_f64(&data["bestBidSize"]).unwrap_or(0.0),
                        ask_price: json_f64(&data["bestAsk"]).unwrap_or(0.0),
                        ask_qty: json_f64(&data["bestAskSize"]).unwrap_or(0.0),
                        last_update_id: json_u64(&data["sequence"]),
                        utc,
                    }),
                    None,
                    None,
                );
            }
        } else if topic.contains("level2Depth20") {
            if self.throttler.may_pass(&symbol, "depth").await {
                let bids = levels_from_pairs(&data["bids"]);
                let asks = levels_from_pairs(&data["asks"]);
                if bids.is_empty() && asks.is_empty() {
                    return;
                }
                cb.handle(
                    None,
                    Some(BookDepth {
                        symbol,
                        bids,
                        asks,
                        exchange_symbol: Some(native.to_string()),
                        last_update_id: json_u64(&data["sequence"]),
                        utc,
                    }),
                    None,
                );
            }
        }
    }
}

#[async_trait]
impl SpotConnector for KucoinSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Kucoin
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
            .get_data(
                "/api/v1/market/orderbook/level1",
                &[("symbol".to_string(), native)],
            )
            .await?;
        let price = json_f64(&data["bestAsk"]).or_else(|| json_f64(&data["bestBid"]));
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
        let data = self.get_data("/api/v1/market/allTickers", &[]).await?;
        let rows = data["ticker"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| symbol_to_kucoin(s)).collect());
        let mut out = Vec::new();
        for row in rows {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
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
            .get_data(
                "/api/v1/market/orderbook/level2_20",
                &[("symbol".to_string(), native.clone())],
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
            last_update_id: json_u64(&data["sequence"]),
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
                "/api/v1/market/candles",
                &[
                    (
                        "symbol".to_string(),
                        ticker.exchange_symbol.clone().unwrap_or_default(),
                    ),
                    ("type".to_string(), "1min".to_string()),
                ],
            )
            .await?;
        let candles = parse_spot_candles(&data, &ticker.quote, n);
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
                .take(SPOT_SUBSCRIBE_ALL_CAP)
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
        let url = match ws_endpoint(&self.opts.http, SPOT_API, "cex-spot").await {
            Ok(url) => url,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(&url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        // Subscribes go out once the welcome frame arrives.
        let mut frames = Vec::new();
        for native in &natives {
            for topic in self.topics_for(native, depth) {
                frames.push(subscribe_frame(&topic));
            }
        }
        self.stream.queue_frames(frames);
        self.stream.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.stream.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                me.route_frame(&frame).await;
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
impl SubscriptionSink for KucoinSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.stream.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        for token in &tokens {
            let dashed = token.replace('/', "-");
            if let Some(native) = idx
                .get_any([token.as_str(), dashed.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                for topic in self.topics_for(&native, depth) {
                    self.stream.core.send_json(&subscribe_frame(&topic));
                }
            }
        }
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.stream.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        for token in &tokens {
            let dashed = token.replace('/', "-");
            if let Some(native) = idx
                .get_any([token.as_str(), dashed.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                for topic in self.topics_for(&native, depth) {
                    self.stream.core.send_json(&unsubscribe_frame(&topic));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Futures perpetual
// ---------------------------------------------------------------------------

pub struct KucoinPerpetualConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    stream: KucoinStream,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl KucoinPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler =
            Throttler::new(opts.throttle_timeout, opts.store.clone(), "KucoinPerpetual");
        let conn = Arc::new(Self {
            throttler,
            symbols: OnceCell::new(),
            stream: KucoinStream::new(),
            batch: SubscriptionBatcher::new(DEFAULT_SUBSCRIPTION_BATCH_SECS),
            weak: OnceLock::new(),
            opts,
        });
        conn.weak.set(Arc::downgrade(&conn)).ok();
        conn.batch.bind(Arc::downgrade(&conn) as Weak<dyn SubscriptionSink>);
        conn
    }

    async fn get_data(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", FUTURES_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Kucoin,
            MarketKind::Perpetual,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        unwrap_kucoin(resp.json::<Value>().await.with_context(|| format!("decode {}", url))?)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_data("/api/v1/contracts/active", &[]).await?;
                Ok(SymbolIndex::build(parse_contracts(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let futures = symbol_to_futures(symbol);
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, futures.as_str(), no_slash.as_str()])
            .cloned())
    }

    fn topics_for(&self, native: &str, depth: bool) -> Vec<String> {
        let mut topics = vec![format!("/contractMarket/tickerV2:{}", native)];
        if depth {
            topics.push(format!("/contractMarket/level2Depth50:{}", native));
        }
        topics
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "kucoin futures: undecodable frame");
                return;
            }
        };
        match msg["type"].as_str() {
            Some("welcome") => {
                self.stream.flush_pending();
                return;
            }
            Some("ack") | Some("pong") => return,
            _ => {}
        }
        let Some(cb) = self.stream.core.callback() else { return };
        let Some(idx) = self.symbols.get() else { return };
        let topic = msg["topic"].as_str().unwrap_or("");
        let data = &msg["data"];
        if !data.is_object() {
            return;
        }
        let native = topic.rsplit(':').next().unwrap_or("");
        let Some(ticker) = idx.get(native) else { return };
        let symbol = ticker.symbol.clone();
        // Futures timestamps arrive in nanoseconds.
        let utc = json_f64(&data["ts"])
            .or_else(|| json_f64(&data["time"]))
            .map(|ns| ns / 1e9);

        if topic.contains("tickerV2") {
            if self.throttler.may_pass(&symbol, "book").await {
                cb.handle(
                    Some(BookTicker {
                        symbol,
                        bid_price: json_f64(&data["bestBidPrice"]).unwrap_or(0.0),
                        bid_qty: json_f64(&data["bestBidSize"]).unwrap_or(0.0),
                        ask_price: json_f64(&data["bestAskPrice"]).unwrap_or(0.0),
                        ask_qty: json_f64(&data["bestAskSize"]).unwrap_or(0.0),
                        last_update_id: json_u64(&data["sequence"]),
                        utc,
                    }),
                    None,
                    None,
                );
            }
        } else if topic.contains("level2Depth50") {
            if self.throttler.may_pass(&symbol, "depth").await {
                let bids = levels_from_pairs(&data["bids"]);
                let asks = levels_from_pairs(&data["asks"]);
                if bids.is_empty() && asks.is_empty() {
                    return;
                }
                cb.handle(
                    None,
                    Some(BookDepth {
                        symbol,
                        bids,
                        asks,
                        exchange_symbol: Some(native.to_string()),
                        last_update_id: json_u64(&data["sequence"]),
                        utc,
                    }),
                    None,
                );
            }
        }
    }
}

#[async_trait]
impl PerpetualConnector for KucoinPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Kucoin
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
                "/api/v1/ticker",
                &[("symbol".to_string(), ticker.exchange_symbol.clone())],
            )
            .await?;
        let price = json_f64(&data["price"]).or_else(|| json_f64(&data["lastPrice"]));
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
        let data = self.get_data("/api/v1/allTickers", &[]).await?;
        let rows = match data.as_array() {
            Some(rows) => rows.as_slice(),
            None => data["ticker"].as_array().map(Vec::as_slice).unwrap_or(&[]),
        };
        let wanted: Option<Vec<String>> = symbols.map(|list| {
            list.iter()
                .map(|s| if s.contains('/') { symbol_to_futures(s) } else { s.clone() })
                .collect()
        });
        let mut out = Vec::new();
        for row in rows {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let price = json_f64(&row["price"]).or_else(|| json_f64(&row["lastPrice"]));
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
                "/api/v1/level2/depth20",
                &[("symbol".to_string(), ticker.exchange_symbol.clone())],
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
            last_update_id: json_u64(&data["sequence"]),
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
        let end_ms = (utc_now_secs() * 1000.0) as i64;
        let start_ms = end_ms - (n as i64) * 60 * 1000;
        let data = self
            .get_data(
                "/api/v1/kline/query",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol.clone()),
                    ("granularity".to_string(), "1".to_string()),
                    ("startAt".to_string(), start_ms.to_string()),
                    ("endAt".to_string(), end_ms.to_string()),
                ],
            )
            .await?;
        let candles = parse_futures_candles(&data, &ticker.quote, n);
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_data(
                &format!("/api/v1/funding-rate/{}/current", ticker.exchange_symbol),
                &[],
            )
            .await?;
        let rate = json_f64(&data["value"]).or_else(|| json_f64(&data["fundingRate"]));
        let Some(rate) = rate else {
            return Ok(None);
        };
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc: json_f64(&data["fundingTime"])
                .map(|ms| ms / 1000.0)
                .unwrap_or(0.0),
            next_rate: json_f64(&data["nextFundingRate"]),
            index_price: json_f64(&data["indexPrice"]),
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
        // The endpoint is range-based; 31 days back covers both 1 h and 8 h
        // funding intervals at the default history size.
        let now_ms = (utc_now_secs() * 1000.0) as i64;
        let from_ms = now_ms - FUNDING_HISTORY_LOOKBACK_DAYS * 24 * 3600 * 1000;
        let data = self
            .get_data(
                "/api/v1/contract/funding-rates",
                &[
                    ("symbol".to_string(), ticker.exchange_symbol),
                    ("from".to_string(), from_ms.to_string()),
                    ("to".to_string(), (now_ms + 60_000).to_string()),
                ],
            )
            .await?;
        let Some(rows) = data.as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows.iter().take(n) {
            let ts = json_f64(&row["timepoint"])
                .or_else(|| json_f64(&row["settleTime"]))
                .or_else(|| json_f64(&row["ts"]));
            let (Some(ts), Some(rate)) = (ts, json_f64(&row["fundingRate"])) else {
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
        let url = match ws_endpoint(&self.opts.http, FUTURES_API, "cex-futures").await {
            Ok(url) => url,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let worker = match ws::connect(&url, FrameCodec::Utf8, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.stream.core.rollback_begin();
                return Err(e);
            }
        };
        let mut frames = Vec::new();
        for native in &natives {
            for topic in self.topics_for(native, depth) {
                frames.push(subscribe_frame(&topic));
            }
        }
        self.stream.queue_frames(frames);
        self.stream.core.attach_worker(worker);

        let me = self.weak.get().and_then(Weak::upgrade).context("connector dropped")?;
        self.stream.core.attach_task(tokio::spawn(async move {
            while let Some(frame) = queue.pop().await {
                me.route_frame(&frame).await;
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
impl SubscriptionSink for KucoinPerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.stream.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        for token in &tokens {
            let futures = symbol_to_futures(token);
            if let Some(t) = idx.get_any([token.as_str(), futures.as_str()]) {
                for topic in self.topics_for(&t.exchange_symbol, depth) {
                    self.stream.core.send_json(&subscribe_frame(&topic));
                }
            }
        }
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.stream.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.stream.core.depth_enabled();
        for token in &tokens {
            let futures = symbol_to_futures(token);
            if let Some(t) = idx.get_any([token.as_str(), futures.as_str()]) {
                for topic in self.topics_for(&t.exchange_symbol, depth) {
                    self.stream.core.send_json(&unsubscribe_frame(&topic));
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
        assert_eq!(kucoin_to_symbol("BTC-USDT"), "BTC/USDT");
        assert_eq!(symbol_to_kucoin("BTC/USDT"), "BTC-USDT");
        assert_eq!(futures_to_symbol("XBTUSDTM"), "BTC/USDT");
        assert_eq!(futures_to_symbol("ETHUSDTM"), "ETH/USDT");
        assert_eq!(symbol_to_futures("BTC/USDT"), "XBTUSDTM");
        assert_eq!(symbol_to_futures("ETH/USDT"), "ETHUSDTM");
    }

    #[test]
    fn test_futures_round_trip_via_xbt() {
        for symbol in ["BTC/USDT", "ETH/USDT", "SOL/USDT"] {
            assert_eq!(futures_to_symbol(&symbol_to_futures(symbol)), symbol);
        }
    }

    #[test]
    fn test_unwrap_kucoin() {
        let ok = serde_json::json!({"code": "200000", "data": {"token": "t"}});
        assert!(unwrap_kucoin(ok).is_ok());
        let err = serde_json::json!({"code": "400100", "msg": "param illegal"});
        assert!(unwrap_kucoin(err).unwrap_err().to_string().contains("param illegal"));
    }

    #[test]
    fn test_parse_contracts_translates_xbt() {
        let data = serde_json::json!([
            {"symbol": "XBTUSDTM", "baseCurrency": "XBT", "quoteCurrency": "USDT"},
            {"symbol": "ETHUSDTM", "baseCurrency": "ETH", "quoteCurrency": "USDT"},
            {"symbol": "XBTUSDM", "baseCurrency": "XBT", "quoteCurrency": "USD"}
        ]);
        let perps = parse_contracts(&data);
        // XBTUSDM is inverse (USD-settled), not matched by the USDT/USDC rule.
        assert_eq!(perps.len(), 2);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(perps[0].base, "BTC");
        assert_eq!(perps[0].exchange_symbol, "XBTUSDTM");
    }

    #[test]
    fn test_parse_spot_candles_column_order() {
        // KuCoin spot: [time, open, close, high, low, volume, turnover]
        let data = serde_json::json!([
            ["1700000000", "100", "105", "110", "90", "2.0", "210"]
        ]);
        let candles = parse_spot_candles(&data, "USDT", 60);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].high, 110.0);
        assert_eq!(candles[0].low, 90.0);
        assert_eq!(candles[0].utc_open_time, 1_700_000_000.0);
        assert_eq!(candles[0].usd_volume, Some(210.0));
    }

    #[test]
    fn test_parse_futures_candles_ms_times() {
        let data = serde_json::json!([
            [1700000000000i64, 100.0, 110.0, 90.0, 105.0, 2.0]
        ]);
        let candles = parse_futures_candles(&data, "USDT", 60);
        assert_eq!(candles[0].utc_open_time, 1_700_000_000.0);
        assert_eq!(candles[0].high, 110.0);
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame("/market/ticker:BTC-USDT");
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["topic"], "/market/ticker:BTC-USDT");
        assert_eq!(frame["response"], true);
        assert!(frame["id"].as_str().unwrap().starts_with("sub-"));
    }
}
