//! HTX (Huobi) connectors: spot and linear perpetual.
//!
//! Every WS frame is gzip-compressed JSON; keepalive is an application-level
//! `{"ping": n}` answered with `{"pong": n}`. The linear-swap batch ticker
//! endpoint is unreliable, so perpetual `get_pairs` falls back to
//! per-contract merged-detail calls capped at a fixed contract count.

use crate::cex::rest_limit::{self, WeightTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::cex::subscriptions::{SubscriptionBatcher, SubscriptionSink};
use crate::cex::symbol_map::SymbolIndex;
use crate::cex::throttler::Throttler;
use crate::cex::ws::{self, EventQueue, FrameCodec, StreamCore, EVENT_QUEUE_CAPACITY};
use crate::cex::{
    json_f64, json_u64, levels_from_pairs, utc_now_secs, ConnectorOptions, ExchangeId, MarketKind,
    PerpetualConnector, SpotConnector, StreamCallback, DEFAULT_FUNDING_HISTORY_LIMIT,
    DEFAULT_KLINE_LIMIT, DEFAULT_SUBSCRIPTION_BATCH_SECS,
};
use crate::models::{
    pair_code, BookDepth, BookTicker, CandleStick, CurrencyPair, FundingRate, FundingRatePoint,
    PerpetualTicker, Ticker,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

const SPOT_API: &str = "https://api.huobi.pro";
const SPOT_WS: &str = "wss://api.huobi.pro/ws/";
const LINEAR_API: &str = "https://api.hbdm.com";
const LINEAR_WS: &str = "wss://api.hbdm.com/linear-swap-ws";

const SPOT_DEPTH_API_MAX: usize = 20;
const GET_PAIRS_MAX_CONTRACTS: usize = 30;

/// Spot quote suffixes recognized in `btcusdt`-style symbols.
const SPOT_QUOTES: &[&str] = &["USDT", "BTC", "ETH", "USDC", "TUSD", "HT"];

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

fn contract_to_symbol(contract_code: &str) -> String {
    // BTC-USDT -> BTC/USDT
    contract_code.replace('-', "/")
}

/// `{status: "ok"}` envelope used by both REST surfaces.
fn check_status(data: &Value) -> Result<()> {
    let status = data["status"].as_str();
    if status.is_some() && status != Some("ok") {
        bail!(
            "htx API error: {}",
            data["err-msg"]
                .as_str()
                .or_else(|| data["err_msg"].as_str())
                .unwrap_or("unknown")
        );
    }
    Ok(())
}

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

fn parse_spot_tickers(data: &Value) -> Vec<Ticker> {
    let mut out = Vec::new();
    for row in data["data"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let native = row["symbol"].as_str().unwrap_or("");
        let Some(symbol) = spot_native_to_symbol(native) else { continue };
        let (base, quote) = symbol.split_once('/').unwrap_or(("", ""));
        out.push(Ticker {
            symbol: symbol.clone(),
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
    for row in data["data"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let contract = row["contract_code"].as_str().unwrap_or("");
        let Some((base, quote)) = contract.split_once('-') else { continue };
        out.push(PerpetualTicker {
            symbol: contract_to_symbol(contract),
            base: base.to_string(),
            quote: quote.to_string(),
            exchange_symbol: contract.to_string(),
            settlement: quote.to_string(),
        });
    }
    out
}

/// Kline rows carry the open second in `id`.
fn parse_klines(data: &Value, symbol: &str, coin_volume_key: &str) -> Vec<CandleStick> {
    let usd = symbol.ends_with("/USDT");
    let mut out = Vec::new();
    for row in data["data"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let (Some(ts), Some(o), Some(h), Some(l), Some(c)) = (
            json_f64(&row["id"]),
            json_f64(&row["open"]),
            json_f64(&row["high"]),
            json_f64(&row["low"]),
            json_f64(&row["close"]),
        ) else {
            continue;
        };
        let coin_volume = json_f64(&row[coin_volume_key]).unwrap_or(0.0);
        out.push(CandleStick {
            utc_open_time: ts,
            open: o,
            high: h,
            low: l,
            close: c,
            coin_volume,
            usd_volume: if usd { json_f64(&row["vol"]) } else { None },
        });
    }
    out
}

fn depth_from_tick(tick: &Value, symbol: &str, native: &str) -> Option<BookDepth> {
    let bids = levels_from_pairs(&tick["bids"]);
    let asks = levels_from_pairs(&tick["asks"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(BookDepth {
        symbol: symbol.to_string(),
        bids,
        asks,
        exchange_symbol: Some(native.to_string()),
        last_update_id: json_u64(&tick["id"]).or_else(|| json_u64(&tick["ts"])),
        utc: json_f64(&tick["ts"]).map(|ms| ms / 1000.0),
    })
}

// ---------------------------------------------------------------------------
// Spot
// ---------------------------------------------------------------------------

pub struct HtxSpotConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<Ticker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl HtxSpotConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "HtxSpot");
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
            ExchangeId::Htx,
            MarketKind::Spot,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp.json::<Value>().await.with_context(|| format!("decode {}", url))?;
        check_status(&data)?;
        Ok(data)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<Ticker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self.get_json("/market/tickers", &[]).await?;
                Ok(SymbolIndex::build(parse_spot_tickers(&data), ticker_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<Ticker>> {
        let idx = self.symbols().await?;
        let no_slash = symbol.replace('/', "");
        Ok(idx
            .get_any([symbol, no_slash.as_str(), no_slash.to_lowercase().as_str()])
            .cloned())
    }

    fn sub_frames(&self, native: &str, depth: bool) -> Vec<Value> {
        let lower = native.to_lowercase();
        let mut frames = vec![json!({"sub": format!("market.{}.bbo", lower), "id": format!("bbo_{}", lower)})];
        if depth {
            frames.push(json!({
                "sub": format!("market.{}.depth.step0", lower),
                "id": format!("depth_{}", lower)
            }));
        }
        frames
    }

    fn unsub_frames(&self, native: &str, depth: bool) -> Vec<Value> {
        let lower = native.to_lowercase();
        let mut frames =
            vec![json!({"unsub": format!("market.{}.bbo", lower), "id": format!("bbo_{}", lower)})];
        if depth {
            frames.push(json!({
                "unsub": format!("market.{}.depth.step0", lower),
                "id": format!("depth_{}", lower)
            }));
        }
        frames
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "htx spot: undecodable frame");
                return;
            }
        };
        if let Some(ping) = msg.get("ping") {
            self.core.send_json(&json!({"pong": ping}));
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let ch = msg["ch"].as_str().unwrap_or("");
        if ch.ends_with(".bbo") {
            let tick = &msg["tick"];
            let native = tick["symbol"].as_str().unwrap_or("");
            let Some(symbol) = spot_native_to_symbol(native) else { return };
            if self.throttler.may_pass(&symbol, "book").await {
                cb.handle(
                    Some(BookTicker {
                        symbol,
                        bid_price: json_f64(&tick["bid"]).unwrap_or(0.0),
                        bid_qty: json_f64(&tick["bidSize"]).unwrap_or(0.0),
                        ask_price: json_f64(&tick["ask"]).unwrap_or(0.0),
                        ask_qty: json_f64(&tick["askSize"]).unwrap_or(0.0),
                        last_update_id: json_u64(&tick["seqId"]),
                        utc: json_f64(&tick["quoteTime"]).map(|ms| ms / 1000.0),
                    }),
                    None,
                    None,
                );
            }
        } else if ch.contains(".depth.") {
            let native = ch.split('.').nth(1).unwrap_or("");
            let Some(symbol) = spot_native_to_symbol(native) else { return };
            if self.throttler.may_pass(&symbol, "depth").await {
                if let Some(depth) = depth_from_tick(&msg["tick"], &symbol, native) {
                    cb.handle(None, Some(depth), None);
                }
            }
        }
    }
}

#[async_trait]
impl SpotConnector for HtxSpotConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Htx
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
            .get_json("/market/trade", &[("symbol".to_string(), native)])
            .await?;
        let price = data["tick"]["data"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| json_f64(&row["price"]));
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
        let data = self.get_json("/market/tickers", &[]).await?;
        let ts = json_f64(&data["ts"]).map(|ms| ms / 1000.0).unwrap_or_else(utc_now_secs);
        let wanted: Option<Vec<String>> =
            symbols.map(|list| list.iter().map(|s| s.replace('/', "").to_lowercase()).collect());
        let mut out = Vec::new();
        for row in data["data"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let native = row["symbol"].as_str().unwrap_or("");
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == native) {
                    continue;
                }
            }
            let Some(ticker) = idx.get(native) else { continue };
            let (Some(bid), Some(ask)) = (json_f64(&row["bid"]), json_f64(&row["ask"])) else {
                continue;
            };
            out.push(CurrencyPair {
                base: ticker.base.clone(),
                quote: ticker.quote.clone(),
                ratio: (bid + ask) / 2.0,
                utc: Some(ts),
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
                "/market/depth",
                &[
                    ("symbol".to_string(), native.clone()),
                    ("type".to_string(), "step0".to_string()),
                    ("depth".to_string(), limit.min(SPOT_DEPTH_API_MAX).to_string()),
                ],
            )
            .await?;
        Ok(depth_from_tick(&data["tick"], &ticker.symbol, &native))
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
                "/market/history/kline",
                &[
                    (
                        "symbol".to_string(),
                        ticker.exchange_symbol.clone().unwrap_or_default(),
                    ),
                    ("period".to_string(), "1min".to_string()),
                    ("size".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&data, &ticker.symbol, "amount");
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
        let worker = match ws::connect(SPOT_WS, FrameCodec::Gzip, queue.clone()).await {
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
impl SubscriptionSink for HtxSpotConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        let depth = self.core.depth_enabled();
        for token in &tokens {
            let no_slash = token.replace('/', "");
            if let Some(native) = idx
                .get_any([token.as_str(), no_slash.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                for frame in self.sub_frames(&native, depth) {
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
            let no_slash = token.replace('/', "");
            if let Some(native) = idx
                .get_any([token.as_str(), no_slash.as_str()])
                .and_then(|t| t.exchange_symbol.clone())
            {
                for frame in self.unsub_frames(&native, depth) {
                    self.core.send_json(&frame);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Linear perpetual
// ---------------------------------------------------------------------------

pub struct HtxPerpetualConnector {
    opts: ConnectorOptions,
    throttler: Throttler,
    symbols: OnceCell<SymbolIndex<PerpetualTicker>>,
    core: StreamCore,
    batch: Arc<SubscriptionBatcher>,
    weak: OnceLock<Weak<Self>>,
}

impl HtxPerpetualConnector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let throttler = Throttler::new(opts.throttle_timeout, opts.store.clone(), "HtxPerpetual");
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
        let url = format!("{}{}", LINEAR_API, path);
        let resp = rest_limit::request_with_retry(
            WeightTracker::global(),
            &self.opts.http,
            ExchangeId::Htx,
            MarketKind::Perpetual,
            &url,
            params,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let data = resp.json::<Value>().await.with_context(|| format!("decode {}", url))?;
        check_status(&data)?;
        Ok(data)
    }

    async fn symbols(&self) -> Result<&SymbolIndex<PerpetualTicker>> {
        self.symbols
            .get_or_try_init(|| async {
                let data = self
                    .get_json("/linear-swap-api/v1/swap_contract_info", &[])
                    .await?;
                Ok(SymbolIndex::build(parse_contracts(&data), perp_aliases))
            })
            .await
    }

    async fn native_symbol(&self, symbol: &str) -> Result<Option<PerpetualTicker>> {
        let idx = self.symbols().await?;
        let dashed = symbol.replace('/', "-");
        Ok(idx.get_any([symbol, dashed.as_str()]).cloned())
    }

    async fn merged_close(&self, contract: &str) -> Result<Option<f64>> {
        let data = self
            .get_json(
                "/linear-swap-ex/market/detail/merged",
                &[("contract_code".to_string(), contract.to_string())],
            )
            .await?;
        Ok(json_f64(&data["tick"]["close"]))
    }

    async fn route_frame(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "htx linear: undecodable frame");
                return;
            }
        };
        if let Some(ping) = msg.get("ping") {
            self.core.send_json(&json!({"pong": ping}));
            return;
        }
        let Some(cb) = self.core.callback() else { return };
        let ch = msg["ch"].as_str().unwrap_or("");
        if !ch.contains("depth") {
            return;
        }
        let contract = ch.split('.').nth(1).unwrap_or("");
        let symbol = contract_to_symbol(contract);
        if !self.throttler.may_pass(&symbol, "depth").await {
            return;
        }
        let Some(depth) = depth_from_tick(&msg["tick"], &symbol, contract) else {
            return;
        };
        // No separate bbo channel on this endpoint; derive top-of-book.
        let book = match (depth.best_bid(), depth.best_ask()) {
            (Some(bid), Some(ask)) => Some(BookTicker {
                symbol: symbol.clone(),
                bid_price: bid.price,
                bid_qty: bid.quantity,
                ask_price: ask.price,
                ask_qty: ask.quantity,
                last_update_id: depth.last_update_id,
                utc: depth.utc,
            }),
            _ => None,
        };
        cb.handle(book, Some(depth), None);
    }
}

#[async_trait]
impl PerpetualConnector for HtxPerpetualConnector {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Htx
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.symbols().await?.items().to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<CurrencyPair>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let Some(close) = self.merged_close(&ticker.exchange_symbol).await? else {
            return Ok(None);
        };
        Ok(Some(CurrencyPair {
            base: ticker.base,
            quote: ticker.quote,
            ratio: close,
            utc: Some(utc_now_secs()),
        }))
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let idx = self.symbols().await?;
        let contracts: Vec<PerpetualTicker> = match symbols {
            None => idx.items().iter().take(GET_PAIRS_MAX_CONTRACTS).cloned().collect(),
            Some(wanted) => idx
                .items()
                .iter()
                .filter(|t| wanted.contains(&t.symbol) || wanted.contains(&t.exchange_symbol))
                .cloned()
                .collect(),
        };
        let mut out = Vec::new();
        for ticker in contracts {
            match self.merged_close(&ticker.exchange_symbol).await {
                Ok(Some(close)) => out.push(CurrencyPair {
                    base: ticker.base,
                    quote: ticker.quote,
                    ratio: close,
                    utc: Some(utc_now_secs()),
                }),
                Ok(None) => {}
                Err(e) => {
                    debug!(contract = %ticker.exchange_symbol, error = %e, "htx merged detail failed");
                }
            }
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
                "/linear-swap-ex/market/depth",
                &[
                    ("contract_code".to_string(), ticker.exchange_symbol.clone()),
                    ("type".to_string(), "step5".to_string()),
                ],
            )
            .await?;
        Ok(depth_from_tick(&data["tick"], &ticker.symbol, &ticker.exchange_symbol))
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
                "/linear-swap-ex/market/history/kline",
                &[
                    ("contract_code".to_string(), ticker.exchange_symbol.clone()),
                    ("period".to_string(), "1min".to_string()),
                    ("size".to_string(), n.to_string()),
                ],
            )
            .await?;
        let candles = parse_klines(&data, &ticker.symbol, "vol");
        Ok(if candles.is_empty() { None } else { Some(candles) })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        let Some(ticker) = self.native_symbol(symbol).await? else {
            return Ok(None);
        };
        let data = self
            .get_json(
                "/linear-swap-api/v1/swap_funding_rate",
                &[("contract_code".to_string(), ticker.exchange_symbol.clone())],
            )
            .await?;
        let row = &data["data"];
        let Some(rate) = json_f64(&row["funding_rate"]) else {
            return Ok(None);
        };
        let next_utc = json_f64(&row["next_funding_time"])
            .or_else(|| json_f64(&row["funding_time"]))
            .map(|ms| ms / 1000.0)
            .unwrap_or(0.0);
        Ok(Some(FundingRate {
            symbol: ticker.symbol,
            rate,
            next_funding_utc: next_utc,
            next_rate: json_f64(&row["estimated_rate"]),
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
                "/linear-swap-api/v1/swap_historical_funding_rate",
                &[
                    ("contract_code".to_string(), ticker.exchange_symbol),
                    ("page_size".to_string(), n.to_string()),
                ],
            )
            .await?;
        let Some(rows) = data["data"]["data"].as_array() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for row in rows {
            let (Some(ts), Some(rate)) =
                (json_f64(&row["funding_time"]), json_f64(&row["funding_rate"]))
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
        let worker = match ws::connect(LINEAR_WS, FrameCodec::Gzip, queue.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                self.core.rollback_begin();
                return Err(e);
            }
        };
        for contract in &contracts {
            worker.sender.send_json(&json!({
                "sub": format!("market.{}.depth.step6", contract),
                "id": format!("depth_{}", contract)
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
    }

    fn subscribe(&self, tokens: &[String]) {
        self.batch.subscribe(tokens);
    }

    fn unsubscribe(&self, tokens: &[String]) {
        self.batch.unsubscribe(tokens);
    }
}

#[async_trait]
impl SubscriptionSink for HtxPerpetualConnector {
    async fn apply_subscribe(&self, tokens: Vec<String>) {
        self.core.add_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        for token in &tokens {
            let dashed = token.replace('/', "-");
            if let Some(t) = idx.get_any([token.as_str(), dashed.as_str()]) {
                self.core.send_json(&json!({
                    "sub": format!("market.{}.depth.step6", t.exchange_symbol),
                    "id": format!("depth_{}", t.exchange_symbol)
                }));
            }
        }
    }

    async fn apply_unsubscribe(&self, tokens: Vec<String>) {
        self.core.remove_desired(&tokens);
        let Some(idx) = self.symbols.get() else { return };
        for token in &tokens {
            let dashed = token.replace('/', "-");
            if let Some(t) = idx.get_any([token.as_str(), dashed.as_str()]) {
                self.core.send_json(&json!({
                    "unsub": format!("market.{}.depth.step6", t.exchange_symbol),
                    "id": format!("depth_{}", t.exchange_symbol)
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spot_native_to_symbol() {
        assert_eq!(spot_native_to_symbol("btcusdt").as_deref(), Some("BTC/USDT"));
        assert_eq!(spot_native_to_symbol("ethbtc").as_deref(), Some("ETH/BTC"));
        assert_eq!(spot_native_to_symbol("usdt"), None);
        assert_eq!(spot_native_to_symbol("abcxyz"), None);
    }

    #[test]
    fn test_contract_to_symbol() {
        assert_eq!(contract_to_symbol("BTC-USDT"), "BTC/USDT");
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(&serde_json::json!({"status": "ok"})).is_ok());
        // REST surfaces without a status field pass through.
        assert!(check_status(&serde_json::json!({"data": []})).is_ok());
        let err = check_status(&serde_json::json!({"status": "error", "err-msg": "bad symbol"}));
        assert!(err.unwrap_err().to_string().contains("bad symbol"));
    }

    #[test]
    fn test_depth_from_tick() {
        let tick = serde_json::json!({
            "bids": [[50000.0, 1.0], [49999.0, 2.0]],
            "asks": [[50001.0, 1.5]],
            "ts": 1700000000000i64,
            "id": 77
        });
        let depth = depth_from_tick(&tick, "BTC/USDT", "btcusdt").unwrap();
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.last_update_id, Some(77));
        assert_eq!(depth.utc, Some(1_700_000_000.0));
    }

    #[test]
    fn test_parse_klines_spot_vs_linear_volume_keys() {
        let data = serde_json::json!({"data": [
            {"id": 1700000000, "open": 100.0, "high": 110.0, "low": 90.0, "close": 105.0,
             "amount": 2.0, "vol": 210.0}
        ]});
        let spot = parse_klines(&data, "BTC/USDT", "amount");
        assert_eq!(spot[0].coin_volume, 2.0);
        assert_eq!(spot[0].usd_volume, Some(210.0));
        let linear = parse_klines(&data, "BTC/USDT", "vol");
        assert_eq!(linear[0].coin_volume, 210.0);
        let non_usd = parse_klines(&data, "ETH/BTC", "amount");
        assert_eq!(non_usd[0].usd_volume, None);
    }

    #[test]
    fn test_parse_contracts() {
        let data = serde_json::json!({"data": [
            {"contract_code": "BTC-USDT"},
            {"contract_code": "NOTAPAIR"}
        ]});
        let perps = parse_contracts(&data);
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].symbol, "BTC/USDT");
        assert_eq!(perps[0].settlement, "USDT");
    }
}
