//! Crawler service: one run walks the token universe for a (exchange, kind)
//! pair, discovers on-exchange coverage, and fetches per-token artifacts
//! under cooldown windows.
//!
//! A window key is set only after the connector returned a usable payload,
//! with a TTL equal to the window; while it lives, the artifact is skipped.
//! A failed call leaves the key unset so the next tick retries. That bounds
//! the per-symbol request rate for each artifact by `1 / window` regardless
//! of how often ticks run.

use crate::cex::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::cex::{
    utc_now_secs, ExchangeId, MarketKind, PerpetualConnector, SpotConnector, DEFAULT_DEPTH_LIMIT,
};
use crate::db::{CrawlerIterationRecord, CrawlerJobRecord, IterationStatus};
use crate::models::CurrencyPair;
use crate::services::{ServiceConfigRegistry, UnitOfWork};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_NAME: &str = "CexCrawler";
/// Value stored under a closed window key.
const WINDOW_KEY_VALUE: &str = "1";

pub const ARTIFACT_BOOK_DEPTH: &str = "book_depth";
pub const ARTIFACT_KLINES: &str = "klines";
pub const ARTIFACT_FUNDING_RATE: &str = "funding_rate";
pub const ARTIFACT_FUNDING_HISTORY: &str = "funding_history";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub align_to_minutes: i64,
    /// TTL for orchestrator cache writes; doubles as the DB-write interval.
    pub cache_timeout: f64,
    pub funding_rate_window_min: u64,
    pub funding_history_window_min: u64,
    pub liquidity_book_window_min: u64,
    /// Sanity bounds for future liquidity derivation over the book window.
    pub liquidity_book_depth_factor: u64,
    pub liquidity_book_amount_factor: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            align_to_minutes: 1,
            cache_timeout: 15.0,
            funding_rate_window_min: 15,
            funding_history_window_min: 60,
            liquidity_book_window_min: 30,
            liquidity_book_depth_factor: 5,
            liquidity_book_amount_factor: 1000,
        }
    }
}

/// The two connector capabilities a crawl can run over.
pub enum CrawlerConnector {
    Spot(Arc<dyn SpotConnector>),
    Perpetual(Arc<dyn PerpetualConnector>),
}

impl CrawlerConnector {
    pub fn kind(&self) -> MarketKind {
        match self {
            CrawlerConnector::Spot(_) => MarketKind::Spot,
            CrawlerConnector::Perpetual(_) => MarketKind::Perpetual,
        }
    }
}

pub struct CexCrawler {
    uow: UnitOfWork,
    exchange_id: ExchangeId,
    connector: CrawlerConnector,
    config_override: Option<CrawlerConfig>,
    key_prefix: String,
}

impl CexCrawler {
    pub fn new(uow: UnitOfWork, exchange_id: ExchangeId, connector: CrawlerConnector) -> Self {
        let key_prefix = format!(
            "arbitrage:crawler:{}:{}",
            exchange_id,
            connector.kind()
        );
        Self {
            uow,
            exchange_id,
            connector,
            config_override: None,
            key_prefix,
        }
    }

    pub fn with_config(mut self, config: CrawlerConfig) -> Self {
        self.config_override = Some(config);
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn kind(&self) -> MarketKind {
        self.connector.kind()
    }

    /// Explicit config wins; otherwise the registry row (defaults persisted
    /// on first use).
    pub async fn resolve_config(&self) -> Result<CrawlerConfig> {
        if let Some(config) = &self.config_override {
            return Ok(config.clone());
        }
        ServiceConfigRegistry::get_or_default(&self.uow.db, SERVICE_NAME).await
    }

    pub fn window_key(&self, artifact: &str, symbol: &str) -> String {
        format!("{}:window:{}:{}", self.key_prefix, artifact, symbol)
    }

    /// A fetch is allowed while no window key is set. Store errors leave the
    /// artifact fetchable; the per-call budgets still bound the damage.
    async fn fetch_allowed(&self, artifact: &str, symbol: &str) -> bool {
        match self.uow.store.get(&self.window_key(artifact, symbol)).await {
            Ok(existing) => existing.is_none(),
            Err(e) => {
                warn!(artifact, symbol, error = %e, "window check failed");
                true
            }
        }
    }

    async fn close_window(&self, artifact: &str, symbol: &str, window_min: u64) {
        let key = self.window_key(artifact, symbol);
        if let Err(e) = self
            .uow
            .store
            .set_ex(&key, WINDOW_KEY_VALUE, window_min * 60)
            .await
        {
            warn!(key, error = %e, "window close failed");
        }
    }

    /// Upserts the single job row for this (exchange, kind).
    pub async fn prepare_job(&self) -> Result<CrawlerJobRecord> {
        self.uow
            .db
            .upsert_job(
                self.exchange_id.as_str(),
                self.kind().as_str(),
                utc_now_secs(),
            )
            .await
    }

    /// One iteration row per token: `pending` with a published price when
    /// the token maps onto the exchange, `ignore` otherwise.
    pub async fn prepare_iterations(
        &self,
        job: &CrawlerJobRecord,
        config: &CrawlerConfig,
    ) -> Result<Vec<CrawlerIterationRecord>> {
        let tokens = self.uow.db.list_tokens().await?;
        let mut seen = HashSet::new();
        let symbols_ordered: Vec<String> = tokens
            .into_iter()
            .map(|t| t.symbol)
            .filter(|symbol| seen.insert(symbol.clone()))
            .collect();
        let token_set: HashSet<&str> = symbols_ordered.iter().map(String::as_str).collect();

        // One instrument snapshot plus one batch price call for the scope.
        let (pair_by_base, bases_on_exchange) = match &self.connector {
            CrawlerConnector::Spot(conn) => {
                let all = conn.get_all_tickers().await?;
                let scope: Vec<String> = all
                    .iter()
                    .filter(|t| token_set.contains(t.base.as_str()))
                    .filter_map(|t| t.exchange_symbol.clone())
                    .collect();
                let pairs = conn.get_pairs(Some(&scope)).await?;
                let bases: HashSet<String> = all.into_iter().map(|t| t.base).collect();
                (index_pairs_by_base(pairs), bases)
            }
            CrawlerConnector::Perpetual(conn) => {
                let all = conn.get_all_perpetuals().await?;
                let scope: Vec<String> = all
                    .iter()
                    .filter(|t| token_set.contains(t.base.as_str()))
                    .map(|t| t.exchange_symbol.clone())
                    .collect();
                let pairs = conn.get_pairs(Some(&scope)).await?;
                let bases: HashSet<String> = all.into_iter().map(|t| t.base).collect();
                (index_pairs_by_base(pairs), bases)
            }
        };

        let now = utc_now_secs();
        let mut iterations = Vec::with_capacity(symbols_ordered.len());
        for token in &symbols_ordered {
            let mut it = match self.uow.db.find_iteration(job.id, token).await? {
                Some(it) => it,
                None => self.uow.db.insert_iteration(job.id, token, now).await?,
            };
            it.last_update = now;
            if let Some(pair) = pair_by_base.get(token.as_str()) {
                let code = pair.code();
                it.symbol = Some(code.clone());
                it.currency_pair = Some(serde_json::to_string(pair)?);
                it.status = IterationStatus::Pending;
                it.comment = None;
                let orchestrator = Orchestrator::new(
                    self.uow.db.clone(),
                    self.uow.store.clone(),
                    self.exchange_id,
                    self.kind(),
                    &code,
                    OrchestratorConfig {
                        cache_timeout: config.cache_timeout,
                        align_to_minutes: config.align_to_minutes,
                        db_write_interval: config.cache_timeout,
                    },
                );
                if let Err(e) = orchestrator.publish_price(pair).await {
                    warn!(symbol = %code, error = %e, "price publish failed");
                }
            } else {
                it.status = IterationStatus::Ignore;
                it.comment = Some(if bases_on_exchange.contains(token.as_str()) {
                    "missing in tokens list".to_string()
                } else {
                    "not on exchange".to_string()
                });
            }
            self.uow.db.update_iteration(&it).await?;
            iterations.push(it);
        }
        Ok(iterations)
    }

    /// One artifact pass over a pending iteration. Each artifact is guarded
    /// by its own window; any fetched artifact marks the iteration done, an
    /// error flips it to `error` with the captured text.
    pub async fn run_iteration(
        &self,
        it: &mut CrawlerIterationRecord,
        config: &CrawlerConfig,
    ) -> Result<()> {
        let Some(symbol) = it.symbol.clone() else {
            return Ok(());
        };
        let now = utc_now_secs();
        it.last_update = now;

        match self.fetch_artifacts(it, &symbol, config).await {
            Ok(fetched_any) => {
                if fetched_any {
                    it.done = true;
                    it.status = IterationStatus::Success;
                    it.stop = Some(utc_now_secs());
                    it.error = None;
                }
            }
            Err(e) => {
                it.status = IterationStatus::Error;
                it.error = Some(format!("{:#}", e));
                it.stop = Some(utc_now_secs());
                warn!(token = %it.token, error = %e, "iteration failed");
            }
        }
        self.uow.db.update_iteration(it).await?;
        Ok(())
    }

    async fn fetch_artifacts(
        &self,
        it: &mut CrawlerIterationRecord,
        symbol: &str,
        config: &CrawlerConfig,
    ) -> Result<bool> {
        let mut fetched_any = false;

        if self.fetch_allowed(ARTIFACT_BOOK_DEPTH, symbol).await {
            let depth = match &self.connector {
                CrawlerConnector::Spot(conn) => conn.get_depth(symbol, DEFAULT_DEPTH_LIMIT).await?,
                CrawlerConnector::Perpetual(conn) => {
                    conn.get_depth(symbol, DEFAULT_DEPTH_LIMIT).await?
                }
            };
            if let Some(depth) = depth {
                it.book_depth = Some(serde_json::to_string(&depth)?);
                self.close_window(ARTIFACT_BOOK_DEPTH, symbol, config.liquidity_book_window_min)
                    .await;
                fetched_any = true;
            }
        }

        if self.fetch_allowed(ARTIFACT_KLINES, symbol).await {
            let klines = match &self.connector {
                CrawlerConnector::Spot(conn) => conn.get_klines(symbol, None).await?,
                CrawlerConnector::Perpetual(conn) => conn.get_klines(symbol, None).await?,
            };
            if let Some(klines) = klines {
                if !klines.is_empty() {
                    it.klines = Some(serde_json::to_string(&klines)?);
                    self.close_window(ARTIFACT_KLINES, symbol, config.liquidity_book_window_min)
                        .await;
                    fetched_any = true;
                }
            }
        }

        if let CrawlerConnector::Perpetual(conn) = &self.connector {
            if self.fetch_allowed(ARTIFACT_FUNDING_RATE, symbol).await {
                if let Some(funding) = conn.get_funding_rate(symbol).await? {
                    it.funding_rate = Some(serde_json::to_string(&funding)?);
                    if let Some(next_rate) = funding.next_rate {
                        it.next_funding_rate = Some(
                            json!({
                                "rate": next_rate,
                                "funding_time_utc": funding.next_funding_utc,
                            })
                            .to_string(),
                        );
                    }
                    self.close_window(ARTIFACT_FUNDING_RATE, symbol, config.funding_rate_window_min)
                        .await;
                    fetched_any = true;
                }
            }
            if self.fetch_allowed(ARTIFACT_FUNDING_HISTORY, symbol).await {
                if let Some(history) = conn.get_funding_rate_history(symbol, None).await? {
                    if !history.is_empty() {
                        it.funding_rate_history = Some(serde_json::to_string(&history)?);
                        self.close_window(
                            ARTIFACT_FUNDING_HISTORY,
                            symbol,
                            config.funding_history_window_min,
                        )
                        .await;
                        fetched_any = true;
                    }
                }
            }
        }

        Ok(fetched_any)
    }

    /// Ticks every pending iteration of the job once.
    pub async fn run_pending(
        &self,
        job: &CrawlerJobRecord,
        config: &CrawlerConfig,
    ) -> Result<(usize, usize)> {
        let pending = self
            .uow
            .db
            .list_iterations(job.id, Some(IterationStatus::Pending))
            .await?;
        let mut success = 0usize;
        let mut errors = 0usize;
        for mut it in pending {
            self.run_iteration(&mut it, config).await?;
            match it.status {
                IterationStatus::Error => errors += 1,
                IterationStatus::Success => success += 1,
                _ => {}
            }
        }
        Ok((success, errors))
    }

    /// Full pass: job upsert, iteration upserts with a batch price fill,
    /// then one artifact tick over the pending set.
    pub async fn run(&self) -> Result<CrawlerJobRecord> {
        let config = self.resolve_config().await?;
        let job = self.prepare_job().await?;
        info!(
            exchange = %self.exchange_id,
            kind = %self.kind(),
            job_id = job.id,
            "crawler run started"
        );

        let outcome = async {
            let iterations = self.prepare_iterations(&job, &config).await?;
            let ignored = iterations
                .iter()
                .filter(|it| it.status == IterationStatus::Ignore)
                .count();
            let (success, errors) = self.run_pending(&job, &config).await?;
            Ok::<(usize, usize, usize), anyhow::Error>((success, errors, ignored))
        }
        .await;

        let stop = utc_now_secs();
        match outcome {
            Ok((success, errors, ignored)) => {
                self.uow.db.finish_job(job.id, stop, None).await?;
                info!(
                    job_id = job.id,
                    success, errors, ignored, "crawler run finished"
                );
            }
            Err(e) => {
                self.uow
                    .db
                    .finish_job(job.id, stop, Some(&format!("{:#}", e)))
                    .await?;
                return Err(e).context("crawler run failed");
            }
        }
        self.uow
            .db
            .get_job(self.exchange_id.as_str(), self.kind().as_str())
            .await?
            .context("job row vanished")
    }
}

fn index_pairs_by_base(pairs: Vec<CurrencyPair>) -> HashMap<String, CurrencyPair> {
    let mut out = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        out.entry(pair.base.clone()).or_insert(pair);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_windows() {
        let config = CrawlerConfig::default();
        assert_eq!(config.funding_rate_window_min, 15);
        assert_eq!(config.funding_history_window_min, 60);
        assert_eq!(config.liquidity_book_window_min, 30);
        assert_eq!(config.liquidity_book_depth_factor, 5);
        assert_eq!(config.liquidity_book_amount_factor, 1000);
        assert_eq!(config.align_to_minutes, 1);
    }

    #[test]
    fn test_config_deserializes_with_partial_fields() {
        let config: CrawlerConfig =
            serde_json::from_str(r#"{"funding_rate_window_min": 5}"#).unwrap();
        assert_eq!(config.funding_rate_window_min, 5);
        assert_eq!(config.liquidity_book_window_min, 30);
    }

    #[test]
    fn test_index_pairs_by_base_keeps_first() {
        let pairs = vec![
            CurrencyPair {
                base: "BTC".into(),
                quote: "USDT".into(),
                ratio: 1.0,
                utc: None,
            },
            CurrencyPair {
                base: "BTC".into(),
                quote: "USDC".into(),
                ratio: 2.0,
                utc: None,
            },
        ];
        let index = index_pairs_by_base(pairs);
        assert_eq!(index.len(), 1);
        assert_eq!(index["BTC"].quote, "USDT");
    }
}
