//! Crawler end-to-end behavior over a fake connector: coverage mapping,
//! cooldown windows, and the set-key-only-on-success rule.

use anyhow::Result;
use arbfeed_backend::cache::{KvStore, MemoryStore, SharedStore};
use arbfeed_backend::cex::{ExchangeId, PerpetualConnector, StreamCallback};
use arbfeed_backend::db::{Db, IterationStatus, TokenSource};
use arbfeed_backend::models::{
    BidAsk, BookDepth, CandleStick, CurrencyPair, FundingRate, FundingRatePoint, PerpetualTicker,
};
use arbfeed_backend::services::crawler::{
    CexCrawler, CrawlerConfig, CrawlerConnector, ARTIFACT_BOOK_DEPTH, ARTIFACT_FUNDING_HISTORY,
    ARTIFACT_FUNDING_RATE, ARTIFACT_KLINES,
};
use arbfeed_backend::services::UnitOfWork;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TEST_PREFIX: &str = "test:crawler";

/// Fake perpetual connector over a fixed instrument set with call counters.
#[derive(Default)]
struct FakePerpetual {
    bases: Vec<&'static str>,
    with_depth: bool,
    with_klines: bool,
    with_funding: bool,
    depth_calls: AtomicUsize,
    kline_calls: AtomicUsize,
    funding_calls: AtomicUsize,
    history_calls: AtomicUsize,
}

impl FakePerpetual {
    fn covering(bases: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            bases,
            with_depth: true,
            with_klines: true,
            with_funding: true,
            ..Default::default()
        })
    }

    fn empty_handed(bases: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            bases,
            ..Default::default()
        })
    }

    fn ticker(base: &str) -> PerpetualTicker {
        PerpetualTicker {
            symbol: format!("{}/USDT", base),
            base: base.to_string(),
            quote: "USDT".to_string(),
            exchange_symbol: format!("{}USDT", base),
            settlement: "USDT".to_string(),
        }
    }
}

#[async_trait]
impl PerpetualConnector for FakePerpetual {
    fn exchange_id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn get_all_perpetuals(&self) -> Result<Vec<PerpetualTicker>> {
        Ok(self.bases.iter().map(|base| Self::ticker(base)).collect())
    }

    async fn get_price(&self, _symbol: &str) -> Result<Option<CurrencyPair>> {
        Ok(None)
    }

    async fn get_pairs(&self, symbols: Option<&[String]>) -> Result<Vec<CurrencyPair>> {
        let mut out = Vec::new();
        for base in &self.bases {
            let native = format!("{}USDT", base);
            if let Some(wanted) = symbols {
                if !wanted.iter().any(|w| w == &native) {
                    continue;
                }
            }
            out.push(CurrencyPair {
                base: base.to_string(),
                quote: "USDT".to_string(),
                ratio: 100.0,
                utc: Some(1_700_000_000.0),
            });
        }
        Ok(out)
    }

    async fn get_depth(&self, symbol: &str, _limit: usize) -> Result<Option<BookDepth>> {
        self.depth_calls.fetch_add(1, Ordering::SeqCst);
        if !self.with_depth {
            return Ok(None);
        }
        Ok(Some(BookDepth {
            symbol: symbol.to_string(),
            bids: vec![BidAsk { price: 99.0, quantity: 1.0 }],
            asks: vec![BidAsk { price: 101.0, quantity: 1.0 }],
            exchange_symbol: None,
            last_update_id: Some(1),
            utc: Some(1_700_000_000.0),
        }))
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _limit: Option<usize>,
    ) -> Result<Option<Vec<CandleStick>>> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        if !self.with_klines {
            return Ok(None);
        }
        Ok(Some(vec![CandleStick {
            utc_open_time: 1_700_000_000.0,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            coin_volume: 2.0,
            usd_volume: Some(201.0),
        }]))
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>> {
        self.funding_calls.fetch_add(1, Ordering::SeqCst);
        if !self.with_funding {
            return Ok(None);
        }
        Ok(Some(FundingRate {
            symbol: symbol.to_string(),
            rate: 0.0001,
            next_funding_utc: 1_700_030_000.0,
            next_rate: Some(0.0002),
            index_price: None,
            utc: Some(1_700_000_000.0),
        }))
    }

    async fn get_funding_rate_history(
        &self,
        _symbol: &str,
        _limit: Option<usize>,
    ) -> Result<Option<Vec<FundingRatePoint>>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if !self.with_funding {
            return Ok(None);
        }
        Ok(Some(vec![FundingRatePoint {
            funding_time_utc: 1_699_990_000.0,
            rate: 0.0001,
        }]))
    }

    async fn start(
        &self,
        _cb: Arc<dyn StreamCallback>,
        _symbols: Option<&[String]>,
        _depth: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
    fn subscribe(&self, _tokens: &[String]) {}
    fn unsubscribe(&self, _tokens: &[String]) {}
}

async fn seed_tokens(db: &Db, symbols: &[&str]) {
    for (idx, symbol) in symbols.iter().enumerate() {
        db.upsert_token(symbol, TokenSource::Manual, 1000.0 + idx as f64)
            .await
            .unwrap();
    }
}

fn crawler(
    db: &Db,
    store: &SharedStore,
    connector: Arc<FakePerpetual>,
) -> CexCrawler {
    CexCrawler::new(
        UnitOfWork::new(db.clone(), store.clone()),
        ExchangeId::Bybit,
        CrawlerConnector::Perpetual(connector),
    )
    .with_config(CrawlerConfig::default())
    .with_key_prefix(TEST_PREFIX)
}

#[tokio::test]
async fn test_run_maps_coverage_and_marks_unknown_tokens() {
    let db = Db::open_in_memory().unwrap();
    let store = MemoryStore::shared();
    seed_tokens(&db, &["BTC", "ETH", "ZZZZZ"]).await;
    let connector = FakePerpetual::covering(vec!["BTC", "ETH"]);
    let crawler = crawler(&db, &store, connector);

    let job = crawler.run().await.unwrap();
    assert!(job.stop.is_some());
    assert!(job.error.is_none());

    let iterations = db.list_iterations(job.id, None).await.unwrap();
    assert_eq!(iterations.len(), 3);

    let btc = &iterations[0];
    assert_eq!(btc.token, "BTC");
    assert_eq!(btc.status, IterationStatus::Success);
    assert!(btc.done);
    assert_eq!(btc.symbol.as_deref(), Some("BTC/USDT"));
    assert!(btc.currency_pair.is_some());
    assert!(btc.book_depth.is_some());
    assert!(btc.klines.is_some());
    assert!(btc.funding_rate.is_some());
    assert!(btc.next_funding_rate.is_some());
    assert!(btc.funding_rate_history.is_some());

    let unknown = &iterations[2];
    assert_eq!(unknown.token, "ZZZZZ");
    assert_eq!(unknown.status, IterationStatus::Ignore);
    assert_eq!(unknown.comment.as_deref(), Some("not on exchange"));
    assert!(unknown.currency_pair.is_none());

    // The price publish left a snapshot row behind.
    assert_eq!(db.count_snapshots("bybit", "perpetual", "BTC/USDT").await.unwrap(), 1);
}

#[tokio::test]
async fn test_windows_bound_artifact_calls_across_ticks() {
    let db = Db::open_in_memory().unwrap();
    let store = MemoryStore::shared();
    seed_tokens(&db, &["BTC", "ETH"]).await;
    let connector = FakePerpetual::covering(vec!["BTC", "ETH"]);
    let crawler = crawler(&db, &store, connector.clone());

    crawler.run().await.unwrap();
    assert_eq!(connector.depth_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.funding_calls.load(Ordering::SeqCst), 2);

    // A second run a moment later finds every window closed: no new calls.
    crawler.run().await.unwrap();
    assert_eq!(connector.depth_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.kline_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.funding_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.history_calls.load(Ordering::SeqCst), 2);

    // Expire the book windows (as if 31 minutes passed): one more depth
    // fetch per symbol, funding windows still closed.
    for symbol in ["BTC/USDT", "ETH/USDT"] {
        store
            .delete(&crawler.window_key(ARTIFACT_BOOK_DEPTH, symbol))
            .await
            .unwrap();
    }
    crawler.run().await.unwrap();
    assert_eq!(connector.depth_calls.load(Ordering::SeqCst), 4);
    assert_eq!(connector.funding_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_window_key_set_only_on_usable_payload() {
    let db = Db::open_in_memory().unwrap();
    let store = MemoryStore::shared();
    seed_tokens(&db, &["BTC"]).await;
    let connector = FakePerpetual::empty_handed(vec!["BTC"]);
    let crawler = crawler(&db, &store, connector.clone());

    crawler.run().await.unwrap();
    // Nothing usable came back: no window key was set for any artifact.
    for artifact in [
        ARTIFACT_BOOK_DEPTH,
        ARTIFACT_KLINES,
        ARTIFACT_FUNDING_RATE,
        ARTIFACT_FUNDING_HISTORY,
    ] {
        assert!(
            store
                .get(&crawler.window_key(artifact, "BTC/USDT"))
                .await
                .unwrap()
                .is_none(),
            "window for {} must stay open",
            artifact
        );
    }
    // So the next tick retries every artifact.
    crawler.run().await.unwrap();
    assert_eq!(connector.depth_calls.load(Ordering::SeqCst), 2);
    assert_eq!(connector.funding_calls.load(Ordering::SeqCst), 2);

    let job = db.get_job("bybit", "perpetual").await.unwrap().unwrap();
    let iterations = db.list_iterations(job.id, None).await.unwrap();
    assert_eq!(iterations[0].status, IterationStatus::Pending);
    assert!(!iterations[0].done);
}

#[tokio::test]
async fn test_successful_artifacts_close_their_windows() {
    let db = Db::open_in_memory().unwrap();
    let store = MemoryStore::shared();
    seed_tokens(&db, &["BTC"]).await;
    let connector = FakePerpetual::covering(vec!["BTC"]);
    let crawler = crawler(&db, &store, connector);

    crawler.run().await.unwrap();
    for artifact in [
        ARTIFACT_BOOK_DEPTH,
        ARTIFACT_KLINES,
        ARTIFACT_FUNDING_RATE,
        ARTIFACT_FUNDING_HISTORY,
    ] {
        assert_eq!(
            store
                .get(&crawler.window_key(artifact, "BTC/USDT"))
                .await
                .unwrap()
                .as_deref(),
            Some("1"),
            "window for {} must be closed",
            artifact
        );
    }
}

#[tokio::test]
async fn test_job_row_is_reused_across_runs() {
    let db = Db::open_in_memory().unwrap();
    let store = MemoryStore::shared();
    seed_tokens(&db, &["BTC"]).await;
    let connector = FakePerpetual::covering(vec!["BTC"]);
    let crawler = crawler(&db, &store, connector);

    let first = crawler.run().await.unwrap();
    let second = crawler.run().await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(second.start >= first.start);
    // Iterations were upserted, not duplicated.
    let iterations = db.list_iterations(second.id, None).await.unwrap();
    assert_eq!(iterations.len(), 1);
}
