//! SQLite persistence for the crawler and the orchestrator snapshot table.
//!
//! Schema is created on open; there is no separate migration step. JSON
//! artifacts (currency pair, depth, klines, funding) are stored as TEXT.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where a token row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Manual,
    Coinmarketcap,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSource::Manual => "manual",
            TokenSource::Coinmarketcap => "coinmarketcap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(TokenSource::Manual),
            "coinmarketcap" => Some(TokenSource::Coinmarketcap),
            _ => None,
        }
    }
}

/// Crawler iteration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Init,
    Pending,
    Success,
    Error,
    Ignore,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Init => "init",
            IterationStatus::Pending => "pending",
            IterationStatus::Success => "success",
            IterationStatus::Error => "error",
            IterationStatus::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(IterationStatus::Init),
            "pending" => Some(IterationStatus::Pending),
            "success" => Some(IterationStatus::Success),
            "error" => Some(IterationStatus::Error),
            "ignore" => Some(IterationStatus::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: i64,
    pub symbol: String,
    pub source: TokenSource,
    pub created_at: Option<f64>,
    pub updated_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CrawlerJobRecord {
    pub id: i64,
    pub exchange: String,
    pub connector: String,
    pub start: f64,
    pub stop: Option<f64>,
    pub error: Option<String>,
}

/// One row per (job, token). Artifact columns hold serde JSON.
#[derive(Debug, Clone)]
pub struct CrawlerIterationRecord {
    pub id: i64,
    pub crawler_job_id: i64,
    pub token: String,
    pub symbol: Option<String>,
    pub start: f64,
    pub stop: Option<f64>,
    pub done: bool,
    pub status: IterationStatus,
    pub comment: Option<String>,
    pub error: Option<String>,
    pub last_update: f64,
    pub currency_pair: Option<String>,
    pub book_depth: Option<String>,
    pub klines: Option<String>,
    pub funding_rate: Option<String>,
    pub next_funding_rate: Option<String>,
    pub funding_rate_history: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub exchange_id: String,
    pub kind: String,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub ratio: f64,
    pub utc: Option<f64>,
    pub align_to_minutes: i64,
    pub aligned_timestamp: f64,
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS token (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at REAL,
                updated_at REAL,
                UNIQUE(symbol, source)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS crawler_job (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                connector TEXT NOT NULL,
                start REAL NOT NULL,
                stop REAL,
                error TEXT,
                UNIQUE(exchange, connector)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_crawler_job_start ON crawler_job(start)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS crawler_iteration (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                crawler_job_id INTEGER NOT NULL REFERENCES crawler_job(id) ON DELETE CASCADE,
                token TEXT NOT NULL,
                symbol TEXT,
                start REAL NOT NULL,
                stop REAL,
                done INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                comment TEXT,
                error TEXT,
                last_update REAL NOT NULL,
                currency_pair TEXT,
                book_depth TEXT,
                klines TEXT,
                funding_rate TEXT,
                next_funding_rate TEXT,
                funding_rate_history TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_crawler_iteration_job ON crawler_iteration(crawler_job_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_crawler_iteration_job_token ON crawler_iteration(crawler_job_id, token)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS currency_pair_snapshot (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT NOT NULL,
                base TEXT NOT NULL,
                quote TEXT NOT NULL,
                ratio REAL NOT NULL,
                utc REAL,
                align_to_minutes INTEGER NOT NULL,
                aligned_timestamp REAL NOT NULL,
                UNIQUE(exchange_id, kind, symbol, align_to_minutes, aligned_timestamp)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS service_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // token
    // ------------------------------------------------------------------

    /// Creates the token or bumps `updated_at` when the (symbol, source)
    /// pair already exists.
    pub async fn upsert_token(
        &self,
        symbol: &str,
        source: TokenSource,
        now: f64,
    ) -> Result<TokenRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO token (symbol, source, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(symbol, source) DO UPDATE SET updated_at = excluded.updated_at",
            params![symbol, source.as_str(), now],
        )?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, source, created_at, updated_at FROM token
             WHERE symbol = ?1 AND source = ?2",
        )?;
        let record = stmt.query_row(params![symbol, source.as_str()], Self::row_to_token)?;
        Ok(record)
    }

    pub async fn get_token(&self, symbol: &str, source: TokenSource) -> Result<Option<TokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, source, created_at, updated_at FROM token
             WHERE symbol = ?1 AND source = ?2",
        )?;
        let record = stmt
            .query_row(params![symbol, source.as_str()], Self::row_to_token)
            .optional()?;
        Ok(record)
    }

    pub async fn delete_token(&self, symbol: &str, source: TokenSource) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM token WHERE symbol = ?1 AND source = ?2",
            params![symbol, source.as_str()],
        )?;
        Ok(n > 0)
    }

    /// All tokens ordered by id (insertion order).
    pub async fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, source, created_at, updated_at FROM token ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_token)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRecord> {
        let source: String = row.get(2)?;
        Ok(TokenRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            source: TokenSource::parse(&source).unwrap_or(TokenSource::Manual),
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // ------------------------------------------------------------------
    // crawler_job
    // ------------------------------------------------------------------

    /// Single row per (exchange, connector): reset start/stop/error when the
    /// row exists, insert otherwise.
    pub async fn upsert_job(
        &self,
        exchange: &str,
        connector: &str,
        start: f64,
    ) -> Result<CrawlerJobRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO crawler_job (exchange, connector, start, stop, error)
             VALUES (?1, ?2, ?3, NULL, NULL)
             ON CONFLICT(exchange, connector) DO UPDATE SET
                start = excluded.start,
                stop = NULL,
                error = NULL",
            params![exchange, connector, start],
        )?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, exchange, connector, start, stop, error FROM crawler_job
             WHERE exchange = ?1 AND connector = ?2",
        )?;
        let record = stmt.query_row(params![exchange, connector], Self::row_to_job)?;
        Ok(record)
    }

    pub async fn finish_job(&self, job_id: i64, stop: f64, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE crawler_job SET stop = ?2, error = ?3 WHERE id = ?1",
            params![job_id, stop, error],
        )?;
        Ok(())
    }

    pub async fn get_job(&self, exchange: &str, connector: &str) -> Result<Option<CrawlerJobRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, exchange, connector, start, stop, error FROM crawler_job
             WHERE exchange = ?1 AND connector = ?2",
        )?;
        let record = stmt
            .query_row(params![exchange, connector], Self::row_to_job)
            .optional()?;
        Ok(record)
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrawlerJobRecord> {
        Ok(CrawlerJobRecord {
            id: row.get(0)?,
            exchange: row.get(1)?,
            connector: row.get(2)?,
            start: row.get(3)?,
            stop: row.get(4)?,
            error: row.get(5)?,
        })
    }

    // ------------------------------------------------------------------
    // crawler_iteration
    // ------------------------------------------------------------------

    pub async fn find_iteration(
        &self,
        job_id: i64,
        token: &str,
    ) -> Result<Option<CrawlerIterationRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM crawler_iteration WHERE crawler_job_id = ?1 AND token = ?2",
            ITERATION_COLUMNS
        ))?;
        let record = stmt
            .query_row(params![job_id, token], Self::row_to_iteration)
            .optional()?;
        Ok(record)
    }

    pub async fn insert_iteration(
        &self,
        job_id: i64,
        token: &str,
        now: f64,
    ) -> Result<CrawlerIterationRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO crawler_iteration
                (crawler_job_id, token, start, done, status, last_update)
             VALUES (?1, ?2, ?3, 0, 'init', ?3)",
            params![job_id, token, now],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM crawler_iteration WHERE id = ?1",
            ITERATION_COLUMNS
        ))?;
        let record = stmt.query_row(params![id], Self::row_to_iteration)?;
        Ok(record)
    }

    /// Writes back every mutable column of the iteration row.
    pub async fn update_iteration(&self, it: &CrawlerIterationRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE crawler_iteration SET
                symbol = ?2, stop = ?3, done = ?4, status = ?5, comment = ?6,
                error = ?7, last_update = ?8, currency_pair = ?9, book_depth = ?10,
                klines = ?11, funding_rate = ?12, next_funding_rate = ?13,
                funding_rate_history = ?14
             WHERE id = ?1",
            params![
                it.id,
                it.symbol,
                it.stop,
                it.done,
                it.status.as_str(),
                it.comment,
                it.error,
                it.last_update,
                it.currency_pair,
                it.book_depth,
                it.klines,
                it.funding_rate,
                it.next_funding_rate,
                it.funding_rate_history,
            ],
        )?;
        Ok(())
    }

    pub async fn list_iterations(
        &self,
        job_id: i64,
        status: Option<IterationStatus>,
    ) -> Result<Vec<CrawlerIterationRecord>> {
        let conn = self.conn.lock().await;
        let rows = match status {
            Some(st) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM crawler_iteration
                     WHERE crawler_job_id = ?1 AND status = ?2 ORDER BY id",
                    ITERATION_COLUMNS
                ))?;
                let result = stmt.query_map(params![job_id, st.as_str()], Self::row_to_iteration)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM crawler_iteration WHERE crawler_job_id = ?1 ORDER BY id",
                    ITERATION_COLUMNS
                ))?;
                let result = stmt.query_map(params![job_id], Self::row_to_iteration)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrawlerIterationRecord> {
        let status: String = row.get(7)?;
        Ok(CrawlerIterationRecord {
            id: row.get(0)?,
            crawler_job_id: row.get(1)?,
            token: row.get(2)?,
            symbol: row.get(3)?,
            start: row.get(4)?,
            stop: row.get(5)?,
            done: row.get(6)?,
            status: IterationStatus::parse(&status).unwrap_or(IterationStatus::Init),
            comment: row.get(8)?,
            error: row.get(9)?,
            last_update: row.get(10)?,
            currency_pair: row.get(11)?,
            book_depth: row.get(12)?,
            klines: row.get(13)?,
            funding_rate: row.get(14)?,
            next_funding_rate: row.get(15)?,
            funding_rate_history: row.get(16)?,
        })
    }

    // ------------------------------------------------------------------
    // currency_pair_snapshot
    // ------------------------------------------------------------------

    /// At most one row per (exchange, kind, symbol, align, bucket); repeats
    /// within a bucket update the existing row.
    pub async fn upsert_snapshot(&self, snap: &SnapshotRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO currency_pair_snapshot
                (exchange_id, kind, symbol, base, quote, ratio, utc,
                 align_to_minutes, aligned_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(exchange_id, kind, symbol, align_to_minutes, aligned_timestamp)
             DO UPDATE SET
                base = excluded.base,
                quote = excluded.quote,
                ratio = excluded.ratio,
                utc = excluded.utc",
            params![
                snap.exchange_id,
                snap.kind,
                snap.symbol,
                snap.base,
                snap.quote,
                snap.ratio,
                snap.utc,
                snap.align_to_minutes,
                snap.aligned_timestamp,
            ],
        )?;
        Ok(())
    }

    /// Most recently inserted snapshot for the tuple, ignoring the bucket.
    pub async fn latest_snapshot(
        &self,
        exchange_id: &str,
        kind: &str,
        symbol: &str,
        align_to_minutes: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT exchange_id, kind, symbol, base, quote, ratio, utc,
                    align_to_minutes, aligned_timestamp
             FROM currency_pair_snapshot
             WHERE exchange_id = ?1 AND kind = ?2 AND symbol = ?3 AND align_to_minutes = ?4
             ORDER BY id DESC LIMIT 1",
        )?;
        let record = stmt
            .query_row(params![exchange_id, kind, symbol, align_to_minutes], |row| {
                Ok(SnapshotRecord {
                    exchange_id: row.get(0)?,
                    kind: row.get(1)?,
                    symbol: row.get(2)?,
                    base: row.get(3)?,
                    quote: row.get(4)?,
                    ratio: row.get(5)?,
                    utc: row.get(6)?,
                    align_to_minutes: row.get(7)?,
                    aligned_timestamp: row.get(8)?,
                })
            })
            .optional()?;
        Ok(record)
    }

    pub async fn count_snapshots(
        &self,
        exchange_id: &str,
        kind: &str,
        symbol: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM currency_pair_snapshot
             WHERE exchange_id = ?1 AND kind = ?2 AND symbol = ?3",
        )?;
        let n: i64 = stmt.query_row(params![exchange_id, kind, symbol], |row| row.get(0))?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // service_config
    // ------------------------------------------------------------------

    pub async fn get_service_config(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT value FROM service_config WHERE name = ?1")?;
        let value = stmt
            .query_row(params![name], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    pub async fn set_service_config(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO service_config (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }
}

const ITERATION_COLUMNS: &str = "id, crawler_job_id, token, symbol, start, stop, done, status, \
     comment, error, last_update, currency_pair, book_depth, klines, funding_rate, \
     next_funding_rate, funding_rate_history";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbfeed.db");
        let db = Db::open(path.to_str().unwrap()).unwrap();
        db.upsert_token("BTC", TokenSource::Manual, 1.0).await.unwrap();
        drop(db);
        let db = Db::open(path.to_str().unwrap()).unwrap();
        assert_eq!(db.list_tokens().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_upsert_bumps_updated_at() {
        let db = Db::open_in_memory().unwrap();
        let first = db.upsert_token("BTC", TokenSource::Manual, 100.0).await.unwrap();
        let second = db.upsert_token("BTC", TokenSource::Manual, 200.0).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.created_at, Some(100.0));
        assert_eq!(second.updated_at, Some(200.0));

        // Same symbol, different source is a distinct row.
        let cmc = db
            .upsert_token("BTC", TokenSource::Coinmarketcap, 300.0)
            .await
            .unwrap();
        assert_ne!(cmc.id, first.id);
        assert_eq!(db.list_tokens().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_job_upsert_is_single_row() {
        let db = Db::open_in_memory().unwrap();
        let job1 = db.upsert_job("bybit", "spot", 100.0).await.unwrap();
        db.finish_job(job1.id, 150.0, None).await.unwrap();
        let job2 = db.upsert_job("bybit", "spot", 200.0).await.unwrap();
        assert_eq!(job1.id, job2.id);
        assert_eq!(job2.start, 200.0);
        assert!(job2.stop.is_none());
        assert!(job2.error.is_none());
    }

    #[tokio::test]
    async fn test_iteration_lifecycle() {
        let db = Db::open_in_memory().unwrap();
        let job = db.upsert_job("okx", "perpetual", 10.0).await.unwrap();
        let mut it = db.insert_iteration(job.id, "BTC", 10.0).await.unwrap();
        assert_eq!(it.status, IterationStatus::Init);
        assert!(!it.done);

        it.status = IterationStatus::Pending;
        it.symbol = Some("BTC/USDT".to_string());
        it.currency_pair = Some(r#"{"base":"BTC","quote":"USDT","ratio":50000.0}"#.to_string());
        it.last_update = 20.0;
        db.update_iteration(&it).await.unwrap();

        let found = db.find_iteration(job.id, "BTC").await.unwrap().unwrap();
        assert_eq!(found.status, IterationStatus::Pending);
        assert_eq!(found.symbol.as_deref(), Some("BTC/USDT"));

        let pending = db
            .list_iterations(job.id, Some(IterationStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(db
            .list_iterations(job.id, Some(IterationStatus::Success))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_bucket_uniqueness() {
        let db = Db::open_in_memory().unwrap();
        let mut snap = SnapshotRecord {
            exchange_id: "binance".to_string(),
            kind: "spot".to_string(),
            symbol: "BTC/USDT".to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            ratio: 50000.0,
            utc: Some(1000.0),
            align_to_minutes: 1,
            aligned_timestamp: 960.0,
        };
        db.upsert_snapshot(&snap).await.unwrap();
        snap.ratio = 50001.0;
        db.upsert_snapshot(&snap).await.unwrap();
        assert_eq!(
            db.count_snapshots("binance", "spot", "BTC/USDT").await.unwrap(),
            1
        );

        snap.aligned_timestamp = 1020.0;
        db.upsert_snapshot(&snap).await.unwrap();
        assert_eq!(
            db.count_snapshots("binance", "spot", "BTC/USDT").await.unwrap(),
            2
        );
        let latest = db
            .latest_snapshot("binance", "spot", "BTC/USDT", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.aligned_timestamp, 1020.0);
        assert_eq!(latest.ratio, 50001.0);
    }

    #[tokio::test]
    async fn test_service_config_round_trip() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.get_service_config("CexCrawler").await.unwrap().is_none());
        db.set_service_config("CexCrawler", r#"{"align_to_minutes":5}"#)
            .await
            .unwrap();
        db.set_service_config("CexCrawler", r#"{"align_to_minutes":2}"#)
            .await
            .unwrap();
        assert_eq!(
            db.get_service_config("CexCrawler").await.unwrap().as_deref(),
            Some(r#"{"align_to_minutes":2}"#)
        );
    }
}
