//! Token-universe service over the `token` table.
//!
//! The external top-N listing feed stays outside this crate; `setup`
//! consumes a plain symbol list and records a refresh marker in the cache so
//! an unchanged top-N is not re-applied every run.

use crate::cex::utc_now_secs;
use crate::db::{TokenRecord, TokenSource};
use crate::services::{ServiceConfigRegistry, UnitOfWork};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

const SETUP_CACHE_KEY: &str = "tokens:setup:meta";
const SERVICE_NAME: &str = "TokensService";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// How many of the provided symbols are applied by `setup`.
    pub top_n: usize,
    /// TTL of the refresh marker.
    pub setup_cache_timeout_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            top_n: 1000,
            setup_cache_timeout_secs: 60 * 60 * 24,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SetupMeta {
    top_n: usize,
}

pub struct TokensService {
    uow: UnitOfWork,
}

impl TokensService {
    pub fn new(uow: UnitOfWork) -> Self {
        Self { uow }
    }

    /// Creates the token or bumps `updated_at` for an existing
    /// (symbol, source) pair.
    pub async fn upsert(&self, symbol: &str, source: TokenSource) -> Result<TokenRecord> {
        self.uow.db.upsert_token(symbol, source, utc_now_secs()).await
    }

    pub async fn get(&self, symbol: &str, source: TokenSource) -> Result<Option<TokenRecord>> {
        self.uow.db.get_token(symbol, source).await
    }

    pub async fn delete(&self, symbol: &str, source: TokenSource) -> Result<bool> {
        self.uow.db.delete_token(symbol, source).await
    }

    pub async fn list_all(&self) -> Result<Vec<TokenRecord>> {
        self.uow.db.list_tokens().await
    }

    /// Applies a top-N symbol list under the `coinmarketcap` source. Skipped
    /// entirely while the marker from the previous run is still live and the
    /// configured top-N is unchanged.
    pub async fn setup(&self, symbols: &[String]) -> Result<usize> {
        let config: TokensConfig =
            ServiceConfigRegistry::get_or_default(&self.uow.db, SERVICE_NAME).await?;
        if let Ok(Some(raw)) = self.uow.store.get(SETUP_CACHE_KEY).await {
            if let Ok(meta) = serde_json::from_str::<SetupMeta>(&raw) {
                if meta.top_n == config.top_n {
                    info!(top_n = config.top_n, "token setup marker live, skipping");
                    return Ok(0);
                }
            }
        }
        let mut applied = 0;
        for symbol in symbols.iter().take(config.top_n) {
            self.upsert(symbol, TokenSource::Coinmarketcap).await?;
            applied += 1;
        }
        let meta = serde_json::to_string(&SetupMeta { top_n: config.top_n })?;
        self.uow
            .store
            .set_ex(SETUP_CACHE_KEY, &meta, config.setup_cache_timeout_secs)
            .await?;
        info!(applied, "token setup applied");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::db::Db;

    fn service() -> TokensService {
        let uow = UnitOfWork::new(Db::open_in_memory().unwrap(), MemoryStore::shared());
        TokensService::new(uow)
    }

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let svc = service();
        svc.upsert("BTC", TokenSource::Manual).await.unwrap();
        assert!(svc.get("BTC", TokenSource::Manual).await.unwrap().is_some());
        assert!(svc.get("BTC", TokenSource::Coinmarketcap).await.unwrap().is_none());
        assert!(svc.delete("BTC", TokenSource::Manual).await.unwrap());
        assert!(!svc.delete("BTC", TokenSource::Manual).await.unwrap());
    }

    #[tokio::test]
    async fn test_setup_applies_once_per_marker() {
        let svc = service();
        let symbols = vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()];
        assert_eq!(svc.setup(&symbols).await.unwrap(), 3);
        assert_eq!(svc.list_all().await.unwrap().len(), 3);
        // Marker is live: a second pass is a no-op.
        assert_eq!(svc.setup(&symbols).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_setup_respects_top_n() {
        let svc = service();
        ServiceConfigRegistry::set(
            &svc.uow.db,
            SERVICE_NAME,
            &TokensConfig {
                top_n: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let symbols = vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()];
        assert_eq!(svc.setup(&symbols).await.unwrap(), 2);
        let tokens = svc.list_all().await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].symbol, "BTC");
    }
}
