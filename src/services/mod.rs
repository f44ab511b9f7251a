//! Service plumbing: the unit-of-work handed to every service and the
//! per-service configuration registry.

pub mod crawler;
pub mod tokens;

use crate::cache::SharedStore;
use crate::db::Db;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One database handle plus one cache client. Services reach storage only
/// through this; nothing pulls connections from module-level state.
#[derive(Clone)]
pub struct UnitOfWork {
    pub db: Db,
    pub store: SharedStore,
}

impl UnitOfWork {
    pub fn new(db: Db, store: SharedStore) -> Self {
        Self { db, store }
    }
}

/// JSON-encoded per-service configuration stored in the `service_config`
/// table, keyed by the service name.
pub struct ServiceConfigRegistry;

impl ServiceConfigRegistry {
    pub async fn get<T: DeserializeOwned>(db: &Db, name: &str) -> Result<Option<T>> {
        let raw = db.get_service_config(name).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn set<T: Serialize>(db: &Db, name: &str, config: &T) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        db.set_service_config(name, &raw).await
    }

    /// Loads the stored config, or persists the defaults for later editing.
    pub async fn get_or_default<T>(db: &Db, name: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(config) = Self::get(db, name).await? {
            return Ok(config);
        }
        let config = T::default();
        Self::set(db, name, &config).await?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DemoConfig {
        interval_min: u64,
        factor: f64,
    }

    impl Default for DemoConfig {
        fn default() -> Self {
            Self {
                interval_min: 30,
                factor: 5.0,
            }
        }
    }

    #[tokio::test]
    async fn test_get_or_default_persists_defaults() {
        let db = Db::open_in_memory().unwrap();
        assert!(ServiceConfigRegistry::get::<DemoConfig>(&db, "Demo")
            .await
            .unwrap()
            .is_none());
        let loaded: DemoConfig = ServiceConfigRegistry::get_or_default(&db, "Demo").await.unwrap();
        assert_eq!(loaded, DemoConfig::default());
        // Defaults were written for later editing.
        let stored: DemoConfig = ServiceConfigRegistry::get(&db, "Demo").await.unwrap().unwrap();
        assert_eq!(stored, DemoConfig::default());
    }

    #[tokio::test]
    async fn test_stored_config_wins_over_defaults() {
        let db = Db::open_in_memory().unwrap();
        let custom = DemoConfig {
            interval_min: 5,
            factor: 2.0,
        };
        ServiceConfigRegistry::set(&db, "Demo", &custom).await.unwrap();
        let loaded: DemoConfig = ServiceConfigRegistry::get_or_default(&db, "Demo").await.unwrap();
        assert_eq!(loaded, custom);
    }
}
