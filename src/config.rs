//! Application configuration loaded from the environment.

/// Runtime settings. Loaded once at startup and passed explicitly to the
/// pieces that need them.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub redis_url: String,
    /// TTL for cached connector responses and orchestrator price keys.
    pub cache_timeout_secs: u64,
    /// Per-subject throttle period for streamed events.
    pub throttle_timeout_secs: f64,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./arbfeed.db".to_string());

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let cache_timeout_secs = std::env::var("CACHE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .unwrap_or(15);

        let throttle_timeout_secs = std::env::var("THROTTLE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .unwrap_or(1.0);

        Ok(Self {
            database_path,
            redis_url,
            cache_timeout_secs,
            throttle_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let settings = Settings::from_env().unwrap();
        assert!(!settings.database_path.is_empty());
        assert!(settings.redis_url.starts_with("redis://"));
        assert!(settings.throttle_timeout_secs > 0.0);
    }
}
