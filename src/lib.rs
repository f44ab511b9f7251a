//! Market-data connector and ingestion core.
//!
//! Eight centralized exchanges, two market kinds each, normalized into a
//! small set of records and published through a Redis cache plus a SQLite
//! snapshot store.

pub mod cache;
pub mod cex;
pub mod config;
pub mod db;
pub mod models;
pub mod services;

// Re-export the contract types most callers need.
pub use cex::{
    perpetual_connector, spot_connector, ConnectorOptions, ExchangeId, MarketKind,
    PerpetualConnector, SpotConnector, StreamCallback,
};
pub use config::Settings;
