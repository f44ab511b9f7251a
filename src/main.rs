//! arbfeed - exchange market-data crawler and stream runner.

use anyhow::{Context, Result};
use arbfeed_backend::cache::RedisStore;
use arbfeed_backend::cex::{
    perpetual_connector, spot_connector, ConnectorOptions, ExchangeId, MarketKind, StreamCallback,
};
use arbfeed_backend::config::Settings;
use arbfeed_backend::db::{Db, TokenSource};
use arbfeed_backend::models::{BookDepth, BookTicker, CandleStick};
use arbfeed_backend::services::crawler::{CexCrawler, CrawlerConnector};
use arbfeed_backend::services::tokens::TokensService;
use arbfeed_backend::services::UnitOfWork;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbfeed", about = "Exchange market-data crawler and stream runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one crawler pass for an (exchange, kind) pair.
    Crawl {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        kind: String,
    },
    /// Stream book/depth events to the log until interrupted.
    Stream {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        kind: String,
        /// Canonical symbols (comma separated); all known symbols if omitted.
        #[arg(long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,
        #[arg(long, default_value_t = false)]
        no_depth: bool,
    },
    /// Manage the token universe.
    Tokens {
        /// Add a manual token symbol.
        #[arg(long)]
        add: Option<String>,
        /// Delete a manual token symbol.
        #[arg(long)]
        delete: Option<String>,
        #[arg(long, default_value_t = false)]
        list: bool,
    },
}

struct LogCallback;

impl StreamCallback for LogCallback {
    fn handle(
        &self,
        book: Option<BookTicker>,
        depth: Option<BookDepth>,
        kline: Option<CandleStick>,
    ) {
        if let Some(book) = book {
            info!(
                symbol = %book.symbol,
                bid = book.bid_price,
                ask = book.ask_price,
                "book"
            );
        }
        if let Some(depth) = depth {
            info!(
                symbol = %depth.symbol,
                bids = depth.bids.len(),
                asks = depth.asks.len(),
                "depth"
            );
        }
        if let Some(kline) = kline {
            info!(open_time = kline.utc_open_time, close = kline.close, "kline");
        }
    }
}

fn parse_pair(exchange: &str, kind: &str) -> Result<(ExchangeId, MarketKind)> {
    let exchange = ExchangeId::parse(exchange)
        .with_context(|| format!("unknown exchange {:?}", exchange))?;
    let kind = MarketKind::parse(kind).with_context(|| format!("unknown kind {:?}", kind))?;
    Ok((exchange, kind))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let store = Arc::new(RedisStore::connect(&settings.redis_url).await?);
    let db = Db::open(&settings.database_path)?;
    let uow = UnitOfWork::new(db, store.clone());

    match cli.command {
        Command::Crawl { exchange, kind } => {
            let (exchange, kind) = parse_pair(&exchange, &kind)?;
            let opts = ConnectorOptions::new(store).throttle_timeout(settings.throttle_timeout_secs);
            let connector = match kind {
                MarketKind::Spot => CrawlerConnector::Spot(spot_connector(exchange, opts)),
                MarketKind::Perpetual => {
                    CrawlerConnector::Perpetual(perpetual_connector(exchange, opts))
                }
            };
            let crawler = CexCrawler::new(uow, exchange, connector);
            let job = crawler.run().await?;
            info!(job_id = job.id, "crawl complete");
        }
        Command::Stream {
            exchange,
            kind,
            symbols,
            no_depth,
        } => {
            let (exchange, kind) = parse_pair(&exchange, &kind)?;
            let opts = ConnectorOptions::new(store).throttle_timeout(settings.throttle_timeout_secs);
            let cb = Arc::new(LogCallback);
            match kind {
                MarketKind::Spot => {
                    let conn = spot_connector(exchange, opts);
                    conn.start(cb, symbols.as_deref(), !no_depth).await?;
                    info!(%exchange, %kind, "streaming; ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                    conn.stop().await;
                }
                MarketKind::Perpetual => {
                    let conn = perpetual_connector(exchange, opts);
                    conn.start(cb, symbols.as_deref(), !no_depth).await?;
                    info!(%exchange, %kind, "streaming; ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                    conn.stop().await;
                }
            }
        }
        Command::Tokens { add, delete, list } => {
            let service = TokensService::new(uow);
            if let Some(symbol) = add {
                let token = service
                    .upsert(&symbol.to_uppercase(), TokenSource::Manual)
                    .await?;
                info!(symbol = %token.symbol, id = token.id, "token added");
            }
            if let Some(symbol) = delete {
                let removed = service
                    .delete(&symbol.to_uppercase(), TokenSource::Manual)
                    .await?;
                info!(symbol = %symbol, removed, "token delete");
            }
            if list {
                for token in service.list_all().await? {
                    println!("{}\t{}\t{}", token.id, token.symbol, token.source.as_str());
                }
            }
        }
    }
    Ok(())
}
