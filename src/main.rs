// src/main.rs
mod analytics;
mod api;
mod chat;
mod config;
mod db;
mod error;
mod fifo;
mod ledger;
mod market;
mod models;
mod prices;
mod store;
mod streaming;
mod validators;
mod websocket;

use crate::analytics::Analytics;
use crate::api::Services;
use crate::chat::{ChatAssistant, ChatSessions};
use crate::config::{Config, StorageBackend};
use crate::db::ScyllaStore;
use crate::ledger::Ledger;
use crate::market::{AlphaVantageClient, MarketService, QuoteSource};
use crate::prices::MemoryPriceCache;
use crate::store::{MemoryStore, PortfolioStore};
use crate::streaming::PriceStreamer;
use env_logger::Builder;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task;
use warp::Filter;

fn build_services<S: PortfolioStore + 'static>(
    store: Arc<S>,
    source: Option<Arc<dyn QuoteSource>>,
    config: &Config,
) -> Services {
    let cache = Arc::new(MemoryPriceCache::new());
    let ledger = Arc::new(Ledger::new(store.clone()));
    let analytics = Arc::new(Analytics::new(ledger.clone(), store.clone(), cache.clone()));
    let market = Arc::new(MarketService::new(source.clone(), cache.clone(), store));
    let streamer = Arc::new(PriceStreamer::new(
        source,
        cache,
        ledger.clone(),
        config.price_poll,
    ));
    // No chat model ships with the server; chat answers 503 until one is wired in.
    let chat = Arc::new(ChatAssistant::new(
        None,
        Arc::new(ChatSessions::new()),
        ledger.clone(),
        analytics.clone(),
        market.clone(),
    ));
    Services {
        ledger,
        analytics,
        market,
        streamer,
        chat,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    Builder::new()
        .filter_level(config.log_level)
        .format_timestamp_secs()
        .init();

    info!("Starting the portfolio tracker...");

    let source: Option<Arc<dyn QuoteSource>> = match &config.alpha_vantage_api_key {
        Some(key) => Some(Arc::new(AlphaVantageClient::new(key.clone()))),
        None => {
            warn!("ALPHA_VANTAGE_API_KEY not set; market data disabled");
            None
        }
    };

    let services = match config.storage {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            build_services(Arc::new(MemoryStore::new()), source, &config)
        }
        StorageBackend::Scylla => {
            match ScyllaStore::connect(&config.scylla_node, &config.scylla_keyspace).await {
                Ok(store) => {
                    info!("Connected to database at {}", config.scylla_node);
                    build_services(Arc::new(store), source, &config)
                }
                Err(e) => {
                    error!("Failed to initialize database: {}", e);
                    return Err(e.into());
                }
            }
        }
    };

    task::spawn(services.streamer.clone().run());

    let api = api::routes(services);

    info!("Server running on http://{}", config.listen_addr);
    warp::serve(api.with(warp::log("portfolio_tracker")))
        .run(config.listen_addr)
        .await;
    Ok(())
}
