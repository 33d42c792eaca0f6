// src/streaming.rs
use crate::ledger::{Ledger, LedgerResult};
use crate::market::QuoteSource;
use crate::models::PriceQuote;
use crate::prices::PriceCache;
use crate::validators::validate_stock_symbol;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio::time::{self, Duration, MissedTickBehavior};

pub const MARKET_INDICES: [&str; 3] = ["^GSPC", "^DJI", "^IXIC"];

const TICK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price_data: PriceQuote,
}

/// How a tick reaches a subscriber; doubles as the outgoing event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Holdings,
    Watchlist,
    MarketIndex,
}

impl TickKind {
    pub fn event(&self) -> &'static str {
        match self {
            TickKind::Holdings => "price_update",
            TickKind::Watchlist => "watchlist_price_update",
            TickKind::MarketIndex => "market_index_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub active_symbols: Vec<String>,
    pub holdings_users: usize,
    pub watchlist_users: usize,
    pub market_indices_users: usize,
    pub cached_prices: usize,
}

#[derive(Default)]
struct Subscriptions {
    holdings: HashMap<String, BTreeSet<String>>,
    watchlist: HashMap<String, BTreeSet<String>>,
    indices: HashSet<String>,
}

impl Subscriptions {
    fn active_symbols(&self) -> BTreeSet<String> {
        let mut active: BTreeSet<String> = self
            .holdings
            .values()
            .chain(self.watchlist.values())
            .flatten()
            .cloned()
            .collect();
        if !self.indices.is_empty() {
            active.extend(MARKET_INDICES.iter().map(|s| s.to_string()));
        }
        active
    }
}

fn normalize(symbols: &[String]) -> BTreeSet<String> {
    symbols
        .iter()
        .filter_map(|s| match validate_stock_symbol(Some(s)) {
            Ok(symbol) => Some(symbol),
            Err(e) => {
                warn!("Ignoring subscription to {:?}: {}", s, e);
                None
            }
        })
        .collect()
}

/// Polls the quote source for every subscribed symbol and fans results out
/// over a broadcast channel. Subscriptions are in-process only.
pub struct PriceStreamer {
    subscriptions: RwLock<Subscriptions>,
    source: Option<Arc<dyn QuoteSource>>,
    cache: Arc<dyn PriceCache>,
    ledger: Arc<Ledger>,
    ticks: broadcast::Sender<PriceTick>,
    streaming: AtomicBool,
    period: Duration,
}

impl PriceStreamer {
    pub fn new(
        source: Option<Arc<dyn QuoteSource>>,
        cache: Arc<dyn PriceCache>,
        ledger: Arc<Ledger>,
        period: Duration,
    ) -> Self {
        let (ticks, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        PriceStreamer {
            subscriptions: RwLock::new(Subscriptions::default()),
            source,
            cache,
            ledger,
            ticks,
            streaming: AtomicBool::new(false),
            period,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Subscriptions> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Subscriptions> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ticks(&self) -> broadcast::Receiver<PriceTick> {
        self.ticks.subscribe()
    }

    /// Subscribes to the given symbols, or to the user's current holdings
    /// when none are given. Returns false when there is nothing to follow.
    pub async fn subscribe_holdings(
        &self,
        user_id: &str,
        symbols: Option<Vec<String>>,
    ) -> LedgerResult<bool> {
        let symbols = match symbols {
            Some(symbols) if !symbols.is_empty() => normalize(&symbols),
            _ => self.ledger.user_symbols(user_id).await?.into_iter().collect(),
        };
        if symbols.is_empty() {
            info!("No symbols to subscribe for user {}", user_id);
            return Ok(false);
        }
        info!("Subscribed user {} to symbols: {:?}", user_id, symbols);
        self.write().holdings.insert(user_id.to_string(), symbols);
        Ok(true)
    }

    pub fn subscribe_watchlist(&self, user_id: &str, symbols: &[String]) -> bool {
        let symbols = normalize(symbols);
        if symbols.is_empty() {
            return false;
        }
        info!("Subscribed user {} to watchlist symbols: {:?}", user_id, symbols);
        self.write().watchlist.insert(user_id.to_string(), symbols);
        true
    }

    pub fn subscribe_market_indices(&self, user_id: &str) {
        info!("Subscribed {} to market indices", user_id);
        self.write().indices.insert(user_id.to_string());
    }

    pub fn unsubscribe_watchlist(&self, user_id: &str) {
        self.write().watchlist.remove(user_id);
    }

    pub fn unsubscribe_market_indices(&self, user_id: &str) {
        self.write().indices.remove(user_id);
    }

    /// Drops every subscription the user holds.
    pub fn unsubscribe_user(&self, user_id: &str) {
        let mut subs = self.write();
        subs.holdings.remove(user_id);
        subs.watchlist.remove(user_id);
        subs.indices.remove(user_id);
        info!("Unsubscribed user {} from all streams", user_id);
    }

    pub fn active_symbols(&self) -> BTreeSet<String> {
        self.read().active_symbols()
    }

    /// Events `user_id` should receive for a tick on `symbol`.
    pub fn routes_for(&self, user_id: &str, symbol: &str) -> Vec<TickKind> {
        let subs = self.read();
        let mut kinds = Vec::new();
        if subs.holdings.get(user_id).is_some_and(|s| s.contains(symbol)) {
            kinds.push(TickKind::Holdings);
        }
        if subs.watchlist.get(user_id).is_some_and(|s| s.contains(symbol)) {
            kinds.push(TickKind::Watchlist);
        }
        if subs.indices.contains(user_id) && MARKET_INDICES.contains(&symbol) {
            kinds.push(TickKind::MarketIndex);
        }
        kinds
    }

    pub async fn status(&self) -> StreamStatus {
        let cached_prices = match self.cache.all().await {
            Ok(all) => all.len(),
            Err(e) => {
                warn!("Could not count cached prices: {}", e);
                0
            }
        };
        let subs = self.read();
        StreamStatus {
            is_streaming: self.streaming.load(Ordering::Relaxed),
            active_symbols: subs.active_symbols().into_iter().collect(),
            holdings_users: subs.holdings.len(),
            watchlist_users: subs.watchlist.len(),
            market_indices_users: subs.indices.len(),
            cached_prices,
        }
    }

    /// One refresh pass over the active symbols. Returns how many ticks were
    /// published.
    pub async fn poll_once(&self) -> usize {
        let Some(source) = &self.source else {
            return 0;
        };
        let mut published = 0;
        for symbol in self.active_symbols() {
            let quote = match source.fetch_quote(&symbol).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!("Streaming fetch failed for {}: {}", symbol, e);
                    continue;
                }
            };
            if let Err(e) = self.cache.cache_price(quote.clone()).await {
                error!("Error caching streamed price for {}: {}", symbol, e);
            }
            debug!("Broadcasting {} at {}", symbol, quote.current_price);
            // No receivers just means nobody is connected right now.
            let _ = self.ticks.send(PriceTick {
                symbol,
                price_data: quote,
            });
            published += 1;
        }
        published
    }

    /// Poll loop for the life of the process.
    pub async fn run(self: Arc<Self>) {
        if self.source.is_none() {
            warn!("No quote source configured; price streaming disabled");
            return;
        }
        self.streaming.store(true, Ordering::Relaxed);
        info!("Price streaming every {:?}", self.period);
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if self.active_symbols().is_empty() {
                continue;
            }
            let published = self.poll_once().await;
            debug!("Published {} price ticks", published);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryMeta;
    use crate::market::tests::StaticSource;
    use crate::prices::MemoryPriceCache;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    async fn streamer(source: Option<Arc<StaticSource>>) -> PriceStreamer {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(Ledger::new(store));
        ledger
            .apply_deposit("u1", dec!(1000), EntryMeta::default())
            .await
            .unwrap();
        ledger
            .apply_buy("u1", "AAPL", dec!(1), dec!(100), EntryMeta::default())
            .await
            .unwrap();
        PriceStreamer::new(
            source.map(|s| s as Arc<dyn QuoteSource>),
            Arc::new(MemoryPriceCache::new()),
            ledger,
            Duration::from_millis(10),
        )
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn holdings_subscription_defaults_to_positions() {
        let s = streamer(None).await;
        assert!(s.subscribe_holdings("u1", None).await.unwrap());
        assert!(!s.subscribe_holdings("nobody", None).await.unwrap());
        assert_eq!(s.active_symbols().into_iter().collect::<Vec<_>>(), vec!["AAPL"]);
    }

    #[tokio::test]
    async fn active_symbols_union_all_kinds() {
        let s = streamer(None).await;
        s.subscribe_holdings("u1", Some(symbols(&["aapl"]))).await.unwrap();
        assert!(s.subscribe_watchlist("u2", &symbols(&["TSLA", "bad symbol"])));
        assert!(!s.subscribe_watchlist("u3", &[]));
        s.subscribe_market_indices("u2");

        let active: Vec<String> = s.active_symbols().into_iter().collect();
        assert_eq!(active, vec!["AAPL", "TSLA", "^DJI", "^GSPC", "^IXIC"]);

        s.unsubscribe_user("u2");
        assert_eq!(s.active_symbols().len(), 1);
        s.unsubscribe_user("u1");
        assert!(s.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn ticks_route_by_subscription_kind() {
        let s = streamer(None).await;
        s.subscribe_holdings("u1", Some(symbols(&["AAPL"]))).await.unwrap();
        s.subscribe_watchlist("u1", &symbols(&["AAPL", "MSFT"]));
        s.subscribe_market_indices("u1");

        assert_eq!(
            s.routes_for("u1", "AAPL"),
            vec![TickKind::Holdings, TickKind::Watchlist]
        );
        assert_eq!(s.routes_for("u1", "MSFT"), vec![TickKind::Watchlist]);
        assert_eq!(s.routes_for("u1", "^DJI"), vec![TickKind::MarketIndex]);
        assert!(s.routes_for("u2", "AAPL").is_empty());

        s.unsubscribe_market_indices("u1");
        assert!(s.routes_for("u1", "^DJI").is_empty());
        assert_eq!(TickKind::Watchlist.event(), "watchlist_price_update");
    }

    #[tokio::test]
    async fn poll_publishes_and_caches() {
        let source = Arc::new(StaticSource::with_prices(&[("AAPL", dec!(101))]));
        let s = streamer(Some(source)).await;
        s.subscribe_holdings("u1", None).await.unwrap();
        s.subscribe_watchlist("u1", &symbols(&["NOPE"]));
        let mut rx = s.ticks();

        assert_eq!(s.poll_once().await, 1);
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price_data.current_price, dec!(101));

        let status = s.status().await;
        assert_eq!(status.cached_prices, 1);
        assert_eq!(status.holdings_users, 1);
        assert!(!status.is_streaming);
    }

    #[tokio::test]
    async fn run_loop_streams_until_dropped() {
        let source = Arc::new(StaticSource::with_prices(&[("AAPL", dec!(99))]));
        let s = Arc::new(streamer(Some(source)).await);
        s.subscribe_holdings("u1", None).await.unwrap();
        let mut rx = s.ticks();
        let handle = tokio::spawn(s.clone().run());

        let tick = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert!(s.status().await.is_streaming);
        handle.abort();
    }

    #[tokio::test]
    async fn no_source_means_no_streaming() {
        let s = Arc::new(streamer(None).await);
        s.clone().run().await;
        assert_eq!(s.poll_once().await, 0);
        assert!(!s.status().await.is_streaming);
    }
}
