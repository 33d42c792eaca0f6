// src/market.rs
use crate::error::MarketError;
use crate::models::{Asset, PriceQuote, SymbolMatch};
use crate::prices::PriceCache;
use crate::store::PortfolioStore;
use crate::validators::validate_stock_symbol;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{error, info, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";
pub const DEFAULT_NEWS_COUNT: usize = 10;
const MAX_NEWS_COUNT: usize = 50;

/// Display name and sector for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetProfile {
    pub name: String,
    pub sector: Option<String>,
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<PriceQuote, MarketError>;
    async fn fetch_profile(&self, symbol: &str) -> Result<AssetProfile, MarketError>;
    async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, MarketError>;
    async fn news(&self, symbol: &str, count: usize) -> Result<Vec<NewsArticle>, MarketError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsArticle {
    pub title: String,
    pub summary: String,
    pub link: String,
    pub publisher: String,
    pub published: String,
}

/// News for one symbol. Provider failures leave `articles` empty and set
/// `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsReport {
    pub symbol: String,
    pub count: usize,
    pub articles: Vec<NewsArticle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct GlobalQuote {
    #[serde(rename = "05. price")]
    price: Option<String>,
    #[serde(rename = "08. previous close")]
    previous_close: Option<String>,
    #[serde(rename = "09. change")]
    change: Option<String>,
    #[serde(rename = "10. change percent")]
    change_percent: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote", default)]
    quote: GlobalQuote,
}

#[derive(Deserialize)]
struct OverviewResponse {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Sector")]
    sector: Option<String>,
}

#[derive(Deserialize)]
struct SearchMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
    #[serde(rename = "8. currency", default)]
    currency: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SearchMatch>,
}

#[derive(Deserialize)]
struct FeedItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    time_published: String,
}

#[derive(Deserialize)]
struct NewsResponse {
    #[serde(default)]
    feed: Vec<FeedItem>,
}

/// `20240105T143000` becomes RFC 3339; anything else passes through.
fn published_at(raw: &str) -> String {
    NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
        .map(|t| t.and_utc().to_rfc3339())
        .unwrap_or_else(|_| raw.to_string())
}

fn provider_decimal(raw: Option<&str>) -> Option<Decimal> {
    let raw = raw?.trim().trim_end_matches('%');
    Decimal::from_str(raw).ok()
}

fn quote_from_global(symbol: &str, quote: GlobalQuote) -> Result<PriceQuote, MarketError> {
    let current_price = provider_decimal(quote.price.as_deref())
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| MarketError::NoQuote(symbol.to_string()))?;
    let previous_close = provider_decimal(quote.previous_close.as_deref());
    let day_change = provider_decimal(quote.change.as_deref())
        .or_else(|| previous_close.map(|prev| current_price - prev))
        .unwrap_or(Decimal::ZERO);
    let day_change_percent = provider_decimal(quote.change_percent.as_deref())
        .or_else(|| {
            previous_close
                .filter(|prev| !prev.is_zero())
                .map(|prev| day_change / prev * Decimal::ONE_HUNDRED)
        })
        .unwrap_or(Decimal::ZERO);
    Ok(PriceQuote {
        symbol: symbol.to_string(),
        current_price,
        previous_close,
        day_change,
        day_change_percent,
        last_updated: Utc::now(),
    })
}

/// Blank fields come back from the provider as `"None"` or `"-"`.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != "None" && v != "-")
}

pub struct AlphaVantageClient {
    client: Client,
    api_key: String,
}

impl AlphaVantageClient {
    pub fn new(api_key: String) -> Self {
        AlphaVantageClient {
            client: Client::new(),
            api_key,
        }
    }

    async fn query<T: for<'de> Deserialize<'de>>(
        &self,
        function: &str,
        params: &[(&str, &str)],
    ) -> Result<T, MarketError> {
        let mut query = params.to_vec();
        query.push(("function", function));
        query.push(("apikey", &self.api_key));
        let url = reqwest::Url::parse_with_params(ALPHA_VANTAGE_URL, &query)
            .map_err(|e| MarketError::Parse(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Status(response.status().as_u16()));
        }
        let body: serde_json::Value = response.json().await?;
        if let Some(note) = body.get("Note").or_else(|| body.get("Information")) {
            return Err(MarketError::Parse(note.to_string()));
        }
        serde_json::from_value(body).map_err(|e| MarketError::Parse(e.to_string()))
    }
}

#[async_trait]
impl QuoteSource for AlphaVantageClient {
    async fn fetch_quote(&self, symbol: &str) -> Result<PriceQuote, MarketError> {
        let response: GlobalQuoteResponse =
            self.query("GLOBAL_QUOTE", &[("symbol", symbol)]).await?;
        quote_from_global(symbol, response.quote)
    }

    async fn fetch_profile(&self, symbol: &str) -> Result<AssetProfile, MarketError> {
        let response: OverviewResponse = self.query("OVERVIEW", &[("symbol", symbol)]).await?;
        Ok(AssetProfile {
            name: present(response.name).unwrap_or_else(|| symbol.to_string()),
            sector: present(response.sector),
        })
    }

    async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, MarketError> {
        let response: SearchResponse = self
            .query("SYMBOL_SEARCH", &[("keywords", query)])
            .await?;
        Ok(response
            .best_matches
            .into_iter()
            .map(|m| SymbolMatch {
                symbol: m.symbol,
                name: m.name,
                currency: m.currency.unwrap_or_else(|| "USD".to_string()),
            })
            .collect())
    }

    async fn news(&self, symbol: &str, count: usize) -> Result<Vec<NewsArticle>, MarketError> {
        let limit = count.to_string();
        let response: NewsResponse = self
            .query("NEWS_SENTIMENT", &[("tickers", symbol), ("limit", &limit)])
            .await?;
        Ok(response
            .feed
            .into_iter()
            .take(count)
            .map(|item| NewsArticle {
                published: published_at(&item.time_published),
                title: item.title,
                summary: item.summary,
                link: item.url,
                publisher: item.source,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub name: String,
    pub current_price: Option<Decimal>,
    pub previous_close: Option<Decimal>,
    pub day_change: Decimal,
    pub day_change_percent: Decimal,
}

/// Price lookups, asset metadata and the watchlist. The provider is optional;
/// cached reads keep working without it.
pub struct MarketService {
    source: Option<Arc<dyn QuoteSource>>,
    cache: Arc<dyn PriceCache>,
    store: Arc<dyn PortfolioStore>,
}

impl MarketService {
    pub fn new(
        source: Option<Arc<dyn QuoteSource>>,
        cache: Arc<dyn PriceCache>,
        store: Arc<dyn PortfolioStore>,
    ) -> Self {
        MarketService {
            source,
            cache,
            store,
        }
    }

    fn require_source(&self) -> Result<&Arc<dyn QuoteSource>, MarketError> {
        self.source.as_ref().ok_or(MarketError::NotConfigured)
    }

    /// Cache first; on a miss, fetch from the provider and cache the result.
    pub async fn current_price(&self, symbol: &str) -> Result<PriceQuote, MarketError> {
        let symbol = validate_stock_symbol(Some(symbol))?;
        if let Some(quote) = self.cache.get_cached_price(&symbol).await? {
            return Ok(quote);
        }
        let quote = self.require_source()?.fetch_quote(&symbol).await?;
        self.cache.cache_price(quote.clone()).await?;
        Ok(quote)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, MarketError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.require_source()?.search(query).await
    }

    /// Latest articles for a symbol, capped at 50. A bad symbol is an error;
    /// a provider failure is reported inside the result.
    pub async fn news(&self, symbol: &str, count: usize) -> Result<NewsReport, MarketError> {
        let symbol = validate_stock_symbol(Some(symbol))?;
        let count = count.clamp(1, MAX_NEWS_COUNT);
        let fetched = match self.require_source() {
            Ok(source) => source.news(&symbol, count).await,
            Err(e) => Err(e),
        };
        let (articles, error) = match fetched {
            Ok(mut articles) => {
                articles.truncate(count);
                (articles, None)
            }
            Err(e) => {
                error!("Error fetching news for {}: {}", symbol, e);
                (Vec::new(), Some(e.to_string()))
            }
        };
        Ok(NewsReport {
            symbol,
            count: articles.len(),
            articles,
            error,
            last_updated: Utc::now(),
        })
    }

    /// Refreshes every non-cash symbol the user holds. Returns how many were
    /// updated; individual failures are logged and skipped.
    pub async fn refresh_prices(&self, user_id: &str) -> Result<usize, MarketError> {
        let source = self.require_source()?;
        let symbols: Vec<String> = self
            .store
            .list_holdings(user_id)
            .await?
            .into_iter()
            .filter(|h| !h.is_cash())
            .map(|h| h.symbol)
            .collect();
        if symbols.is_empty() {
            info!("No symbols to refresh for user {}", user_id);
            return Ok(0);
        }

        let mut updated = 0;
        for symbol in &symbols {
            match source.fetch_quote(symbol).await {
                Ok(quote) => {
                    info!("Updated price for {}: {}", symbol, quote.current_price);
                    self.cache.cache_price(quote).await?;
                    updated += 1;
                }
                Err(e) => warn!("Failed to refresh price for {}: {}", symbol, e),
            }
        }
        info!(
            "Refreshed {}/{} prices for user {}",
            updated,
            symbols.len(),
            user_id
        );
        Ok(updated)
    }

    /// Registers asset metadata the first time a symbol is seen. Never fails:
    /// the asset table is presentation-only.
    pub async fn ensure_asset(&self, symbol: &str) {
        match self.store.get_asset(symbol).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!("Could not look up asset {}: {}", symbol, e);
                return;
            }
        }

        let profile = match &self.source {
            Some(source) => match source.fetch_profile(symbol).await {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!("Could not fetch profile for {}: {}", symbol, e);
                    None
                }
            },
            None => None,
        };
        let asset = Asset {
            symbol: symbol.to_string(),
            name: profile
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| symbol.to_string()),
            sector: profile.and_then(|p| p.sector),
            asset_type: "STOCK".to_string(),
        };
        match self.store.upsert_asset(asset).await {
            Ok(()) => info!("Added new asset: {}", symbol),
            Err(e) => warn!("Could not register asset {}: {}", symbol, e),
        }
    }

    /// Fills in missing sectors for the user's holdings.
    pub async fn update_sectors(&self, user_id: &str) -> Result<usize, MarketError> {
        let source = self.require_source()?;
        let mut updated = 0;
        for holding in self.store.list_holdings(user_id).await? {
            if holding.is_cash() {
                continue;
            }
            let existing = self.store.get_asset(&holding.symbol).await?;
            if existing.as_ref().is_some_and(|a| a.sector.is_some()) {
                continue;
            }
            let profile = match source.fetch_profile(&holding.symbol).await {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Could not fetch sector for {}: {}", holding.symbol, e);
                    continue;
                }
            };
            let Some(sector) = profile.sector else {
                continue;
            };
            let mut asset = existing.unwrap_or_else(|| Asset {
                symbol: holding.symbol.clone(),
                name: profile.name.clone(),
                sector: None,
                asset_type: "STOCK".to_string(),
            });
            info!("Sector for {}: {}", holding.symbol, sector);
            asset.sector = Some(sector);
            self.store.upsert_asset(asset).await?;
            updated += 1;
        }
        Ok(updated)
    }

    pub async fn watchlist(&self, user_id: &str) -> Result<Vec<WatchlistEntry>, MarketError> {
        let mut entries = Vec::new();
        for symbol in self.store.watchlist(user_id).await? {
            let name = match self.store.get_asset(&symbol).await {
                Ok(Some(asset)) => asset.name,
                Ok(None) => symbol.clone(),
                Err(e) => {
                    warn!("Asset lookup failed for {}: {}", symbol, e);
                    symbol.clone()
                }
            };
            let quote = match self.cache.get_cached_price(&symbol).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!("Cached price lookup failed for {}: {}", symbol, e);
                    None
                }
            };
            entries.push(WatchlistEntry {
                name,
                current_price: quote.as_ref().map(|q| q.current_price),
                previous_close: quote.as_ref().and_then(|q| q.previous_close),
                day_change: quote.as_ref().map_or(Decimal::ZERO, |q| q.day_change),
                day_change_percent: quote
                    .as_ref()
                    .map_or(Decimal::ZERO, |q| q.day_change_percent),
                symbol,
            });
        }
        Ok(entries)
    }

    /// Returns the normalized symbol and whether it was newly added.
    pub async fn add_to_watchlist(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<(String, bool), MarketError> {
        let symbol = validate_stock_symbol(Some(symbol))?;
        self.ensure_asset(&symbol).await;
        let added = self.store.add_to_watchlist(user_id, &symbol).await?;
        info!("Watchlist add {} for {} (new: {})", symbol, user_id, added);
        Ok((symbol, added))
    }

    pub async fn remove_from_watchlist(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<bool, MarketError> {
        let symbol = validate_stock_symbol(Some(symbol))?;
        Ok(self.store.remove_from_watchlist(user_id, &symbol).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Holding;
    use crate::prices::MemoryPriceCache;
    use crate::store::{AssetStore, HoldingChange, LedgerCommit, LedgerStore, MemoryStore};
    use crate::models::{Transaction, TransactionType};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Quote source backed by fixed prices; counts fetches.
    #[derive(Default)]
    pub(crate) struct StaticSource {
        pub prices: HashMap<String, Decimal>,
        pub sectors: HashMap<String, String>,
        pub news: HashMap<String, Vec<NewsArticle>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StaticSource {
        pub fn with_prices(prices: &[(&str, Decimal)]) -> Self {
            StaticSource {
                prices: prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QuoteSource for StaticSource {
        async fn fetch_quote(&self, symbol: &str) -> Result<PriceQuote, MarketError> {
            self.calls.lock().unwrap().push(symbol.to_string());
            let price = self
                .prices
                .get(symbol)
                .ok_or_else(|| MarketError::NoQuote(symbol.to_string()))?;
            Ok(PriceQuote {
                symbol: symbol.to_string(),
                current_price: *price,
                previous_close: Some(*price - dec!(1)),
                day_change: dec!(1),
                day_change_percent: dec!(1),
                last_updated: Utc::now(),
            })
        }

        async fn fetch_profile(&self, symbol: &str) -> Result<AssetProfile, MarketError> {
            Ok(AssetProfile {
                name: format!("{} Inc", symbol),
                sector: self.sectors.get(symbol).cloned(),
            })
        }

        async fn search(&self, query: &str) -> Result<Vec<SymbolMatch>, MarketError> {
            Ok(self
                .prices
                .keys()
                .filter(|s| s.starts_with(&query.to_uppercase()))
                .map(|s| SymbolMatch {
                    symbol: s.clone(),
                    name: s.clone(),
                    currency: "USD".into(),
                })
                .collect())
        }

        async fn news(&self, symbol: &str, count: usize) -> Result<Vec<NewsArticle>, MarketError> {
            let articles = self.news.get(symbol).ok_or(MarketError::Status(503))?;
            Ok(articles.iter().take(count).cloned().collect())
        }
    }

    pub(crate) fn article(title: &str) -> NewsArticle {
        NewsArticle {
            title: title.to_string(),
            summary: format!("{} summary", title),
            link: format!("https://news.test/{}", title),
            publisher: "Wire".to_string(),
            published: "2024-01-05T14:30:00+00:00".to_string(),
        }
    }

    fn service(source: Option<Arc<StaticSource>>) -> (Arc<MemoryStore>, MarketService) {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        let source = source.map(|s| s as Arc<dyn QuoteSource>);
        let svc = MarketService::new(source, Arc::new(MemoryPriceCache::new()), store.clone());
        (store, svc)
    }

    async fn hold(store: &MemoryStore, symbol: &str) {
        store
            .commit(LedgerCommit {
                holdings: vec![HoldingChange::Upsert(Holding::new(
                    "u1",
                    symbol,
                    dec!(1),
                    dec!(10),
                ))],
                transaction: Transaction::record(
                    "u1",
                    symbol,
                    TransactionType::Buy,
                    dec!(1),
                    dec!(10),
                    Utc::now(),
                    None,
                    Decimal::ZERO,
                ),
            })
            .await
            .unwrap();
    }

    #[test]
    fn global_quote_parses_provider_strings() {
        let body = json!({
            "Global Quote": {
                "01. symbol": "IBM",
                "05. price": "182.5000",
                "08. previous close": "180.0000",
                "09. change": "2.5000",
                "10. change percent": "1.3889%"
            }
        });
        let response: GlobalQuoteResponse = serde_json::from_value(body).unwrap();
        let quote = quote_from_global("IBM", response.quote).unwrap();
        assert_eq!(quote.current_price, dec!(182.5));
        assert_eq!(quote.previous_close, Some(dec!(180)));
        assert_eq!(quote.day_change, dec!(2.5));
        assert_eq!(quote.day_change_percent, dec!(1.3889));
    }

    #[test]
    fn empty_global_quote_is_no_quote() {
        let response: GlobalQuoteResponse =
            serde_json::from_value(json!({ "Global Quote": {} })).unwrap();
        assert!(matches!(
            quote_from_global("NOPE", response.quote),
            Err(MarketError::NoQuote(_))
        ));
    }

    #[test]
    fn blank_overview_fields_are_dropped() {
        assert_eq!(present(Some("None".into())), None);
        assert_eq!(present(Some("TECHNOLOGY".into())), Some("TECHNOLOGY".into()));
    }

    #[tokio::test]
    async fn current_price_hits_provider_once() {
        let source = Arc::new(StaticSource::with_prices(&[("AAPL", dec!(150))]));
        let (_, svc) = service(Some(source.clone()));

        assert_eq!(svc.current_price("aapl").await.unwrap().current_price, dec!(150));
        assert_eq!(svc.current_price("AAPL").await.unwrap().current_price, dec!(150));
        assert_eq!(source.calls(), vec!["AAPL"]);
    }

    #[tokio::test]
    async fn current_price_without_provider_or_cache() {
        let (_, svc) = service(None);
        assert!(matches!(
            svc.current_price("AAPL").await,
            Err(MarketError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn refresh_counts_successes_only() {
        let source = Arc::new(StaticSource::with_prices(&[("AAPL", dec!(150))]));
        let (store, svc) = service(Some(source.clone()));
        hold(&store, "AAPL").await;
        hold(&store, "ZZZZ").await;

        assert_eq!(svc.refresh_prices("u1").await.unwrap(), 1);
        assert!(svc.cache.get_cached_price("AAPL").await.unwrap().is_some());
        assert!(!source.calls().contains(&"CASH".to_string()));
        assert_eq!(svc.refresh_prices("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ensure_asset_falls_back_to_symbol() {
        let (store, svc) = service(None);
        svc.ensure_asset("XYZ").await;
        let asset = store.get_asset("XYZ").await.unwrap().unwrap();
        assert_eq!(asset.name, "XYZ");
        assert_eq!(asset.sector, None);
    }

    #[tokio::test]
    async fn update_sectors_fills_only_missing() {
        let mut source = StaticSource::with_prices(&[]);
        source.sectors.insert("AAPL".into(), "TECHNOLOGY".into());
        let (store, svc) = service(Some(Arc::new(source)));
        hold(&store, "AAPL").await;
        hold(&store, "KO").await;

        assert_eq!(svc.update_sectors("u1").await.unwrap(), 1);
        let asset = store.get_asset("AAPL").await.unwrap().unwrap();
        assert_eq!(asset.sector.as_deref(), Some("TECHNOLOGY"));
        assert_eq!(svc.update_sectors("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn watchlist_round_trip_with_cached_prices() {
        let source = Arc::new(StaticSource::with_prices(&[("TSLA", dec!(200))]));
        let (_, svc) = service(Some(source));

        let (symbol, added) = svc.add_to_watchlist("u1", "tsla").await.unwrap();
        assert_eq!(symbol, "TSLA");
        assert!(added);
        assert!(!svc.add_to_watchlist("u1", "TSLA").await.unwrap().1);

        let entries = svc.watchlist("u1").await.unwrap();
        assert_eq!(entries[0].name, "TSLA Inc");
        assert_eq!(entries[0].current_price, None);

        svc.current_price("TSLA").await.unwrap();
        let entries = svc.watchlist("u1").await.unwrap();
        assert_eq!(entries[0].current_price, Some(dec!(200)));

        assert!(svc.remove_from_watchlist("u1", "TSLA").await.unwrap());
        assert!(svc.watchlist("u1").await.unwrap().is_empty());
        assert!(matches!(
            svc.add_to_watchlist("u1", "BAD SYMBOL").await,
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn news_timestamps_become_rfc3339() {
        assert_eq!(published_at("20240105T143000"), "2024-01-05T14:30:00+00:00");
        assert_eq!(published_at("yesterday"), "yesterday");
    }

    #[tokio::test]
    async fn news_is_capped_and_degrades_on_provider_failure() {
        let mut source = StaticSource::default();
        source.news.insert(
            "AAPL".into(),
            vec![article("one"), article("two"), article("three")],
        );
        let (_, svc) = service(Some(Arc::new(source)));

        let report = svc.news("aapl", 2).await.unwrap();
        assert_eq!(report.symbol, "AAPL");
        assert_eq!(report.count, 2);
        assert_eq!(report.articles[0].title, "one");
        assert!(report.error.is_none());

        let report = svc.news("MSFT", 5).await.unwrap();
        assert_eq!(report.count, 0);
        assert!(report.articles.is_empty());
        assert_eq!(
            report.error.as_deref(),
            Some("Failed to fetch data: HTTP 503")
        );

        assert!(matches!(
            svc.news("BAD SYMBOL", 5).await,
            Err(MarketError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn news_without_provider_reports_error() {
        let (_, svc) = service(None);
        let report = svc.news("AAPL", 5).await.unwrap();
        assert!(report.articles.is_empty());
        assert!(report.error.is_some());
    }
}
