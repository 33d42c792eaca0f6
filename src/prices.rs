// src/prices.rs
use crate::error::MarketError;
use crate::models::PriceQuote;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Last-known quote per symbol. Lookups never reach the provider.
#[async_trait]
pub trait PriceCache: Send + Sync {
    async fn get_cached_price(&self, symbol: &str) -> Result<Option<PriceQuote>, MarketError>;
    async fn cache_price(&self, quote: PriceQuote) -> Result<(), MarketError>;
    async fn all(&self) -> Result<Vec<PriceQuote>, MarketError>;
}

#[derive(Default)]
pub struct MemoryPriceCache {
    quotes: RwLock<HashMap<String, PriceQuote>>,
}

impl MemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> MarketError {
    MarketError::Cache("price cache lock poisoned".into())
}

#[async_trait]
impl PriceCache for MemoryPriceCache {
    async fn get_cached_price(&self, symbol: &str) -> Result<Option<PriceQuote>, MarketError> {
        Ok(self.quotes.read().map_err(poisoned)?.get(symbol).cloned())
    }

    async fn cache_price(&self, quote: PriceQuote) -> Result<(), MarketError> {
        self.quotes
            .write()
            .map_err(poisoned)?
            .insert(quote.symbol.clone(), quote);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PriceQuote>, MarketError> {
        let mut quotes: Vec<PriceQuote> =
            self.quotes.read().map_err(poisoned)?.values().cloned().collect();
        quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(quotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn quote(symbol: &str, price: rust_decimal::Decimal) -> PriceQuote {
        PriceQuote {
            symbol: symbol.into(),
            current_price: price,
            previous_close: None,
            day_change: dec!(0),
            day_change_percent: dec!(0),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_symbol_is_none() {
        let cache = MemoryPriceCache::new();
        assert!(cache.get_cached_price("AAPL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_quote_replaces_earlier() {
        let cache = MemoryPriceCache::new();
        cache.cache_price(quote("AAPL", dec!(150))).await.unwrap();
        cache.cache_price(quote("MSFT", dec!(300))).await.unwrap();
        cache.cache_price(quote("AAPL", dec!(155))).await.unwrap();

        let aapl = cache.get_cached_price("AAPL").await.unwrap().unwrap();
        assert_eq!(aapl.current_price, dec!(155));
        let symbols: Vec<String> = cache
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.symbol)
            .collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    }
}
