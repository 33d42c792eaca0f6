// src/analytics.rs
//! Read-only valuation over ledger state and cached prices.
//!
//! A price lookup failure values that symbol at zero instead of failing the
//! whole computation. Storage failures still propagate.

use crate::error::ValidationError;
use crate::ledger::{Ledger, LedgerResult};
use crate::models::{Holding, PortfolioSnapshot, PriceQuote, TransactionType};
use crate::prices::PriceCache;
use crate::store::{PortfolioStore, TransactionFilter};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_PERIOD_DAYS: i64 = 30;
pub const MAX_PERIOD_DAYS: i64 = 3650;
const TOP_HOLDINGS: usize = 5;

/// Lookback window for a chart period code.
pub fn period_days(period: &str) -> i64 {
    match period {
        "1W" => 7,
        "1M" => 30,
        "3M" => 90,
        "6M" => 180,
        "1Y" => 365,
        "MAX" => MAX_PERIOD_DAYS,
        _ => DEFAULT_PERIOD_DAYS,
    }
}

/// Start of a lookback window of `days` days, which must be in
/// `1..=MAX_PERIOD_DAYS`.
fn window_start(days: i64) -> Result<DateTime<Utc>, ValidationError> {
    let out_of_range = || ValidationError::OutOfRange("days".into());
    if !(1..=MAX_PERIOD_DAYS).contains(&days) {
        return Err(out_of_range());
    }
    Duration::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(out_of_range)
}

/// Valuation saturates instead of panicking on extreme prices.
fn percent(part: Decimal, whole: Decimal) -> Decimal {
    part.checked_div(whole)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO)
}

fn saturating_total(values: impl Iterator<Item = Decimal>) -> Decimal {
    values.fold(Decimal::ZERO, Decimal::saturating_add)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingView {
    pub symbol: String,
    pub name: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub total_cost: Decimal,
    pub gain_loss: Decimal,
    pub gain_loss_percent: Decimal,
    pub day_change: Decimal,
    pub day_change_percent: Decimal,
    pub realized_gain_loss: Decimal,
    pub sector: Option<String>,
}

impl HoldingView {
    fn cash(holding: &Holding) -> Self {
        HoldingView {
            symbol: holding.symbol.clone(),
            name: "Cash".to_string(),
            quantity: holding.quantity,
            average_cost: Decimal::ONE,
            current_price: Decimal::ONE,
            market_value: holding.quantity,
            total_cost: holding.quantity,
            gain_loss: Decimal::ZERO,
            gain_loss_percent: Decimal::ZERO,
            day_change: Decimal::ZERO,
            day_change_percent: Decimal::ZERO,
            realized_gain_loss: Decimal::ZERO,
            sector: None,
        }
    }

    fn is_cash(&self) -> bool {
        self.symbol == crate::models::CASH_SYMBOL
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioTotals {
    pub total_market_value: Decimal,
    pub total_cost_basis: Decimal,
    pub total_gain_loss: Decimal,
    pub total_gain_loss_percent: Decimal,
    pub total_realized_gain_loss: Decimal,
    pub cash_balance: Decimal,
    pub total_positions: usize,
    pub holdings_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performance {
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub total_gain_loss: Decimal,
    pub total_return_percent: Decimal,
    pub day_change: Decimal,
    pub day_change_percent: Decimal,
    pub cash_balance: Decimal,
    pub invested_amount: Decimal,
    pub positions_count: usize,
    pub as_of_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationBucket {
    pub value: Decimal,
    pub count: usize,
    pub percentage: Decimal,
}

pub type Allocation = BTreeMap<String, AllocationBucket>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopHolding {
    pub symbol: String,
    pub name: String,
    pub quantity: Decimal,
    pub market_value: Decimal,
    pub percentage_of_portfolio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub performance: Performance,
    pub asset_allocation: Allocation,
    pub top_holdings: Vec<TopHolding>,
    pub portfolio_totals: PortfolioTotals,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioDetails {
    pub summary: PortfolioTotals,
    pub holdings: Vec<HoldingView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionMetrics {
    pub period_days: i64,
    pub total_invested: Decimal,
    pub total_divested: Decimal,
    pub net_cash_flow: Decimal,
    pub transaction_count: usize,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValuePoint {
    pub date: NaiveDate,
    pub total_value: Decimal,
    pub cumulative_change: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueHistory {
    pub chart_data: Vec<ValuePoint>,
    pub period_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HistoricalPerformance {
    InsufficientData {
        period_days: i64,
        insufficient_data: bool,
        message: String,
        calculated_at: DateTime<Utc>,
    },
    Period {
        period_days: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_value: Decimal,
        end_value: Decimal,
        value_change: Decimal,
        percent_change: Decimal,
        snapshots_count: usize,
        transaction_metrics: TransactionMetrics,
        calculated_at: DateTime<Utc>,
    },
}

pub struct Analytics {
    ledger: Arc<Ledger>,
    store: Arc<dyn PortfolioStore>,
    cache: Arc<dyn PriceCache>,
}

impl Analytics {
    pub fn new(
        ledger: Arc<Ledger>,
        store: Arc<dyn PortfolioStore>,
        cache: Arc<dyn PriceCache>,
    ) -> Self {
        Analytics {
            ledger,
            store,
            cache,
        }
    }

    async fn cached_quote(&self, symbol: &str) -> Option<PriceQuote> {
        match self.cache.get_cached_price(symbol).await {
            Ok(Some(quote)) => Some(quote),
            Ok(None) => {
                warn!("No cached price for {}, valuing at 0", symbol);
                None
            }
            Err(e) => {
                warn!("Price lookup failed for {}: {}", symbol, e);
                None
            }
        }
    }

    async fn view(&self, holding: &Holding) -> LedgerResult<HoldingView> {
        if holding.is_cash() {
            return Ok(HoldingView::cash(holding));
        }
        let quote = self.cached_quote(&holding.symbol).await;
        let (name, sector) = match self.store.get_asset(&holding.symbol).await {
            Ok(Some(asset)) => (asset.name, asset.sector),
            Ok(None) => (holding.symbol.clone(), None),
            Err(e) => {
                warn!("Asset lookup failed for {}: {}", holding.symbol, e);
                (holding.symbol.clone(), None)
            }
        };
        let current_price = quote.as_ref().map_or(Decimal::ZERO, |q| q.current_price);
        let market_value = holding.quantity.saturating_mul(current_price);
        let total_cost = holding.quantity.saturating_mul(holding.average_cost);
        let gain_loss = market_value.saturating_sub(total_cost);
        let realized_gain_loss = self
            .ledger
            .realized_gain_loss_for_symbol(&holding.user_id, &holding.symbol)
            .await?;

        Ok(HoldingView {
            symbol: holding.symbol.clone(),
            name,
            quantity: holding.quantity,
            average_cost: holding.average_cost,
            current_price,
            market_value,
            total_cost,
            gain_loss,
            gain_loss_percent: percent(gain_loss, total_cost),
            day_change: quote.as_ref().map_or(Decimal::ZERO, |q| q.day_change),
            day_change_percent: quote.as_ref().map_or(Decimal::ZERO, |q| q.day_change_percent),
            realized_gain_loss,
            sector,
        })
    }

    pub async fn holdings(&self, user_id: &str) -> LedgerResult<Vec<HoldingView>> {
        let mut views = Vec::new();
        for holding in self.ledger.holdings(user_id).await? {
            views.push(self.view(&holding).await?);
        }
        Ok(views)
    }

    async fn totals_for(
        &self,
        user_id: &str,
        holdings: &[HoldingView],
    ) -> LedgerResult<PortfolioTotals> {
        let total_market_value = saturating_total(holdings.iter().map(|h| h.market_value));
        let total_cost_basis = saturating_total(holdings.iter().map(|h| h.total_cost));
        let total_gain_loss = total_market_value.saturating_sub(total_cost_basis);
        Ok(PortfolioTotals {
            total_market_value,
            total_cost_basis,
            total_gain_loss,
            total_gain_loss_percent: percent(total_gain_loss, total_cost_basis),
            total_realized_gain_loss: self.ledger.total_realized_gain_loss(user_id).await?,
            cash_balance: holdings
                .iter()
                .find(|h| h.is_cash())
                .map_or(Decimal::ZERO, |h| h.quantity),
            total_positions: holdings
                .iter()
                .filter(|h| !h.is_cash() && !h.quantity.is_zero())
                .count(),
            holdings_count: holdings.len(),
        })
    }

    pub async fn totals(&self, user_id: &str) -> LedgerResult<PortfolioTotals> {
        let holdings = self.holdings(user_id).await?;
        self.totals_for(user_id, &holdings).await
    }

    pub async fn portfolio(&self, user_id: &str) -> LedgerResult<PortfolioDetails> {
        let holdings = self.holdings(user_id).await?;
        let summary = self.totals_for(user_id, &holdings).await?;
        Ok(PortfolioDetails { summary, holdings })
    }

    fn performance_for(holdings: &[HoldingView], totals: &PortfolioTotals) -> Performance {
        let total_value = totals.total_market_value;
        let day_change = saturating_total(
            holdings
                .iter()
                .filter(|h| !h.is_cash())
                .map(|h| h.day_change.saturating_mul(h.quantity)),
        );
        let base = total_value.saturating_sub(day_change);
        let day_change_percent = if base > Decimal::ZERO {
            percent(day_change, base)
        } else {
            Decimal::ZERO
        };
        Performance {
            total_value: total_value.round_dp(2),
            total_cost: totals.total_cost_basis.round_dp(2),
            total_gain_loss: totals.total_gain_loss.round_dp(2),
            total_return_percent: totals.total_gain_loss_percent.round_dp(2),
            day_change: day_change.round_dp(2),
            day_change_percent: day_change_percent.round_dp(2),
            cash_balance: totals.cash_balance.round_dp(2),
            invested_amount: total_value.saturating_sub(totals.cash_balance).round_dp(2),
            positions_count: totals.total_positions,
            as_of_date: Utc::now(),
        }
    }

    pub async fn performance(&self, user_id: &str) -> LedgerResult<Performance> {
        let holdings = self.holdings(user_id).await?;
        let totals = self.totals_for(user_id, &holdings).await?;
        Ok(Self::performance_for(&holdings, &totals))
    }

    fn allocation_for(holdings: &[HoldingView]) -> Allocation {
        let mut allocation = Allocation::new();
        let mut total_value = Decimal::ZERO;
        for holding in holdings.iter().filter(|h| h.quantity > Decimal::ZERO) {
            let bucket = if holding.is_cash() { "Cash" } else { "Stocks" };
            let entry = allocation
                .entry(bucket.to_string())
                .or_insert(AllocationBucket {
                    value: Decimal::ZERO,
                    count: 0,
                    percentage: Decimal::ZERO,
                });
            entry.value = entry.value.saturating_add(holding.market_value);
            entry.count += 1;
            total_value = total_value.saturating_add(holding.market_value);
        }
        for bucket in allocation.values_mut() {
            bucket.percentage = if total_value > Decimal::ZERO {
                percent(bucket.value, total_value).round_dp(1)
            } else {
                Decimal::ZERO
            };
            bucket.value = bucket.value.round_dp(2);
        }
        allocation
    }

    pub async fn allocation(&self, user_id: &str) -> LedgerResult<Allocation> {
        Ok(Self::allocation_for(&self.holdings(user_id).await?))
    }

    pub async fn summary(&self, user_id: &str) -> LedgerResult<PortfolioSummary> {
        let holdings = self.holdings(user_id).await?;
        let totals = self.totals_for(user_id, &holdings).await?;

        let mut stocks: Vec<&HoldingView> = holdings
            .iter()
            .filter(|h| !h.is_cash() && h.quantity > Decimal::ZERO)
            .collect();
        stocks.sort_by(|a, b| b.market_value.cmp(&a.market_value));
        let top_holdings = stocks
            .into_iter()
            .take(TOP_HOLDINGS)
            .map(|h| TopHolding {
                symbol: h.symbol.clone(),
                name: h.name.clone(),
                quantity: h.quantity,
                market_value: h.market_value,
                percentage_of_portfolio: if totals.total_market_value > Decimal::ZERO {
                    percent(h.market_value, totals.total_market_value)
                } else {
                    Decimal::ZERO
                },
            })
            .collect();

        Ok(PortfolioSummary {
            performance: Self::performance_for(&holdings, &totals),
            asset_allocation: Self::allocation_for(&holdings),
            top_holdings,
            portfolio_totals: totals,
            generated_at: Utc::now(),
        })
    }

    pub async fn transaction_metrics(
        &self,
        user_id: &str,
        days: i64,
    ) -> LedgerResult<TransactionMetrics> {
        let cutoff = window_start(days)?;
        let recent: Vec<_> = self
            .store
            .list_transactions(user_id, &TransactionFilter::default())
            .await?
            .into_iter()
            .filter(|tx| tx.transaction_date >= cutoff)
            .collect();
        let total_of = |kind: TransactionType| -> Decimal {
            recent
                .iter()
                .filter(|tx| tx.transaction_type == kind)
                .map(|tx| tx.total_amount)
                .fold(Decimal::ZERO, Decimal::saturating_add)
        };
        Ok(TransactionMetrics {
            period_days: days,
            total_invested: total_of(TransactionType::Buy).round_dp(2),
            total_divested: total_of(TransactionType::Sell).round_dp(2),
            net_cash_flow: total_of(TransactionType::Deposit)
                .saturating_sub(total_of(TransactionType::Withdrawal))
                .round_dp(2),
            transaction_count: recent.len(),
            calculated_at: Utc::now(),
        })
    }

    /// Records the portfolio value for `date` (today by default), replacing
    /// any earlier snapshot for that day. Without a value, the current total
    /// market value is used.
    pub async fn store_snapshot(
        &self,
        user_id: &str,
        total_value: Option<Decimal>,
        date: Option<NaiveDate>,
    ) -> LedgerResult<PortfolioSnapshot> {
        let total_value = match total_value {
            Some(value) => value,
            None => self.totals(user_id).await?.total_market_value,
        };
        let snapshot = PortfolioSnapshot {
            user_id: user_id.to_string(),
            date: date.unwrap_or_else(|| Utc::now().date_naive()),
            total_value,
            created_at: Utc::now(),
        };
        let stored = self.store.upsert_snapshot(snapshot).await?;
        info!(
            "Stored snapshot for {} on {}: {}",
            user_id, stored.date, stored.total_value
        );
        Ok(stored)
    }

    /// Snapshots from the last `days` days, oldest first, each carrying the
    /// running change since the first point.
    pub async fn value_history(&self, user_id: &str, days: i64) -> LedgerResult<ValueHistory> {
        let since = window_start(days)?.date_naive();
        let snapshots = self.store.snapshots_since(user_id, since).await?;
        let first = snapshots.first().map(|s| s.total_value);
        let chart_data = snapshots
            .into_iter()
            .map(|s| ValuePoint {
                date: s.date,
                cumulative_change: first
                    .map_or(Decimal::ZERO, |f| s.total_value.saturating_sub(f)),
                total_value: s.total_value,
            })
            .collect();
        Ok(ValueHistory {
            chart_data,
            period_days: days,
        })
    }

    /// Value history for a period code. With no snapshots yet, a single point
    /// carries today's value.
    pub async fn chart(&self, user_id: &str, period: &str) -> LedgerResult<ValueHistory> {
        let mut history = self.value_history(user_id, period_days(period)).await?;
        if history.chart_data.is_empty() {
            let current = self.totals(user_id).await?.total_market_value;
            history.chart_data.push(ValuePoint {
                date: Utc::now().date_naive(),
                total_value: current.round_dp(2),
                cumulative_change: Decimal::ZERO,
            });
        }
        Ok(history)
    }

    pub async fn historical_performance(
        &self,
        user_id: &str,
        days: i64,
    ) -> LedgerResult<HistoricalPerformance> {
        let history = self.value_history(user_id, days).await?;
        let (first, last) = match (history.chart_data.first(), history.chart_data.last()) {
            (Some(first), Some(last)) if history.chart_data.len() >= 2 => (first, last),
            _ => {
                return Ok(HistoricalPerformance::InsufficientData {
                    period_days: days,
                    insufficient_data: true,
                    message: "Need at least 2 portfolio snapshots for historical analysis"
                        .to_string(),
                    calculated_at: Utc::now(),
                })
            }
        };
        let value_change = last.total_value.saturating_sub(first.total_value);
        let percent_change = if first.total_value > Decimal::ZERO {
            percent(value_change, first.total_value)
        } else {
            Decimal::ZERO
        };
        Ok(HistoricalPerformance::Period {
            period_days: days,
            start_date: first.date,
            end_date: last.date,
            start_value: first.total_value.round_dp(2),
            end_value: last.total_value.round_dp(2),
            value_change: value_change.round_dp(2),
            percent_change: percent_change.round_dp(2),
            snapshots_count: history.chart_data.len(),
            transaction_metrics: self.transaction_metrics(user_id, days).await?,
            calculated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::EntryMeta;
    use crate::models::Asset;
    use crate::prices::MemoryPriceCache;
    use crate::store::{AssetStore, MemoryStore, SnapshotStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryPriceCache>,
        ledger: Arc<Ledger>,
        analytics: Analytics,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryPriceCache::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let analytics = Analytics::new(ledger.clone(), store.clone(), cache.clone());
        Fixture {
            store,
            cache,
            ledger,
            analytics,
        }
    }

    async fn price(cache: &MemoryPriceCache, symbol: &str, price: Decimal, change: Decimal) {
        cache
            .cache_price(PriceQuote {
                symbol: symbol.into(),
                current_price: price,
                previous_close: Some(price - change),
                day_change: change,
                day_change_percent: Decimal::ZERO,
                last_updated: Utc::now(),
            })
            .await
            .unwrap();
    }

    /// CASH 900, AAPL 10 @ avg 110.
    async fn seeded() -> Fixture {
        let f = fixture();
        let meta = EntryMeta::default;
        f.ledger.apply_deposit("u1", dec!(2000), meta()).await.unwrap();
        f.ledger
            .apply_buy("u1", "AAPL", dec!(5), dec!(100), meta())
            .await
            .unwrap();
        f.ledger
            .apply_buy("u1", "AAPL", dec!(5), dec!(120), meta())
            .await
            .unwrap();
        f
    }

    #[test]
    fn period_codes_map_to_days() {
        assert_eq!(period_days("1W"), 7);
        assert_eq!(period_days("1Y"), 365);
        assert_eq!(period_days("MAX"), 3650);
        assert_eq!(period_days("2D"), 30);
    }

    #[tokio::test]
    async fn holding_view_uses_cached_price_and_metadata() {
        let f = seeded().await;
        price(&f.cache, "AAPL", dec!(150), dec!(2)).await;
        f.store
            .upsert_asset(Asset {
                symbol: "AAPL".into(),
                name: "Apple Inc".into(),
                sector: Some("TECHNOLOGY".into()),
                asset_type: "STOCK".into(),
            })
            .await
            .unwrap();

        let views = f.analytics.holdings("u1").await.unwrap();
        let aapl = views.iter().find(|h| h.symbol == "AAPL").unwrap();
        assert_eq!(aapl.name, "Apple Inc");
        assert_eq!(aapl.market_value, dec!(1500));
        assert_eq!(aapl.total_cost, dec!(1100));
        assert_eq!(aapl.gain_loss, dec!(400));
        assert_eq!(aapl.gain_loss_percent.round_dp(4), dec!(36.3636));
        assert_eq!(aapl.sector.as_deref(), Some("TECHNOLOGY"));

        let cash = views.iter().find(|h| h.symbol == "CASH").unwrap();
        assert_eq!(cash.market_value, dec!(900));
        assert_eq!(cash.gain_loss, Decimal::ZERO);
    }

    #[tokio::test]
    async fn missing_price_values_holding_at_zero() {
        let f = seeded().await;
        let totals = f.analytics.totals("u1").await.unwrap();
        assert_eq!(totals.total_market_value, dec!(900));
        assert_eq!(totals.total_cost_basis, dec!(2000));
        assert_eq!(totals.total_gain_loss, dec!(-1100));
        assert_eq!(totals.cash_balance, dec!(900));
        assert_eq!(totals.total_positions, 1);
        assert_eq!(totals.holdings_count, 2);
    }

    #[tokio::test]
    async fn zero_cost_basis_gives_zero_percent() {
        let f = fixture();
        let totals = f.analytics.totals("empty").await.unwrap();
        assert_eq!(totals.total_gain_loss_percent, Decimal::ZERO);
        assert_eq!(totals.holdings_count, 0);
    }

    #[tokio::test]
    async fn realized_totals_survive_closed_positions() {
        let f = seeded().await;
        f.ledger
            .apply_sell("u1", "AAPL", dec!(10), dec!(150), EntryMeta::default())
            .await
            .unwrap();
        let totals = f.analytics.totals("u1").await.unwrap();
        // 5*(150-100) + 5*(150-120)
        assert_eq!(totals.total_realized_gain_loss, dec!(400));
        assert_eq!(totals.total_positions, 0);
    }

    #[tokio::test]
    async fn performance_day_change() {
        let f = seeded().await;
        price(&f.cache, "AAPL", dec!(150), dec!(3)).await;
        let perf = f.analytics.performance("u1").await.unwrap();
        assert_eq!(perf.total_value, dec!(2400));
        assert_eq!(perf.day_change, dec!(30));
        // 30 / (2400 - 30) * 100
        assert_eq!(perf.day_change_percent, dec!(1.27));
        assert_eq!(perf.invested_amount, dec!(1500));
        assert_eq!(perf.positions_count, 1);
    }

    #[tokio::test]
    async fn allocation_splits_cash_and_stocks() {
        let f = seeded().await;
        price(&f.cache, "AAPL", dec!(210), dec!(0)).await;
        let allocation = f.analytics.allocation("u1").await.unwrap();
        assert_eq!(allocation["Cash"].value, dec!(900));
        assert_eq!(allocation["Cash"].percentage, dec!(30.0));
        assert_eq!(allocation["Stocks"].value, dec!(2100));
        assert_eq!(allocation["Stocks"].percentage, dec!(70.0));
        assert_eq!(allocation["Stocks"].count, 1);
    }

    #[tokio::test]
    async fn allocation_skips_overdrawn_cash() {
        let f = fixture();
        f.ledger
            .apply_withdrawal("u1", dec!(50), EntryMeta::default())
            .await
            .unwrap();
        assert!(f.analytics.allocation("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_ranks_top_holdings() {
        let f = fixture();
        f.ledger
            .apply_deposit("u1", dec!(100000), EntryMeta::default())
            .await
            .unwrap();
        for (i, symbol) in ["A", "B", "C", "D", "E", "F"].iter().enumerate() {
            let px = Decimal::from(10 * (i + 1));
            f.ledger
                .apply_buy("u1", symbol, dec!(1), px, EntryMeta::default())
                .await
                .unwrap();
            price(&f.cache, symbol, px, Decimal::ZERO).await;
        }
        let summary = f.analytics.summary("u1").await.unwrap();
        let top: Vec<&str> = summary
            .top_holdings
            .iter()
            .map(|h| h.symbol.as_str())
            .collect();
        assert_eq!(top, vec!["F", "E", "D", "C", "B"]);
        assert!(summary.top_holdings[0].percentage_of_portfolio > Decimal::ZERO);
    }

    #[tokio::test]
    async fn transaction_metrics_over_window() {
        let f = seeded().await;
        f.ledger
            .apply_sell("u1", "AAPL", dec!(2), dec!(130), EntryMeta::default())
            .await
            .unwrap();
        f.ledger
            .apply_withdrawal("u1", dec!(300), EntryMeta::default())
            .await
            .unwrap();
        f.ledger
            .apply_deposit(
                "u1",
                dec!(5000),
                EntryMeta {
                    transaction_date: Some(Utc::now() - Duration::days(90)),
                    notes: None,
                },
            )
            .await
            .unwrap();

        let m = f.analytics.transaction_metrics("u1", 30).await.unwrap();
        assert_eq!(m.total_invested, dec!(1100));
        assert_eq!(m.total_divested, dec!(260));
        assert_eq!(m.net_cash_flow, dec!(1700));
        assert_eq!(m.transaction_count, 5);
    }

    async fn snapshot(f: &Fixture, days_ago: i64, value: Decimal) {
        let date = (Utc::now() - Duration::days(days_ago)).date_naive();
        f.store
            .upsert_snapshot(PortfolioSnapshot {
                user_id: "u1".into(),
                date,
                total_value: value,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn value_history_accumulates_changes() {
        let f = fixture();
        snapshot(&f, 40, dec!(50)).await;
        snapshot(&f, 3, dec!(100)).await;
        snapshot(&f, 2, dec!(110)).await;
        snapshot(&f, 1, dec!(95)).await;

        let history = f.analytics.value_history("u1", 7).await.unwrap();
        let changes: Vec<Decimal> = history
            .chart_data
            .iter()
            .map(|p| p.cumulative_change)
            .collect();
        assert_eq!(changes, vec![dec!(0), dec!(10), dec!(-5)]);
    }

    #[tokio::test]
    async fn chart_falls_back_to_current_value() {
        let f = seeded().await;
        let chart = f.analytics.chart("u1", "1W").await.unwrap();
        assert_eq!(chart.period_days, 7);
        assert_eq!(chart.chart_data.len(), 1);
        assert_eq!(chart.chart_data[0].total_value, dec!(900));
    }

    #[tokio::test]
    async fn store_snapshot_replaces_same_day() {
        let f = seeded().await;
        f.analytics
            .store_snapshot("u1", Some(dec!(1)), None)
            .await
            .unwrap();
        let stored = f.analytics.store_snapshot("u1", None, None).await.unwrap();
        assert_eq!(stored.total_value, dec!(900));
        let history = f.analytics.value_history("u1", 1).await.unwrap();
        assert_eq!(history.chart_data.len(), 1);
    }

    #[tokio::test]
    async fn historical_performance_needs_two_snapshots() {
        let f = fixture();
        snapshot(&f, 5, dec!(100)).await;
        let result = f.analytics.historical_performance("u1", 30).await.unwrap();
        assert!(matches!(result, HistoricalPerformance::InsufficientData { .. }));

        snapshot(&f, 1, dec!(125)).await;
        match f.analytics.historical_performance("u1", 30).await.unwrap() {
            HistoricalPerformance::Period {
                value_change,
                percent_change,
                snapshots_count,
                ..
            } => {
                assert_eq!(value_change, dec!(25));
                assert_eq!(percent_change, dec!(25));
                assert_eq!(snapshots_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn lookback_outside_supported_window_is_rejected() {
        let f = fixture();
        for days in [0, -3, MAX_PERIOD_DAYS + 1, 1_000_000_000, i64::MAX] {
            let err = f
                .analytics
                .historical_performance("u1", days)
                .await
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    LedgerError::Validation(ValidationError::OutOfRange(ref field)) if field == "days"
                ),
                "days={} gave {:?}",
                days,
                err
            );
        }
        assert!(f.analytics.transaction_metrics("u1", MAX_PERIOD_DAYS).await.is_ok());
    }

    #[tokio::test]
    async fn extreme_prices_saturate_instead_of_panicking() {
        let f = fixture();
        f.ledger
            .apply_deposit("u1", Decimal::MAX - dec!(10), EntryMeta::default())
            .await
            .unwrap();
        f.ledger
            .apply_buy("u1", "AAPL", dec!(2), dec!(5), EntryMeta::default())
            .await
            .unwrap();
        price(&f.cache, "AAPL", Decimal::MAX, dec!(0)).await;

        let totals = f.analytics.totals("u1").await.unwrap();
        assert_eq!(totals.total_market_value, Decimal::MAX);
        assert!(f.analytics.performance("u1").await.is_ok());
        assert!(f.analytics.summary("u1").await.is_ok());
    }
}
