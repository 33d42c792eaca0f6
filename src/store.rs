// src/store.rs
//! Storage seams consumed by the ledger and the read-side services.

use crate::error::StorageError;
use crate::models::{Asset, Holding, PortfolioSnapshot, Transaction, TransactionType};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

pub type StoreResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq)]
pub enum HoldingChange {
    Upsert(Holding),
    Delete { user_id: String, symbol: String },
}

/// Everything one ledger operation writes. Applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerCommit {
    pub holdings: Vec<HoldingChange>,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub symbol: Option<String>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.symbol.as_deref().map_or(true, |s| tx.symbol == s)
            && self
                .transaction_type
                .map_or(true, |t| tx.transaction_type == t)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_holding(&self, user_id: &str, symbol: &str) -> StoreResult<Option<Holding>>;
    async fn list_holdings(&self, user_id: &str) -> StoreResult<Vec<Holding>>;
    /// Ordered by `transaction_date` ascending; equal dates keep commit order.
    async fn list_transactions(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>>;
    async fn get_transaction(&self, user_id: &str, id: &str) -> StoreResult<Option<Transaction>>;
    async fn commit(&self, commit: LedgerCommit) -> StoreResult<Transaction>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn upsert_snapshot(&self, snapshot: PortfolioSnapshot) -> StoreResult<PortfolioSnapshot>;
    /// Snapshots dated on or after `since`, oldest first.
    async fn snapshots_since(
        &self,
        user_id: &str,
        since: NaiveDate,
    ) -> StoreResult<Vec<PortfolioSnapshot>>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get_asset(&self, symbol: &str) -> StoreResult<Option<Asset>>;
    async fn upsert_asset(&self, asset: Asset) -> StoreResult<()>;
}

#[async_trait]
pub trait WatchlistStore: Send + Sync {
    async fn watchlist(&self, user_id: &str) -> StoreResult<Vec<String>>;
    /// Returns false when the symbol was already listed.
    async fn add_to_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool>;
    async fn remove_from_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool>;
}

/// Everything the service needs from one backend.
pub trait PortfolioStore: LedgerStore + SnapshotStore + AssetStore + WatchlistStore {}

impl<T: LedgerStore + SnapshotStore + AssetStore + WatchlistStore> PortfolioStore for T {}

#[derive(Default)]
struct Tables {
    holdings: HashMap<(String, String), Holding>,
    transactions: Vec<Transaction>,
    snapshots: BTreeMap<(String, NaiveDate), PortfolioSnapshot>,
    assets: HashMap<String, Asset>,
    watchlist: HashMap<String, Vec<String>>,
}

/// Process-local backend. A single lock covers every table, so a commit is
/// observed either entirely or not at all.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Query("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_holding(&self, user_id: &str, symbol: &str) -> StoreResult<Option<Holding>> {
        let tables = self.lock()?;
        Ok(tables
            .holdings
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn list_holdings(&self, user_id: &str) -> StoreResult<Vec<Holding>> {
        let tables = self.lock()?;
        let mut holdings: Vec<Holding> = tables
            .holdings
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(holdings)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let tables = self.lock()?;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id && filter.matches(tx))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.transaction_date);
        Ok(txs)
    }

    async fn get_transaction(&self, user_id: &str, id: &str) -> StoreResult<Option<Transaction>> {
        let tables = self.lock()?;
        Ok(tables
            .transactions
            .iter()
            .find(|tx| tx.user_id == user_id && tx.id == id)
            .cloned())
    }

    async fn commit(&self, commit: LedgerCommit) -> StoreResult<Transaction> {
        let mut tables = self.lock()?;
        for change in commit.holdings {
            match change {
                HoldingChange::Upsert(holding) => {
                    let key = (holding.user_id.clone(), holding.symbol.clone());
                    tables.holdings.insert(key, holding);
                }
                HoldingChange::Delete { user_id, symbol } => {
                    tables.holdings.remove(&(user_id, symbol));
                }
            }
        }
        tables.transactions.push(commit.transaction.clone());
        Ok(commit.transaction)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upsert_snapshot(&self, snapshot: PortfolioSnapshot) -> StoreResult<PortfolioSnapshot> {
        let mut tables = self.lock()?;
        let key = (snapshot.user_id.clone(), snapshot.date);
        tables.snapshots.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    async fn snapshots_since(
        &self,
        user_id: &str,
        since: NaiveDate,
    ) -> StoreResult<Vec<PortfolioSnapshot>> {
        let tables = self.lock()?;
        Ok(tables
            .snapshots
            .values()
            .filter(|s| s.user_id == user_id && s.date >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn get_asset(&self, symbol: &str) -> StoreResult<Option<Asset>> {
        Ok(self.lock()?.assets.get(symbol).cloned())
    }

    async fn upsert_asset(&self, asset: Asset) -> StoreResult<()> {
        self.lock()?.assets.insert(asset.symbol.clone(), asset);
        Ok(())
    }
}

#[async_trait]
impl WatchlistStore for MemoryStore {
    async fn watchlist(&self, user_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .watchlist
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_to_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        let list = tables.watchlist.entry(user_id.to_string()).or_default();
        if list.iter().any(|s| s == symbol) {
            return Ok(false);
        }
        list.push(symbol.to_string());
        Ok(true)
    }

    async fn remove_from_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        let Some(list) = tables.watchlist.get_mut(user_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|s| s != symbol);
        Ok(list.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn tx(user: &str, symbol: &str, kind: TransactionType, day: u32) -> Transaction {
        Transaction::record(
            user,
            symbol,
            kind,
            dec!(1),
            dec!(10),
            Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            None,
            Decimal::ZERO,
        )
    }

    #[tokio::test]
    async fn commit_applies_upserts_deletes_and_appends() {
        let store = MemoryStore::new();
        store
            .commit(LedgerCommit {
                holdings: vec![
                    HoldingChange::Upsert(Holding::new("u1", "AAPL", dec!(5), dec!(100))),
                    HoldingChange::Upsert(Holding::cash("u1", dec!(500))),
                ],
                transaction: tx("u1", "AAPL", TransactionType::Buy, 1),
            })
            .await
            .unwrap();
        assert_eq!(store.list_holdings("u1").await.unwrap().len(), 2);

        store
            .commit(LedgerCommit {
                holdings: vec![HoldingChange::Delete {
                    user_id: "u1".into(),
                    symbol: "AAPL".into(),
                }],
                transaction: tx("u1", "AAPL", TransactionType::Sell, 2),
            })
            .await
            .unwrap();
        assert!(store.get_holding("u1", "AAPL").await.unwrap().is_none());
        assert_eq!(
            store
                .list_transactions("u1", &TransactionFilter::default())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn transactions_are_filtered_and_date_ordered() {
        let store = MemoryStore::new();
        for t in [
            tx("u1", "AAPL", TransactionType::Buy, 9),
            tx("u1", "MSFT", TransactionType::Buy, 2),
            tx("u1", "AAPL", TransactionType::Buy, 4),
            tx("u1", "AAPL", TransactionType::Sell, 10),
            tx("u2", "AAPL", TransactionType::Buy, 1),
        ] {
            store
                .commit(LedgerCommit {
                    holdings: vec![],
                    transaction: t,
                })
                .await
                .unwrap();
        }
        let filter = TransactionFilter {
            symbol: Some("AAPL".into()),
            transaction_type: Some(TransactionType::Buy),
        };
        let buys = store.list_transactions("u1", &filter).await.unwrap();
        let days: Vec<_> = buys
            .iter()
            .map(|t| t.transaction_date.format("%d").to_string())
            .collect();
        assert_eq!(days, vec!["04", "09"]);

        let other = &buys[0];
        assert!(store.get_transaction("u2", &other.id).await.unwrap().is_none());
        assert!(store.get_transaction("u1", &other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshots_upsert_per_day() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        for value in [dec!(100), dec!(150)] {
            store
                .upsert_snapshot(PortfolioSnapshot {
                    user_id: "u1".into(),
                    date: day,
                    total_value: value,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let all = store.snapshots_since("u1", day).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].total_value, dec!(150));
    }

    #[tokio::test]
    async fn watchlist_add_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.add_to_watchlist("u1", "TSLA").await.unwrap());
        assert!(!store.add_to_watchlist("u1", "TSLA").await.unwrap());
        assert_eq!(store.watchlist("u1").await.unwrap(), vec!["TSLA"]);
        assert!(store.remove_from_watchlist("u1", "TSLA").await.unwrap());
        assert!(!store.remove_from_watchlist("u1", "TSLA").await.unwrap());
    }
}
