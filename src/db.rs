// src/db.rs
use crate::error::StorageError;
use crate::models::{Asset, Holding, PortfolioSnapshot, Transaction, TransactionType};
use crate::store::{
    AssetStore, HoldingChange, LedgerCommit, LedgerStore, SnapshotStore, StoreResult,
    TransactionFilter, WatchlistStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use rust_decimal::Decimal;
use scylla::batch::Batch;
use scylla::frame::response::result::{CqlValue, Row};
use scylla::frame::value::SerializedValues;
use scylla::{query::Query, Session, SessionBuilder};
use std::str::FromStr;

/// ScyllaDB backend. Decimals are stored as TEXT and re-parsed on read so a
/// malformed row surfaces as `StorageError::Corrupt` instead of a bad number.
pub struct ScyllaStore {
    session: Session,
    keyspace: String,
}

fn query_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Query(e.to_string())
}

fn column<'a>(row: &'a Row, idx: usize) -> Option<&'a CqlValue> {
    row.columns.get(idx).and_then(|c| c.as_ref())
}

fn text(row: &Row, idx: usize, name: &str) -> StoreResult<String> {
    column(row, idx)
        .and_then(|v| v.as_text())
        .cloned()
        .ok_or_else(|| StorageError::Corrupt(format!("missing {}", name)))
}

fn opt_text(row: &Row, idx: usize) -> Option<String> {
    column(row, idx).and_then(|v| v.as_text()).cloned()
}

fn decimal(row: &Row, idx: usize, name: &str) -> StoreResult<Decimal> {
    let raw = text(row, idx, name)?;
    Decimal::from_str(&raw).map_err(|_| StorageError::Corrupt(format!("{} = {:?}", name, raw)))
}

fn timestamp(row: &Row, idx: usize, name: &str) -> StoreResult<DateTime<Utc>> {
    match column(row, idx) {
        Some(CqlValue::Timestamp(ts)) => {
            DateTime::<Utc>::from_timestamp_millis(ts.num_milliseconds())
                .ok_or_else(|| StorageError::Corrupt(format!("{} out of range", name)))
        }
        _ => Err(StorageError::Corrupt(format!("missing {}", name))),
    }
}

fn holding_from_row(row: &Row) -> StoreResult<Holding> {
    Ok(Holding {
        user_id: text(row, 0, "user_id")?,
        symbol: text(row, 1, "symbol")?,
        quantity: decimal(row, 2, "quantity")?,
        average_cost: decimal(row, 3, "average_cost")?,
        updated_at: timestamp(row, 4, "updated_at")?,
    })
}

fn transaction_from_row(row: &Row) -> StoreResult<Transaction> {
    let kind = text(row, 3, "transaction_type")?;
    let transaction_type = TransactionType::from_str(&kind)
        .map_err(|_| StorageError::Corrupt(format!("transaction_type = {:?}", kind)))?;
    Ok(Transaction {
        user_id: text(row, 0, "user_id")?,
        id: text(row, 1, "id")?,
        symbol: text(row, 2, "symbol")?,
        transaction_type,
        quantity: decimal(row, 4, "quantity")?,
        price: decimal(row, 5, "price")?,
        total_amount: decimal(row, 6, "total_amount")?,
        transaction_date: timestamp(row, 7, "transaction_date")?,
        notes: opt_text(row, 8),
        realized_gain_loss: decimal(row, 9, "realized_gain_loss")?,
    })
}

const TRANSACTION_COLUMNS: &str = "user_id, id, symbol, transaction_type, quantity, price, total_amount, transaction_date, notes, realized_gain_loss, recorded_at";

/// Commit time in microseconds. Rows are clustered by random id, so this is
/// what keeps same-date transactions in commit order. Rows written without
/// it sort first.
fn recorded_at(row: &Row) -> i64 {
    column(row, 10).and_then(|v| v.as_bigint()).unwrap_or(0)
}

/// Date ascending, then commit order.
fn in_ledger_order(mut rows: Vec<(Transaction, i64)>) -> Vec<Transaction> {
    rows.sort_by_key(|(tx, recorded)| (tx.transaction_date, *recorded));
    rows.into_iter().map(|(tx, _)| tx).collect()
}

impl ScyllaStore {
    pub async fn connect(node: &str, keyspace: &str) -> StoreResult<ScyllaStore> {
        let session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let ks = keyspace;
        let schema = [
            format!("CREATE KEYSPACE IF NOT EXISTS {ks} WITH REPLICATION = {{'class': 'SimpleStrategy', 'replication_factor': 1}}"),
            format!("CREATE TABLE IF NOT EXISTS {ks}.holdings (user_id TEXT, symbol TEXT, quantity TEXT, average_cost TEXT, updated_at TIMESTAMP, PRIMARY KEY (user_id, symbol))"),
            format!("CREATE TABLE IF NOT EXISTS {ks}.transactions (user_id TEXT, id TEXT, symbol TEXT, transaction_type TEXT, quantity TEXT, price TEXT, total_amount TEXT, transaction_date TIMESTAMP, notes TEXT, realized_gain_loss TEXT, recorded_at BIGINT, PRIMARY KEY (user_id, id))"),
            format!("CREATE TABLE IF NOT EXISTS {ks}.portfolio_snapshots (user_id TEXT, date TEXT, total_value TEXT, created_at TIMESTAMP, PRIMARY KEY (user_id, date)) WITH CLUSTERING ORDER BY (date ASC)"),
            format!("CREATE TABLE IF NOT EXISTS {ks}.assets (symbol TEXT PRIMARY KEY, name TEXT, sector TEXT, asset_type TEXT)"),
            format!("CREATE TABLE IF NOT EXISTS {ks}.watchlist (user_id TEXT, symbol TEXT, added_at TIMESTAMP, PRIMARY KEY (user_id, symbol))"),
        ];
        for statement in schema {
            session.query(statement, &[]).await.map_err(|e| {
                error!("Schema setup failed: {}", e);
                StorageError::Connection(e.to_string())
            })?;
        }

        info!("Successfully connected to ScyllaDB keyspace {}.", keyspace);
        Ok(ScyllaStore {
            session,
            keyspace: keyspace.to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.keyspace, name)
    }

    async fn rows(&self, cql: String, user_id: &str) -> StoreResult<Vec<Row>> {
        let result = self
            .session
            .query(Query::new(cql), (user_id,))
            .await
            .map_err(query_err)?;
        Ok(result.rows.unwrap_or_default())
    }
}

fn serialize_holding(holding: &Holding) -> StoreResult<SerializedValues> {
    let mut values = SerializedValues::new();
    values.add_value(&holding.user_id).map_err(query_err)?;
    values.add_value(&holding.symbol).map_err(query_err)?;
    values
        .add_value(&holding.quantity.to_string())
        .map_err(query_err)?;
    values
        .add_value(&holding.average_cost.to_string())
        .map_err(query_err)?;
    values
        .add_value(&holding.updated_at.timestamp_millis())
        .map_err(query_err)?;
    Ok(values)
}

fn serialize_transaction(tx: &Transaction, recorded_at: i64) -> StoreResult<SerializedValues> {
    let mut values = SerializedValues::new();
    values.add_value(&tx.user_id).map_err(query_err)?;
    values.add_value(&tx.id).map_err(query_err)?;
    values.add_value(&tx.symbol).map_err(query_err)?;
    values
        .add_value(&tx.transaction_type.as_str().to_string())
        .map_err(query_err)?;
    for amount in [tx.quantity, tx.price, tx.total_amount] {
        values.add_value(&amount.to_string()).map_err(query_err)?;
    }
    values
        .add_value(&tx.transaction_date.timestamp_millis())
        .map_err(query_err)?;
    values.add_value(&tx.notes).map_err(query_err)?;
    values
        .add_value(&tx.realized_gain_loss.to_string())
        .map_err(query_err)?;
    values.add_value(&recorded_at).map_err(query_err)?;
    Ok(values)
}

#[async_trait]
impl LedgerStore for ScyllaStore {
    async fn get_holding(&self, user_id: &str, symbol: &str) -> StoreResult<Option<Holding>> {
        let cql = format!(
            "SELECT user_id, symbol, quantity, average_cost, updated_at FROM {} WHERE user_id = ? AND symbol = ?",
            self.table("holdings")
        );
        let result = self
            .session
            .query(Query::new(cql), (user_id, symbol))
            .await
            .map_err(query_err)?;
        match result.rows.unwrap_or_default().first() {
            Some(row) => holding_from_row(row).map(Some),
            None => Ok(None),
        }
    }

    async fn list_holdings(&self, user_id: &str) -> StoreResult<Vec<Holding>> {
        let cql = format!(
            "SELECT user_id, symbol, quantity, average_cost, updated_at FROM {} WHERE user_id = ?",
            self.table("holdings")
        );
        self.rows(cql, user_id)
            .await?
            .iter()
            .map(holding_from_row)
            .collect()
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let cql = format!(
            "SELECT {} FROM {} WHERE user_id = ?",
            TRANSACTION_COLUMNS,
            self.table("transactions")
        );
        let mut rows = Vec::new();
        for row in self.rows(cql, user_id).await? {
            let tx = transaction_from_row(&row)?;
            if filter.matches(&tx) {
                rows.push((tx, recorded_at(&row)));
            }
        }
        Ok(in_ledger_order(rows))
    }

    async fn get_transaction(&self, user_id: &str, id: &str) -> StoreResult<Option<Transaction>> {
        let cql = format!(
            "SELECT {} FROM {} WHERE user_id = ? AND id = ?",
            TRANSACTION_COLUMNS,
            self.table("transactions")
        );
        let result = self
            .session
            .query(Query::new(cql), (user_id, id))
            .await
            .map_err(query_err)?;
        match result.rows.unwrap_or_default().first() {
            Some(row) => transaction_from_row(row).map(Some),
            None => Ok(None),
        }
    }

    async fn commit(&self, commit: LedgerCommit) -> StoreResult<Transaction> {
        // Logged batch: holding writes and the transaction row apply together.
        let mut batch = Batch::default();
        let mut values: Vec<SerializedValues> = Vec::new();

        for change in &commit.holdings {
            match change {
                HoldingChange::Upsert(holding) => {
                    batch.append_statement(Query::new(format!(
                        "INSERT INTO {} (user_id, symbol, quantity, average_cost, updated_at) VALUES (?, ?, ?, ?, ?)",
                        self.table("holdings")
                    )));
                    values.push(serialize_holding(holding)?);
                }
                HoldingChange::Delete { user_id, symbol } => {
                    batch.append_statement(Query::new(format!(
                        "DELETE FROM {} WHERE user_id = ? AND symbol = ?",
                        self.table("holdings")
                    )));
                    let mut v = SerializedValues::new();
                    v.add_value(user_id).map_err(query_err)?;
                    v.add_value(symbol).map_err(query_err)?;
                    values.push(v);
                }
            }
        }

        batch.append_statement(Query::new(format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table("transactions"),
            TRANSACTION_COLUMNS
        )));
        values.push(serialize_transaction(
            &commit.transaction,
            Utc::now().timestamp_micros(),
        )?);

        self.session.batch(&batch, values).await.map_err(|e| {
            error!("Ledger batch failed: {}", e);
            query_err(e)
        })?;
        Ok(commit.transaction)
    }
}

#[async_trait]
impl SnapshotStore for ScyllaStore {
    async fn upsert_snapshot(&self, snapshot: PortfolioSnapshot) -> StoreResult<PortfolioSnapshot> {
        let cql = format!(
            "INSERT INTO {} (user_id, date, total_value, created_at) VALUES (?, ?, ?, ?)",
            self.table("portfolio_snapshots")
        );
        self.session
            .query(
                Query::new(cql),
                (
                    snapshot.user_id.as_str(),
                    snapshot.date.format("%Y-%m-%d").to_string(),
                    snapshot.total_value.to_string(),
                    snapshot.created_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(query_err)?;
        Ok(snapshot)
    }

    async fn snapshots_since(
        &self,
        user_id: &str,
        since: NaiveDate,
    ) -> StoreResult<Vec<PortfolioSnapshot>> {
        let cql = format!(
            "SELECT user_id, date, total_value, created_at FROM {} WHERE user_id = ? AND date >= ?",
            self.table("portfolio_snapshots")
        );
        let result = self
            .session
            .query(
                Query::new(cql),
                (user_id, since.format("%Y-%m-%d").to_string()),
            )
            .await
            .map_err(query_err)?;
        result
            .rows
            .unwrap_or_default()
            .iter()
            .map(|row| {
                let raw_date = text(row, 1, "date")?;
                let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
                    .map_err(|_| StorageError::Corrupt(format!("date = {:?}", raw_date)))?;
                Ok(PortfolioSnapshot {
                    user_id: text(row, 0, "user_id")?,
                    date,
                    total_value: decimal(row, 2, "total_value")?,
                    created_at: timestamp(row, 3, "created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AssetStore for ScyllaStore {
    async fn get_asset(&self, symbol: &str) -> StoreResult<Option<Asset>> {
        let cql = format!(
            "SELECT symbol, name, sector, asset_type FROM {} WHERE symbol = ?",
            self.table("assets")
        );
        let rows = self.rows(cql, symbol).await?;
        match rows.first() {
            Some(row) => Ok(Some(Asset {
                symbol: text(row, 0, "symbol")?,
                name: opt_text(row, 1).unwrap_or_else(|| symbol.to_string()),
                sector: opt_text(row, 2),
                asset_type: opt_text(row, 3).unwrap_or_else(|| "STOCK".to_string()),
            })),
            None => Ok(None),
        }
    }

    async fn upsert_asset(&self, asset: Asset) -> StoreResult<()> {
        let cql = format!(
            "INSERT INTO {} (symbol, name, sector, asset_type) VALUES (?, ?, ?, ?)",
            self.table("assets")
        );
        self.session
            .query(
                Query::new(cql),
                (asset.symbol, asset.name, asset.sector, asset.asset_type),
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[async_trait]
impl WatchlistStore for ScyllaStore {
    async fn watchlist(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let cql = format!(
            "SELECT symbol FROM {} WHERE user_id = ?",
            self.table("watchlist")
        );
        self.rows(cql, user_id)
            .await?
            .iter()
            .map(|row| text(row, 0, "symbol"))
            .collect()
    }

    async fn add_to_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool> {
        if self.watchlist(user_id).await?.iter().any(|s| s == symbol) {
            return Ok(false);
        }
        let cql = format!(
            "INSERT INTO {} (user_id, symbol, added_at) VALUES (?, ?, ?)",
            self.table("watchlist")
        );
        self.session
            .query(
                Query::new(cql),
                (user_id, symbol, Utc::now().timestamp_millis()),
            )
            .await
            .map_err(query_err)?;
        Ok(true)
    }

    async fn remove_from_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<bool> {
        if !self.watchlist(user_id).await?.iter().any(|s| s == symbol) {
            return Ok(false);
        }
        let cql = format!(
            "DELETE FROM {} WHERE user_id = ? AND symbol = ?",
            self.table("watchlist")
        );
        self.session
            .query(Query::new(cql), (user_id, symbol))
            .await
            .map_err(query_err)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn buy(price: Decimal, day: u32) -> Transaction {
        Transaction::record(
            "u1",
            "AAPL",
            TransactionType::Buy,
            dec!(1),
            price,
            Utc.with_ymd_and_hms(2024, 1, day, 9, 30, 0).unwrap(),
            None,
            Decimal::ZERO,
        )
    }

    #[test]
    fn same_date_rows_follow_commit_order() {
        let rows = vec![
            (buy(dec!(30), 2), 300),
            (buy(dec!(20), 1), 200),
            (buy(dec!(10), 1), 100),
            (buy(dec!(5), 1), 0),
        ];
        let prices: Vec<Decimal> = in_ledger_order(rows).iter().map(|tx| tx.price).collect();
        assert_eq!(prices, vec![dec!(5), dec!(10), dec!(20), dec!(30)]);
    }
}
