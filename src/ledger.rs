// src/ledger.rs
//! Transaction-and-holdings ledger.
//!
//! Every mutation runs under the user's lock and ends in a single
//! [`LedgerCommit`], so a failed step never leaves a balance change without
//! its transaction record.
//!
//! Two cost views are kept on purpose: holdings carry a weighted average
//! cost, while SELL records carry a FIFO realized gain computed from the BUY
//! history. Neither is derived from the other.

use crate::error::{LedgerError, ValidationError};
use crate::fifo::{lot_queue, match_sell};
use crate::models::{Holding, Transaction, TransactionRequest, TransactionType, CASH_SYMBOL};
use crate::store::{HoldingChange, LedgerCommit, LedgerStore, TransactionFilter};
use crate::validators::{
    checked_product, checked_sum, ensure_positive, parse_transaction_date,
    validate_positive_number, validate_tradable_symbol, validate_transaction_type,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Per-user write serialization. The guard releases on drop, error paths
/// included. An entry lives only while some task holds or waits on it.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: &str) -> UserGuard<'_> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UserGuard {
            locks: self,
            user_id: user_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

pub struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map's Arc is the last reference if no one waits.
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Optional fields shared by every ledger entry.
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub transaction_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl EntryMeta {
    fn date(&self) -> DateTime<Utc> {
        self.transaction_date.unwrap_or_else(Utc::now)
    }
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    locks: UserLocks,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Ledger {
            store,
            locks: UserLocks::default(),
        }
    }

    pub async fn get_cash_balance(&self, user_id: &str) -> LedgerResult<Decimal> {
        self.get_holding_quantity(user_id, CASH_SYMBOL).await
    }

    pub async fn get_holding_quantity(&self, user_id: &str, symbol: &str) -> LedgerResult<Decimal> {
        Ok(self
            .store
            .get_holding(user_id, symbol)
            .await?
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO))
    }

    pub async fn holdings(&self, user_id: &str) -> LedgerResult<Vec<Holding>> {
        Ok(self.store.list_holdings(user_id).await?)
    }

    /// Non-cash symbols the user currently holds.
    pub async fn user_symbols(&self, user_id: &str) -> LedgerResult<Vec<String>> {
        Ok(self
            .holdings(user_id)
            .await?
            .into_iter()
            .filter(|h| !h.is_cash())
            .map(|h| h.symbol)
            .collect())
    }

    pub async fn apply_buy(
        &self,
        user_id: &str,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        meta: EntryMeta,
    ) -> LedgerResult<Transaction> {
        let symbol = validate_tradable_symbol(Some(symbol))?;
        let quantity = ensure_positive(quantity, "quantity")?;
        let price = ensure_positive(price, "price")?;

        let _guard = self.locks.acquire(user_id).await;

        let cash = self.store.get_holding(user_id, CASH_SYMBOL).await?;
        let available = cash.as_ref().map(|h| h.quantity).unwrap_or(Decimal::ZERO);
        let required = checked_product(quantity, price, "quantity")?;
        if required > available {
            warn!(
                "Rejected BUY {} {} for {}: required {} > cash {}",
                quantity, symbol, user_id, required, available
            );
            return Err(LedgerError::InsufficientCash {
                available,
                required,
            });
        }

        let holding = match self.store.get_holding(user_id, &symbol).await? {
            Some(mut existing) => {
                let new_quantity = checked_sum(existing.quantity, quantity, "quantity")?;
                let held_cost =
                    checked_product(existing.quantity, existing.average_cost, "quantity")?;
                existing.average_cost = checked_sum(held_cost, required, "quantity")?
                    .checked_div(new_quantity)
                    .ok_or_else(|| ValidationError::OutOfRange("quantity".into()))?;
                existing.quantity = new_quantity;
                existing.updated_at = Utc::now();
                existing
            }
            None => Holding::new(user_id, &symbol, quantity, price),
        };

        let transaction = Transaction::record(
            user_id,
            &symbol,
            TransactionType::Buy,
            quantity,
            price,
            meta.date(),
            meta.notes,
            Decimal::ZERO,
        );
        let commit = LedgerCommit {
            holdings: vec![
                HoldingChange::Upsert(holding),
                HoldingChange::Upsert(adjust_cash(cash, user_id, -required)?),
            ],
            transaction,
        };
        self.commit("BUY", commit).await
    }

    pub async fn apply_sell(
        &self,
        user_id: &str,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        meta: EntryMeta,
    ) -> LedgerResult<Transaction> {
        let symbol = validate_tradable_symbol(Some(symbol))?;
        let quantity = ensure_positive(quantity, "quantity")?;
        let price = ensure_positive(price, "price")?;

        let _guard = self.locks.acquire(user_id).await;

        let mut holding = match self.store.get_holding(user_id, &symbol).await? {
            Some(h) if h.quantity > Decimal::ZERO => h,
            _ => return Err(LedgerError::NoSuchPosition(symbol)),
        };
        if quantity > holding.quantity {
            return Err(LedgerError::InsufficientShares {
                owned: holding.quantity,
                requested: quantity,
            });
        }

        let buys = self
            .store
            .list_transactions(
                user_id,
                &TransactionFilter {
                    symbol: Some(symbol.clone()),
                    transaction_type: Some(TransactionType::Buy),
                },
            )
            .await?;
        let proceeds = checked_product(quantity, price, "quantity")?;
        let fifo = match_sell(&mut lot_queue(&buys), quantity, price)
            .ok_or_else(|| ValidationError::OutOfRange("realized_gain_loss".into()))?;
        if fifo.unmatched_quantity > Decimal::ZERO {
            warn!(
                "SELL {} {} for {}: {} units not covered by recorded BUY lots",
                quantity, symbol, user_id, fifo.unmatched_quantity
            );
        }

        holding.quantity -= quantity;
        holding.updated_at = Utc::now();
        let holding_change = if holding.quantity <= Decimal::ZERO {
            HoldingChange::Delete {
                user_id: user_id.to_string(),
                symbol: symbol.clone(),
            }
        } else {
            HoldingChange::Upsert(holding)
        };

        let cash = adjust_cash(
            self.store.get_holding(user_id, CASH_SYMBOL).await?,
            user_id,
            proceeds,
        )?;
        let transaction = Transaction::record(
            user_id,
            &symbol,
            TransactionType::Sell,
            quantity,
            price,
            meta.date(),
            meta.notes,
            fifo.realized_gain_loss,
        );
        let commit = LedgerCommit {
            holdings: vec![
                holding_change,
                HoldingChange::Upsert(cash),
            ],
            transaction,
        };
        self.commit("SELL", commit).await
    }

    pub async fn apply_deposit(
        &self,
        user_id: &str,
        amount: Decimal,
        meta: EntryMeta,
    ) -> LedgerResult<Transaction> {
        let amount = ensure_positive(amount, "amount")?;
        self.apply_cash_movement(user_id, TransactionType::Deposit, amount, meta)
            .await
    }

    /// No overdraft check: the balance may go negative.
    pub async fn apply_withdrawal(
        &self,
        user_id: &str,
        amount: Decimal,
        meta: EntryMeta,
    ) -> LedgerResult<Transaction> {
        let amount = ensure_positive(amount, "amount")?;
        self.apply_cash_movement(user_id, TransactionType::Withdrawal, amount, meta)
            .await
    }

    async fn apply_cash_movement(
        &self,
        user_id: &str,
        kind: TransactionType,
        amount: Decimal,
        meta: EntryMeta,
    ) -> LedgerResult<Transaction> {
        let delta = match kind {
            TransactionType::Withdrawal => -amount,
            _ => amount,
        };

        let _guard = self.locks.acquire(user_id).await;

        let cash = adjust_cash(
            self.store.get_holding(user_id, CASH_SYMBOL).await?,
            user_id,
            delta,
        )?;
        let transaction = Transaction::record(
            user_id,
            CASH_SYMBOL,
            kind,
            amount,
            Decimal::ONE,
            meta.date(),
            meta.notes,
            Decimal::ZERO,
        );
        let commit = LedgerCommit {
            holdings: vec![HoldingChange::Upsert(cash)],
            transaction,
        };
        self.commit(kind.as_str(), commit).await
    }

    pub async fn process_transaction(
        &self,
        user_id: &str,
        request: TransactionRequest,
    ) -> LedgerResult<Transaction> {
        let kind = validate_transaction_type(request.transaction_type.as_deref())?;
        let meta = EntryMeta {
            transaction_date: parse_transaction_date(request.transaction_date.as_deref())?,
            notes: request.notes,
        };

        match kind {
            TransactionType::Buy | TransactionType::Sell => {
                let symbol = request.symbol.as_ref().and_then(|v| v.as_str());
                let symbol = validate_tradable_symbol(symbol)?;
                let quantity = validate_positive_number(request.quantity.as_ref(), "quantity")?;
                let price = validate_positive_number(request.price.as_ref(), "price")?;
                if kind == TransactionType::Buy {
                    self.apply_buy(user_id, &symbol, quantity, price, meta).await
                } else {
                    self.apply_sell(user_id, &symbol, quantity, price, meta).await
                }
            }
            TransactionType::Deposit | TransactionType::Withdrawal => {
                let raw = request.amount.as_ref().or(request.quantity.as_ref());
                let amount = validate_positive_number(raw, "amount")?;
                if kind == TransactionType::Deposit {
                    self.apply_deposit(user_id, amount, meta).await
                } else {
                    self.apply_withdrawal(user_id, amount, meta).await
                }
            }
        }
    }

    /// Newest first.
    pub async fn transaction_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let mut txs = self
            .store
            .list_transactions(user_id, &TransactionFilter::default())
            .await?;
        txs.reverse();
        Ok(txs.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn get_transaction(&self, user_id: &str, id: &str) -> LedgerResult<Transaction> {
        self.store
            .get_transaction(user_id, id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("Transaction".into()))
    }

    pub async fn realized_gain_loss_for_symbol(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> LedgerResult<Decimal> {
        self.sum_realized(
            user_id,
            TransactionFilter {
                symbol: Some(symbol.to_string()),
                transaction_type: Some(TransactionType::Sell),
            },
        )
        .await
    }

    pub async fn total_realized_gain_loss(&self, user_id: &str) -> LedgerResult<Decimal> {
        self.sum_realized(
            user_id,
            TransactionFilter {
                symbol: None,
                transaction_type: Some(TransactionType::Sell),
            },
        )
        .await
    }

    async fn sum_realized(&self, user_id: &str, filter: TransactionFilter) -> LedgerResult<Decimal> {
        Ok(self
            .store
            .list_transactions(user_id, &filter)
            .await?
            .iter()
            .map(|tx| tx.realized_gain_loss)
            .fold(Decimal::ZERO, Decimal::saturating_add))
    }

    async fn commit(&self, label: &str, commit: LedgerCommit) -> LedgerResult<Transaction> {
        let user_id = commit.transaction.user_id.clone();
        match self.store.commit(commit).await {
            Ok(tx) => {
                info!(
                    "{} {} {} @ {} recorded for {} (realized {})",
                    label, tx.quantity, tx.symbol, tx.price, user_id, tx.realized_gain_loss
                );
                Ok(tx)
            }
            Err(e) => {
                error!("Failed to commit {} for {}: {}", label, user_id, e);
                Err(e.into())
            }
        }
    }
}

fn adjust_cash(
    cash: Option<Holding>,
    user_id: &str,
    delta: Decimal,
) -> Result<Holding, ValidationError> {
    match cash {
        Some(mut holding) => {
            holding.quantity = checked_sum(holding.quantity, delta, "cash balance")?;
            holding.updated_at = Utc::now();
            Ok(holding)
        }
        None => Ok(Holding::cash(user_id, delta)),
    }
}
