// src/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved symbol for the cash sub-account.
pub const CASH_SYMBOL: &str = "CASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub const ALL: [TransactionType; 4] = [
        TransactionType::Buy,
        TransactionType::Sell,
        TransactionType::Deposit,
        TransactionType::Withdrawal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

/// A user's current position in one symbol. `CASH` is a holding too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn new(user_id: &str, symbol: &str, quantity: Decimal, average_cost: Decimal) -> Self {
        Holding {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            quantity,
            average_cost,
            updated_at: Utc::now(),
        }
    }

    pub fn cash(user_id: &str, quantity: Decimal) -> Self {
        Holding::new(user_id, CASH_SYMBOL, quantity, Decimal::ONE)
    }

    pub fn is_cash(&self) -> bool {
        self.symbol == CASH_SYMBOL
    }
}

/// Append-only ledger record. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub transaction_type: TransactionType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total_amount: Decimal,
    pub transaction_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub realized_gain_loss: Decimal,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        user_id: &str,
        symbol: &str,
        transaction_type: TransactionType,
        quantity: Decimal,
        price: Decimal,
        transaction_date: DateTime<Utc>,
        notes: Option<String>,
        realized_gain_loss: Decimal,
    ) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            transaction_type,
            quantity,
            price,
            // Callers check this product before recording.
            total_amount: quantity.saturating_mul(price),
            transaction_date,
            notes,
            realized_gain_loss,
        }
    }
}

/// Raw payload accepted by `process_transaction`. Numeric fields may arrive
/// as JSON numbers or strings, so they stay untyped until validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionRequest {
    pub transaction_type: Option<String>,
    pub symbol: Option<serde_json::Value>,
    pub quantity: Option<serde_json::Value>,
    pub amount: Option<serde_json::Value>,
    pub price: Option<serde_json::Value>,
    pub transaction_date: Option<String>,
    pub notes: Option<String>,
}

/// Display metadata for a symbol. Not needed for ledger correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub asset_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub current_price: Decimal,
    pub previous_close: Option<Decimal>,
    pub day_change: Decimal,
    pub day_change_percent: Decimal,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub user_id: String,
    pub date: NaiveDate,
    pub total_value: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub symbol: String,
    pub name: String,
    pub currency: String,
}
