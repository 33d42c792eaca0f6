// src/fifo.rs
//! FIFO lot matching for realized gain/loss.
//!
//! Lots are rebuilt from the BUY history on every SELL; nothing here is
//! persisted. The result is reporting-only and never feeds back into the
//! holding's average cost.

use crate::models::{Transaction, TransactionType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Unconsumed quantity of one historical BUY.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub quantity: Decimal,
    pub price: Decimal,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FifoMatch {
    pub realized_gain_loss: Decimal,
    pub matched_quantity: Decimal,
    /// Part of the sell that no recorded lot covered. It contributes nothing
    /// to the gain.
    pub unmatched_quantity: Decimal,
}

/// Builds the lot queue, oldest first. Ties on date keep history order.
pub fn lot_queue(history: &[Transaction]) -> Vec<Lot> {
    let mut lots: Vec<Lot> = history
        .iter()
        .filter(|tx| tx.transaction_type == TransactionType::Buy)
        .map(|tx| Lot {
            quantity: tx.quantity,
            price: tx.price,
            acquired_at: tx.transaction_date,
        })
        .collect();
    lots.sort_by_key(|lot| lot.acquired_at);
    lots
}

/// Walks `lots` oldest to newest, drawing each one down in place. `None` if
/// the gain does not fit in a `Decimal`.
pub fn match_sell(
    lots: &mut [Lot],
    sell_quantity: Decimal,
    sell_price: Decimal,
) -> Option<FifoMatch> {
    let mut remaining = sell_quantity;
    let mut gain = Decimal::ZERO;

    for lot in lots.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let matched = remaining.min(lot.quantity);
        gain = gain.checked_add((sell_price - lot.price).checked_mul(matched)?)?;
        remaining -= matched;
        lot.quantity -= matched;
    }

    Some(FifoMatch {
        realized_gain_loss: gain,
        matched_quantity: sell_quantity - remaining.max(Decimal::ZERO),
        unmatched_quantity: remaining.max(Decimal::ZERO),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn buy(qty: Decimal, price: Decimal, day: u32) -> Transaction {
        Transaction::record(
            "u1",
            "AAPL",
            TransactionType::Buy,
            qty,
            price,
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            None,
            Decimal::ZERO,
        )
    }

    #[test]
    fn no_lots_means_no_gain() {
        let m = match_sell(&mut [], dec!(4), dec!(150)).unwrap();
        assert_eq!(m.realized_gain_loss, Decimal::ZERO);
        assert_eq!(m.unmatched_quantity, dec!(4));
    }

    #[test]
    fn consumes_oldest_lot_first() {
        let mut lots = lot_queue(&[buy(dec!(5), dec!(100), 1), buy(dec!(5), dec!(120), 2)]);
        let m = match_sell(&mut lots, dec!(4), dec!(150)).unwrap();
        assert_eq!(m.realized_gain_loss, dec!(200));
        assert_eq!(m.matched_quantity, dec!(4));
        assert_eq!(m.unmatched_quantity, Decimal::ZERO);
        assert_eq!(lots[0].quantity, dec!(1));
        assert_eq!(lots[1].quantity, dec!(5));
    }

    #[test]
    fn spans_multiple_lots() {
        let mut lots = lot_queue(&[buy(dec!(5), dec!(100), 1), buy(dec!(5), dec!(120), 2)]);
        // 5 @ (150-100) + 2 @ (150-120)
        let m = match_sell(&mut lots, dec!(7), dec!(150)).unwrap();
        assert_eq!(m.realized_gain_loss, dec!(310));
    }

    #[test]
    fn history_is_ordered_by_date_not_insertion() {
        let mut lots = lot_queue(&[buy(dec!(5), dec!(120), 9), buy(dec!(5), dec!(100), 3)]);
        assert_eq!(lots[0].price, dec!(100));
        let m = match_sell(&mut lots, dec!(5), dec!(90)).unwrap();
        assert_eq!(m.realized_gain_loss, dec!(-50));
    }

    #[test]
    fn sells_and_deposits_are_not_lots() {
        let mut sell = buy(dec!(3), dec!(130), 4);
        sell.transaction_type = TransactionType::Sell;
        let lots = lot_queue(&[buy(dec!(2), dec!(100), 1), sell]);
        assert_eq!(lots.len(), 1);
    }

    #[test]
    fn oversell_stops_at_exhausted_queue() {
        let mut lots = lot_queue(&[buy(dec!(2), dec!(10), 1)]);
        let m = match_sell(&mut lots, dec!(5), dec!(12)).unwrap();
        assert_eq!(m.realized_gain_loss, dec!(4));
        assert_eq!(m.matched_quantity, dec!(2));
        assert_eq!(m.unmatched_quantity, dec!(3));
    }

    #[test]
    fn fractional_quantities() {
        let mut lots = lot_queue(&[buy(dec!(0.5), dec!(200), 1), buy(dec!(1.25), dec!(180), 2)]);
        let m = match_sell(&mut lots, dec!(1), dec!(210)).unwrap();
        // 0.5*10 + 0.5*30
        assert_eq!(m.realized_gain_loss, dec!(20));
    }
}
