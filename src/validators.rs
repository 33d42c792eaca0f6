// src/validators.rs
//! Pure input sanitizers run before any ledger mutation.

use crate::error::ValidationError;
use crate::models::{TransactionType, CASH_SYMBOL};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '^' | '=' | '-')
}

/// Uppercases and checks `[A-Z0-9.^=-]+`.
pub fn validate_stock_symbol(symbol: Option<&str>) -> Result<String, ValidationError> {
    let symbol = match symbol {
        Some(s) if !s.is_empty() => s.to_uppercase(),
        _ => return Err(ValidationError::Required("Symbol".into())),
    };
    if !symbol.chars().all(is_symbol_char) {
        return Err(ValidationError::InvalidFormat("symbol".into()));
    }
    Ok(symbol)
}

/// Like `validate_stock_symbol`, but refuses the cash sub-account.
pub fn validate_tradable_symbol(symbol: Option<&str>) -> Result<String, ValidationError> {
    let symbol = validate_stock_symbol(symbol)?;
    if symbol == CASH_SYMBOL {
        return Err(ValidationError::ReservedSymbol(symbol));
    }
    Ok(symbol)
}

fn parse_str_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Accepts JSON numbers and numeric strings.
pub fn parse_decimal(value: Option<&Value>, field: &str) -> Result<Decimal, ValidationError> {
    let parsed = match value {
        Some(Value::Number(n)) => parse_str_decimal(&n.to_string()),
        Some(Value::String(s)) => parse_str_decimal(s),
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::InvalidFormat(field.to_string()))
}

/// `a * b`, failing instead of overflowing.
pub fn checked_product(a: Decimal, b: Decimal, field: &str) -> Result<Decimal, ValidationError> {
    a.checked_mul(b)
        .ok_or_else(|| ValidationError::OutOfRange(field.to_string()))
}

/// `a + b`, failing instead of overflowing.
pub fn checked_sum(a: Decimal, b: Decimal, field: &str) -> Result<Decimal, ValidationError> {
    a.checked_add(b)
        .ok_or_else(|| ValidationError::OutOfRange(field.to_string()))
}

pub fn ensure_positive(value: Decimal, field: &str) -> Result<Decimal, ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::MustBePositive(field.to_string()));
    }
    Ok(value)
}

pub fn ensure_non_negative(value: Decimal, field: &str) -> Result<Decimal, ValidationError> {
    if value < Decimal::ZERO {
        return Err(ValidationError::Negative(field.to_string()));
    }
    Ok(value)
}

pub fn validate_positive_number(
    value: Option<&Value>,
    field: &str,
) -> Result<Decimal, ValidationError> {
    ensure_positive(parse_decimal(value, field)?, field)
}

pub fn validate_non_negative_number(
    value: Option<&Value>,
    field: &str,
) -> Result<Decimal, ValidationError> {
    ensure_non_negative(parse_decimal(value, field)?, field)
}

pub fn validate_transaction_type(kind: Option<&str>) -> Result<TransactionType, ValidationError> {
    let kind = kind.unwrap_or_default();
    kind.parse()
        .map_err(|_| ValidationError::UnsupportedType(kind.to_string()))
}

/// ISO-8601 date or date-time. Values without an offset are taken as UTC.
pub fn parse_transaction_date(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let raw = match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(None),
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Some(naive.and_utc()));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Some(naive.and_utc()));
        }
    }
    Err(ValidationError::InvalidFormat("transaction_date".into()))
}
