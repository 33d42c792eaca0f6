// src/error.rs
use rust_decimal::Decimal;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(String),
    #[error("Invalid {0} format")]
    InvalidFormat(String),
    #[error("{0} must be positive")]
    MustBePositive(String),
    #[error("{0} cannot be negative")]
    Negative(String),
    #[error("Transaction type must be one of: BUY, SELL, DEPOSIT, WITHDRAWAL (got {0:?})")]
    UnsupportedType(String),
    #[error("{0} is a reserved symbol")]
    ReservedSymbol(String),
    #[error("{0} is out of range")]
    OutOfRange(String),
}

/// Infrastructure failures from a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to connect to storage: {0}")]
    Connection(String),
    #[error("Storage query failed: {0}")]
    Query(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Insufficient cash. Available: ${available:.2}, Required: ${required:.2}")]
    InsufficientCash { available: Decimal, required: Decimal },
    #[error("Insufficient shares. Owned: {owned}, Trying to sell: {requested}")]
    InsufficientShares { owned: Decimal, requested: Decimal },
    #[error("You don't own any shares of {0}")]
    NoSuchPosition(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Business-rule and input failures; retrying them cannot succeed.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, LedgerError::Storage(_))
    }
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Market data provider is not configured")]
    NotConfigured,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to fetch data: HTTP {0}")]
    Status(u16),
    #[error("Unexpected provider response: {0}")]
    Parse(String),
    #[error("No price available for {0}")]
    NoQuote(String),
    #[error("Price cache unavailable: {0}")]
    Cache(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Chat model is not configured")]
    NotConfigured,
    #[error("Chat model failed: {0}")]
    Model(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Rejection carried through warp filters and turned into a JSON error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl Reject for ApiError {}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_rejection() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let status = match err {
            MarketError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            MarketError::NoQuote(_) => StatusCode::NOT_FOUND,
            MarketError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match err {
            ChatError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

pub fn reject(err: impl Into<ApiError>) -> Rejection {
    warp::reject::custom(err.into())
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(api) = err.find::<ApiError>() {
        (api.status, api.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_cash_message_shows_two_decimals() {
        let err = LedgerError::InsufficientCash {
            available: dec!(500),
            required: dec!(600),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient cash. Available: $500.00, Required: $600.00"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn ledger_errors_map_to_status_codes() {
        let not_found: ApiError = LedgerError::NotFound("Transaction".into()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let storage: ApiError = LedgerError::Storage(StorageError::Query("down".into())).into();
        assert_eq!(storage.status, StatusCode::INTERNAL_SERVER_ERROR);

        let shares: ApiError = LedgerError::InsufficientShares {
            owned: dec!(1),
            requested: dec!(2),
        }
        .into();
        assert_eq!(shares.status, StatusCode::BAD_REQUEST);
    }
}
