//! Custom error types for the trading system
//!
//! Provides structured, typed errors instead of generic Box<dyn Error>

use thiserror::Error;

/// Top-level trading system errors
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Strategy config invalid for {user_id}/{strategy}: {reason}")]
    StrategyConfig {
        user_id: String,
        strategy: String,
        reason: String,
    },

    #[error("No client for user {user_id}")]
    ClientNotFound { user_id: String },

    #[error("No trading task for {user_id}/{symbol}")]
    TaskNotFound { user_id: String, symbol: String },

    #[error("Balance not initialised for {user_id}")]
    BalanceUnavailable { user_id: String },

    #[error("Invalid quantity {qty} for {symbol}")]
    InvalidQuantity { symbol: String, qty: f64 },

    #[error("Invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("Notional too small for {symbol}: {notional} < {min_notional}")]
    MinNotional {
        symbol: String,
        notional: f64,
        min_notional: f64,
    },

    #[error("Position already open for {symbol}: {state}")]
    PositionAlreadyOpen { symbol: String, state: String },

    #[error("No open position for {symbol}")]
    NoOpenPosition { symbol: String },

    #[error("Unknown indicator: {name}")]
    UnknownIndicator { name: String },

    #[error("Handler error in {handler}: {reason}")]
    Handler { handler: String, reason: String },

    #[error("Exchange API error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Exchange-specific errors
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// 4xx responses: the request itself is wrong, never retried
    #[error("HTTP {status}: {body}")]
    Client { status: u16, body: String },

    /// 5xx responses and rate limiting: retryable
    #[error("HTTP {status} (retryable): {body}")]
    Server { status: u16, body: String },

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Classify an HTTP status into a retryable or terminal error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ExchangeError::AuthFailed {
                reason: format!("HTTP {}: {}", status, body),
            },
            400..=499 => ExchangeError::Client { status, body },
            _ => ExchangeError::Server { status, body },
        }
    }

    /// Whether a fresh attempt with a new timestamp and signature may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Server { .. } => true,
            ExchangeError::Network(_) => true,
            _ => false,
        }
    }
}

impl From<String> for TradingError {
    fn from(err: String) -> Self {
        TradingError::Config(err)
    }
}

impl From<&str> for TradingError {
    fn from(err: &str) -> Self {
        TradingError::Config(err.to_string())
    }
}
