//! perpgrid - event-driven multi-account trading system for perpetual futures
//!
//! This library provides the core runtime: the event bus, the per-domain
//! managers (accounts, data engine, indicators, strategies, trade execution)
//! and the SQLite persistence layer that ties them together.

pub mod bus;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod events;
pub mod exchange;
pub mod indicators;
pub mod services;

// Re-export commonly used types
pub use bus::EventBus;
pub use config::{AccountsConfig, StrategyConfig};
pub use error::{ExchangeError, TradingError};
pub use events::{topics, Event};

#[cfg(test)]
mod events_tests;
#[cfg(test)]
mod config_tests;
