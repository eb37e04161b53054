//! Application-wide constants and magic numbers
//!
//! This module centralizes all hardcoded values to improve maintainability
//! and make the codebase easier to tune.

use std::time::Duration;

/// Event bus and journal constants
pub mod bus {
    use super::*;

    /// Maximum number of journaled events kept in the events table
    pub const JOURNAL_MAX_EVENTS: usize = 1000;

    /// Grace period granted to in-flight handlers during shutdown
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
}

/// Capital and trading constants
pub mod trading {
    /// Safety margin applied to the available balance (use 95% not 100%)
    pub const CAPITAL_SAFETY_RATIO: f64 = 0.95;

    /// Default taker fee rate (0.04%)
    pub const DEFAULT_FEE_RATE: f64 = 0.0004;

    /// Default minimum notional value of an order (USDT/USDC)
    pub const DEFAULT_MIN_NOTIONAL: f64 = 5.0;

    /// Default price precision (decimal places) when the symbol has no config
    pub const DEFAULT_PRICE_PRECISION: u32 = 2;

    /// Default quantity precision (decimal places) when the symbol has no config
    pub const DEFAULT_QUANTITY_PRECISION: u32 = 0;
}

/// Exchange connectivity constants
pub mod exchange {
    use super::*;

    /// REST request timeout
    pub const REST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Maximum attempts for an order submission (1 initial + 2 retries)
    pub const ORDER_MAX_ATTEMPTS: u32 = 3;

    /// Listen-key keepalive interval (Binance expires keys after 60 minutes)
    pub const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

    /// Delay before a WebSocket reconnect attempt
    pub const WS_RECONNECT_DELAY: Duration = Duration::from_secs(3);

    /// Read heartbeat: a silent socket is force-reconnected after this long
    pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);

    /// Consecutive reconnect failures before a connection is declared failed
    pub const WS_MAX_RECONNECT_FAILURES: u32 = 5;

    /// Default number of historical K-lines fetched for indicator windows
    pub const DEFAULT_KLINE_LIMIT: usize = 200;
}
