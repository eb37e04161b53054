pub mod client;
pub mod market_ws;
pub mod types;
pub mod user_ws;

pub use client::{ExchangeApi, FuturesClient};
pub use types::{
    BalanceInfo, Kline, OrderAck, OrderSubmission, OrderType, PlaceOrderRequest, Side,
    SubmitFailure,
};

use std::fmt;

/// Lifecycle of a single REST/WS connection. `Reconnecting` is entered on any
/// socket error or keepalive failure; `Failed` after five consecutive
/// reconnection failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
