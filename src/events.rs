//! Event type and topic constants
//!
//! Every message crossing the bus is an `Event`: a dotted subject string plus
//! an open JSON payload. Subjects follow the `module.object.action` naming
//! convention and are all enumerated in [`topics`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An immutable event. `event_id` and `timestamp` are populated at
/// construction; `data` is always a JSON object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub subject: String,
    pub data: Value,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

impl Event {
    pub fn new(subject: impl Into<String>, data: Value) -> Self {
        Self {
            subject: subject.into(),
            data: normalize_payload(data),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(subject: impl Into<String>, data: Value, source: &str) -> Self {
        let mut event = Self::new(subject, data);
        event.source = Some(source.to_string());
        event
    }

    /// A valid event has a non-blank subject and an object payload.
    pub fn is_valid(&self) -> bool {
        !self.subject.trim().is_empty() && self.data.is_object()
    }

    /// Fetch a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Fetch a numeric field, accepting both JSON numbers and numeric strings
    /// (exchange payloads encode decimals as strings).
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        match self.data.get(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        match self.data.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }
}

fn normalize_payload(data: Value) -> Value {
    if data.is_object() {
        data
    } else {
        Value::Object(Map::new())
    }
}

/// All event subjects used by the system, grouped by producing module.
pub mod topics {
    /// Account registry (PM)
    pub mod pm {
        pub const ACCOUNT_LOADED: &str = "pm.account.loaded";
        pub const ACCOUNT_ENABLED: &str = "pm.account.enabled";
        pub const ACCOUNT_DISABLED: &str = "pm.account.disabled";
        pub const LOAD_FAILED: &str = "pm.load.failed";
        pub const MANAGER_READY: &str = "pm.manager.ready";
        pub const MANAGER_SHUTDOWN: &str = "pm.manager.shutdown";
    }

    /// Data engine (DE)
    pub mod de {
        pub const CLIENT_CONNECTED: &str = "de.client.connected";
        pub const CLIENT_CONNECTION_FAILED: &str = "de.client.connection_failed";
        pub const WEBSOCKET_CONNECTED: &str = "de.websocket.connected";
        pub const WEBSOCKET_DISCONNECTED: &str = "de.websocket.disconnected";
        pub const WEBSOCKET_FAILED: &str = "de.websocket.failed";
        pub const USER_STREAM_STARTED: &str = "de.user_stream.started";
        pub const GET_HISTORICAL_KLINES: &str = "de.get_historical_klines";
        pub const HISTORICAL_KLINES_SUCCESS: &str = "de.historical_klines.success";
        pub const HISTORICAL_KLINES_FAILED: &str = "de.historical_klines.failed";
        pub const KLINE_UPDATE: &str = "de.kline.update";
        pub const ORDER_SUBMITTED: &str = "de.order.submitted";
        pub const ORDER_FAILED: &str = "de.order.failed";
        pub const ORDER_CANCELLED: &str = "de.order.cancelled";
        pub const ORDER_FILLED: &str = "de.order.filled";
        pub const ORDER_UPDATE: &str = "de.order.update";
        pub const ACCOUNT_BALANCE: &str = "de.account.balance";
        pub const ACCOUNT_UPDATE: &str = "de.account.update";
        pub const POSITION_UPDATE: &str = "de.position.update";
    }

    /// Requests consumed by the data engine
    pub mod trading {
        pub const ORDER_CREATE: &str = "trading.order.create";
        pub const ORDER_CANCEL: &str = "trading.order.cancel";
        pub const GET_ACCOUNT_BALANCE: &str = "trading.get_account_balance";
    }

    /// Indicator engine (TA)
    pub mod ta {
        pub const INDICATOR_CREATED: &str = "ta.indicator.created";
        pub const INDICATOR_CREATE_FAILED: &str = "ta.indicator.create_failed";
        pub const CALCULATION_COMPLETED: &str = "ta.calculation.completed";
    }

    /// Strategy engine (ST)
    pub mod st {
        pub const STRATEGY_LOADED: &str = "st.strategy.loaded";
        pub const STRATEGY_LOAD_FAILED: &str = "st.strategy.load_failed";
        pub const INDICATOR_SUBSCRIBE: &str = "st.indicator.subscribe";
        pub const SIGNAL_GENERATED: &str = "st.signal.generated";
        pub const GRID_CREATE: &str = "st.grid.create";
    }

    /// Trade executor (TR)
    pub mod tr {
        pub const POSITION_OPENED: &str = "tr.position.opened";
        pub const POSITION_CLOSED: &str = "tr.position.closed";
        pub const TASK_CREATED: &str = "tr.task.created";
        pub const GRID_CREATED: &str = "tr.grid.created";
        pub const GRID_MOVED: &str = "tr.grid.moved";
        pub const MANAGER_STARTED: &str = "tr.manager.started";
        pub const MANAGER_SHUTDOWN: &str = "tr.manager.shutdown";
    }

    /// System-level alerts published by the bus itself
    pub mod system {
        pub const HANDLER_ERROR: &str = "system.alert.handler_error";
    }
}
