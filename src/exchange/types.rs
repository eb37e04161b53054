//! Wire-level data types shared by the REST client and the WebSocket streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExchangeError;

/// Order direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Exchange order types used by the execution paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "POST_ONLY")]
    PostOnly,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
    #[serde(rename = "TAKE_PROFIT_MARKET")]
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::PostOnly => "POST_ONLY",
            OrderType::Stop => "STOP",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "POST_ONLY" => Some(OrderType::PostOnly),
            "STOP" => Some(OrderType::Stop),
            "TAKE_PROFIT" => Some(OrderType::TakeProfit),
            "STOP_MARKET" => Some(OrderType::StopMarket),
            "TAKE_PROFIT_MARKET" => Some(OrderType::TakeProfitMarket),
            _ => None,
        }
    }

    pub fn requires_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::PostOnly)
    }
}

/// One K-line in the normalized shape used everywhere past the wire layer.
/// Historical K-lines are always closed; stream frames carry the close flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: i64,
    pub is_closed: bool,
}

impl Kline {
    /// Parse one row of the exchange's kline array format:
    /// `[open_time, open, high, low, close, volume, close_time, ...]`.
    pub fn from_exchange_row(row: &Value) -> Result<Kline, ExchangeError> {
        let arr = row.as_array().ok_or_else(|| {
            ExchangeError::WebSocket("kline row is not an array".to_string())
        })?;
        let field = |idx: usize| -> Result<f64, ExchangeError> {
            match arr.get(idx) {
                Some(Value::String(s)) => s.parse::<f64>().map_err(|e| {
                    ExchangeError::WebSocket(format!("kline field {}: {}", idx, e))
                }),
                Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(0.0)),
                _ => Err(ExchangeError::WebSocket(format!(
                    "kline field {} missing",
                    idx
                ))),
            }
        };
        Ok(Kline {
            timestamp: arr.first().and_then(|v| v.as_i64()).unwrap_or(0),
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            is_closed: true,
        })
    }

    pub fn from_exchange_rows(rows: &Value) -> Result<Vec<Kline>, ExchangeError> {
        rows.as_array()
            .ok_or_else(|| ExchangeError::WebSocket("klines payload is not an array".to_string()))?
            .iter()
            .map(Kline::from_exchange_row)
            .collect()
    }
}

/// An order about to be submitted. The client order id is caller-generated
/// and echoed back by the exchange, which is what lets fills be correlated
/// to the intent that produced them.
#[derive(Clone, Debug)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl PlaceOrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn post_only(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::PostOnly,
            quantity,
            price: Some(price),
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, client_order_id: &str) -> Self {
        self.client_order_id = Some(client_order_id.to_string());
        self
    }
}

/// Exchange acknowledgement of an accepted or cancelled order.
#[derive(Clone, Debug)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: f64,
    pub raw: Value,
}

impl OrderAck {
    pub fn from_response(raw: Value) -> Self {
        let order_id = raw
            .get("orderId")
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => "unknown".to_string(),
            })
            .unwrap_or_else(|| "unknown".to_string());
        let text = |key: &str| {
            raw.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let num = |key: &str| {
            raw.get(key)
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<f64>().ok(),
                    Value::Number(n) => n.as_f64(),
                    _ => None,
                })
                .unwrap_or(0.0)
        };
        Self {
            order_id,
            symbol: text("symbol"),
            status: text("status"),
            side: text("side"),
            order_type: text("type"),
            quantity: num("origQty"),
            price: num("price"),
            raw,
        }
    }
}

/// Result of a successful order submission, with the number of retries that
/// were needed before the exchange accepted it.
#[derive(Clone, Debug)]
pub struct OrderSubmission {
    pub ack: OrderAck,
    pub retries: u32,
}

/// Terminal submission failure carrying the total attempt count.
#[derive(Debug)]
pub struct SubmitFailure {
    pub error: ExchangeError,
    pub attempts: u32,
}

/// Account balance for a single margin asset.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceInfo {
    pub asset: String,
    pub balance: f64,
    pub available_balance: f64,
}
