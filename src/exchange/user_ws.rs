//! User-data WebSocket: order, account and position updates for one account.
//!
//! The stream is bound to a listen key obtained over REST and refreshed every
//! 30 minutes. A dropped stream discards the key entirely — reconnection
//! always requests a fresh one before reopening.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::constants::exchange::{
    LISTEN_KEY_KEEPALIVE, WS_MAX_RECONNECT_FAILURES, WS_READ_TIMEOUT, WS_RECONNECT_DELAY,
};
use crate::events::{topics, Event};
use crate::exchange::client::ExchangeApi;
use crate::exchange::ConnectionState;

#[derive(Clone)]
pub struct UserDataWebSocket {
    user_id: String,
    bus: EventBus,
    client: Arc<dyn ExchangeApi>,
    listen_key: Arc<Mutex<Option<String>>>,
    state: Arc<Mutex<ConnectionState>>,
    should_run: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl UserDataWebSocket {
    pub fn new(user_id: &str, bus: EventBus, client: Arc<dyn ExchangeApi>) -> Self {
        Self {
            user_id: user_id.to_string(),
            bus,
            client,
            listen_key: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            should_run: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn listen_key(&self) -> Option<String> {
        self.listen_key.lock().unwrap().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub async fn disconnect(&self) {
        self.should_run.store(false, Ordering::Release);
        self.stop.notify_waiters();
        let key = self.listen_key.lock().unwrap().take();
        if let Some(key) = key {
            if let Err(e) = self.client.close_listen_key(&key).await {
                warn!(
                    "[DE] Listen key close failed: user_id={} error={}",
                    self.user_id, e
                );
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.publish_disconnected("manual_disconnect");
        info!("[DE] User-data WS stopped: user_id={}", self.user_id);
    }

    pub async fn run(&self) {
        let mut consecutive_failures: u32 = 0;

        while self.should_run.load(Ordering::Acquire) {
            self.set_state(if consecutive_failures == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            // Always start from a fresh key after a disconnect.
            let listen_key = match self.client.create_listen_key().await {
                Ok(key) => {
                    *self.listen_key.lock().unwrap() = Some(key.clone());
                    key
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        "[DE] Listen key create failed ({}/{}): user_id={} error={}",
                        consecutive_failures, WS_MAX_RECONNECT_FAILURES, self.user_id, e
                    );
                    if consecutive_failures >= WS_MAX_RECONNECT_FAILURES {
                        self.fail(&e.to_string());
                        return;
                    }
                    tokio::time::sleep(WS_RECONNECT_DELAY).await;
                    continue;
                }
            };

            let url = format!("{}/ws/{}", self.client.ws_url(), listen_key);
            info!("[DE] User-data WS connecting: user_id={}", self.user_id);

            match connect_async(&url).await {
                Ok((stream, _)) => {
                    consecutive_failures = 0;
                    self.set_state(ConnectionState::Connected);
                    self.publish_stream_started(&listen_key);
                    info!("[DE] ✓ User-data WS connected: user_id={}", self.user_id);

                    let reason = self.read_loop(stream, &listen_key).await;
                    let _ = self.listen_key.lock().unwrap().take();
                    if !self.should_run.load(Ordering::Acquire) {
                        break;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    self.publish_disconnected(&reason);
                    warn!(
                        "[DE] User-data WS disconnected, reconnecting with new listen key: user_id={} reason={}",
                        self.user_id, reason
                    );
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let _ = self.listen_key.lock().unwrap().take();
                    error!(
                        "[DE] User-data WS connect failed ({}/{}): user_id={} error={}",
                        consecutive_failures, WS_MAX_RECONNECT_FAILURES, self.user_id, e
                    );
                    if consecutive_failures >= WS_MAX_RECONNECT_FAILURES {
                        self.fail(&e.to_string());
                        return;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    self.publish_disconnected(&format!("connect error: {}", e));
                }
            }

            tokio::time::sleep(WS_RECONNECT_DELAY).await;
        }
    }

    fn fail(&self, error: &str) {
        self.set_state(ConnectionState::Failed);
        self.bus.publish(Event::with_source(
            topics::de::WEBSOCKET_FAILED,
            json!({
                "user_id": &self.user_id,
                "connection_type": "user_data",
                "error": error,
                "failures": WS_MAX_RECONNECT_FAILURES,
            }),
            "DE",
        ));
        error!(
            "[DE] ❌ User-data WS FAILED: user_id={} error={}",
            self.user_id, error
        );
    }

    /// Reads frames and keeps the listen key alive every 30 minutes. Returns
    /// the disconnect reason. A keepalive failure forces a reconnect (the
    /// key may already be invalid server-side).
    async fn read_loop(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        listen_key: &str,
    ) -> String {
        let (mut write, mut read) = stream.split();
        let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    return "manual_disconnect".to_string();
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.client.keepalive_listen_key(listen_key).await {
                        error!(
                            "[DE] Listen key keepalive failed: user_id={} error={}",
                            self.user_id, e
                        );
                        return format!("keepalive failed: {}", e);
                    }
                    info!("[DE] Listen key keepalive ok: user_id={}", self.user_id);
                }
                frame = tokio::time::timeout(WS_READ_TIMEOUT, read.next()) => {
                    match frame {
                        Err(_) => return "heartbeat timeout".to_string(),
                        Ok(None) => return "stream closed".to_string(),
                        Ok(Some(Err(e))) => return format!("socket error: {}", e),
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.handle_message(&text);
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return "connection_closed".to_string();
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "[DE] User-data message parse failed: user_id={} error={}",
                    self.user_id, e
                );
                return;
            }
        };

        match value.get("e").and_then(|v| v.as_str()) {
            Some("ORDER_TRADE_UPDATE") => {
                if let Some(order) = value.get("o") {
                    self.handle_order_update(order);
                }
            }
            Some("ACCOUNT_UPDATE") => {
                if let Some(account) = value.get("a") {
                    self.handle_account_update(account);
                }
            }
            Some("listenKeyExpired") => {
                warn!("[DE] Listen key expired server-side: user_id={}", self.user_id);
            }
            other => {
                debug!(
                    "[DE] Unhandled user-data event: user_id={} type={:?}",
                    self.user_id, other
                );
            }
        }
    }

    fn handle_order_update(&self, order: &Value) {
        let order_id = order
            .get("i")
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            })
            .unwrap_or_default();
        let symbol = order.get("s").and_then(|v| v.as_str()).unwrap_or("");
        let status = order.get("X").and_then(|v| v.as_str()).unwrap_or("");
        let side = order.get("S").and_then(|v| v.as_str()).unwrap_or("");
        let client_order_id = order.get("c").and_then(|v| v.as_str()).unwrap_or("");
        let filled = str_num(order, "z");
        let total = str_num(order, "q");

        debug!(
            "[DE] Order update: user_id={} order_id={} symbol={} status={}",
            self.user_id, order_id, symbol, status
        );

        self.bus.publish(Event::with_source(
            topics::de::ORDER_UPDATE,
            json!({
                "user_id": &self.user_id,
                "order_id": &order_id,
                "client_order_id": client_order_id,
                "symbol": symbol,
                "status": status,
                "filled_quantity": filled,
                "remaining_quantity": (total - filled).max(0.0),
            }),
            "DE",
        ));

        // A complete fill gets its own event; partial fills do not move
        // position state downstream.
        if status == "FILLED" {
            let avg_price = str_num(order, "ap");
            let price = if avg_price > 0.0 {
                avg_price
            } else {
                str_num(order, "p")
            };
            self.bus.publish(Event::with_source(
                topics::de::ORDER_FILLED,
                json!({
                    "user_id": &self.user_id,
                    "order_id": &order_id,
                    "client_order_id": client_order_id,
                    "symbol": symbol,
                    "side": side,
                    "price": price,
                    "quantity": filled,
                    "timestamp": order.get("T").and_then(|v| v.as_i64()).unwrap_or(0),
                }),
                "DE",
            ));
        }
    }

    fn handle_account_update(&self, account: &Value) {
        let balances = account.get("B").and_then(|v| v.as_array());
        if let Some(balances) = balances {
            if let Some(margin) = balances.iter().find(|b| {
                matches!(
                    b.get("a").and_then(|v| v.as_str()),
                    Some("USDT") | Some("USDC")
                )
            }) {
                let wallet = str_num(margin, "wb");
                let cross = str_num(margin, "cw");
                self.bus.publish(Event::with_source(
                    topics::de::ACCOUNT_UPDATE,
                    json!({
                        "user_id": &self.user_id,
                        "asset": margin.get("a").and_then(|v| v.as_str()).unwrap_or(""),
                        "total_equity": wallet,
                        "available_balance": cross,
                        "margin_used": (wallet - cross).max(0.0),
                    }),
                    "DE",
                ));
            }
        }

        if let Some(positions) = account.get("P").and_then(|v| v.as_array()) {
            for position in positions {
                let amount = str_num(position, "pa");
                self.bus.publish(Event::with_source(
                    topics::de::POSITION_UPDATE,
                    json!({
                        "user_id": &self.user_id,
                        "symbol": position.get("s").and_then(|v| v.as_str()).unwrap_or(""),
                        "side": if amount >= 0.0 { "LONG" } else { "SHORT" },
                        "quantity": amount.abs(),
                        "unrealized_pnl": str_num(position, "up"),
                        "entry_price": str_num(position, "ep"),
                    }),
                    "DE",
                ));
            }
        }
    }

    fn publish_stream_started(&self, listen_key: &str) {
        self.bus.publish(Event::with_source(
            topics::de::USER_STREAM_STARTED,
            json!({
                "user_id": &self.user_id,
                "listen_key": listen_key,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
            "DE",
        ));
    }

    fn publish_disconnected(&self, reason: &str) {
        self.bus.publish(Event::with_source(
            topics::de::WEBSOCKET_DISCONNECTED,
            json!({
                "user_id": &self.user_id,
                "connection_type": "user_data",
                "reason": reason,
            }),
            "DE",
        ));
    }
}

/// Exchange payloads encode decimals as strings; accept numbers too.
fn str_num(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
