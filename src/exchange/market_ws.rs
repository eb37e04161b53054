//! Market data WebSocket: multiplexed K-line streams for one account.
//!
//! The socket carries every `(symbol, interval)` subscription of the account
//! as a combined stream. K-lines are never cached: when a closed frame
//! arrives, the freshest window is fetched over REST and published whole.
//! The exchange does not support adding streams to a live combined socket,
//! so a subscription change forces a reconnect, which restores the full set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::constants::exchange::{
    DEFAULT_KLINE_LIMIT, WS_MAX_RECONNECT_FAILURES, WS_READ_TIMEOUT, WS_RECONNECT_DELAY,
};
use crate::events::{topics, Event};
use crate::exchange::client::ExchangeApi;
use crate::exchange::ConnectionState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KlineSubscription {
    pub symbol: String,
    pub interval: String,
}

impl KlineSubscription {
    fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

#[derive(Clone)]
pub struct MarketWebSocket {
    user_id: String,
    bus: EventBus,
    client: Arc<dyn ExchangeApi>,
    subscriptions: Arc<Mutex<Vec<KlineSubscription>>>,
    state: Arc<Mutex<ConnectionState>>,
    should_run: Arc<AtomicBool>,
    restart: Arc<Notify>,
}

impl MarketWebSocket {
    pub fn new(user_id: &str, bus: EventBus, client: Arc<dyn ExchangeApi>) -> Self {
        Self {
            user_id: user_id.to_string(),
            bus,
            client,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            should_run: Arc::new(AtomicBool::new(true)),
            restart: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscriptions(&self) -> Vec<KlineSubscription> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Add a K-line subscription. If the socket is live the connection is
    /// bounced so the new combined-stream URL takes effect.
    pub fn subscribe_kline(&self, symbol: &str, interval: &str) {
        let sub = KlineSubscription {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        };
        {
            let mut subs = self.subscriptions.lock().unwrap();
            if subs.contains(&sub) {
                return;
            }
            subs.push(sub);
        }
        info!(
            "[DE] K-line subscription added: user_id={} symbol={} interval={}",
            self.user_id, symbol, interval
        );
        if self.is_connected() {
            self.restart.notify_waiters();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn stream_url(&self) -> String {
        let subs = self.subscriptions.lock().unwrap();
        if subs.is_empty() {
            return format!("{}/ws", self.client.ws_url());
        }
        let streams: Vec<String> = subs.iter().map(|s| s.stream_name()).collect();
        format!("{}/stream?streams={}", self.client.ws_url(), streams.join("/"))
    }

    /// Stop the socket permanently. Publishes a final disconnect event.
    pub fn disconnect(&self) {
        self.should_run.store(false, Ordering::Release);
        self.restart.notify_waiters();
        self.set_state(ConnectionState::Disconnected);
        self.publish_disconnected("manual_disconnect");
        info!("[DE] Market WS stopped: user_id={}", self.user_id);
    }

    /// Run the connection loop until `disconnect` is called.
    pub async fn run(&self) {
        let mut consecutive_failures: u32 = 0;

        while self.should_run.load(Ordering::Acquire) {
            let url = self.stream_url();
            self.set_state(if consecutive_failures == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            info!("[DE] Market WS connecting: user_id={} url={}", self.user_id, url);

            match connect_async(&url).await {
                Ok((stream, _)) => {
                    consecutive_failures = 0;
                    self.set_state(ConnectionState::Connected);
                    self.publish_connected();
                    info!("[DE] ✓ Market WS connected: user_id={}", self.user_id);

                    let reason = self.read_loop(stream).await;
                    if !self.should_run.load(Ordering::Acquire) {
                        break;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    self.publish_disconnected(&reason);
                    warn!(
                        "[DE] Market WS disconnected, reconnecting in {:?}: user_id={} reason={}",
                        WS_RECONNECT_DELAY, self.user_id, reason
                    );
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        "[DE] Market WS connect failed ({}/{}): user_id={} error={}",
                        consecutive_failures, WS_MAX_RECONNECT_FAILURES, self.user_id, e
                    );
                    if consecutive_failures >= WS_MAX_RECONNECT_FAILURES {
                        self.set_state(ConnectionState::Failed);
                        self.publish_failed(&e.to_string());
                        error!(
                            "[DE] ❌ Market WS FAILED after {} attempts: user_id={}",
                            consecutive_failures, self.user_id
                        );
                        return;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    self.publish_disconnected(&format!("connect error: {}", e));
                }
            }

            tokio::time::sleep(WS_RECONNECT_DELAY).await;
        }
    }

    /// Read frames until an error, a silent-socket timeout, or a restart
    /// request (subscription change / disconnect). Returns the reason.
    async fn read_loop(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> String {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = self.restart.notified() => {
                    return "resubscribe".to_string();
                }
                frame = tokio::time::timeout(WS_READ_TIMEOUT, read.next()) => {
                    match frame {
                        Err(_) => return "heartbeat timeout".to_string(),
                        Ok(None) => return "stream closed".to_string(),
                        Ok(Some(Err(e))) => return format!("socket error: {}", e),
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.handle_message(&text).await;
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

    async fn handle_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "[DE] Market WS message parse failed: user_id={} error={}",
                    self.user_id, e
                );
                return;
            }
        };

        // Combined-stream frames wrap the payload in {stream, data}.
        let payload = value.get("data").unwrap_or(&value);
        if payload.get("e").and_then(|v| v.as_str()) == Some("kline") {
            self.handle_kline(payload).await;
        } else {
            debug!(
                "[DE] Ignoring non-kline frame: user_id={}",
                self.user_id
            );
        }
    }

    /// Closed K-lines trigger a fresh REST fetch of the whole window, which
    /// is published as `de.kline.update`. Open frames are dropped.
    async fn handle_kline(&self, payload: &Value) {
        let kline = match payload.get("k") {
            Some(k) => k,
            None => return,
        };
        let is_closed = kline.get("x").and_then(|v| v.as_bool()).unwrap_or(false);
        let symbol = kline.get("s").and_then(|v| v.as_str()).unwrap_or("");
        let interval = kline.get("i").and_then(|v| v.as_str()).unwrap_or("");
        if symbol.is_empty() || interval.is_empty() {
            return;
        }
        if !is_closed {
            debug!(
                "[DE] K-line still open, skipping: user_id={} symbol={}",
                self.user_id, symbol
            );
            return;
        }

        info!(
            "[DE] K-line closed: user_id={} symbol={} interval={}",
            self.user_id, symbol, interval
        );

        match self
            .client
            .get_historical_klines(symbol, interval, DEFAULT_KLINE_LIMIT)
            .await
        {
            Ok(klines) => {
                let count = klines.len();
                let event = Event::with_source(
                    topics::de::KLINE_UPDATE,
                    json!({
                        "user_id": &self.user_id,
                        "symbol": symbol,
                        "interval": interval,
                        "klines": klines,
                    }),
                    "DE",
                );
                self.bus.publish(event);
                debug!(
                    "[DE] K-line update published: user_id={} symbol={} count={}",
                    self.user_id, symbol, count
                );
            }
            Err(e) => {
                error!(
                    "[DE] K-line window fetch failed: user_id={} symbol={} error={}",
                    self.user_id, symbol, e
                );
            }
        }
    }

    fn publish_connected(&self) {
        self.bus.publish(Event::with_source(
            topics::de::WEBSOCKET_CONNECTED,
            json!({
                "user_id": &self.user_id,
                "connection_type": "market",
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
                "connection_type": "market",
                "reason": reason,
            }),
            "DE",
        ));
    }

    fn publish_failed(&self, error: &str) {
        self.bus.publish(Event::with_source(
            topics::de::WEBSOCKET_FAILED,
            json!({
                "user_id": &self.user_id,
                "connection_type": "market",
                "error": error,
                "failures": WS_MAX_RECONNECT_FAILURES,
            }),
            "DE",
        ));
    }
}
