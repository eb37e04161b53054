//! DataEngine: the external connection supervisor.
//!
//! Owns one REST client, one market WebSocket and one user-data WebSocket per
//! account, all driven by events. A failure in one account's connections
//! never touches another account's.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::constants::exchange::DEFAULT_KLINE_LIMIT;
use crate::error::{ExchangeError, TradingError};
use crate::events::{topics, Event};
use crate::exchange::client::{ExchangeApi, FuturesClient};
use crate::exchange::market_ws::MarketWebSocket;
use crate::exchange::types::{OrderType, PlaceOrderRequest, Side};
use crate::exchange::user_ws::UserDataWebSocket;

/// Builds an API client for an account. Tests inject doubles through this.
pub type ClientFactory =
    Arc<dyn Fn(&str, &str, &str, bool) -> Arc<dyn ExchangeApi> + Send + Sync>;

#[derive(Clone)]
pub struct DataEngine {
    bus: EventBus,
    client_factory: ClientFactory,
    clients: Arc<DashMap<String, Arc<dyn ExchangeApi>>>,
    market_streams: Arc<DashMap<String, MarketWebSocket>>,
    user_streams: Arc<DashMap<String, UserDataWebSocket>>,
    stream_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// When false, WS streams are registered but never spawned (tests).
    spawn_streams: bool,
}

impl DataEngine {
    pub fn new(bus: EventBus) -> Self {
        Self::with_client_factory(
            bus,
            Arc::new(|user_id, api_key, api_secret, testnet| {
                Arc::new(FuturesClient::new(user_id, api_key, api_secret, testnet))
                    as Arc<dyn ExchangeApi>
            }),
        )
    }

    pub fn with_client_factory(bus: EventBus, client_factory: ClientFactory) -> Self {
        info!("[DE] DataEngine initialised");
        Self {
            bus,
            client_factory,
            clients: Arc::new(DashMap::new()),
            market_streams: Arc::new(DashMap::new()),
            user_streams: Arc::new(DashMap::new()),
            stream_tasks: Arc::new(Mutex::new(Vec::new())),
            spawn_streams: true,
        }
    }

    /// Register streams without spawning their connection loops. Used by
    /// tests that drive the engine with synthetic events.
    pub fn without_stream_tasks(mut self) -> Self {
        self.spawn_streams = false;
        self
    }

    /// Register all event subscriptions.
    pub fn start(&self) {
        let engine = self.clone();
        self.bus.subscribe(
            topics::pm::ACCOUNT_LOADED,
            "data_engine.on_account_loaded",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_account_loaded(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::st::STRATEGY_LOADED,
            "data_engine.on_strategy_loaded",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_strategy_loaded(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::de::GET_HISTORICAL_KLINES,
            "data_engine.on_get_historical_klines",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_get_historical_klines(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::trading::ORDER_CREATE,
            "data_engine.on_order_create",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_order_create(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::trading::ORDER_CANCEL,
            "data_engine.on_order_cancel",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_order_cancel(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::trading::GET_ACCOUNT_BALANCE,
            "data_engine.on_get_account_balance",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_get_account_balance(event).await })
            },
        );

        info!("[DE] DataEngine subscriptions registered");
    }

    pub fn has_client(&self, user_id: &str) -> bool {
        self.clients.contains_key(user_id)
    }

    pub fn client(&self, user_id: &str) -> Option<Arc<dyn ExchangeApi>> {
        self.clients.get(user_id).map(|c| c.clone())
    }

    pub fn market_stream(&self, user_id: &str) -> Option<MarketWebSocket> {
        self.market_streams.get(user_id).map(|s| s.clone())
    }

    pub fn user_stream(&self, user_id: &str) -> Option<UserDataWebSocket> {
        self.user_streams.get(user_id).map(|s| s.clone())
    }

    async fn on_account_loaded(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let api_key = event.str_field("api_key").unwrap_or("").to_string();
        let api_secret = event.str_field("api_secret").unwrap_or("").to_string();
        let testnet = event.bool_field("testnet").unwrap_or(false);

        if user_id.is_empty() || api_key.is_empty() || api_secret.is_empty() {
            let mut missing = Vec::new();
            if user_id.is_empty() {
                missing.push("user_id");
            }
            if api_key.is_empty() {
                missing.push("api_key");
            }
            if api_secret.is_empty() {
                missing.push("api_secret");
            }
            let reason = format!("missing fields: {}", missing.join(", "));
            error!("[DE] Account setup rejected: {}", reason);
            self.publish_connection_failed(
                if user_id.is_empty() { "unknown" } else { &user_id },
                "missing_fields",
                &reason,
            );
            return Ok(());
        }

        info!("[DE] Building client: user_id={} testnet={}", user_id, testnet);
        let client = (self.client_factory)(&user_id, &api_key, &api_secret, testnet);

        // Probe the signed surface once so a bad key aborts this account's
        // setup without touching the other accounts.
        if let Err(e) = client.get_account_balance("USDT").await {
            if matches!(e, ExchangeError::AuthFailed { .. }) {
                error!(
                    "[DE] ❌ Credentials rejected: user_id={} error={}",
                    user_id, e
                );
                self.publish_connection_failed(&user_id, "auth", &e.to_string());
                return Ok(());
            }
            // Transient probe failures are survivable; the client stays.
            warn!(
                "[DE] Balance probe failed (continuing): user_id={} error={}",
                user_id, e
            );
        }

        self.clients.insert(user_id.clone(), client.clone());
        self.bus.publish(Event::with_source(
            topics::de::CLIENT_CONNECTED,
            json!({
                "user_id": &user_id,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
            "DE",
        ));
        info!("[DE] ✓ Client ready: user_id={}", user_id);

        // The user-data stream starts with the account; the market stream
        // waits for the strategy's subscription set.
        let user_ws = UserDataWebSocket::new(&user_id, self.bus.clone(), client);
        self.user_streams.insert(user_id.clone(), user_ws.clone());
        if self.spawn_streams {
            let handle = tokio::spawn(async move { user_ws.run().await });
            self.stream_tasks.lock().unwrap().push(handle);
        }
        Ok(())
    }

    async fn on_strategy_loaded(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let timeframe = event.str_field("timeframe").unwrap_or("15m").to_string();
        let symbols: Vec<String> = event
            .data
            .get("trading_pairs")
            .and_then(|v| v.as_array())
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|p| match p {
                        serde_json::Value::String(s) => Some(s.clone()),
                        other => other
                            .get("symbol")
                            .and_then(|s| s.as_str())
                            .map(|s| s.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if symbols.is_empty() {
            warn!("[DE] Strategy loaded without symbols: user_id={}", user_id);
            return Ok(());
        }
        let Some(client) = self.client(&user_id) else {
            error!(
                "[DE] Cannot start market stream, no client: user_id={}",
                user_id
            );
            return Ok(());
        };

        let stream = self
            .market_streams
            .entry(user_id.clone())
            .or_insert_with(|| MarketWebSocket::new(&user_id, self.bus.clone(), client))
            .clone();
        for symbol in &symbols {
            stream.subscribe_kline(symbol, &timeframe);
        }

        // First strategy load for the user spawns the connection loop.
        if self.spawn_streams && stream.state() == crate::exchange::ConnectionState::Disconnected
        {
            let runner = stream.clone();
            let handle = tokio::spawn(async move { runner.run().await });
            self.stream_tasks.lock().unwrap().push(handle);
            info!(
                "[DE] Market stream starting: user_id={} symbols={:?} interval={}",
                user_id, symbols, timeframe
            );
        }
        Ok(())
    }

    async fn on_get_historical_klines(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let interval = event.str_field("interval").unwrap_or("").to_string();
        let limit = event.u64_field("limit").unwrap_or(DEFAULT_KLINE_LIMIT as u64) as usize;

        let Some(client) = self.client(&user_id) else {
            self.bus.publish(Event::with_source(
                topics::de::HISTORICAL_KLINES_FAILED,
                json!({
                    "user_id": &user_id,
                    "symbol": &symbol,
                    "interval": &interval,
                    "error": format!("no client for user {}", user_id),
                }),
                "DE",
            ));
            return Ok(());
        };

        match client.get_historical_klines(&symbol, &interval, limit).await {
            Ok(klines) => {
                info!(
                    "[DE] Historical klines fetched: user_id={} symbol={} interval={} count={}",
                    user_id,
                    symbol,
                    interval,
                    klines.len()
                );
                self.bus.publish(Event::with_source(
                    topics::de::HISTORICAL_KLINES_SUCCESS,
                    json!({
                        "user_id": user_id,
                        "symbol": symbol,
                        "interval": interval,
                        "klines": klines,
                    }),
                    "DE",
                ));
            }
            Err(e) => {
                error!(
                    "[DE] Historical klines failed: user_id={} symbol={} error={}",
                    user_id, symbol, e
                );
                self.bus.publish(Event::with_source(
                    topics::de::HISTORICAL_KLINES_FAILED,
                    json!({
                        "user_id": user_id,
                        "symbol": symbol,
                        "interval": interval,
                        "error": e.to_string(),
                    }),
                    "DE",
                ));
            }
        }
        Ok(())
    }

    async fn on_order_create(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let side = event.str_field("side").and_then(Side::parse);
        let order_type = event.str_field("order_type").and_then(OrderType::parse);
        let quantity = event.f64_field("quantity").unwrap_or(0.0);
        let price = event.f64_field("price");
        let reduce_only = event.bool_field("reduce_only").unwrap_or(false);
        let client_order_id = event.str_field("client_order_id").map(|s| s.to_string());

        let (Some(side), Some(order_type)) = (side, order_type) else {
            self.publish_order_failed(
                &user_id,
                &symbol,
                client_order_id.as_deref(),
                "invalid side or order_type",
                0,
            );
            return Ok(());
        };
        let Some(client) = self.client(&user_id) else {
            self.publish_order_failed(
                &user_id,
                &symbol,
                client_order_id.as_deref(),
                &format!("no client for user {}", user_id),
                0,
            );
            return Ok(());
        };

        let request = PlaceOrderRequest {
            symbol: symbol.clone(),
            side,
            order_type,
            quantity,
            price,
            reduce_only,
            client_order_id: client_order_id.clone(),
        };
        match client.place_order(&request).await {
            Ok(submission) => {
                info!(
                    "[DE] Order submitted: user_id={} order_id={} symbol={} retries={}",
                    user_id, submission.ack.order_id, symbol, submission.retries
                );
                self.bus.publish(Event::with_source(
                    topics::de::ORDER_SUBMITTED,
                    json!({
                        "user_id": user_id,
                        "order_id": submission.ack.order_id,
                        "client_order_id": client_order_id,
                        "symbol": symbol,
                        "side": side.as_str(),
                        "type": order_type.as_str(),
                        "quantity": quantity,
                        "price": price.unwrap_or(0.0),
                    }),
                    "DE",
                ));
            }
            Err(failure) => {
                error!(
                    "[DE] Order failed: user_id={} symbol={} attempts={} error={}",
                    user_id, symbol, failure.attempts, failure.error
                );
                self.publish_order_failed(
                    &user_id,
                    &symbol,
                    client_order_id.as_deref(),
                    &failure.error.to_string(),
                    failure.attempts,
                );
            }
        }
        Ok(())
    }

    async fn on_order_cancel(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let order_id = event
            .str_field("order_id")
            .map(|s| s.to_string())
            .or_else(|| event.u64_field("order_id").map(|n| n.to_string()))
            .unwrap_or_default();

        let Some(client) = self.client(&user_id) else {
            self.publish_order_failed(
                &user_id,
                &symbol,
                None,
                &format!("no client for user {}", user_id),
                0,
            );
            return Ok(());
        };

        match client.cancel_order(&symbol, &order_id).await {
            Ok(ack) => {
                self.bus.publish(Event::with_source(
                    topics::de::ORDER_CANCELLED,
                    json!({
                        "user_id": user_id,
                        "order_id": ack.order_id,
                        "symbol": symbol,
                        "status": ack.status,
                    }),
                    "DE",
                ));
            }
            Err(e) => {
                error!(
                    "[DE] Order cancel failed: user_id={} order_id={} error={}",
                    user_id, order_id, e
                );
                self.publish_order_failed(&user_id, &symbol, None, &e.to_string(), 0);
            }
        }
        Ok(())
    }

    async fn on_get_account_balance(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let asset = event.str_field("asset").unwrap_or("USDT").to_string();

        let Some(client) = self.client(&user_id) else {
            error!("[DE] Balance query: no client for user {}", user_id);
            return Ok(());
        };

        match client.get_account_balance(&asset).await {
            Ok(balance) => {
                info!(
                    "[DE] Balance: user_id={} asset={} available={}",
                    user_id, asset, balance.available_balance
                );
                self.bus.publish(Event::with_source(
                    topics::de::ACCOUNT_BALANCE,
                    json!({
                        "user_id": user_id,
                        "asset": balance.asset,
                        "balance": balance.balance,
                        "available_balance": balance.available_balance,
                    }),
                    "DE",
                ));
            }
            Err(e) => {
                error!(
                    "[DE] Balance query failed: user_id={} asset={} error={}",
                    user_id, asset, e
                );
            }
        }
        Ok(())
    }

    fn publish_connection_failed(&self, user_id: &str, error_type: &str, message: &str) {
        self.bus.publish(Event::with_source(
            topics::de::CLIENT_CONNECTION_FAILED,
            json!({
                "user_id": user_id,
                "error_type": error_type,
                "error_message": message,
            }),
            "DE",
        ));
    }

    fn publish_order_failed(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: Option<&str>,
        error: &str,
        retry_count: u32,
    ) {
        self.bus.publish(Event::with_source(
            topics::de::ORDER_FAILED,
            json!({
                "user_id": user_id,
                "symbol": symbol,
                "client_order_id": client_order_id,
                "error": error,
                "retry_count": retry_count,
            }),
            "DE",
        ));
    }

    /// Close every stream and abort the connection tasks.
    pub async fn shutdown(&self) {
        info!(
            "[DE] Shutting down: {} market stream(s), {} user stream(s)",
            self.market_streams.len(),
            self.user_streams.len()
        );
        for entry in self.market_streams.iter() {
            entry.value().disconnect();
        }
        let user_streams: Vec<UserDataWebSocket> =
            self.user_streams.iter().map(|e| e.value().clone()).collect();
        for stream in user_streams {
            stream.disconnect().await;
        }

        let handles: Vec<JoinHandle<()>> = self.stream_tasks.lock().unwrap().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        self.market_streams.clear();
        self.user_streams.clear();
        self.clients.clear();
        info!("[DE] DataEngine shut down");
    }
}
