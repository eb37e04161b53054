//! IndicatorEngine: indicator instance registry, K-line driven recomputation
//! and per-(user, symbol) result aggregation.
//!
//! Instances are keyed by `{user_id}_{symbol}_{interval}_{name}`. The engine
//! never caches K-lines — every computation runs over the window supplied by
//! the data engine. Only closed K-lines arrive here at all.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::events::{topics, Event};
use crate::exchange::types::Kline;
use crate::indicators::{Indicator, IndicatorFactory};

pub struct IndicatorInstance {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub name: String,
    pub ready: bool,
    indicator: Box<dyn Indicator>,
}

impl IndicatorInstance {
    pub fn instance_id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.user_id, self.symbol, self.interval, self.name
        )
    }

    pub fn min_klines_required(&self) -> usize {
        self.indicator.min_klines_required()
    }

    fn matches(&self, user_id: &str, symbol: &str, interval: &str) -> bool {
        self.user_id == user_id && self.symbol == symbol && self.interval == interval
    }
}

/// Collects per-indicator results until every registered indicator for the
/// `(user, symbol)` key has deposited one for the current tick.
#[derive(Default)]
struct AggregatorSlot {
    interval: String,
    results: HashMap<String, Value>,
}

#[derive(Clone)]
pub struct IndicatorEngine {
    bus: EventBus,
    factory: Arc<IndicatorFactory>,
    instances: Arc<DashMap<String, IndicatorInstance>>,
    aggregators: Arc<DashMap<String, AggregatorSlot>>,
}

impl IndicatorEngine {
    pub fn new(bus: EventBus, factory: IndicatorFactory) -> Self {
        info!(
            "[TA] IndicatorEngine initialised, registered indicators: {:?}",
            factory.registered_names()
        );
        Self {
            bus,
            factory: Arc::new(factory),
            instances: Arc::new(DashMap::new()),
            aggregators: Arc::new(DashMap::new()),
        }
    }

    /// Register all event subscriptions.
    pub fn start(&self) {
        let engine = self.clone();
        self.bus.subscribe(
            topics::st::INDICATOR_SUBSCRIBE,
            "indicator_engine.on_subscribe",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_indicator_subscribe(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::de::HISTORICAL_KLINES_SUCCESS,
            "indicator_engine.on_historical_klines",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_historical_klines_success(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::de::HISTORICAL_KLINES_FAILED,
            "indicator_engine.on_historical_klines_failed",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_historical_klines_failed(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::de::KLINE_UPDATE,
            "indicator_engine.on_kline_update",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_kline_update(event).await })
            },
        );

        info!("[TA] IndicatorEngine subscriptions registered");
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_ready(&self, instance_id: &str) -> Option<bool> {
        self.instances.get(instance_id).map(|i| i.ready)
    }

    async fn on_indicator_subscribe(
        &self,
        event: Event,
    ) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let name = event.str_field("indicator_name").unwrap_or("").to_string();
        let timeframe = event.str_field("timeframe").unwrap_or("15m").to_string();
        let params = event
            .data
            .get("indicator_params")
            .cloned()
            .unwrap_or_else(|| json!({}));

        debug!(
            "[TA] Subscribe request: user_id={} symbol={} indicator={} timeframe={}",
            user_id, symbol, name, timeframe
        );

        let indicator = match self.factory.create(&name, &params) {
            Ok(indicator) => indicator,
            Err(e) => {
                error!(
                    "[TA] Indicator create failed: user_id={} symbol={} indicator={} error={}",
                    user_id, symbol, name, e
                );
                self.bus.publish(Event::with_source(
                    topics::ta::INDICATOR_CREATE_FAILED,
                    json!({
                        "user_id": &user_id,
                        "symbol": &symbol,
                        "indicator_name": &name,
                        "error": e.to_string(),
                    }),
                    "ta",
                ));
                return Ok(());
            }
        };

        let instance = IndicatorInstance {
            user_id: user_id.clone(),
            symbol: symbol.clone(),
            interval: timeframe.clone(),
            name: name.clone(),
            ready: false,
            indicator,
        };
        let instance_id = instance.instance_id();
        let min_klines = instance.min_klines_required();
        self.instances.insert(instance_id.clone(), instance);
        info!("[TA] 📊 Indicator instance created: {}", instance_id);

        // Bootstrap the instance with the window it needs.
        self.bus.publish(Event::with_source(
            topics::de::GET_HISTORICAL_KLINES,
            json!({
                "user_id": &user_id,
                "symbol": &symbol,
                "interval": &timeframe,
                "limit": min_klines,
            }),
            "ta",
        ));

        self.bus.publish(Event::with_source(
            topics::ta::INDICATOR_CREATED,
            json!({
                "user_id": &user_id,
                "symbol": &symbol,
                "indicator_name": &name,
                "indicator_id": &instance_id,
            }),
            "ta",
        ));
        Ok(())
    }

    async fn on_historical_klines_success(
        &self,
        event: Event,
    ) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("");
        let symbol = event.str_field("symbol").unwrap_or("");
        let interval = event.str_field("interval").unwrap_or("");
        let klines = parse_klines(&event.data);

        debug!(
            "[TA] Historical klines received: user_id={} symbol={} interval={} count={}",
            user_id,
            symbol,
            interval,
            klines.len()
        );

        let matching: Vec<String> = self
            .instances
            .iter()
            .filter(|e| e.value().matches(user_id, symbol, interval))
            .map(|e| e.key().clone())
            .collect();

        for key in matching {
            if let Some(mut instance) = self.instances.get_mut(&key) {
                // First calculation doubles as initialization.
                instance.indicator.calculate(&klines);
                instance.ready = true;
                info!("[TA] Indicator ready: {}", key);
            }
        }
        Ok(())
    }

    async fn on_historical_klines_failed(
        &self,
        event: Event,
    ) -> Result<(), crate::error::TradingError> {
        error!(
            "[TA] Historical klines failed: user_id={:?} symbol={:?} error={:?}",
            event.str_field("user_id"),
            event.str_field("symbol"),
            event.str_field("error"),
        );
        Ok(())
    }

    async fn on_kline_update(&self, event: Event) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let interval = event.str_field("interval").unwrap_or("").to_string();
        let klines = parse_klines(&event.data);

        debug!(
            "[TA] K-line update: user_id={} symbol={} interval={} window={}",
            user_id,
            symbol,
            interval,
            klines.len()
        );

        let matching: Vec<String> = self
            .instances
            .iter()
            .filter(|e| e.value().matches(&user_id, &symbol, &interval))
            .map(|e| e.key().clone())
            .collect();

        for key in matching {
            let result = {
                let Some(mut instance) = self.instances.get_mut(&key) else {
                    continue;
                };
                if !instance.ready {
                    debug!("[TA] Indicator not ready, skipping: {}", key);
                    continue;
                }
                let result = instance.indicator.calculate(&klines);
                (instance.name.clone(), result)
            };
            self.deposit_result(&user_id, &symbol, &interval, result.0, result.1);
        }
        Ok(())
    }

    /// Put one indicator result into the per-(user, symbol) aggregator and
    /// publish `ta.calculation.completed` once the set is complete.
    fn deposit_result(
        &self,
        user_id: &str,
        symbol: &str,
        interval: &str,
        indicator_name: String,
        result: crate::indicators::IndicatorResult,
    ) {
        let key = format!("{}_{}", user_id, symbol);

        // How many ready indicators feed this key right now. Instances that
        // have not seen their history yet do not hold the tick open.
        let expected = self
            .instances
            .iter()
            .filter(|e| e.value().matches(user_id, symbol, interval) && e.value().ready)
            .count();

        let completed = {
            let mut slot = self.aggregators.entry(key.clone()).or_default();
            slot.interval = interval.to_string();
            slot.results.insert(
                indicator_name,
                json!({"signal": result.signal.as_str(), "data": result.data}),
            );
            debug!(
                "[TA] Aggregated {}: {}/{}",
                key,
                slot.results.len(),
                expected
            );
            slot.results.len() >= expected
        };

        if completed {
            if let Some((_, slot)) = self.aggregators.remove(&key) {
                info!(
                    "[TA] Calculation completed: user_id={} symbol={} indicators={}",
                    user_id,
                    symbol,
                    slot.results.len()
                );
                self.bus.publish(Event::with_source(
                    topics::ta::CALCULATION_COMPLETED,
                    json!({
                        "user_id": user_id,
                        "symbol": symbol,
                        "timeframe": slot.interval,
                        "indicators": slot.results,
                    }),
                    "ta",
                ));
            }
        }
    }
}

fn parse_klines(data: &Value) -> Vec<Kline> {
    match data.get("klines") {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!("[TA] K-line payload parse failed: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}
