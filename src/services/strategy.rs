//! StrategyEngine: per-account strategy instances, position tracking, signal
//! synthesis, grid triggers and reverse entry.
//!
//! Position state lives here in memory only and moves exclusively on
//! `tr.position.opened` / `tr.position.closed` — never on raw order fills,
//! which protects against partial fills and pending cancellations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::StrategyConfig;
use crate::events::{topics, Event};
use crate::indicators::Signal;

/// Per-symbol position as the strategy sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionState {
    None,
    Long,
    Short,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::None => "NONE",
            PositionState::Long => "LONG",
            PositionState::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> PositionState {
        match s {
            "LONG" => PositionState::Long,
            "SHORT" => PositionState::Short,
            _ => PositionState::None,
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds the per-indicator signals of one tick into a composite direction.
pub trait SignalCombiner: Send + Sync {
    fn combine(&self, signals: &HashMap<String, Signal>) -> Signal;
}

/// Default rule: every indicator agrees on a direction, or no signal.
pub struct UnanimousCombiner;

impl SignalCombiner for UnanimousCombiner {
    fn combine(&self, signals: &HashMap<String, Signal>) -> Signal {
        let mut iter = signals.values();
        let Some(&first) = iter.next() else {
            return Signal::None;
        };
        if first == Signal::None {
            return Signal::None;
        }
        if iter.all(|&s| s == first) {
            first
        } else {
            Signal::None
        }
    }
}

/// One loaded strategy with its per-symbol position map.
pub struct StrategyState {
    pub user_id: String,
    pub name: String,
    pub config: StrategyConfig,
    pub positions: HashMap<String, PositionState>,
}

impl StrategyState {
    fn new(user_id: &str, name: &str, config: StrategyConfig) -> Self {
        let positions = config
            .trading_pairs
            .iter()
            .map(|p| (p.symbol.clone(), PositionState::None))
            .collect();
        Self {
            user_id: user_id.to_string(),
            name: name.to_string(),
            config,
            positions,
        }
    }

    pub fn position(&self, symbol: &str) -> PositionState {
        self.positions
            .get(symbol)
            .copied()
            .unwrap_or(PositionState::None)
    }
}

#[derive(Clone)]
pub struct StrategyEngine {
    bus: EventBus,
    config_dir: String,
    strategies: Arc<DashMap<String, StrategyState>>,
    combiner: Arc<dyn SignalCombiner>,
}

impl StrategyEngine {
    pub fn new(bus: EventBus, config_dir: &str) -> Self {
        Self::with_combiner(bus, config_dir, Arc::new(UnanimousCombiner))
    }

    pub fn with_combiner(
        bus: EventBus,
        config_dir: &str,
        combiner: Arc<dyn SignalCombiner>,
    ) -> Self {
        info!("[ST] StrategyEngine initialised: config_dir={}", config_dir);
        Self {
            bus,
            config_dir: config_dir.to_string(),
            strategies: Arc::new(DashMap::new()),
            combiner,
        }
    }

    /// Register all event subscriptions.
    pub fn start(&self) {
        let engine = self.clone();
        self.bus.subscribe(
            topics::pm::ACCOUNT_LOADED,
            "strategy_engine.on_account_loaded",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_account_loaded(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::ta::CALCULATION_COMPLETED,
            "strategy_engine.on_calculation_completed",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_calculation_completed(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::tr::POSITION_OPENED,
            "strategy_engine.on_position_opened",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_position_opened(event).await })
            },
        );

        let engine = self.clone();
        self.bus.subscribe(
            topics::tr::POSITION_CLOSED,
            "strategy_engine.on_position_closed",
            move |event| {
                let engine = engine.clone();
                Box::pin(async move { engine.on_position_closed(event).await })
            },
        );

        info!("[ST] StrategyEngine subscriptions registered");
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    pub fn position(&self, user_id: &str, symbol: &str) -> PositionState {
        self.strategies
            .get(user_id)
            .map(|s| s.position(symbol))
            .unwrap_or(PositionState::None)
    }

    /// Load a strategy directly from a parsed config (tests and tooling).
    pub fn load_strategy(&self, user_id: &str, name: &str, config: StrategyConfig) {
        let state = StrategyState::new(user_id, name, config);
        self.announce_strategy(&state);
        self.strategies.insert(user_id.to_string(), state);
    }

    async fn on_account_loaded(&self, event: Event) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let strategy_name = event.str_field("strategy").unwrap_or("").to_string();
        if user_id.is_empty() || strategy_name.is_empty() {
            warn!("[ST] Account loaded event missing user_id or strategy");
            return Ok(());
        }

        match StrategyConfig::load(&self.config_dir, &user_id, &strategy_name) {
            Ok(config) => {
                info!(
                    "[ST] 📈 Strategy loaded: user_id={} strategy={} pairs={}",
                    user_id,
                    strategy_name,
                    config.trading_pairs.len()
                );
                self.load_strategy(&user_id, &strategy_name, config);
            }
            Err(reason) => {
                error!(
                    "[ST] Strategy load failed: user_id={} strategy={} reason={}",
                    user_id, strategy_name, reason
                );
                self.bus.publish(Event::with_source(
                    topics::st::STRATEGY_LOAD_FAILED,
                    json!({
                        "user_id": user_id,
                        "strategy": strategy_name,
                        "error": reason,
                    }),
                    "st",
                ));
            }
        }
        Ok(())
    }

    /// Publish `st.strategy.loaded` plus one indicator subscription per
    /// `(symbol, indicator)` of the strategy.
    fn announce_strategy(&self, state: &StrategyState) {
        let symbols: Vec<&str> = state
            .config
            .trading_pairs
            .iter()
            .map(|p| p.symbol.as_str())
            .collect();
        self.bus.publish(Event::with_source(
            topics::st::STRATEGY_LOADED,
            json!({
                "user_id": &state.user_id,
                "strategy": &state.name,
                "timeframe": &state.config.timeframe,
                "leverage": state.config.leverage,
                "position_side": &state.config.position_side,
                "margin_mode": &state.config.margin_mode,
                "margin_type": &state.config.margin_type,
                "trading_pairs": symbols,
                "pair_count": state.config.trading_pairs.len(),
                "grid_trading": &state.config.grid_trading,
                "reverse": state.config.reverse,
            }),
            "st",
        ));

        for pair in &state.config.trading_pairs {
            for (indicator_name, params) in &pair.indicator_params {
                self.bus.publish(Event::with_source(
                    topics::st::INDICATOR_SUBSCRIBE,
                    json!({
                        "user_id": &state.user_id,
                        "symbol": &pair.symbol,
                        "indicator_name": indicator_name,
                        "indicator_params": params,
                        "timeframe": &state.config.timeframe,
                    }),
                    "st",
                ));
                info!(
                    "[ST] Indicator subscription published: {}/{} timeframe={}",
                    pair.symbol, indicator_name, state.config.timeframe
                );
            }
        }
    }

    async fn on_calculation_completed(
        &self,
        event: Event,
    ) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let indicators = event
            .data
            .get("indicators")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let Some(strategy) = self.strategies.get(&user_id) else {
            debug!("[ST] No strategy for user {}", user_id);
            return Ok(());
        };

        let signals: HashMap<String, Signal> = indicators
            .iter()
            .map(|(name, result)| {
                let signal = result
                    .get("signal")
                    .and_then(|v| v.as_str())
                    .map(Signal::parse)
                    .unwrap_or(Signal::None);
                (name.clone(), signal)
            })
            .collect();
        let composite = self.combiner.combine(&signals);
        let current = strategy.position(&symbol);

        debug!(
            "[ST] Tick: user_id={} symbol={} composite={} position={}",
            user_id, symbol, composite, current
        );

        // Decision table: open from flat, close on the opposite direction.
        let decision = match (current, composite) {
            (PositionState::None, Signal::Long) => Some(("OPEN", "BUY")),
            (PositionState::None, Signal::Short) => Some(("OPEN", "SELL")),
            (PositionState::Long, Signal::Short) => Some(("CLOSE", "SELL")),
            (PositionState::Short, Signal::Long) => Some(("CLOSE", "BUY")),
            _ => None,
        };
        let Some((action, side)) = decision else {
            return Ok(());
        };

        let price = latest_close(&indicators);
        let grid = strategy.config.grid_trading.clone();
        drop(strategy);

        info!(
            "[ST] 🎯 Signal: user_id={} symbol={} action={} side={} price={:?}",
            user_id, symbol, action, side, price
        );
        self.publish_signal(&user_id, &symbol, action, side, price, grid.as_ref());
        Ok(())
    }

    fn publish_signal(
        &self,
        user_id: &str,
        symbol: &str,
        action: &str,
        side: &str,
        price: Option<f64>,
        grid: Option<&crate::config::GridTradingConfig>,
    ) {
        self.bus.publish(Event::with_source(
            topics::st::SIGNAL_GENERATED,
            json!({
                "user_id": user_id,
                "symbol": symbol,
                "action": action,
                "side": side,
                "price": price,
                "grid_trading": grid,
            }),
            "st",
        ));
    }

    async fn on_position_opened(&self, event: Event) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let side = PositionState::parse(event.str_field("side").unwrap_or(""));
        let entry_price = event.f64_field("entry_price").unwrap_or(0.0);

        let Some(mut strategy) = self.strategies.get_mut(&user_id) else {
            warn!("[ST] Position opened for unknown strategy: {}", user_id);
            return Ok(());
        };
        strategy.positions.insert(symbol.clone(), side);
        info!(
            "[ST] Position state: user_id={} symbol={} -> {}",
            user_id, symbol, side
        );

        let grid = strategy.config.grid_trading.clone();
        drop(strategy);

        // Grid deployment is driven from the already-loaded config, not the
        // strategy file on disk.
        if let Some(grid) = grid.filter(|g| g.enabled) {
            info!(
                "[ST] Grid create trigger: user_id={} symbol={} entry_price={}",
                user_id, symbol, entry_price
            );
            self.bus.publish(Event::with_source(
                topics::st::GRID_CREATE,
                json!({
                    "user_id": user_id,
                    "symbol": symbol,
                    "entry_price": entry_price,
                    "side": side.as_str(),
                    "upper_price": grid.upper_price,
                    "lower_price": grid.lower_price,
                    "grid_levels": grid.grid_levels,
                    "grid_ratio": grid.ratio,
                    "move_up": grid.move_up,
                    "move_down": grid.move_down,
                }),
                "st",
            ));
        }
        Ok(())
    }

    async fn on_position_closed(&self, event: Event) -> Result<(), crate::error::TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let closed_side = PositionState::parse(event.str_field("side").unwrap_or(""));
        let exit_price = event.f64_field("exit_price");

        let Some(mut strategy) = self.strategies.get_mut(&user_id) else {
            warn!("[ST] Position closed for unknown strategy: {}", user_id);
            return Ok(());
        };
        strategy.positions.insert(symbol.clone(), PositionState::None);
        info!(
            "[ST] Position state: user_id={} symbol={} -> NONE",
            user_id, symbol
        );

        let reverse = strategy.config.reverse;
        let grid = strategy.config.grid_trading.clone();
        drop(strategy);

        // Reverse entry: a closed long immediately opens a short, and the
        // other way around.
        if reverse && closed_side != PositionState::None {
            let side = match closed_side {
                PositionState::Long => "SELL",
                _ => "BUY",
            };
            info!(
                "[ST] Reverse entry: user_id={} symbol={} closed={} -> OPEN {}",
                user_id, symbol, closed_side, side
            );
            self.publish_signal(&user_id, &symbol, "OPEN", side, exit_price, grid.as_ref());
        }
        Ok(())
    }
}

/// Pull the freshest close price out of any indicator payload of the tick.
fn latest_close(indicators: &serde_json::Map<String, Value>) -> Option<f64> {
    indicators
        .values()
        .filter_map(|result| result.get("data").and_then(|d| d.get("close")))
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .next()
}
