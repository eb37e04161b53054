//! TradeExecutor: per-symbol trading tasks, execution mode selection,
//! capital allocation, grid lifecycle and profit accounting.
//!
//! Every `(user, symbol)` owns one `TradingTask` behind its own lock; all
//! mutations are serialised through it. Handlers collect the events they
//! need to publish while holding the lock and publish after releasing it —
//! no lock is ever held across a suspension point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::{GridTradingConfig, GridType};
use crate::data::trade_store::{OrderRecord, TaskRecord, TradeStore};
use crate::error::TradingError;
use crate::events::{topics, Event};
use crate::exchange::types::{OrderType, Side};
use crate::services::capital::CapitalManager;
use crate::services::grid::{self, GridBook, GridFillOutcome, GridOrderSpec};
use crate::services::precision::PrecisionHandler;
use crate::services::profit::{order_profit, profit_stats, ProfitStats};
use crate::services::strategy::PositionState;

/// Execution mode of a task, derived from the grid configuration the signal
/// carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradingMode {
    NoGrid,
    NormalGrid,
    AbnormalGrid,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::NoGrid => "NO_GRID",
            TradingMode::NormalGrid => "NORMAL_GRID",
            TradingMode::AbnormalGrid => "ABNORMAL_GRID",
        }
    }

    fn from_grid_config(grid: Option<&GridTradingConfig>) -> TradingMode {
        match grid {
            Some(g) if g.enabled => {
                if g.grid_type == GridType::Normal && g.ratio >= 1.0 {
                    TradingMode::NormalGrid
                } else {
                    TradingMode::AbnormalGrid
                }
            }
            _ => TradingMode::NoGrid,
        }
    }
}

/// What an order was for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OrderPurpose {
    Entry,
    Close,
    Grid,
}

#[derive(Clone, Debug)]
struct OrderInfo {
    client_order_id: String,
    exchange_order_id: Option<String>,
    side: Side,
    order_type: OrderType,
    price: f64,
    quantity: f64,
    filled_quantity: f64,
    status: String,
    purpose: OrderPurpose,
    grid_pair_id: Option<String>,
    created_at: String,
    filled_at: Option<String>,
}

/// One per-(user, symbol) trading state machine.
pub struct TradingTask {
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub mode: TradingMode,
    pub grid_ratio: f64,
    pub position_state: PositionState,
    pub entry_price: Option<f64>,
    pub entry_quantity: Option<f64>,
    orders: HashMap<String, OrderInfo>,
    grid: Option<GridBook>,
    grid_level_quantity: f64,
    closing: bool,
    close_fill: Option<(f64, f64)>,
    pending_cancels: HashSet<String>,
    pub realized_profits: Vec<f64>,
    pub total_profit: f64,
    created_at: String,
    opened_at: Option<String>,
    closed_at: Option<String>,
}

impl TradingTask {
    fn new(user_id: &str, symbol: &str, mode: TradingMode, grid_ratio: f64) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            mode,
            grid_ratio,
            position_state: PositionState::None,
            entry_price: None,
            entry_quantity: None,
            orders: HashMap::new(),
            grid: None,
            grid_level_quantity: 0.0,
            closing: false,
            close_fill: None,
            pending_cancels: HashSet::new(),
            realized_profits: Vec::new(),
            total_profit: 0.0,
            created_at: Utc::now().to_rfc3339(),
            opened_at: None,
            closed_at: None,
        }
    }

    pub fn is_position_open(&self) -> bool {
        self.position_state != PositionState::None
    }

    fn record_order(
        &mut self,
        client_order_id: &str,
        side: Side,
        order_type: OrderType,
        price: f64,
        quantity: f64,
        purpose: OrderPurpose,
        grid_pair_id: Option<String>,
    ) {
        self.orders.insert(
            client_order_id.to_string(),
            OrderInfo {
                client_order_id: client_order_id.to_string(),
                exchange_order_id: None,
                side,
                order_type,
                price,
                quantity,
                filled_quantity: 0.0,
                status: "NEW".to_string(),
                purpose,
                grid_pair_id,
                created_at: Utc::now().to_rfc3339(),
                filled_at: None,
            },
        );
    }

    fn resolve_client_id(&self, client_order_id: &str, exchange_order_id: &str) -> Option<String> {
        if !client_order_id.is_empty() && self.orders.contains_key(client_order_id) {
            return Some(client_order_id.to_string());
        }
        self.orders
            .values()
            .find(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id))
            .map(|o| o.client_order_id.clone())
    }

    fn open_position(&mut self, side: PositionState, price: f64, quantity: f64) {
        self.position_state = side;
        self.entry_price = Some(price);
        self.entry_quantity = Some(quantity);
        self.opened_at = Some(Utc::now().to_rfc3339());
    }

    fn add_profit(&mut self, profit: f64) {
        self.realized_profits.push(profit);
        self.total_profit += profit;
    }

    fn task_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            symbol: self.symbol.clone(),
            trading_mode: self.mode.as_str().to_string(),
            position_state: self.position_state.as_str().to_string(),
            entry_side: if self.is_position_open() {
                Some(self.position_state.as_str().to_string())
            } else {
                None
            },
            entry_price: self.entry_price,
            entry_quantity: self.entry_quantity,
            exit_price: self.close_fill.map(|(price, _)| price),
            total_profit: self.total_profit,
            created_at: self.created_at.clone(),
            opened_at: self.opened_at.clone(),
            closed_at: self.closed_at.clone(),
            grid_config: self.grid.as_ref().map(|g| {
                json!({
                    "upper_price": g.upper,
                    "lower_price": g.lower,
                    "grid_levels": g.levels,
                    "move_up": g.move_up,
                    "move_down": g.move_down,
                })
            }),
        }
    }

    fn order_record(&self, order: &OrderInfo) -> OrderRecord {
        OrderRecord {
            order_id: order
                .exchange_order_id
                .clone()
                .unwrap_or_else(|| order.client_order_id.clone()),
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            symbol: self.symbol.clone(),
            side: order.side.as_str().to_string(),
            order_type: order.order_type.as_str().to_string(),
            price: order.price,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            status: order.status.clone(),
            is_grid_order: order.purpose == OrderPurpose::Grid,
            grid_pair_id: order.grid_pair_id.clone(),
            profit: 0.0,
            created_at: order.created_at.clone(),
            filled_at: order.filled_at.clone(),
        }
    }
}

struct UserContext {
    capital: CapitalManager,
    pair_count: usize,
    grid: Option<GridTradingConfig>,
}

#[derive(Clone)]
pub struct TradeExecutor {
    bus: EventBus,
    users: Arc<DashMap<String, UserContext>>,
    tasks: Arc<DashMap<(String, String), Arc<Mutex<TradingTask>>>>,
    precision: Arc<PrecisionHandler>,
    store: Option<Arc<TradeStore>>,
}

impl TradeExecutor {
    pub fn new(bus: EventBus, store: Option<Arc<TradeStore>>) -> Self {
        info!("[TR] TradeExecutor initialised (persistence={})", store.is_some());
        Self {
            bus,
            users: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            precision: Arc::new(PrecisionHandler::new()),
            store,
        }
    }

    pub fn precision(&self) -> &PrecisionHandler {
        &self.precision
    }

    /// Register all event subscriptions and announce readiness.
    pub fn start(&self) {
        let executor = self.clone();
        self.bus.subscribe(
            topics::st::STRATEGY_LOADED,
            "executor.on_strategy_loaded",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_strategy_loaded(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ACCOUNT_BALANCE,
            "executor.on_account_balance",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_account_balance(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ACCOUNT_UPDATE,
            "executor.on_account_update",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_account_balance(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::st::SIGNAL_GENERATED,
            "executor.on_signal_generated",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_signal_generated(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::st::GRID_CREATE,
            "executor.on_grid_create",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_grid_create(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ORDER_SUBMITTED,
            "executor.on_order_submitted",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_order_submitted(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ORDER_FAILED,
            "executor.on_order_failed",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_order_failed(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ORDER_FILLED,
            "executor.on_order_filled",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_order_filled(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::ORDER_CANCELLED,
            "executor.on_order_cancelled",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_order_cancelled(event).await })
            },
        );

        let executor = self.clone();
        self.bus.subscribe(
            topics::de::KLINE_UPDATE,
            "executor.on_kline_update",
            move |event| {
                let executor = executor.clone();
                Box::pin(async move { executor.on_kline_update(event).await })
            },
        );

        self.bus.publish(Event::with_source(
            topics::tr::MANAGER_STARTED,
            json!({"timestamp": Utc::now().timestamp_millis()}),
            "tr",
        ));
        info!("[TR] TradeExecutor subscriptions registered");
    }

    // ---------- queries ----------

    pub fn position_state(&self, user_id: &str, symbol: &str) -> PositionState {
        self.tasks
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|t| t.lock().unwrap().position_state)
            .unwrap_or(PositionState::None)
    }

    pub fn total_profit(&self, user_id: &str, symbol: &str) -> f64 {
        self.tasks
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|t| t.lock().unwrap().total_profit)
            .unwrap_or(0.0)
    }

    /// Win/loss breakdown over the task's realised profits (closed positions
    /// and completed grid pairs).
    pub fn profit_stats(&self, user_id: &str, symbol: &str) -> ProfitStats {
        self.tasks
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|t| profit_stats(&t.lock().unwrap().realized_profits))
            .unwrap_or_else(|| profit_stats(&[]))
    }

    // ---------- handlers ----------

    async fn on_strategy_loaded(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let leverage = event.u64_field("leverage").unwrap_or(1) as u32;
        let margin_type = event.str_field("margin_type").unwrap_or("USDT").to_string();
        let pair_count = event.u64_field("pair_count").unwrap_or(1).max(1) as usize;
        let grid: Option<GridTradingConfig> = event
            .data
            .get("grid_trading")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        info!(
            "[TR] Strategy context: user_id={} leverage={}x margin_type={} pairs={}",
            user_id, leverage, margin_type, pair_count
        );
        self.users.insert(
            user_id.clone(),
            UserContext {
                capital: CapitalManager::new(&user_id, leverage, &margin_type),
                pair_count,
                grid,
            },
        );

        // Pull the opening balance for the margin asset.
        self.bus.publish(Event::with_source(
            topics::trading::GET_ACCOUNT_BALANCE,
            json!({"user_id": user_id, "asset": margin_type}),
            "tr",
        ));
        Ok(())
    }

    async fn on_account_balance(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let available = event.f64_field("available_balance").unwrap_or(0.0);
        let total = event.f64_field("balance").or(event.f64_field("total_equity"));

        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.capital.update_balance(available, total);
        } else {
            debug!("[TR] Balance for unknown user {}", user_id);
        }
        Ok(())
    }

    async fn on_signal_generated(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let action = event.str_field("action").unwrap_or("").to_string();
        let side = event.str_field("side").and_then(Side::parse);
        let price = event.f64_field("price");
        let grid: Option<GridTradingConfig> = event
            .data
            .get("grid_trading")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        let Some(side) = side else {
            warn!("[TR] Signal without a valid side: user_id={} symbol={}", user_id, symbol);
            return Ok(());
        };

        info!(
            "[TR] Signal: user_id={} symbol={} action={} side={}",
            user_id,
            symbol,
            action,
            side.as_str()
        );

        match action.as_str() {
            "OPEN" => self.handle_open(&user_id, &symbol, side, price, grid.as_ref()),
            "CLOSE" => self.handle_close(&user_id, &symbol, side),
            other => {
                warn!("[TR] Unknown signal action: {}", other);
                Ok(())
            }
        }
    }

    fn handle_open(
        &self,
        user_id: &str,
        symbol: &str,
        side: Side,
        price: Option<f64>,
        grid: Option<&GridTradingConfig>,
    ) -> Result<(), TradingError> {
        let Some(entry_price) = price.filter(|p| *p > 0.0) else {
            error!(
                "[TR] OPEN signal without a price, cannot size: user_id={} symbol={}",
                user_id, symbol
            );
            return Ok(());
        };

        let (margin, user_grid) = {
            let Some(user) = self.users.get(user_id) else {
                error!("[TR] No capital context for user {}", user_id);
                return Ok(());
            };
            if !user.capital.has_balance() {
                error!("[TR] Balance not initialised yet: user_id={}", user_id);
                return Ok(());
            }
            (
                user.capital.margin_per_symbol(user.pair_count)?,
                user.grid.clone(),
            )
        };
        let grid = grid.or(user_grid.as_ref());
        let mode = TradingMode::from_grid_config(grid);
        let ratio = grid.map(|g| g.ratio).unwrap_or(1.0);

        let task = self.get_or_create_task(user_id, symbol, mode, ratio);
        let mut events = Vec::new();
        let mut task_snapshot = None;
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            if task.is_position_open() || task.closing {
                warn!(
                    "[TR] OPEN ignored, position already {} ({}): {}/{}",
                    task.position_state,
                    if task.closing { "closing" } else { "open" },
                    user_id,
                    symbol
                );
                return Ok(());
            }

            match mode {
                TradingMode::NoGrid => {
                    let user = self.users.get(user_id).unwrap();
                    let quantity = user.capital.position_size(margin, entry_price, 1.0)?;
                    drop(user);
                    self.queue_market_order(
                        &mut task,
                        side,
                        quantity,
                        entry_price,
                        OrderPurpose::Entry,
                        &mut events,
                        &mut order_snapshots,
                    )?;
                }
                TradingMode::AbnormalGrid => {
                    // The sized entry goes in first; the grid waits for
                    // st.grid.create.
                    let user = self.users.get(user_id).unwrap();
                    let quantity = user.capital.position_size(margin, entry_price, ratio)?;
                    drop(user);
                    self.queue_market_order(
                        &mut task,
                        side,
                        quantity,
                        entry_price,
                        OrderPurpose::Entry,
                        &mut events,
                        &mut order_snapshots,
                    )?;
                }
                TradingMode::NormalGrid => {
                    let grid_config = grid.expect("normal grid mode implies grid config");
                    let upper = grid_config.upper_price.unwrap_or(0.0);
                    let lower = grid_config.lower_price.unwrap_or(0.0);
                    let user = self.users.get(user_id).unwrap();
                    let total_quantity = user.capital.position_size(margin, entry_price, 1.0)?;
                    drop(user);

                    let mut book = GridBook::new(
                        upper,
                        lower,
                        grid_config.grid_levels,
                        grid_config.move_up,
                        grid_config.move_down,
                    )?;
                    let specs = grid::symmetric_orders(
                        entry_price,
                        upper,
                        lower,
                        grid_config.grid_levels,
                        total_quantity,
                    )?;
                    task.grid_level_quantity = specs
                        .first()
                        .map(|s| s.quantity)
                        .unwrap_or(0.0);
                    for spec in &specs {
                        self.queue_grid_order(
                            &mut task,
                            &mut book,
                            spec,
                            None,
                            &mut events,
                            &mut order_snapshots,
                        );
                    }
                    info!(
                        "[TR] Normal grid posted: {}/{} orders={} band=[{}, {}]",
                        user_id,
                        symbol,
                        specs.len(),
                        lower,
                        upper
                    );
                    events.push(Event::with_source(
                        topics::tr::GRID_CREATED,
                        json!({
                            "user_id": &user_id,
                            "symbol": &symbol,
                            "grid_count": specs.len(),
                            "total_quantity": total_quantity,
                        }),
                        "tr",
                    ));
                    task.grid = Some(book);
                }
            }
            task_snapshot = Some(task.task_record());
        }

        self.flush(events, task_snapshot, order_snapshots);
        Ok(())
    }

    fn handle_close(&self, user_id: &str, symbol: &str, side: Side) -> Result<(), TradingError> {
        let Some(task) = self
            .tasks
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|t| t.clone())
        else {
            warn!("[TR] CLOSE for unknown task: {}/{}", user_id, symbol);
            return Ok(());
        };

        let mut events = Vec::new();
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            if !task.is_position_open() {
                warn!("[TR] CLOSE ignored, no open position: {}/{}", user_id, symbol);
                return Ok(());
            }
            if task.closing {
                warn!("[TR] CLOSE ignored, already closing: {}/{}", user_id, symbol);
                return Ok(());
            }
            let quantity = task.entry_quantity.unwrap_or(0.0);
            if quantity <= 0.0 {
                error!("[TR] CLOSE with zero position quantity: {}/{}", user_id, symbol);
                return Ok(());
            }
            task.closing = true;
            let reference = task.entry_price.unwrap_or(0.0);
            self.queue_market_order(
                &mut task,
                side,
                quantity,
                reference,
                OrderPurpose::Close,
                &mut events,
                &mut order_snapshots,
            )?;
        }

        self.flush(events, None, order_snapshots);
        Ok(())
    }

    async fn on_grid_create(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let entry_price = event.f64_field("entry_price").unwrap_or(0.0);
        let entry_side = PositionState::parse(event.str_field("side").unwrap_or(""));
        let upper = event.f64_field("upper_price").unwrap_or(0.0);
        let lower = event.f64_field("lower_price").unwrap_or(0.0);
        let levels = event.u64_field("grid_levels").unwrap_or(10) as u32;
        let ratio = event.f64_field("grid_ratio").unwrap_or(1.0);
        let move_up = event.bool_field("move_up").unwrap_or(false);
        let move_down = event.bool_field("move_down").unwrap_or(false);

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            error!("[TR] Grid create for unknown task: {}/{}", user_id, symbol);
            return Ok(());
        };

        let margin = {
            let Some(user) = self.users.get(&user_id) else {
                error!("[TR] Grid create without capital context: {}", user_id);
                return Ok(());
            };
            user.capital.margin_per_symbol(user.pair_count)?
        };

        let mut events = Vec::new();
        let mut task_snapshot = None;
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            if task.grid.is_some() {
                // Normal-grid tasks already deployed at signal time.
                debug!("[TR] Grid already active: {}/{}", user_id, symbol);
                return Ok(());
            }
            if !task.is_position_open() {
                warn!("[TR] Grid create before position open: {}/{}", user_id, symbol);
                return Ok(());
            }

            // The entry consumed `ratio`; the ladder gets the remainder.
            let grid_ratio = (1.0 - ratio).max(0.0);
            if grid_ratio <= 0.0 {
                warn!(
                    "[TR] Grid create with no remaining capital (ratio={}): {}/{}",
                    ratio, user_id, symbol
                );
                return Ok(());
            }
            let user = self.users.get(&user_id).unwrap();
            let total_quantity = user.capital.position_size(margin, entry_price, grid_ratio)?;
            drop(user);

            let mut book = GridBook::new(upper, lower, levels, move_up, move_down)?;
            let ladder_side = match entry_side {
                PositionState::Long => Side::Sell,
                _ => Side::Buy,
            };
            let specs = grid::one_sided_orders(upper, lower, levels, total_quantity, ladder_side)?;
            task.grid_level_quantity = specs.first().map(|s| s.quantity).unwrap_or(0.0);
            for spec in &specs {
                self.queue_grid_order(
                    &mut task,
                    &mut book,
                    spec,
                    None,
                    &mut events,
                    &mut order_snapshots,
                );
            }
            info!(
                "[TR] Abnormal grid posted: {}/{} side={} orders={} band=[{}, {}]",
                user_id,
                symbol,
                ladder_side.as_str(),
                specs.len(),
                lower,
                upper
            );
            events.push(Event::with_source(
                topics::tr::GRID_CREATED,
                json!({
                    "user_id": &user_id,
                    "symbol": &symbol,
                    "grid_count": specs.len(),
                    "total_quantity": total_quantity,
                }),
                "tr",
            ));
            task.grid = Some(book);
            task_snapshot = Some(task.task_record());
        }

        self.flush(events, task_snapshot, order_snapshots);
        Ok(())
    }

    async fn on_order_submitted(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let order_id = event.str_field("order_id").unwrap_or("").to_string();
        let client_order_id = event.str_field("client_order_id").unwrap_or("").to_string();

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            return Ok(());
        };

        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            if let Some(order) = task.orders.get_mut(&client_order_id) {
                order.exchange_order_id = Some(order_id.clone());
                let snapshot = {
                    let order = task.orders.get(&client_order_id).unwrap().clone();
                    task.order_record(&order)
                };
                order_snapshots.push(snapshot);
                debug!(
                    "[TR] Order acknowledged: {}/{} client={} exchange={}",
                    user_id, symbol, client_order_id, order_id
                );
            }
        }
        self.flush(Vec::new(), None, order_snapshots);
        Ok(())
    }

    async fn on_order_failed(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let client_order_id = event.str_field("client_order_id").unwrap_or("").to_string();
        let retry_count = event.u64_field("retry_count").unwrap_or(0);

        error!(
            "[TR] Order failed: {}/{} client={} retry_count={} error={:?}",
            user_id,
            symbol,
            client_order_id,
            retry_count,
            event.str_field("error")
        );

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            return Ok(());
        };

        let mut task = task.lock().unwrap();
        if let Some(order) = task.orders.get_mut(&client_order_id) {
            order.status = "FAILED".to_string();
            let purpose = order.purpose;
            if purpose == OrderPurpose::Close {
                // The position survives; allow another close attempt.
                task.closing = false;
            }
            if let Some(book) = task.grid.as_mut() {
                book.untrack(&client_order_id);
            }
        }
        Ok(())
    }

    async fn on_order_filled(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let order_id = event.str_field("order_id").unwrap_or("").to_string();
        let client_hint = event.str_field("client_order_id").unwrap_or("").to_string();
        let price = event.f64_field("price").unwrap_or(0.0);
        let quantity = event.f64_field("quantity").unwrap_or(0.0);
        let side = event.str_field("side").and_then(Side::parse);

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            debug!("[TR] Fill for unknown task: {}/{}", user_id, symbol);
            return Ok(());
        };

        let mut events = Vec::new();
        let mut task_snapshot = None;
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            let Some(client_order_id) = task.resolve_client_id(&client_hint, &order_id) else {
                warn!(
                    "[TR] Fill for untracked order: {}/{} order_id={}",
                    user_id, symbol, order_id
                );
                return Ok(());
            };

            let purpose = {
                let order = task.orders.get_mut(&client_order_id).unwrap();
                order.status = "FILLED".to_string();
                order.filled_quantity = quantity.min(order.quantity).max(0.0);
                if order.filled_quantity == 0.0 {
                    order.filled_quantity = order.quantity;
                }
                order.filled_at = Some(Utc::now().to_rfc3339());
                order.purpose
            };
            let fill_side = side.unwrap_or_else(|| {
                task.orders.get(&client_order_id).unwrap().side
            });
            let fill_price = if price > 0.0 {
                price
            } else {
                task.orders.get(&client_order_id).unwrap().price
            };
            let fill_quantity = task.orders.get(&client_order_id).unwrap().filled_quantity;

            info!(
                "[TR] Fill: {}/{} {} {}@{} purpose={:?}",
                user_id,
                symbol,
                fill_side.as_str(),
                fill_quantity,
                fill_price,
                purpose
            );

            let snapshot = {
                let order = task.orders.get(&client_order_id).unwrap().clone();
                task.order_record(&order)
            };
            order_snapshots.push(snapshot);

            match purpose {
                OrderPurpose::Entry => self.apply_entry_fill(
                    &mut task,
                    fill_side,
                    fill_price,
                    fill_quantity,
                    &mut events,
                ),
                OrderPurpose::Close => self.apply_close_fill(
                    &mut task,
                    fill_price,
                    fill_quantity,
                    &mut events,
                ),
                OrderPurpose::Grid => self.apply_grid_fill(
                    &mut task,
                    &client_order_id,
                    fill_side,
                    fill_price,
                    fill_quantity,
                    &mut events,
                    &mut order_snapshots,
                ),
            }
            task_snapshot = Some(task.task_record());
        }

        self.flush(events, task_snapshot, order_snapshots);
        Ok(())
    }

    fn apply_entry_fill(
        &self,
        task: &mut TradingTask,
        side: Side,
        price: f64,
        quantity: f64,
        events: &mut Vec<Event>,
    ) {
        if task.is_position_open() {
            warn!(
                "[TR] Entry fill with position already open: {}/{}",
                task.user_id, task.symbol
            );
            return;
        }
        let position_side = match side {
            Side::Buy => PositionState::Long,
            Side::Sell => PositionState::Short,
        };
        task.open_position(position_side, price, quantity);
        info!(
            "[TR] 📈 Position opened: {}/{} {} {}@{}",
            task.user_id,
            task.symbol,
            position_side,
            quantity,
            price
        );
        events.push(Event::with_source(
            topics::tr::POSITION_OPENED,
            json!({
                "user_id": &task.user_id,
                "symbol": &task.symbol,
                "side": position_side.as_str(),
                "entry_price": price,
                "quantity": quantity,
                "mode": task.mode.as_str(),
            }),
            "tr",
        ));
    }

    fn apply_close_fill(
        &self,
        task: &mut TradingTask,
        price: f64,
        quantity: f64,
        events: &mut Vec<Event>,
    ) {
        if !task.closing {
            warn!(
                "[TR] Close fill without a pending close: {}/{}",
                task.user_id, task.symbol
            );
            return;
        }
        task.close_fill = Some((price, quantity));

        // Cancel every surviving grid order before the close is announced.
        let open_ids: Vec<String> = task
            .grid
            .as_ref()
            .map(|book| book.open_order_ids())
            .unwrap_or_default();
        let mut cancels = Vec::new();
        for client_id in open_ids {
            let exchange_id = task
                .orders
                .get(&client_id)
                .and_then(|o| o.exchange_order_id.clone());
            // Orders never acknowledged have nothing to cancel upstream.
            if let Some(exchange_id) = exchange_id {
                task.pending_cancels.insert(client_id);
                cancels.push(exchange_id);
            }
        }
        for exchange_id in &cancels {
            events.push(Event::with_source(
                topics::trading::ORDER_CANCEL,
                json!({
                    "user_id": &task.user_id,
                    "symbol": &task.symbol,
                    "order_id": exchange_id,
                }),
                "tr",
            ));
        }

        if task.pending_cancels.is_empty() {
            self.finalize_close(task, events);
        } else {
            info!(
                "[TR] Close filled, awaiting {} grid cancellation(s): {}/{}",
                task.pending_cancels.len(),
                task.user_id,
                task.symbol
            );
        }
    }

    /// Only runs once every surviving order is confirmed cancelled. This
    /// ordering keeps a reverse signal from racing leftover grid orders.
    fn finalize_close(&self, task: &mut TradingTask, events: &mut Vec<Event>) {
        let (exit_price, _) = task.close_fill.unwrap_or((0.0, 0.0));
        let entry_price = task.entry_price.unwrap_or(0.0);
        let quantity = task.entry_quantity.unwrap_or(0.0);
        let side = task.position_state;

        let pnl = order_profit(entry_price, exit_price, quantity, side.as_str(), None);
        task.add_profit(pnl);
        task.position_state = PositionState::None;
        task.closing = false;
        task.close_fill = None;
        task.entry_price = None;
        task.entry_quantity = None;
        task.closed_at = Some(Utc::now().to_rfc3339());
        if let Some(book) = task.grid.as_mut() {
            book.clear();
        }
        task.grid = None;

        let stats = profit_stats(&task.realized_profits);
        info!(
            "[TR] 📉 Position closed: {}/{} {} exit={} pnl={:.4} total={:.4} trades={} win_rate={:.0}%",
            task.user_id,
            task.symbol,
            side,
            exit_price,
            pnl,
            stats.total_profit,
            task.realized_profits.len(),
            stats.win_rate * 100.0
        );
        events.push(Event::with_source(
            topics::tr::POSITION_CLOSED,
            json!({
                "user_id": &task.user_id,
                "symbol": &task.symbol,
                "side": side.as_str(),
                "exit_price": exit_price,
                "pnl": pnl,
            }),
            "tr",
        ));
    }

    fn apply_grid_fill(
        &self,
        task: &mut TradingTask,
        client_order_id: &str,
        side: Side,
        price: f64,
        quantity: f64,
        events: &mut Vec<Event>,
        order_snapshots: &mut Vec<OrderRecord>,
    ) {
        // The first grid fill of a flat task opens the position.
        if !task.is_position_open() && !task.closing {
            let position_side = match side {
                Side::Buy => PositionState::Long,
                Side::Sell => PositionState::Short,
            };
            task.open_position(position_side, price, quantity);
            info!(
                "[TR] 📈 Position opened on grid fill: {}/{} {} {}@{}",
                task.user_id,
                task.symbol,
                position_side,
                quantity,
                price
            );
            events.push(Event::with_source(
                topics::tr::POSITION_OPENED,
                json!({
                    "user_id": &task.user_id,
                    "symbol": &task.symbol,
                    "side": position_side.as_str(),
                    "entry_price": price,
                    "quantity": quantity,
                    "mode": task.mode.as_str(),
                }),
                "tr",
            ));
        }

        let Some(book) = task.grid.as_mut() else {
            return;
        };
        match book.on_fill(client_order_id, None) {
            Some(GridFillOutcome::PairOpened { pair_id, counter }) => {
                debug!(
                    "[TR] Grid pair opened: {}/{} pair={} counter={}@{}",
                    task.user_id,
                    task.symbol,
                    pair_id,
                    counter.side.as_str(),
                    counter.price
                );
                self.queue_grid_order_locked(
                    task,
                    &counter,
                    Some(pair_id),
                    events,
                    order_snapshots,
                );
            }
            Some(GridFillOutcome::PairCompleted { pair, profit, rearm }) => {
                task.add_profit(profit);
                info!(
                    "[TR] 💰 Grid pair completed: {}/{} buy={} sell={} qty={} profit={:.4}",
                    task.user_id,
                    task.symbol,
                    pair.buy_price,
                    pair.sell_price,
                    pair.quantity,
                    profit
                );
                // Re-arm the level that started the cycle.
                self.queue_grid_order_locked(task, &rearm, None, events, order_snapshots);
            }
            None => {}
        }
    }

    async fn on_order_cancelled(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let order_id = event.str_field("order_id").unwrap_or("").to_string();

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            return Ok(());
        };

        let mut events = Vec::new();
        let mut task_snapshot = None;
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            let Some(client_order_id) = task.resolve_client_id("", &order_id) else {
                return Ok(());
            };
            if let Some(order) = task.orders.get_mut(&client_order_id) {
                order.status = "CANCELED".to_string();
                let snapshot = {
                    let order = task.orders.get(&client_order_id).unwrap().clone();
                    task.order_record(&order)
                };
                order_snapshots.push(snapshot);
            }
            if let Some(book) = task.grid.as_mut() {
                book.untrack(&client_order_id);
            }
            task.pending_cancels.remove(&client_order_id);
            debug!(
                "[TR] Cancel confirmed: {}/{} client={} remaining={}",
                user_id,
                symbol,
                client_order_id,
                task.pending_cancels.len()
            );

            if task.closing && task.close_fill.is_some() && task.pending_cancels.is_empty() {
                self.finalize_close(&mut task, &mut events);
                task_snapshot = Some(task.task_record());
            }
        }

        self.flush(events, task_snapshot, order_snapshots);
        Ok(())
    }

    /// Grid band following: a close beyond the band cancels the ladder,
    /// shifts it one interval and reposts.
    async fn on_kline_update(&self, event: Event) -> Result<(), TradingError> {
        let user_id = event.str_field("user_id").unwrap_or("").to_string();
        let symbol = event.str_field("symbol").unwrap_or("").to_string();
        let last_close = event
            .data
            .get("klines")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.last())
            .and_then(|k| k.get("close"))
            .and_then(|v| v.as_f64());
        let Some(last_close) = last_close else {
            return Ok(());
        };

        let Some(task) = self
            .tasks
            .get(&(user_id.clone(), symbol.clone()))
            .map(|t| t.clone())
        else {
            return Ok(());
        };

        let mut events = Vec::new();
        let mut task_snapshot = None;
        let mut order_snapshots = Vec::new();
        {
            let mut task = task.lock().unwrap();
            if task.closing {
                return Ok(());
            }
            let Some(up) = task.grid.as_ref().and_then(|b| b.breach(last_close)) else {
                return Ok(());
            };

            // Cancel what is out there, then repost around the new band.
            let (open_ids, level_quantity) = {
                let book = task.grid.as_ref().unwrap();
                (book.open_order_ids(), task.grid_level_quantity)
            };
            for client_id in &open_ids {
                if let Some(order) = task.orders.get(client_id) {
                    if let Some(exchange_id) = &order.exchange_order_id {
                        events.push(Event::with_source(
                            topics::trading::ORDER_CANCEL,
                            json!({
                                "user_id": &task.user_id,
                                "symbol": &task.symbol,
                                "order_id": exchange_id,
                            }),
                            "tr",
                        ));
                    }
                }
            }

            let book = task.grid.as_mut().unwrap();
            book.clear();
            book.shift_band(up);
            let (upper, lower, levels) = (book.upper, book.lower, book.levels);
            info!(
                "[TR] Grid band moved {}: {}/{} new_band=[{}, {}]",
                if up { "UP" } else { "DOWN" },
                user_id,
                symbol,
                lower,
                upper
            );
            events.push(Event::with_source(
                topics::tr::GRID_MOVED,
                json!({
                    "user_id": &user_id,
                    "symbol": &symbol,
                    "direction": if up { "UP" } else { "DOWN" },
                    "new_upper_price": upper,
                    "new_lower_price": lower,
                }),
                "tr",
            ));

            if level_quantity > 0.0 {
                // The breach price sits on or past the band edge; pull the
                // repost pivot strictly inside so the ladder stays valid.
                let half = (upper - lower) / levels as f64 / 2.0;
                let pivot = last_close.clamp(lower + half, upper - half);
                match grid::symmetric_orders(
                    pivot,
                    upper,
                    lower,
                    levels,
                    level_quantity * levels as f64,
                ) {
                    Ok(specs) => {
                        for spec in &specs {
                            self.queue_grid_order_locked(
                                &mut task,
                                spec,
                                None,
                                &mut events,
                                &mut order_snapshots,
                            );
                        }
                    }
                    Err(e) => {
                        error!(
                            "[TR] Grid repost failed: {}/{} error={}",
                            user_id, symbol, e
                        );
                    }
                }
            }
            task_snapshot = Some(task.task_record());
        }

        self.flush(events, task_snapshot, order_snapshots);
        Ok(())
    }

    // ---------- order submission ----------

    fn queue_market_order(
        &self,
        task: &mut TradingTask,
        side: Side,
        quantity: f64,
        reference_price: f64,
        purpose: OrderPurpose,
        events: &mut Vec<Event>,
        order_snapshots: &mut Vec<OrderRecord>,
    ) -> Result<(), TradingError> {
        let quantity = self.precision.truncate_quantity(&task.symbol, quantity);
        if let Err(e) = self
            .precision
            .validate_order(&task.symbol, reference_price, quantity)
        {
            error!(
                "[TR] Market order rejected before submission: {}/{} {}",
                task.user_id, task.symbol, e
            );
            if purpose == OrderPurpose::Close {
                task.closing = false;
            }
            return Ok(());
        }

        let client_order_id = Uuid::new_v4().to_string();
        task.record_order(
            &client_order_id,
            side,
            OrderType::Market,
            reference_price,
            quantity,
            purpose,
            None,
        );
        let snapshot = {
            let order = task.orders.get(&client_order_id).unwrap().clone();
            task.order_record(&order)
        };
        order_snapshots.push(snapshot);

        info!(
            "[TR] Market order queued: {}/{} {} qty={} purpose={:?}",
            task.user_id,
            task.symbol,
            side.as_str(),
            quantity,
            purpose
        );
        events.push(Event::with_source(
            topics::trading::ORDER_CREATE,
            json!({
                "user_id": &task.user_id,
                "symbol": &task.symbol,
                "side": side.as_str(),
                "order_type": "MARKET",
                "quantity": quantity,
                "client_order_id": client_order_id,
            }),
            "tr",
        ));
        Ok(())
    }

    fn queue_grid_order(
        &self,
        task: &mut TradingTask,
        book: &mut GridBook,
        spec: &GridOrderSpec,
        pair_id: Option<String>,
        events: &mut Vec<Event>,
        order_snapshots: &mut Vec<OrderRecord>,
    ) {
        let (price, quantity) =
            self.precision
                .process_order_params(&task.symbol, spec.price, spec.quantity);
        if let Err(e) = self.precision.validate_order(&task.symbol, price, quantity) {
            warn!(
                "[TR] Grid order skipped: {}/{} {}@{} reason={}",
                task.user_id,
                task.symbol,
                spec.side.as_str(),
                spec.price,
                e
            );
            return;
        }

        let client_order_id = Uuid::new_v4().to_string();
        book.track_order(&client_order_id, spec.side, price, quantity, pair_id.clone());
        task.record_order(
            &client_order_id,
            spec.side,
            OrderType::PostOnly,
            price,
            quantity,
            OrderPurpose::Grid,
            pair_id,
        );
        let snapshot = {
            let order = task.orders.get(&client_order_id).unwrap().clone();
            task.order_record(&order)
        };
        order_snapshots.push(snapshot);

        events.push(Event::with_source(
            topics::trading::ORDER_CREATE,
            json!({
                "user_id": &task.user_id,
                "symbol": &task.symbol,
                "side": spec.side.as_str(),
                "order_type": "POST_ONLY",
                "quantity": quantity,
                "price": price,
                "client_order_id": client_order_id,
            }),
            "tr",
        ));
    }

    /// Same as `queue_grid_order` for call sites where the book already
    /// lives inside the task.
    fn queue_grid_order_locked(
        &self,
        task: &mut TradingTask,
        spec: &GridOrderSpec,
        pair_id: Option<String>,
        events: &mut Vec<Event>,
        order_snapshots: &mut Vec<OrderRecord>,
    ) {
        let Some(mut book) = task.grid.take() else {
            return;
        };
        self.queue_grid_order(task, &mut book, spec, pair_id, events, order_snapshots);
        task.grid = Some(book);
    }

    fn get_or_create_task(
        &self,
        user_id: &str,
        symbol: &str,
        mode: TradingMode,
        grid_ratio: f64,
    ) -> Arc<Mutex<TradingTask>> {
        let key = (user_id.to_string(), symbol.to_string());
        let (task, created) = match self.tasks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let task =
                    Arc::new(Mutex::new(TradingTask::new(user_id, symbol, mode, grid_ratio)));
                entry.insert(task.clone());
                (task, true)
            }
        };
        if !created {
            return task;
        }
        let (task_id, record) = {
            let task = task.lock().unwrap();
            (task.task_id.clone(), task.task_record())
        };

        info!(
            "[TR] Task created: {}/{} mode={} task_id={}",
            user_id,
            symbol,
            mode.as_str(),
            task_id
        );
        self.bus.publish(Event::with_source(
            topics::tr::TASK_CREATED,
            json!({
                "user_id": user_id,
                "symbol": symbol,
                "task_id": task_id,
                "mode": mode.as_str(),
            }),
            "tr",
        ));
        self.persist_task(&record);
        task
    }

    // ---------- persistence ----------

    fn flush(
        &self,
        events: Vec<Event>,
        task_snapshot: Option<TaskRecord>,
        order_snapshots: Vec<OrderRecord>,
    ) {
        if let Some(record) = task_snapshot {
            self.persist_task(&record);
        }
        for record in &order_snapshots {
            self.persist_order(record);
        }
        for event in events {
            self.bus.publish(event);
        }
    }

    fn persist_task(&self, record: &TaskRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_task(record) {
                error!(
                    "[TR] Task persistence failed (continuing): task_id={} error={}",
                    record.task_id, e
                );
            }
        }
    }

    fn persist_order(&self, record: &OrderRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_order(record) {
                error!(
                    "[TR] Order persistence failed (continuing): order_id={} error={}",
                    record.order_id, e
                );
            }
        }
    }

    /// Announce shutdown. Streams and tasks die with the process.
    pub fn shutdown(&self) {
        self.bus.publish_transient(Event::with_source(
            topics::tr::MANAGER_SHUTDOWN,
            json!({"timestamp": Utc::now().timestamp_millis()}),
            "tr",
        ));
        info!("[TR] TradeExecutor shut down");
    }
}
