//! Trading persistence: `trading_tasks` and `orders` tables.
//!
//! Writes are best-effort — the executor logs persistence failures and keeps
//! trading. Reads are for audit and inspection only; in-memory task state is
//! authoritative and is rebuilt from the exchange on restart.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::error::TradingError;

/// Persisted snapshot of a trading task.
#[derive(Clone, Debug, Default)]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub trading_mode: String,
    pub position_state: String,
    pub entry_side: Option<String>,
    pub entry_price: Option<f64>,
    pub entry_quantity: Option<f64>,
    pub exit_price: Option<f64>,
    pub total_profit: f64,
    pub created_at: String,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub grid_config: Option<Value>,
}

/// Persisted snapshot of an order.
#[derive(Clone, Debug, Default)]
pub struct OrderRecord {
    pub order_id: String,
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: String,
    pub is_grid_order: bool,
    pub grid_pair_id: Option<String>,
    pub profit: f64,
    pub created_at: String,
    pub filled_at: Option<String>,
}

pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TradingError> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| TradingError::Config(format!("trade store dir: {}", e)))?;
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path.as_ref())?),
        };
        store.init_schema()?;
        info!("[STORE] Trade store opened: {}", path.as_ref().display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, TradingError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), TradingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trading_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                trading_mode TEXT NOT NULL,
                position_state TEXT NOT NULL,
                entry_side TEXT,
                entry_price REAL,
                entry_quantity REAL,
                exit_price REAL,
                total_profit REAL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                opened_at TEXT,
                closed_at TEXT,
                grid_config TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_user_symbol
                ON trading_tasks(user_id, symbol);
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL UNIQUE,
                task_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                filled_quantity REAL DEFAULT 0.0,
                status TEXT NOT NULL,
                is_grid_order INTEGER DEFAULT 0,
                grid_pair_id TEXT,
                profit REAL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                filled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_task ON orders(task_id);",
        )?;
        Ok(())
    }

    /// Insert or refresh a task row (keyed by task_id).
    pub fn upsert_task(&self, task: &TaskRecord) -> Result<(), TradingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trading_tasks (
                task_id, user_id, symbol, trading_mode, position_state,
                entry_side, entry_price, entry_quantity, exit_price,
                total_profit, created_at, opened_at, closed_at, grid_config
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(task_id) DO UPDATE SET
                position_state = excluded.position_state,
                entry_side = excluded.entry_side,
                entry_price = excluded.entry_price,
                entry_quantity = excluded.entry_quantity,
                exit_price = excluded.exit_price,
                total_profit = excluded.total_profit,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at,
                grid_config = excluded.grid_config",
            params![
                task.task_id,
                task.user_id,
                task.symbol,
                task.trading_mode,
                task.position_state,
                task.entry_side,
                task.entry_price,
                task.entry_quantity,
                task.exit_price,
                task.total_profit,
                task.created_at,
                task.opened_at,
                task.closed_at,
                task.grid_config
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            ],
        )?;
        Ok(())
    }

    /// Insert or refresh an order row (keyed by order_id).
    pub fn upsert_order(&self, order: &OrderRecord) -> Result<(), TradingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (
                order_id, task_id, user_id, symbol, side, order_type,
                price, quantity, filled_quantity, status,
                is_grid_order, grid_pair_id, profit, created_at, filled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(order_id) DO UPDATE SET
                filled_quantity = excluded.filled_quantity,
                status = excluded.status,
                profit = excluded.profit,
                filled_at = excluded.filled_at",
            params![
                order.order_id,
                order.task_id,
                order.user_id,
                order.symbol,
                order.side,
                order.order_type,
                order.price,
                order.quantity,
                order.filled_quantity,
                order.status,
                order.is_grid_order as i64,
                order.grid_pair_id,
                order.profit,
                order.created_at,
                order.filled_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, TradingError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT task_id, user_id, symbol, trading_mode, position_state,
                        entry_side, entry_price, entry_quantity, exit_price,
                        total_profit, created_at, opened_at, closed_at, grid_config
                 FROM trading_tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    /// Recent tasks, optionally filtered by user and symbol, newest first.
    pub fn query_tasks(
        &self,
        user_id: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, TradingError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT task_id, user_id, symbol, trading_mode, position_state,
                    entry_side, entry_price, entry_quantity, exit_price,
                    total_profit, created_at, opened_at, closed_at, grid_config
             FROM trading_tasks WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(user) = user_id {
            sql.push_str(" AND user_id = ?");
            args.push(user.to_string());
        }
        if let Some(sym) = symbol {
            sql.push_str(" AND symbol = ?");
            args.push(sym.to_string());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", limit));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn query_orders_for_task(&self, task_id: &str) -> Result<Vec<OrderRecord>, TradingError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT order_id, task_id, user_id, symbol, side, order_type,
                    price, quantity, filled_quantity, status,
                    is_grid_order, grid_pair_id, profit, created_at, filled_at
             FROM orders WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(OrderRecord {
                order_id: row.get(0)?,
                task_id: row.get(1)?,
                user_id: row.get(2)?,
                symbol: row.get(3)?,
                side: row.get(4)?,
                order_type: row.get(5)?,
                price: row.get(6)?,
                quantity: row.get(7)?,
                filled_quantity: row.get(8)?,
                status: row.get(9)?,
                is_grid_order: row.get::<_, i64>(10)? != 0,
                grid_pair_id: row.get(11)?,
                profit: row.get(12)?,
                created_at: row.get(13)?,
                filled_at: row.get(14)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let grid_config_text: Option<String> = row.get(13)?;
    Ok(TaskRecord {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        trading_mode: row.get(3)?,
        position_state: row.get(4)?,
        entry_side: row.get(5)?,
        entry_price: row.get(6)?,
        entry_quantity: row.get(7)?,
        exit_price: row.get(8)?,
        total_profit: row.get(9)?,
        created_at: row.get(10)?,
        opened_at: row.get(11)?,
        closed_at: row.get(12)?,
        grid_config: grid_config_text.and_then(|t| serde_json::from_str(&t).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(task_id: &str) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            user_id: "u1".to_string(),
            symbol: "XRPUSDC".to_string(),
            trading_mode: "NO_GRID".to_string(),
            position_state: "NONE".to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn task_upsert_updates_in_place() {
        let store = TradeStore::in_memory().unwrap();
        let mut task = sample_task("t1");
        store.upsert_task(&task).unwrap();

        task.position_state = "LONG".to_string();
        task.entry_price = Some(1.05);
        task.total_profit = 3.2;
        store.upsert_task(&task).unwrap();

        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.position_state, "LONG");
        assert_eq!(loaded.entry_price, Some(1.05));
        assert_eq!(loaded.total_profit, 3.2);
        assert_eq!(store.query_tasks(Some("u1"), None, 10).unwrap().len(), 1);
    }

    #[test]
    fn orders_attach_to_task() {
        let store = TradeStore::in_memory().unwrap();
        store.upsert_task(&sample_task("t1")).unwrap();

        for i in 0..3 {
            let order = OrderRecord {
                order_id: format!("o{}", i),
                task_id: "t1".to_string(),
                user_id: "u1".to_string(),
                symbol: "XRPUSDC".to_string(),
                side: "BUY".to_string(),
                order_type: "LIMIT".to_string(),
                price: 1.0 + i as f64 * 0.01,
                quantity: 100.0,
                status: "NEW".to_string(),
                is_grid_order: true,
                grid_pair_id: Some(format!("p{}", i)),
                created_at: "2025-01-01T00:00:00Z".to_string(),
                ..Default::default()
            };
            store.upsert_order(&order).unwrap();
        }

        let orders = store.query_orders_for_task("t1").unwrap();
        assert_eq!(orders.len(), 3);
        assert!(orders.iter().all(|o| o.is_grid_order));
        assert_eq!(orders[1].grid_pair_id.as_deref(), Some("p1"));
    }

    #[test]
    fn order_status_update_preserves_identity() {
        let store = TradeStore::in_memory().unwrap();
        let mut order = OrderRecord {
            order_id: "o1".to_string(),
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            symbol: "XRPUSDC".to_string(),
            side: "SELL".to_string(),
            order_type: "MARKET".to_string(),
            price: 1.1,
            quantity: 50.0,
            status: "NEW".to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            ..Default::default()
        };
        store.upsert_order(&order).unwrap();

        order.status = "FILLED".to_string();
        order.filled_quantity = 50.0;
        order.filled_at = Some("2025-01-01T00:01:00Z".to_string());
        store.upsert_order(&order).unwrap();

        let orders = store.query_orders_for_task("t1").unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "FILLED");
        assert_eq!(orders[0].filled_quantity, 50.0);
    }
}
