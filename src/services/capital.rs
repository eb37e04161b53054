//! CapitalManager: balance tracking, margin allocation and position sizing
//! for one account.

use tracing::{debug, info};

use crate::constants::trading::CAPITAL_SAFETY_RATIO;
use crate::error::TradingError;

pub struct CapitalManager {
    pub user_id: String,
    pub leverage: u32,
    pub margin_type: String,
    available_balance: Option<f64>,
    total_balance: Option<f64>,
}

impl CapitalManager {
    pub fn new(user_id: &str, leverage: u32, margin_type: &str) -> Self {
        info!(
            "[TR] CapitalManager: user_id={} leverage={}x margin_type={}",
            user_id, leverage, margin_type
        );
        Self {
            user_id: user_id.to_string(),
            leverage,
            margin_type: margin_type.to_string(),
            available_balance: None,
            total_balance: None,
        }
    }

    pub fn update_balance(&mut self, available: f64, total: Option<f64>) {
        self.available_balance = Some(available);
        self.total_balance = Some(total.unwrap_or(available));
        info!(
            "[TR] Balance updated: user_id={} available={} total={}",
            self.user_id,
            available,
            self.total_balance.unwrap()
        );
    }

    pub fn has_balance(&self) -> bool {
        self.available_balance.is_some()
    }

    pub fn available_balance(&self) -> Result<f64, TradingError> {
        self.available_balance
            .ok_or_else(|| TradingError::BalanceUnavailable {
                user_id: self.user_id.clone(),
            })
    }

    /// Available balance with the 5% safety buffer applied.
    pub fn usable_balance(&self) -> Result<f64, TradingError> {
        Ok(self.available_balance()? * CAPITAL_SAFETY_RATIO)
    }

    /// Usable balance divided evenly across the configured pairs.
    pub fn margin_per_symbol(&self, symbol_count: usize) -> Result<f64, TradingError> {
        if symbol_count == 0 {
            return Err(TradingError::Config(
                "symbol count must be at least 1".to_string(),
            ));
        }
        let margin = self.usable_balance()? / symbol_count as f64;
        debug!(
            "[TR] Margin per symbol: user_id={} count={} margin={}",
            self.user_id, symbol_count, margin
        );
        Ok(margin)
    }

    /// Position size: `margin × ratio × leverage ÷ entry_price`.
    pub fn position_size(
        &self,
        margin: f64,
        entry_price: f64,
        ratio: f64,
    ) -> Result<f64, TradingError> {
        if entry_price <= 0.0 {
            return Err(TradingError::InvalidPrice {
                symbol: String::new(),
                price: entry_price,
            });
        }
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(TradingError::Config(format!(
                "capital ratio must be in (0, 1]: {}",
                ratio
            )));
        }
        let size = margin * ratio * self.leverage as f64 / entry_price;
        debug!(
            "[TR] Position size: user_id={} margin={} ratio={} leverage={} price={} size={}",
            self.user_id, margin, ratio, self.leverage, entry_price, size
        );
        Ok(size)
    }

    /// Per-level grid size: the ratio-scaled position split across levels.
    pub fn grid_level_size(
        &self,
        margin: f64,
        entry_price: f64,
        grid_levels: u32,
        ratio: f64,
    ) -> Result<f64, TradingError> {
        if grid_levels == 0 {
            return Err(TradingError::Config(
                "grid_levels must be at least 1".to_string(),
            ));
        }
        Ok(self.position_size(margin, entry_price, ratio)? / grid_levels as f64)
    }
}
