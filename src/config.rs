//! Configuration models for accounts and strategies.
//!
//! Accounts live in `config/pm_config.json`; each user's strategy lives in
//! `config/strategies/{user_id}/{strategy}.json`. Both are plain JSON loaded
//! with serde; validation reports a human-readable reason per failure so a
//! broken entry can be skipped without taking the rest of the system down.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TradingError;

/// Top-level account file: `{ "users": { "<user_id>": {...} } }`.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountsConfig {
    pub users: BTreeMap<String, AccountConfig>,
}

/// One account entry. `testnet` defaults to false.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default)]
    pub api_key: Option<Value>,
    #[serde(default)]
    pub api_secret: Option<Value>,
    #[serde(default)]
    pub strategy: Option<Value>,
    #[serde(default)]
    pub testnet: Option<Value>,
}

/// A validated account entry with concrete field types.
#[derive(Clone, Debug)]
pub struct ValidatedAccount {
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub strategy: String,
    pub testnet: bool,
}

impl AccountConfig {
    /// Validate per the account rules: `name`, `api_key`, `api_secret` and
    /// `strategy` must be non-empty strings; `testnet`, when present, must be
    /// boolean and defaults to false.
    pub fn validate(&self) -> Result<ValidatedAccount, String> {
        let required = [
            ("name", &self.name),
            ("api_key", &self.api_key),
            ("api_secret", &self.api_secret),
            ("strategy", &self.strategy),
        ];

        let mut values = Vec::with_capacity(required.len());
        for (field, value) in required {
            match value {
                None => return Err(format!("missing required field: {}", field)),
                Some(Value::String(s)) => {
                    if s.trim().is_empty() {
                        return Err(format!("field must not be empty: {}", field));
                    }
                    values.push(s.clone());
                }
                Some(_) => return Err(format!("field must be a string: {}", field)),
            }
        }

        let testnet = match &self.testnet {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err("field testnet must be a boolean".to_string()),
        };

        let mut iter = values.into_iter();
        Ok(ValidatedAccount {
            name: iter.next().unwrap(),
            api_key: iter.next().unwrap(),
            api_secret: iter.next().unwrap(),
            strategy: iter.next().unwrap(),
            testnet,
        })
    }
}

impl AccountsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TradingError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TradingError::Config(format!(
                "account config not found: {} ({})",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| TradingError::Config(format!("account config JSON invalid: {}", e)))
    }
}

/// Grid execution variant selected by a strategy's grid configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GridType {
    Normal,
    Abnormal,
}

/// Optional grid trading block of a strategy file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GridTradingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grid_type")]
    pub grid_type: GridType,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    #[serde(default = "default_grid_levels")]
    pub grid_levels: u32,
    pub upper_price: Option<f64>,
    pub lower_price: Option<f64>,
    #[serde(default)]
    pub move_up: bool,
    #[serde(default)]
    pub move_down: bool,
}

fn default_grid_type() -> GridType {
    GridType::Normal
}

fn default_ratio() -> f64 {
    1.0
}

fn default_grid_levels() -> u32 {
    10
}

/// One tradeable pair inside a strategy, with its indicator parameter map
/// (`indicator_name -> params`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradingPair {
    pub symbol: String,
    #[serde(default)]
    pub indicator_params: BTreeMap<String, Value>,
}

/// A strategy file. Required scalar fields plus the pair list; grid trading
/// and reverse entry are optional.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub timeframe: String,
    pub leverage: u32,
    pub position_side: String,
    pub margin_mode: String,
    pub margin_type: String,
    pub trading_pairs: Vec<TradingPair>,
    #[serde(default)]
    pub grid_trading: Option<GridTradingConfig>,
    #[serde(default)]
    pub reverse: bool,
}

impl StrategyConfig {
    pub fn load(dir: impl AsRef<Path>, user_id: &str, strategy: &str) -> Result<Self, String> {
        let path = dir
            .as_ref()
            .join(user_id)
            .join(format!("{}.json", strategy));
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("strategy file not found: {} ({})", path.display(), e))?;
        let config: StrategyConfig = serde_json::from_str(&text)
            .map_err(|e| format!("strategy JSON invalid: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Field-level validation beyond what serde enforces structurally.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeframe.trim().is_empty() {
            return Err("timeframe must not be empty".to_string());
        }
        if self.leverage == 0 {
            return Err("leverage must be at least 1".to_string());
        }
        if self.trading_pairs.is_empty() {
            return Err("trading_pairs must be a non-empty array".to_string());
        }
        for pair in &self.trading_pairs {
            if pair.symbol.trim().is_empty() {
                return Err("trading pair symbol must not be empty".to_string());
            }
        }
        if let Some(grid) = &self.grid_trading {
            if grid.enabled {
                if !(grid.ratio > 0.0 && grid.ratio <= 1.0) {
                    return Err(format!("grid ratio must be in (0, 1]: {}", grid.ratio));
                }
                if grid.grid_levels == 0 {
                    return Err("grid_levels must be at least 1".to_string());
                }
                let upper = grid
                    .upper_price
                    .ok_or_else(|| "grid_trading.upper_price is required".to_string())?;
                let lower = grid
                    .lower_price
                    .ok_or_else(|| "grid_trading.lower_price is required".to_string())?;
                if upper <= lower {
                    return Err(format!(
                        "grid upper_price must exceed lower_price: {} <= {}",
                        upper, lower
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether grid trading is switched on at all.
    pub fn grid_enabled(&self) -> bool {
        self.grid_trading.as_ref().map(|g| g.enabled).unwrap_or(false)
    }
}
