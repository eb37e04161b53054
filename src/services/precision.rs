//! PrecisionHandler: per-symbol price/quantity truncation and the
//! minimum-notional gate.
//!
//! Values are truncated (round-down), never rounded — a rounded-up quantity
//! could exceed the allocated margin.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;

use crate::constants::trading::{
    DEFAULT_MIN_NOTIONAL, DEFAULT_PRICE_PRECISION, DEFAULT_QUANTITY_PRECISION,
};
use crate::error::TradingError;

#[derive(Clone, Copy, Debug)]
pub struct SymbolPrecision {
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_notional: f64,
}

impl Default for SymbolPrecision {
    fn default() -> Self {
        Self {
            price_precision: DEFAULT_PRICE_PRECISION,
            quantity_precision: DEFAULT_QUANTITY_PRECISION,
            min_notional: DEFAULT_MIN_NOTIONAL,
        }
    }
}

#[derive(Default)]
pub struct PrecisionHandler {
    symbols: RwLock<HashMap<String, SymbolPrecision>>,
}

impl PrecisionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_symbol_precision(
        &self,
        symbol: &str,
        price_precision: u32,
        quantity_precision: u32,
        min_notional: f64,
    ) {
        self.symbols.write().unwrap().insert(
            symbol.to_string(),
            SymbolPrecision {
                price_precision,
                quantity_precision,
                min_notional,
            },
        );
    }

    pub fn symbol_precision(&self, symbol: &str) -> SymbolPrecision {
        self.symbols
            .read()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    /// Truncate a price to the symbol's tick precision.
    pub fn truncate_price(&self, symbol: &str, price: f64) -> f64 {
        truncate(price, self.symbol_precision(symbol).price_precision)
    }

    /// Truncate a quantity to the symbol's lot precision.
    pub fn truncate_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        truncate(quantity, self.symbol_precision(symbol).quantity_precision)
    }

    /// Truncate both order parameters.
    pub fn process_order_params(&self, symbol: &str, price: f64, quantity: f64) -> (f64, f64) {
        (
            self.truncate_price(symbol, price),
            self.truncate_quantity(symbol, quantity),
        )
    }

    /// Validate an order after truncation: positive values and the
    /// minimum-notional floor.
    pub fn validate_order(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<(), TradingError> {
        if price <= 0.0 {
            return Err(TradingError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        if quantity <= 0.0 {
            return Err(TradingError::InvalidQuantity {
                symbol: symbol.to_string(),
                qty: quantity,
            });
        }
        let min_notional = self.symbol_precision(symbol).min_notional;
        let notional = price * quantity;
        if notional < min_notional {
            warn!(
                "[TR] Notional below minimum: symbol={} price={} qty={} notional={} min={}",
                symbol, price, quantity, notional, min_notional
            );
            return Err(TradingError::MinNotional {
                symbol: symbol.to_string(),
                notional,
                min_notional,
            });
        }
        Ok(())
    }
}

/// Round-down to `precision` decimal places. The epsilon absorbs binary
/// float error so exact values like 1.23 survive the truncation; it scales
/// with the magnitude and stays far below one scaled unit.
fn truncate(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let scaled = value * factor;
    (scaled + scaled.abs() * 1e-12 + 1e-9).floor() / factor
}
