//! Technical indicator library: trait, signal type and factory.
//!
//! Indicators are pure over the K-line window they are handed — the system
//! never caches K-lines, so every computation receives the full window.

pub mod ma_stop;
pub mod rsi;

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::error::TradingError;
use crate::exchange::types::Kline;

/// Direction emitted by an indicator or a composite strategy signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Long,
    Short,
    None,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Long => "LONG",
            Signal::Short => "SHORT",
            Signal::None => "NONE",
        }
    }

    pub fn parse(s: &str) -> Signal {
        match s {
            "LONG" => Signal::Long,
            "SHORT" => Signal::Short,
            _ => Signal::None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one indicator computation.
#[derive(Clone, Debug)]
pub struct IndicatorResult {
    pub signal: Signal,
    pub data: Value,
}

/// A technical indicator. Implementations keep only their parameters;
/// state derived from K-lines is recomputed on every call.
pub trait Indicator: Send + Sync {
    /// Minimum K-line count required before the indicator can compute.
    fn min_klines_required(&self) -> usize;

    /// Compute over the full window. The last K-line is the newest.
    fn calculate(&mut self, klines: &[Kline]) -> IndicatorResult;
}

pub type IndicatorConstructor =
    fn(params: &Value) -> Result<Box<dyn Indicator>, TradingError>;

/// Maps indicator names to constructors. Registration happens in the
/// composition root before any subscription is honored.
#[derive(Default)]
pub struct IndicatorFactory {
    registry: HashMap<String, IndicatorConstructor>,
}

impl IndicatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with every built-in indicator registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("ma_stop_ta", ma_stop::MaStopIndicator::construct);
        factory.register("rsi_ta", rsi::RsiIndicator::construct);
        factory
    }

    pub fn register(&mut self, name: &str, constructor: IndicatorConstructor) {
        self.registry.insert(name.to_string(), constructor);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    pub fn create(&self, name: &str, params: &Value) -> Result<Box<dyn Indicator>, TradingError> {
        let constructor = self
            .registry
            .get(name)
            .ok_or_else(|| TradingError::UnknownIndicator {
                name: name.to_string(),
            })?;
        constructor(params)
    }
}

/// Extract the close prices out of a K-line window.
pub(crate) fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

#[cfg(test)]
pub(crate) fn kline_window(closes: &[f64]) -> Vec<Kline> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Kline {
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
            timestamp: 1_700_000_000_000 + i as i64 * 60_000,
            is_closed: true,
        })
        .collect()
}
