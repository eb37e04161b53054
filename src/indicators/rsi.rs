//! RSI with Wilder smoothing.
//!
//! First average gain/loss is a simple mean over the first `period` changes;
//! afterwards `avg = (prev_avg * (period - 1) + current) / period`.
//! Signal rule: RSI below `oversold` → LONG, above `overbought` → SHORT.

use serde_json::{json, Value};

use crate::error::TradingError;
use crate::exchange::types::Kline;
use crate::indicators::{closes, Indicator, IndicatorResult, Signal};

pub struct RsiIndicator {
    period: usize,
    overbought: f64,
    oversold: f64,
    min_klines: usize,
}

impl RsiIndicator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        Self {
            period,
            overbought,
            oversold,
            min_klines: (period * 3).max(50),
        }
    }

    /// Factory constructor. Params:
    /// `{"period": 14, "overbought": 70, "oversold": 30}`.
    pub fn construct(params: &Value) -> Result<Box<dyn Indicator>, TradingError> {
        let period = params.get("period").and_then(|v| v.as_u64()).unwrap_or(14) as usize;
        let overbought = params
            .get("overbought")
            .and_then(|v| v.as_f64())
            .unwrap_or(70.0);
        let oversold = params
            .get("oversold")
            .and_then(|v| v.as_f64())
            .unwrap_or(30.0);
        if period < 2 {
            return Err(TradingError::Config(
                "rsi_ta: period must be at least 2".to_string(),
            ));
        }
        if oversold >= overbought {
            return Err(TradingError::Config(format!(
                "rsi_ta: oversold must be below overbought: {} >= {}",
                oversold, overbought
            )));
        }
        Ok(Box::new(Self::new(period, overbought, oversold)))
    }

    fn rsi_value(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.period + 1 {
            return None;
        }

        let mut avg_gain = 0.0;
        let mut avg_loss = 0.0;
        for i in 1..=self.period {
            let change = closes[i] - closes[i - 1];
            if change > 0.0 {
                avg_gain += change;
            } else {
                avg_loss += -change;
            }
        }
        avg_gain /= self.period as f64;
        avg_loss /= self.period as f64;

        for i in self.period + 1..closes.len() {
            let change = closes[i] - closes[i - 1];
            let gain = if change > 0.0 { change } else { 0.0 };
            let loss = if change < 0.0 { -change } else { 0.0 };
            avg_gain = (avg_gain * (self.period - 1) as f64 + gain) / self.period as f64;
            avg_loss = (avg_loss * (self.period - 1) as f64 + loss) / self.period as f64;
        }

        if avg_loss == 0.0 {
            return Some(100.0);
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }
}

impl Indicator for RsiIndicator {
    fn min_klines_required(&self) -> usize {
        self.min_klines
    }

    fn calculate(&mut self, klines: &[Kline]) -> IndicatorResult {
        let closes = closes(klines);
        let Some(rsi) = self.rsi_value(&closes) else {
            return IndicatorResult {
                signal: Signal::None,
                data: json!({
                    "error": "not enough klines",
                    "required": self.period + 1,
                    "actual": closes.len(),
                }),
            };
        };

        let signal = if rsi <= self.oversold {
            Signal::Long
        } else if rsi >= self.overbought {
            Signal::Short
        } else {
            Signal::None
        };

        IndicatorResult {
            signal,
            data: json!({
                "rsi": rsi,
                "period": self.period,
                "overbought": self.overbought,
                "oversold": self.oversold,
                "close": closes.last().copied().unwrap_or(0.0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::kline_window;

    #[test]
    fn monotonic_rise_maxes_out() {
        let closes: Vec<f64> = (0..60).map(|i| 1.0 + i as f64 * 0.01).collect();
        let window = kline_window(&closes);
        let mut indicator = RsiIndicator::new(14, 70.0, 30.0);

        let result = indicator.calculate(&window);
        assert_eq!(result.signal, Signal::Short);
        assert!((result.data["rsi"].as_f64().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn monotonic_fall_bottoms_out() {
        let closes: Vec<f64> = (0..60).map(|i| 2.0 - i as f64 * 0.01).collect();
        let window = kline_window(&closes);
        let mut indicator = RsiIndicator::new(14, 70.0, 30.0);

        let result = indicator.calculate(&window);
        assert_eq!(result.signal, Signal::Long);
        assert!(result.data["rsi"].as_f64().unwrap() < 1.0);
    }

    #[test]
    fn flat_series_is_neutral() {
        let window = kline_window(&[1.0; 60]);
        let mut indicator = RsiIndicator::new(14, 70.0, 30.0);

        let result = indicator.calculate(&window);
        // No losses at all reads as RSI 100 by convention
        assert_eq!(result.data["rsi"].as_f64().unwrap(), 100.0);
    }

    #[test]
    fn short_window_returns_none() {
        let window = kline_window(&[1.0, 1.1]);
        let mut indicator = RsiIndicator::new(14, 70.0, 30.0);
        assert_eq!(indicator.calculate(&window).signal, Signal::None);
    }

    #[test]
    fn construct_rejects_inverted_thresholds() {
        let err = RsiIndicator::construct(&json!({"oversold": 80, "overbought": 20}));
        assert!(err.is_err());
    }
}
