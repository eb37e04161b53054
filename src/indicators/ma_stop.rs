//! MA-stop: a trend-following indicator built on a simple moving average
//! with percentage stop bands.
//!
//! Signal rule over the newest close:
//! - close above `ma * (1 - percent/100)` → LONG
//! - close below `ma * (1 + percent/100)` → SHORT
//! - otherwise → NONE

use serde_json::{json, Value};

use crate::error::TradingError;
use crate::exchange::types::Kline;
use crate::indicators::{closes, Indicator, IndicatorResult, Signal};

pub struct MaStopIndicator {
    period: usize,
    percent: f64,
    min_klines: usize,
}

impl MaStopIndicator {
    pub fn new(period: usize, percent: f64) -> Self {
        Self {
            period,
            percent,
            min_klines: (period * 2).max(50),
        }
    }

    /// Factory constructor. Params: `{"period": 20, "percent": 2}`.
    pub fn construct(params: &Value) -> Result<Box<dyn Indicator>, TradingError> {
        let period = params.get("period").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let percent = params.get("percent").and_then(|v| v.as_f64()).unwrap_or(2.0);
        if period == 0 {
            return Err(TradingError::Config(
                "ma_stop_ta: period must be at least 1".to_string(),
            ));
        }
        if percent < 0.0 {
            return Err(TradingError::Config(format!(
                "ma_stop_ta: percent must not be negative: {}",
                percent
            )));
        }
        Ok(Box::new(Self::new(period, percent)))
    }
}

impl Indicator for MaStopIndicator {
    fn min_klines_required(&self) -> usize {
        self.min_klines
    }

    fn calculate(&mut self, klines: &[Kline]) -> IndicatorResult {
        let closes = closes(klines);
        if closes.len() < self.period {
            return IndicatorResult {
                signal: Signal::None,
                data: json!({
                    "error": "not enough klines",
                    "required": self.period,
                    "actual": closes.len(),
                }),
            };
        }

        let ma: f64 = closes[closes.len() - self.period..].iter().sum::<f64>()
            / self.period as f64;
        let stop_line_long = ma * (1.0 - self.percent / 100.0);
        let stop_line_short = ma * (1.0 + self.percent / 100.0);
        let latest_close = *closes.last().unwrap();

        let signal = if latest_close > stop_line_long {
            Signal::Long
        } else if latest_close < stop_line_short {
            Signal::Short
        } else {
            Signal::None
        };

        IndicatorResult {
            signal,
            data: json!({
                "ma": ma,
                "stop_line_long": stop_line_long,
                "stop_line_short": stop_line_short,
                "close": latest_close,
                "period": self.period,
                "percent": self.percent,
            }),
        }
    }
}
