//! Profit accounting for single orders and completed grid pairs.

use crate::constants::trading::DEFAULT_FEE_RATE;

/// Net profit of a closed position:
/// `(exit − entry) × qty × sign(side) − (entry + exit) fees`.
/// `side` is the position direction (LONG/SHORT).
pub fn order_profit(
    entry_price: f64,
    exit_price: f64,
    quantity: f64,
    side: &str,
    fee_rate: Option<f64>,
) -> f64 {
    let fee_rate = fee_rate.unwrap_or(DEFAULT_FEE_RATE);
    let price_diff = if side == "SHORT" {
        entry_price - exit_price
    } else {
        exit_price - entry_price
    };
    let gross = price_diff * quantity;
    let fees = entry_price * quantity * fee_rate + exit_price * quantity * fee_rate;
    gross - fees
}

/// Net profit of a completed grid round-trip:
/// `(sell − buy) × qty − fees`.
pub fn grid_pair_profit(
    buy_price: f64,
    sell_price: f64,
    quantity: f64,
    fee_rate: Option<f64>,
) -> f64 {
    let fee_rate = fee_rate.unwrap_or(DEFAULT_FEE_RATE);
    let gross = (sell_price - buy_price) * quantity;
    let fees = buy_price * quantity * fee_rate + sell_price * quantity * fee_rate;
    gross - fees
}

/// Summary over a task's realised profits.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfitStats {
    pub total_profit: f64,
    pub profit_count: usize,
    pub loss_count: usize,
    pub win_rate: f64,
}

pub fn profit_stats(profits: &[f64]) -> ProfitStats {
    if profits.is_empty() {
        return ProfitStats {
            total_profit: 0.0,
            profit_count: 0,
            loss_count: 0,
            win_rate: 0.0,
        };
    }
    let total_profit = profits.iter().sum();
    let profit_count = profits.iter().filter(|&&p| p > 0.0).count();
    let loss_count = profits.iter().filter(|&&p| p < 0.0).count();
    ProfitStats {
        total_profit,
        profit_count,
        loss_count,
        win_rate: profit_count as f64 / profits.len() as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_profit_nets_fees() {
        // (1.05 - 1.00) * 100 = 5.0 gross
        // fees = 1.00*100*0.0004 + 1.05*100*0.0004 = 0.082
        let profit = order_profit(1.0, 1.05, 100.0, "LONG", None);
        assert!((profit - 4.918).abs() < 1e-9);
    }

    #[test]
    fn short_profit_inverts_direction() {
        let profit = order_profit(1.05, 1.0, 100.0, "SHORT", None);
        assert!((profit - 4.918).abs() < 1e-9);
    }

    #[test]
    fn losing_long_goes_negative() {
        let profit = order_profit(1.05, 1.0, 100.0, "LONG", None);
        assert!(profit < -5.0);
    }

    #[test]
    fn grid_pair_profit_matches_formula() {
        // (0.96 - 0.95) * 100 = 1.0 gross
        // fees = 0.95*100*0.0004 + 0.96*100*0.0004 = 0.0764
        let profit = grid_pair_profit(0.95, 0.96, 100.0, None);
        assert!((profit - 0.9236).abs() < 1e-9);
    }

    #[test]
    fn custom_fee_rate_respected() {
        let no_fee = grid_pair_profit(0.95, 1.05, 100.0, Some(0.0));
        assert!((no_fee - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stats_over_mixed_outcomes() {
        let stats = profit_stats(&[10.0, -5.0, 8.0, -3.0]);
        assert!((stats.total_profit - 10.0).abs() < 1e-9);
        assert_eq!(stats.profit_count, 2);
        assert_eq!(stats.loss_count, 2);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stats_empty() {
        let stats = profit_stats(&[]);
        assert_eq!(stats.total_profit, 0.0);
        assert_eq!(stats.win_rate, 0.0);
    }
}
