//! Grid mechanics: the price-ladder calculator and the per-task grid book.
//!
//! The calculator is pure arithmetic over the configured band. The book
//! tracks live grid orders and their pairings: a filled buy opens a pair
//! whose sell sits one interval above (and the mirror for sells); the
//! completed round-trip books `(sell − buy) × qty − fees` and re-arms the
//! level that started the pair.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::TradingError;
use crate::exchange::types::Side;
use crate::services::profit::grid_pair_profit;

/// One order of a computed ladder.
#[derive(Clone, Debug, PartialEq)]
pub struct GridOrderSpec {
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub level: usize,
}

/// `price_interval = (upper − lower) / levels`.
pub fn price_interval(upper: f64, lower: f64, levels: u32) -> Result<f64, TradingError> {
    if upper <= lower {
        return Err(TradingError::Config(format!(
            "grid upper must exceed lower: {} <= {}",
            upper, lower
        )));
    }
    if levels == 0 {
        return Err(TradingError::Config(
            "grid levels must be at least 1".to_string(),
        ));
    }
    Ok((upper - lower) / levels as f64)
}

/// The full ladder `lower, lower+interval, …, upper` (levels + 1 prices).
pub fn grid_prices(upper: f64, lower: f64, levels: u32) -> Result<Vec<f64>, TradingError> {
    let interval = price_interval(upper, lower, levels)?;
    Ok((0..=levels)
        .map(|i| lower + i as f64 * interval)
        .collect())
}

/// A one-sided ladder: `levels` orders of equal quantity from the bottom of
/// the band upwards.
pub fn one_sided_orders(
    upper: f64,
    lower: f64,
    levels: u32,
    total_quantity: f64,
    side: Side,
) -> Result<Vec<GridOrderSpec>, TradingError> {
    if total_quantity <= 0.0 {
        return Err(TradingError::InvalidQuantity {
            symbol: String::new(),
            qty: total_quantity,
        });
    }
    let prices = grid_prices(upper, lower, levels)?;
    let quantity = total_quantity / levels as f64;
    Ok(prices[..levels as usize]
        .iter()
        .enumerate()
        .map(|(level, &price)| GridOrderSpec {
            side,
            price,
            quantity,
            level,
        })
        .collect())
}

/// A symmetric ladder around the entry: buys strictly below, sells strictly
/// above, equal quantity per order.
pub fn symmetric_orders(
    entry_price: f64,
    upper: f64,
    lower: f64,
    levels: u32,
    total_quantity: f64,
) -> Result<Vec<GridOrderSpec>, TradingError> {
    if !(lower < entry_price && entry_price < upper) {
        return Err(TradingError::Config(format!(
            "entry price must sit inside the band: {} < {} < {}",
            lower, entry_price, upper
        )));
    }
    let prices = grid_prices(upper, lower, levels)?;
    // A ladder price within float error of the entry is the entry level
    // itself and gets no order.
    let eps = price_interval(upper, lower, levels)? * 1e-6;
    let in_band: Vec<(usize, f64, Side)> = prices
        .iter()
        .enumerate()
        .filter_map(|(level, &price)| {
            if price < entry_price - eps {
                Some((level, price, Side::Buy))
            } else if price > entry_price + eps {
                Some((level, price, Side::Sell))
            } else {
                None
            }
        })
        .collect();
    if in_band.is_empty() {
        return Ok(Vec::new());
    }
    let quantity = total_quantity / in_band.len() as f64;
    Ok(in_band
        .into_iter()
        .map(|(level, price, side)| GridOrderSpec {
            side,
            price,
            quantity,
            level,
        })
        .collect())
}

/// Two linked grid orders whose completed round-trip is a unit of profit.
#[derive(Clone, Debug)]
pub struct GridPair {
    pub pair_id: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    /// The side whose fill opened the pair; re-armed after completion.
    pub initiator: Side,
    pub buy_filled: bool,
    pub sell_filled: bool,
}

impl GridPair {
    pub fn is_complete(&self) -> bool {
        self.buy_filled && self.sell_filled
    }

    pub fn profit(&self, fee_rate: Option<f64>) -> f64 {
        grid_pair_profit(self.buy_price, self.sell_price, self.quantity, fee_rate)
    }
}

/// What a grid fill means for the task.
#[derive(Clone, Debug)]
pub enum GridFillOutcome {
    /// First side of a fresh pair filled; submit the counter order.
    PairOpened {
        pair_id: String,
        counter: GridOrderSpec,
    },
    /// Both sides done: book the profit and re-arm the initiating level.
    PairCompleted {
        pair: GridPair,
        profit: f64,
        rearm: GridOrderSpec,
    },
}

struct TrackedOrder {
    side: Side,
    price: f64,
    quantity: f64,
    pair_id: Option<String>,
}

/// Live grid state for one trading task.
pub struct GridBook {
    pub upper: f64,
    pub lower: f64,
    pub levels: u32,
    pub interval: f64,
    pub move_up: bool,
    pub move_down: bool,
    orders: HashMap<String, TrackedOrder>,
    pairs: HashMap<String, GridPair>,
    completed_pairs: usize,
}

impl GridBook {
    pub fn new(
        upper: f64,
        lower: f64,
        levels: u32,
        move_up: bool,
        move_down: bool,
    ) -> Result<Self, TradingError> {
        let interval = price_interval(upper, lower, levels)?;
        Ok(Self {
            upper,
            lower,
            levels,
            interval,
            move_up,
            move_down,
            orders: HashMap::new(),
            pairs: HashMap::new(),
            completed_pairs: 0,
        })
    }

    /// Record a live grid order under its client order id.
    pub fn track_order(
        &mut self,
        client_order_id: &str,
        side: Side,
        price: f64,
        quantity: f64,
        pair_id: Option<String>,
    ) {
        self.orders.insert(
            client_order_id.to_string(),
            TrackedOrder {
                side,
                price,
                quantity,
                pair_id,
            },
        );
    }

    pub fn is_grid_order(&self, client_order_id: &str) -> bool {
        self.orders.contains_key(client_order_id)
    }

    /// Drop a tracked order without any pairing side effects (rejected or
    /// cancelled orders).
    pub fn untrack(&mut self, client_order_id: &str) {
        self.orders.remove(client_order_id);
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.orders.keys().cloned().collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn completed_pair_count(&self) -> usize {
        self.completed_pairs
    }

    pub fn clear(&mut self) {
        self.orders.clear();
        self.pairs.clear();
    }

    /// Process a fill of a tracked grid order. Returns `None` when the order
    /// is not part of this grid.
    pub fn on_fill(
        &mut self,
        client_order_id: &str,
        fee_rate: Option<f64>,
    ) -> Option<GridFillOutcome> {
        let order = self.orders.remove(client_order_id)?;

        match order.pair_id {
            Some(pair_id) => {
                // The counter side of an open pair just filled.
                let mut pair = self.pairs.remove(&pair_id)?;
                match order.side {
                    Side::Buy => pair.buy_filled = true,
                    Side::Sell => pair.sell_filled = true,
                }
                if !pair.is_complete() {
                    self.pairs.insert(pair_id, pair);
                    return None;
                }
                self.completed_pairs += 1;
                let profit = pair.profit(fee_rate);
                let rearm_price = match pair.initiator {
                    Side::Buy => pair.buy_price,
                    Side::Sell => pair.sell_price,
                };
                Some(GridFillOutcome::PairCompleted {
                    rearm: GridOrderSpec {
                        side: pair.initiator,
                        price: rearm_price,
                        quantity: pair.quantity,
                        level: 0,
                    },
                    profit,
                    pair,
                })
            }
            None => {
                // An un-paired ladder order opens a fresh pair; its counter
                // sits one interval away on the other side.
                let pair_id = Uuid::new_v4().to_string();
                let (buy_price, sell_price, counter_side, counter_price) = match order.side {
                    Side::Buy => (
                        order.price,
                        order.price + self.interval,
                        Side::Sell,
                        order.price + self.interval,
                    ),
                    Side::Sell => (
                        order.price - self.interval,
                        order.price,
                        Side::Buy,
                        order.price - self.interval,
                    ),
                };
                let pair = GridPair {
                    pair_id: pair_id.clone(),
                    buy_price,
                    sell_price,
                    quantity: order.quantity,
                    initiator: order.side,
                    buy_filled: order.side == Side::Buy,
                    sell_filled: order.side == Side::Sell,
                };
                self.pairs.insert(pair_id.clone(), pair);
                Some(GridFillOutcome::PairOpened {
                    pair_id,
                    counter: GridOrderSpec {
                        side: counter_side,
                        price: counter_price,
                        quantity: order.quantity,
                        level: 0,
                    },
                })
            }
        }
    }

    /// Shift the band one interval up or down (move_up / move_down).
    pub fn shift_band(&mut self, up: bool) {
        if up {
            self.upper += self.interval;
            self.lower += self.interval;
        } else {
            self.upper -= self.interval;
            self.lower -= self.interval;
        }
    }

    /// Whether the last price breached the band in a direction the grid is
    /// allowed to follow.
    pub fn breach(&self, last_price: f64) -> Option<bool> {
        if self.move_up && last_price > self.upper {
            Some(true)
        } else if self.move_down && last_price < self.lower {
            Some(false)
        } else {
            None
        }
    }
}
