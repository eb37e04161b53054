//! Unit tests for the TradeExecutor: no-grid round trips, grid deployment,
//! pair profit and the cancel-before-close ordering.

#[cfg(test)]
mod executor_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::bus::EventBus;
    use crate::data::trade_store::TradeStore;
    use crate::events::{topics, Event};
    use crate::services::executor::TradeExecutor;
    use crate::services::strategy::PositionState;

    fn probe(bus: &EventBus, pattern: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(pattern, "probe", move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(event).ok();
                Ok(())
            })
        });
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("probe channel closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Executor with a strategy context and a live balance for `u1`.
    async fn executor_with_balance(
        bus: &EventBus,
        grid: Option<serde_json::Value>,
        balance: f64,
    ) -> TradeExecutor {
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let executor = TradeExecutor::new(bus.clone(), Some(store));
        executor.start();

        bus.publish(Event::with_source(
            topics::st::STRATEGY_LOADED,
            json!({
                "user_id": "u1",
                "strategy": "test_st",
                "timeframe": "15m",
                "leverage": 4,
                "margin_type": "USDC",
                "pair_count": 1,
                "grid_trading": grid,
            }),
            "st",
        ));
        settle().await;
        bus.publish(Event::with_source(
            topics::de::ACCOUNT_BALANCE,
            json!({
                "user_id": "u1",
                "asset": "USDC",
                "balance": balance,
                "available_balance": balance,
            }),
            "DE",
        ));
        settle().await;
        executor
    }

    fn open_signal(side: &str, price: f64, grid: Option<serde_json::Value>) -> Event {
        Event::with_source(
            topics::st::SIGNAL_GENERATED,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "action": "OPEN",
                "side": side,
                "price": price,
                "grid_trading": grid,
            }),
            "st",
        )
    }

    fn close_signal(side: &str) -> Event {
        Event::with_source(
            topics::st::SIGNAL_GENERATED,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "action": "CLOSE",
                "side": side,
            }),
            "st",
        )
    }

    fn ack(bus: &EventBus, order_create: &Event, exchange_id: &str) {
        bus.publish(Event::with_source(
            topics::de::ORDER_SUBMITTED,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "order_id": exchange_id,
                "client_order_id": order_create.str_field("client_order_id"),
                "side": order_create.str_field("side"),
                "type": order_create.str_field("order_type"),
                "quantity": order_create.f64_field("quantity"),
                "price": order_create.f64_field("price").unwrap_or(0.0),
            }),
            "DE",
        ));
    }

    fn fill(bus: &EventBus, order_create: &Event, exchange_id: &str, price: f64) {
        bus.publish(Event::with_source(
            topics::de::ORDER_FILLED,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "order_id": exchange_id,
                "client_order_id": order_create.str_field("client_order_id"),
                "side": order_create.str_field("side"),
                "price": price,
                "quantity": order_create.f64_field("quantity"),
            }),
            "DE",
        ));
    }

    fn grid_config_normal() -> serde_json::Value {
        json!({
            "enabled": true,
            "grid_type": "normal",
            "ratio": 1.0,
            "grid_levels": 10,
            "upper_price": 1.05,
            "lower_price": 0.95,
        })
    }

    #[tokio::test]
    async fn no_grid_open_close_round_trip() {
        let bus = EventBus::new();
        let executor = executor_with_balance(&bus, None, 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);
        let mut opened = probe(&bus, topics::tr::POSITION_OPENED);
        let mut closed = probe(&bus, topics::tr::POSITION_CLOSED);

        // OPEN: market buy sized from capital
        bus.publish(open_signal("BUY", 1.0, None));
        let entry = recv(&mut orders).await;
        assert_eq!(entry.str_field("order_type"), Some("MARKET"));
        assert_eq!(entry.str_field("side"), Some("BUY"));
        // 10000 * 0.95 * 4x / 1.0, truncated to whole units
        assert_eq!(entry.f64_field("quantity"), Some(38_000.0));

        ack(&bus, &entry, "E1");
        fill(&bus, &entry, "E1", 1.0);

        let open_event = recv(&mut opened).await;
        assert_eq!(open_event.str_field("side"), Some("LONG"));
        assert_eq!(open_event.f64_field("entry_price"), Some(1.0));
        assert_eq!(executor.position_state("u1", "XRPUSDC"), PositionState::Long);

        // Duplicate OPEN while long is ignored
        bus.publish(open_signal("BUY", 1.0, None));
        assert!(timeout(Duration::from_millis(150), orders.recv())
            .await
            .is_err());

        // CLOSE: opposite market order, then the position closes on its fill
        bus.publish(close_signal("SELL"));
        let exit = recv(&mut orders).await;
        assert_eq!(exit.str_field("side"), Some("SELL"));
        assert_eq!(exit.f64_field("quantity"), Some(38_000.0));

        ack(&bus, &exit, "E2");
        fill(&bus, &exit, "E2", 1.05);

        let close_event = recv(&mut closed).await;
        assert_eq!(close_event.str_field("side"), Some("LONG"));
        assert_eq!(close_event.f64_field("exit_price"), Some(1.05));
        // (1.05 - 1.0) * 38000 - (1.0 + 1.05) * 38000 * 0.0004
        let pnl = close_event.f64_field("pnl").unwrap();
        assert!((pnl - 1868.84).abs() < 1e-6, "pnl was {}", pnl);

        assert_eq!(executor.position_state("u1", "XRPUSDC"), PositionState::None);
        assert!((executor.total_profit("u1", "XRPUSDC") - 1868.84).abs() < 1e-6);

        // One winning round trip in the books
        let stats = executor.profit_stats("u1", "XRPUSDC");
        assert_eq!(stats.profit_count, 1);
        assert_eq!(stats.loss_count, 0);
        assert!((stats.win_rate - 1.0).abs() < 1e-9);
        assert!((stats.total_profit - 1868.84).abs() < 1e-6);

        // Unknown tasks read as an empty book
        let empty = executor.profit_stats("u1", "BTCUSDT");
        assert_eq!(empty.profit_count, 0);
        assert_eq!(empty.total_profit, 0.0);
    }

    #[tokio::test]
    async fn open_without_balance_is_rejected() {
        let bus = EventBus::new();
        let executor = TradeExecutor::new(bus.clone(), None);
        executor.start();
        bus.publish(Event::with_source(
            topics::st::STRATEGY_LOADED,
            json!({
                "user_id": "u1", "strategy": "test_st", "timeframe": "15m",
                "leverage": 4, "margin_type": "USDC", "pair_count": 1,
            }),
            "st",
        ));
        settle().await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);

        bus.publish(open_signal("BUY", 1.0, None));
        assert!(timeout(Duration::from_millis(150), orders.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn below_min_notional_never_reaches_the_exchange() {
        let bus = EventBus::new();
        // 1.0 available * 0.95 * 4x = 3.8 notional at price 1.0, under the 5.0 floor
        let _executor = executor_with_balance(&bus, None, 1.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);

        bus.publish(open_signal("BUY", 1.0, None));
        assert!(timeout(Duration::from_millis(150), orders.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn normal_grid_posts_full_ladder_and_opens_on_first_fill() {
        let bus = EventBus::new();
        let executor =
            executor_with_balance(&bus, Some(grid_config_normal()), 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);
        let mut opened = probe(&bus, topics::tr::POSITION_OPENED);

        bus.publish(open_signal("BUY", 1.0, Some(grid_config_normal())));

        // 11 ladder prices minus the entry level = 10 POST_ONLY orders
        let mut ladder = Vec::new();
        for _ in 0..10 {
            let order = recv(&mut orders).await;
            assert_eq!(order.str_field("order_type"), Some("POST_ONLY"));
            // 38000 split across 10 levels
            assert_eq!(order.f64_field("quantity"), Some(3_800.0));
            ladder.push(order);
        }
        let buys = ladder
            .iter()
            .filter(|o| o.str_field("side") == Some("BUY"))
            .count();
        assert_eq!(buys, 5);

        // Nothing is open until a grid order actually fills
        assert_eq!(executor.position_state("u1", "XRPUSDC"), PositionState::None);

        let low_buy = ladder
            .iter()
            .find(|o| o.str_field("side") == Some("BUY") && o.f64_field("price") == Some(0.95))
            .expect("ladder should include the 0.95 buy");
        ack(&bus, low_buy, "G1");
        fill(&bus, low_buy, "G1", 0.95);

        let open_event = recv(&mut opened).await;
        assert_eq!(open_event.str_field("side"), Some("LONG"));
        assert_eq!(open_event.f64_field("entry_price"), Some(0.95));
        assert_eq!(open_event.str_field("mode"), Some("NORMAL_GRID"));
    }

    #[tokio::test]
    async fn grid_pair_round_trip_books_profit_and_rearms() {
        let bus = EventBus::new();
        let executor =
            executor_with_balance(&bus, Some(grid_config_normal()), 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);

        bus.publish(open_signal("BUY", 1.0, Some(grid_config_normal())));
        let mut ladder = Vec::new();
        for _ in 0..10 {
            ladder.push(recv(&mut orders).await);
        }
        let low_buy = ladder
            .iter()
            .find(|o| o.str_field("side") == Some("BUY") && o.f64_field("price") == Some(0.95))
            .unwrap()
            .clone();
        ack(&bus, &low_buy, "G1");
        fill(&bus, &low_buy, "G1", 0.95);

        // The buy fill pairs with a sell one interval above
        let counter = recv(&mut orders).await;
        assert_eq!(counter.str_field("side"), Some("SELL"));
        assert_eq!(counter.f64_field("price"), Some(0.96));
        assert_eq!(counter.f64_field("quantity"), Some(3_800.0));

        ack(&bus, &counter, "G2");
        fill(&bus, &counter, "G2", 0.96);

        // Completion re-arms the original buy level
        let rearm = recv(&mut orders).await;
        assert_eq!(rearm.str_field("side"), Some("BUY"));
        assert_eq!(rearm.f64_field("price"), Some(0.95));

        // (0.96 - 0.95) * 3800 - (0.95 + 0.96) * 3800 * 0.0004
        settle().await;
        let profit = executor.total_profit("u1", "XRPUSDC");
        assert!((profit - 35.0968).abs() < 1e-4, "profit was {}", profit);

        // The completed pair is the task's one realised win so far
        let stats = executor.profit_stats("u1", "XRPUSDC");
        assert_eq!(stats.profit_count, 1);
        assert_eq!(stats.loss_count, 0);
    }

    #[tokio::test]
    async fn abnormal_grid_enters_with_ratio_then_deploys_ladder() {
        let bus = EventBus::new();
        let grid = json!({
            "enabled": true,
            "grid_type": "abnormal",
            "ratio": 0.5,
            "grid_levels": 10,
            "upper_price": 1.05,
            "lower_price": 0.95,
        });
        let _executor = executor_with_balance(&bus, Some(grid.clone()), 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);
        let mut opened = probe(&bus, topics::tr::POSITION_OPENED);

        bus.publish(open_signal("BUY", 1.0, Some(grid)));

        // Entry uses half the capital: 9500 * 0.5 * 4 / 1.0 = 19000
        let entry = recv(&mut orders).await;
        assert_eq!(entry.str_field("order_type"), Some("MARKET"));
        assert_eq!(entry.f64_field("quantity"), Some(19_000.0));

        ack(&bus, &entry, "E1");
        fill(&bus, &entry, "E1", 1.0);
        let open_event = recv(&mut opened).await;
        assert_eq!(open_event.str_field("mode"), Some("ABNORMAL_GRID"));

        // The grid arrives separately (normally from the strategy engine)
        bus.publish(Event::with_source(
            topics::st::GRID_CREATE,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "entry_price": 1.0,
                "side": "LONG",
                "upper_price": 1.05,
                "lower_price": 0.95,
                "grid_levels": 10,
                "grid_ratio": 0.5,
                "move_up": false,
                "move_down": false,
            }),
            "st",
        ));

        // Remaining half of the capital, one-sided sell ladder, 10 levels
        for _ in 0..10 {
            let order = recv(&mut orders).await;
            assert_eq!(order.str_field("order_type"), Some("POST_ONLY"));
            assert_eq!(order.str_field("side"), Some("SELL"));
            assert_eq!(order.f64_field("quantity"), Some(1_900.0));
        }
    }

    #[tokio::test]
    async fn close_waits_for_grid_cancellations() {
        let bus = EventBus::new();
        let executor =
            executor_with_balance(&bus, Some(grid_config_normal()), 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);
        let mut cancels = probe(&bus, topics::trading::ORDER_CANCEL);
        let mut closed = probe(&bus, topics::tr::POSITION_CLOSED);

        bus.publish(open_signal("BUY", 1.0, Some(grid_config_normal())));
        let mut ladder = Vec::new();
        for i in 0..10 {
            let order = recv(&mut orders).await;
            ack(&bus, &order, &format!("G{}", i));
            ladder.push(order);
        }
        settle().await;

        // First fill opens the position and spawns the counter order
        let low_buy = ladder
            .iter()
            .find(|o| o.str_field("side") == Some("BUY") && o.f64_field("price") == Some(0.95))
            .unwrap()
            .clone();
        fill(&bus, &low_buy, "G0", 0.95);
        let counter = recv(&mut orders).await;
        ack(&bus, &counter, "G10");
        settle().await;

        // CLOSE: market sell for the position, fills immediately
        bus.publish(close_signal("SELL"));
        let exit = recv(&mut orders).await;
        assert_eq!(exit.str_field("order_type"), Some("MARKET"));
        fill(&bus, &exit, "E9", 1.02);

        // All surviving grid orders must be cancelled first: 9 ladder + 1 counter
        let mut cancel_ids = Vec::new();
        for _ in 0..10 {
            let cancel = recv(&mut cancels).await;
            cancel_ids.push(cancel.str_field("order_id").unwrap().to_string());
        }

        // The close is not announced until the last cancellation confirms
        assert!(timeout(Duration::from_millis(150), closed.recv())
            .await
            .is_err());

        for (i, order_id) in cancel_ids.iter().enumerate() {
            bus.publish(Event::with_source(
                topics::de::ORDER_CANCELLED,
                json!({
                    "user_id": "u1",
                    "symbol": "XRPUSDC",
                    "order_id": order_id,
                    "status": "CANCELED",
                }),
                "DE",
            ));
            if i + 1 < cancel_ids.len() {
                assert!(timeout(Duration::from_millis(50), closed.recv())
                    .await
                    .is_err());
            }
        }

        let close_event = recv(&mut closed).await;
        assert_eq!(close_event.str_field("side"), Some("LONG"));
        assert_eq!(executor.position_state("u1", "XRPUSDC"), PositionState::None);
    }

    #[tokio::test]
    async fn band_breach_moves_the_grid() {
        let bus = EventBus::new();
        let grid = json!({
            "enabled": true,
            "grid_type": "normal",
            "ratio": 1.0,
            "grid_levels": 10,
            "upper_price": 1.05,
            "lower_price": 0.95,
            "move_up": true,
        });
        let _executor = executor_with_balance(&bus, Some(grid.clone()), 10_000.0).await;
        let mut orders = probe(&bus, topics::trading::ORDER_CREATE);
        let mut moved = probe(&bus, topics::tr::GRID_MOVED);

        bus.publish(open_signal("BUY", 1.0, Some(grid)));
        for i in 0..10 {
            let order = recv(&mut orders).await;
            ack(&bus, &order, &format!("G{}", i));
        }
        settle().await;

        // A close above the band shifts it one interval up
        bus.publish(Event::with_source(
            topics::de::KLINE_UPDATE,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "interval": "15m",
                "klines": [{"open": 1.05, "high": 1.07, "low": 1.04, "close": 1.06,
                             "volume": 1000.0, "timestamp": 1, "is_closed": true}],
            }),
            "DE",
        ));

        let move_event = recv(&mut moved).await;
        assert_eq!(move_event.str_field("direction"), Some("UP"));
        assert!((move_event.f64_field("new_upper_price").unwrap() - 1.06).abs() < 1e-9);
        assert!((move_event.f64_field("new_lower_price").unwrap() - 0.96).abs() < 1e-9);

        // The ladder is reposted inside the new band
        let reposted = recv(&mut orders).await;
        assert_eq!(reposted.str_field("order_type"), Some("POST_ONLY"));
        let price = reposted.f64_field("price").unwrap();
        assert!((0.96..=1.06).contains(&price));
    }
}
