//! Unit tests for the IndicatorEngine: subscription, bootstrap, readiness
//! and tick aggregation.

#[cfg(test)]
mod indicator_engine_tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::bus::EventBus;
    use crate::events::{topics, Event};
    use crate::exchange::types::Kline;
    use crate::indicators::IndicatorFactory;
    use crate::services::indicator_engine::IndicatorEngine;

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

    fn window(len: usize) -> Vec<Kline> {
        (0..len)
            .map(|i| Kline {
                open: 1.0,
                high: 1.1,
                low: 0.9,
                close: 1.0 + i as f64 * 0.001,
                volume: 1000.0,
                timestamp: 1_700_000_000_000 + i as i64 * 900_000,
                is_closed: true,
            })
            .collect()
    }

    fn subscribe_event(indicator: &str, params: serde_json::Value) -> Event {
        Event::with_source(
            topics::st::INDICATOR_SUBSCRIBE,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "indicator_name": indicator,
                "indicator_params": params,
                "timeframe": "15m",
            }),
            "st",
        )
    }

    fn klines_event(subject: &str, klines: &[Kline]) -> Event {
        Event::with_source(
            subject,
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "interval": "15m",
                "klines": klines,
            }),
            "DE",
        )
    }

    fn engine_with_builtins(bus: &EventBus) -> IndicatorEngine {
        let engine = IndicatorEngine::new(bus.clone(), IndicatorFactory::with_builtins());
        engine.start();
        engine
    }

    #[tokio::test]
    async fn subscribe_creates_instance_and_requests_history() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        let mut created = probe(&bus, topics::ta::INDICATOR_CREATED);
        let mut history = probe(&bus, topics::de::GET_HISTORICAL_KLINES);

        bus.publish(subscribe_event("ma_stop_ta", json!({"period": 20})));

        let event = recv(&mut created).await;
        assert_eq!(
            event.str_field("indicator_id"),
            Some("u1_XRPUSDC_15m_ma_stop_ta")
        );

        let request = recv(&mut history).await;
        assert_eq!(request.str_field("symbol"), Some("XRPUSDC"));
        assert_eq!(request.str_field("interval"), Some("15m"));
        // MA(20) needs its warmup window
        assert_eq!(request.u64_field("limit"), Some(50));

        assert_eq!(engine.instance_count(), 1);
        assert_eq!(engine.is_ready("u1_XRPUSDC_15m_ma_stop_ta"), Some(false));
    }

    #[tokio::test]
    async fn unknown_indicator_reports_create_failed() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        let mut failed = probe(&bus, topics::ta::INDICATOR_CREATE_FAILED);

        bus.publish(subscribe_event("mystery_ta", json!({})));

        let event = recv(&mut failed).await;
        assert_eq!(event.str_field("indicator_name"), Some("mystery_ta"));
        assert!(event.str_field("error").unwrap().contains("mystery_ta"));
        assert_eq!(engine.instance_count(), 0);
    }

    #[tokio::test]
    async fn history_marks_instances_ready() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        bus.publish(subscribe_event("ma_stop_ta", json!({"period": 20})));

        // Wait until the instance exists, then feed history
        timeout(Duration::from_secs(1), async {
            while engine.instance_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        bus.publish(klines_event(
            topics::de::HISTORICAL_KLINES_SUCCESS,
            &window(200),
        ));

        timeout(Duration::from_secs(1), async {
            while engine.is_ready("u1_XRPUSDC_15m_ma_stop_ta") != Some(true) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("instance should become ready");
    }

    #[tokio::test]
    async fn tick_with_two_indicators_emits_one_completed_event() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        let mut completed = probe(&bus, topics::ta::CALCULATION_COMPLETED);

        bus.publish(subscribe_event("ma_stop_ta", json!({"period": 20})));
        bus.publish(subscribe_event("rsi_ta", json!({"period": 14})));
        timeout(Duration::from_secs(1), async {
            while engine.instance_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Initialize both, then deliver one closed-K-line tick
        bus.publish(klines_event(
            topics::de::HISTORICAL_KLINES_SUCCESS,
            &window(200),
        ));
        timeout(Duration::from_secs(1), async {
            while engine.is_ready("u1_XRPUSDC_15m_rsi_ta") != Some(true)
                || engine.is_ready("u1_XRPUSDC_15m_ma_stop_ta") != Some(true)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        bus.publish(klines_event(topics::de::KLINE_UPDATE, &window(200)));

        let event = recv(&mut completed).await;
        assert_eq!(event.str_field("user_id"), Some("u1"));
        assert_eq!(event.str_field("symbol"), Some("XRPUSDC"));
        let indicators = event.data["indicators"].as_object().unwrap();
        assert_eq!(indicators.len(), 2);
        assert!(indicators.contains_key("ma_stop_ta"));
        assert!(indicators.contains_key("rsi_ta"));
        for result in indicators.values() {
            assert!(result.get("signal").is_some());
            assert!(result.get("data").is_some());
        }

        // Exactly one completion per tick
        assert!(
            timeout(Duration::from_millis(150), completed.recv())
                .await
                .is_err(),
            "second completion for a single tick"
        );
    }

    #[tokio::test]
    async fn unready_instances_are_skipped() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        let mut completed = probe(&bus, topics::ta::CALCULATION_COMPLETED);

        bus.publish(subscribe_event("ma_stop_ta", json!({"period": 20})));
        timeout(Duration::from_secs(1), async {
            while engine.instance_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // No history yet: the tick must produce nothing
        bus.publish(klines_event(topics::de::KLINE_UPDATE, &window(200)));
        assert!(
            timeout(Duration::from_millis(150), completed.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn ticks_for_other_symbols_do_not_mix() {
        let bus = EventBus::new();
        let engine = engine_with_builtins(&bus);
        let mut completed = probe(&bus, topics::ta::CALCULATION_COMPLETED);

        bus.publish(subscribe_event("ma_stop_ta", json!({"period": 20})));
        timeout(Duration::from_secs(1), async {
            while engine.instance_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        bus.publish(klines_event(
            topics::de::HISTORICAL_KLINES_SUCCESS,
            &window(200),
        ));
        timeout(Duration::from_secs(1), async {
            while engine.is_ready("u1_XRPUSDC_15m_ma_stop_ta") != Some(true) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A different symbol's tick matches no instance
        bus.publish(Event::with_source(
            topics::de::KLINE_UPDATE,
            json!({
                "user_id": "u1",
                "symbol": "BTCUSDT",
                "interval": "15m",
                "klines": window(200),
            }),
            "DE",
        ));
        assert!(
            timeout(Duration::from_millis(150), completed.recv())
                .await
                .is_err()
        );
    }
}
