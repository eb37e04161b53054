//! Unit tests for the Event type and topic constants.

#[cfg(test)]
mod events_tests {
    use serde_json::json;

    use crate::events::{topics, Event};

    #[test]
    fn new_event_populates_id_and_timestamp() {
        let before = chrono::Utc::now();
        let event = Event::new("order.created", json!({"order_id": "12345"}));
        let after = chrono::Utc::now();

        assert_eq!(event.subject, "order.created");
        assert!(event.timestamp >= before && event.timestamp <= after);
        assert!(event.source.is_none());
        assert!(event.is_valid());
    }

    #[test]
    fn event_ids_are_unique() {
        let a = Event::new("t", json!({}));
        let b = Event::new("t", json!({}));
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn with_source_tags_the_originator() {
        let event = Event::with_source("pm.account.loaded", json!({"user_id": "u1"}), "PM");
        assert_eq!(event.source.as_deref(), Some("PM"));
    }

    #[test]
    fn non_object_payload_normalizes_to_empty_object() {
        let event = Event::new("weird.payload", json!([1, 2, 3]));
        assert!(event.data.is_object());
        assert!(event.data.as_object().unwrap().is_empty());
    }

    #[test]
    fn blank_subject_is_invalid() {
        assert!(!Event::new("", json!({})).is_valid());
        assert!(!Event::new("   ", json!({})).is_valid());
    }

    #[test]
    fn serde_round_trip_preserves_all_fields() {
        let event = Event::with_source(
            "de.kline.update",
            json!({
                "user_id": "u1",
                "symbol": "XRPUSDC",
                "klines": [{"close": 1.05, "is_closed": true}],
            }),
            "DE",
        );

        let text = serde_json::to_string(&event).unwrap();
        let restored: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn field_accessors_accept_strings_and_numbers() {
        let event = Event::new(
            "mixed.payload",
            json!({
                "name": "alpha",
                "price_str": "1.2345",
                "price_num": 1.2345,
                "count": 42,
                "flag": true,
            }),
        );

        assert_eq!(event.str_field("name"), Some("alpha"));
        assert_eq!(event.f64_field("price_str"), Some(1.2345));
        assert_eq!(event.f64_field("price_num"), Some(1.2345));
        assert_eq!(event.u64_field("count"), Some(42));
        assert_eq!(event.bool_field("flag"), Some(true));
        assert_eq!(event.str_field("missing"), None);
        assert_eq!(event.f64_field("name"), None);
    }

    #[test]
    fn topic_constants_follow_module_naming() {
        assert_eq!(topics::pm::ACCOUNT_LOADED, "pm.account.loaded");
        assert_eq!(topics::pm::MANAGER_READY, "pm.manager.ready");
        assert_eq!(topics::de::KLINE_UPDATE, "de.kline.update");
        assert_eq!(topics::de::HISTORICAL_KLINES_SUCCESS, "de.historical_klines.success");
        assert_eq!(topics::trading::ORDER_CREATE, "trading.order.create");
        assert_eq!(topics::trading::GET_ACCOUNT_BALANCE, "trading.get_account_balance");
        assert_eq!(topics::ta::CALCULATION_COMPLETED, "ta.calculation.completed");
        assert_eq!(topics::st::SIGNAL_GENERATED, "st.signal.generated");
        assert_eq!(topics::st::GRID_CREATE, "st.grid.create");
        assert_eq!(topics::tr::POSITION_OPENED, "tr.position.opened");
        assert_eq!(topics::tr::POSITION_CLOSED, "tr.position.closed");
    }
}
