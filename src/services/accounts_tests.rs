//! Unit tests for the AccountRegistry.

#[cfg(test)]
mod accounts_tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::bus::EventBus;
    use crate::config::AccountsConfig;
    use crate::events::{topics, Event};
    use crate::services::accounts::AccountRegistry;

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

    fn mixed_config() -> AccountsConfig {
        serde_json::from_value(json!({
            "users": {
                "user_001": {
                    "name": "Alice",
                    "api_key": "k1",
                    "api_secret": "s1",
                    "strategy": "ma_stop_st",
                },
                "user_002": {
                    "name": "Bob",
                    "api_key": "",
                    "api_secret": "s2",
                    "strategy": "ma_stop_st",
                },
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn valid_account_publishes_loaded_with_credentials() {
        let bus = EventBus::new();
        let registry = AccountRegistry::new(bus.clone());
        let mut rx = probe(&bus, topics::pm::ACCOUNT_LOADED);

        let loaded = registry.load_accounts(&mixed_config());
        assert_eq!(loaded, 1);

        let event = recv(&mut rx).await;
        assert_eq!(event.str_field("user_id"), Some("user_001"));
        assert_eq!(event.str_field("api_key"), Some("k1"));
        assert_eq!(event.str_field("api_secret"), Some("s1"));
        assert_eq!(event.str_field("strategy"), Some("ma_stop_st"));
        assert_eq!(event.bool_field("testnet"), Some(false));
    }

    #[tokio::test]
    async fn invalid_account_publishes_load_failed_and_is_recorded() {
        let bus = EventBus::new();
        let registry = AccountRegistry::new(bus.clone());
        let mut rx = probe(&bus, topics::pm::LOAD_FAILED);

        registry.load_accounts(&mixed_config());

        let event = recv(&mut rx).await;
        assert_eq!(event.str_field("user_id"), Some("user_002"));
        assert!(event.str_field("error").unwrap().contains("api_key"));

        let failed = registry.failed_accounts();
        assert_eq!(failed.len(), 1);
        assert!(failed.contains_key("user_002"));
        assert!(registry.get("user_002").is_none());
    }

    #[tokio::test]
    async fn manager_ready_carries_counts_and_ids() {
        let bus = EventBus::new();
        let registry = AccountRegistry::new(bus.clone());
        let mut rx = probe(&bus, topics::pm::MANAGER_READY);

        registry.load_accounts(&mixed_config());

        let event = recv(&mut rx).await;
        assert_eq!(event.u64_field("loaded_count"), Some(1));
        assert_eq!(event.u64_field("failed_count"), Some(1));
        let ids = event.data["user_ids"].as_array().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], "user_001");
    }

    #[tokio::test]
    async fn enable_disable_round_trip() {
        let bus = EventBus::new();
        let registry = AccountRegistry::new(bus.clone());
        registry.load_accounts(&mixed_config());
        let mut rx = probe(&bus, "pm.account.*abled");

        assert!(registry.disable("user_001"));
        assert!(!registry.get("user_001").unwrap().is_enabled);
        let event = recv(&mut rx).await;
        assert_eq!(event.subject, topics::pm::ACCOUNT_DISABLED);
        assert_eq!(event.bool_field("enabled"), Some(false));

        assert!(registry.enable("user_001"));
        assert!(registry.get("user_001").unwrap().is_enabled);
        let event = recv(&mut rx).await;
        assert_eq!(event.subject, topics::pm::ACCOUNT_ENABLED);
        assert_eq!(event.bool_field("enabled"), Some(true));

        // Unknown users are absence, not errors
        assert!(!registry.disable("ghost"));
    }

    #[tokio::test]
    async fn shutdown_disables_everything_and_announces() {
        let bus = EventBus::new();
        let registry = AccountRegistry::new(bus.clone());
        registry.load_accounts(&mixed_config());
        let mut rx = probe(&bus, topics::pm::MANAGER_SHUTDOWN);

        registry.shutdown();

        let event = recv(&mut rx).await;
        assert_eq!(event.u64_field("account_count"), Some(1));
        assert_eq!(registry.count(), 0);
    }
}
