//! Unit tests for account and strategy configuration validation.

#[cfg(test)]
mod config_tests {
    use serde_json::json;

    use crate::config::{AccountConfig, AccountsConfig, GridType, StrategyConfig};

    fn account_from(value: serde_json::Value) -> AccountConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_account_passes() {
        let account = account_from(json!({
            "name": "Main account",
            "api_key": "key",
            "api_secret": "secret",
            "strategy": "ma_stop_st",
        }));

        let validated = account.validate().unwrap();
        assert_eq!(validated.name, "Main account");
        assert_eq!(validated.strategy, "ma_stop_st");
        assert!(!validated.testnet);
    }

    #[test]
    fn testnet_flag_is_respected() {
        let account = account_from(json!({
            "name": "n", "api_key": "k", "api_secret": "s",
            "strategy": "st", "testnet": true,
        }));
        assert!(account.validate().unwrap().testnet);
    }

    #[test]
    fn missing_required_field_is_named_in_reason() {
        let account = account_from(json!({
            "name": "n", "api_key": "k", "strategy": "st",
        }));
        let reason = account.validate().unwrap_err();
        assert!(reason.contains("api_secret"), "reason was: {}", reason);
    }

    #[test]
    fn empty_string_field_rejected() {
        let account = account_from(json!({
            "name": "  ", "api_key": "k", "api_secret": "s", "strategy": "st",
        }));
        let reason = account.validate().unwrap_err();
        assert!(reason.contains("name"));
        assert!(reason.contains("empty"));
    }

    #[test]
    fn non_string_field_rejected() {
        let account = account_from(json!({
            "name": "n", "api_key": 42, "api_secret": "s", "strategy": "st",
        }));
        let reason = account.validate().unwrap_err();
        assert!(reason.contains("api_key"));
        assert!(reason.contains("string"));
    }

    #[test]
    fn non_boolean_testnet_rejected() {
        let account = account_from(json!({
            "name": "n", "api_key": "k", "api_secret": "s",
            "strategy": "st", "testnet": "yes",
        }));
        let reason = account.validate().unwrap_err();
        assert!(reason.contains("testnet"));
    }

    #[test]
    fn accounts_file_shape_parses() {
        let config: AccountsConfig = serde_json::from_value(json!({
            "users": {
                "user_001": {
                    "name": "Alice",
                    "api_key": "k1",
                    "api_secret": "s1",
                    "strategy": "ma_stop_st",
                },
                "user_002": {
                    "name": "Bob",
                    "api_key": "k2",
                    "api_secret": "s2",
                    "strategy": "ma_stop_st",
                    "testnet": true,
                },
            }
        }))
        .unwrap();

        assert_eq!(config.users.len(), 2);
        assert!(config.users["user_001"].validate().is_ok());
        assert!(config.users["user_002"].validate().unwrap().testnet);
    }

    // ---------- strategy configs ----------

    fn strategy_from(value: serde_json::Value) -> Result<StrategyConfig, String> {
        let config: StrategyConfig =
            serde_json::from_value(value).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn base_strategy() -> serde_json::Value {
        json!({
            "timeframe": "15m",
            "leverage": 4,
            "position_side": "BOTH",
            "margin_mode": "cross",
            "margin_type": "USDC",
            "trading_pairs": [
                {"symbol": "XRPUSDC", "indicator_params": {"ma_stop_ta": {"period": 20}}}
            ],
        })
    }

    #[test]
    fn minimal_strategy_passes() {
        let config = strategy_from(base_strategy()).unwrap();
        assert_eq!(config.timeframe, "15m");
        assert_eq!(config.leverage, 4);
        assert!(!config.reverse);
        assert!(!config.grid_enabled());
    }

    #[test]
    fn empty_trading_pairs_rejected() {
        let mut value = base_strategy();
        value["trading_pairs"] = json!([]);
        let reason = strategy_from(value).unwrap_err();
        assert!(reason.contains("trading_pairs"));
    }

    #[test]
    fn grid_config_parses_with_type_and_ratio() {
        let mut value = base_strategy();
        value["grid_trading"] = json!({
            "enabled": true,
            "grid_type": "abnormal",
            "ratio": 0.5,
            "grid_levels": 10,
            "upper_price": 1.05,
            "lower_price": 0.95,
            "move_up": true,
        });
        let config = strategy_from(value).unwrap();
        let grid = config.grid_trading.unwrap();
        assert_eq!(grid.grid_type, GridType::Abnormal);
        assert_eq!(grid.ratio, 0.5);
        assert!(grid.move_up);
        assert!(!grid.move_down);
    }

    #[test]
    fn enabled_grid_without_band_prices_rejected() {
        let mut value = base_strategy();
        value["grid_trading"] = json!({
            "enabled": true,
            "grid_type": "normal",
            "ratio": 1.0,
            "grid_levels": 10,
        });
        let reason = strategy_from(value).unwrap_err();
        assert!(reason.contains("upper_price"), "reason was: {}", reason);
    }

    #[test]
    fn grid_ratio_bounds_enforced() {
        for ratio in [0.0, -0.5, 1.5] {
            let mut value = base_strategy();
            value["grid_trading"] = json!({
                "enabled": true,
                "ratio": ratio,
                "upper_price": 1.05,
                "lower_price": 0.95,
            });
            let reason = strategy_from(value).unwrap_err();
            assert!(reason.contains("ratio"), "ratio {} gave: {}", ratio, reason);
        }
    }

    #[test]
    fn inverted_band_rejected() {
        let mut value = base_strategy();
        value["grid_trading"] = json!({
            "enabled": true,
            "upper_price": 0.95,
            "lower_price": 1.05,
        });
        let reason = strategy_from(value).unwrap_err();
        assert!(reason.contains("upper_price"));
    }

    #[test]
    fn disabled_grid_skips_band_validation() {
        let mut value = base_strategy();
        value["grid_trading"] = json!({"enabled": false});
        assert!(strategy_from(value).is_ok());
    }

    #[test]
    fn zero_leverage_rejected() {
        let mut value = base_strategy();
        value["leverage"] = json!(0);
        let reason = strategy_from(value).unwrap_err();
        assert!(reason.contains("leverage"));
    }

    #[test]
    fn load_reads_user_scoped_file() {
        let dir = std::env::temp_dir().join(format!("perpgrid-cfg-{}", uuid::Uuid::new_v4()));
        let user_dir = dir.join("user_001");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(
            user_dir.join("ma_stop_st.json"),
            serde_json::to_string_pretty(&base_strategy()).unwrap(),
        )
        .unwrap();

        let config = StrategyConfig::load(&dir, "user_001", "ma_stop_st").unwrap();
        assert_eq!(config.trading_pairs[0].symbol, "XRPUSDC");

        let missing = StrategyConfig::load(&dir, "user_001", "nope");
        assert!(missing.unwrap_err().contains("not found"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
