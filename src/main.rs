mod bus;
mod config;
mod constants;
mod data;
mod error;
mod events;
mod exchange;
mod indicators;
mod services;

use std::sync::Arc;

use tracing::{error, info};

use bus::EventBus;
use data::journal::EventJournal;
use data::trade_store::TradeStore;
use indicators::IndicatorFactory;
use services::accounts::AccountRegistry;
use services::data_engine::DataEngine;
use services::executor::TradeExecutor;
use services::indicator_engine::IndicatorEngine;
use services::strategy::StrategyEngine;

const ACCOUNT_CONFIG_PATH: &str = "config/pm_config.json";
const STRATEGY_CONFIG_DIR: &str = "config/strategies";
const EVENTS_DB_PATH: &str = "data/events.db";
const TRADING_DB_PATH: &str = "data/trading.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Setup Logging
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting perpgrid...");

    // Persistence: event journal + trading records
    let journal = match EventJournal::open(EVENTS_DB_PATH) {
        Ok(journal) => Some(Arc::new(journal)),
        Err(e) => {
            error!("Event journal unavailable, continuing without audit log: {}", e);
            None
        }
    };
    let trade_store = match TradeStore::open(TRADING_DB_PATH) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            error!("Trade store unavailable, continuing without records: {}", e);
            None
        }
    };

    // Event bus with journaling
    let bus = EventBus::with_journal(journal);

    // Indicator registry must be complete before any subscription arrives
    let factory = IndicatorFactory::with_builtins();
    info!("Registered indicators: {:?}", factory.registered_names());

    // Managers, leaves first; each start() wires its bus subscriptions
    let registry = AccountRegistry::new(bus.clone());
    let data_engine = DataEngine::new(bus.clone());
    let indicator_engine = IndicatorEngine::new(bus.clone(), factory);
    let strategy_engine = StrategyEngine::new(bus.clone(), STRATEGY_CONFIG_DIR);
    let executor = TradeExecutor::new(bus.clone(), trade_store);

    data_engine.start();
    indicator_engine.start();
    strategy_engine.start();
    executor.start();

    // Account load kicks the whole pipeline off
    let loaded = registry.load_accounts_from_file(ACCOUNT_CONFIG_PATH)?;
    if loaded == 0 {
        error!("No account loaded, nothing to trade");
    } else {
        info!("🚀 {} account(s) live, waiting for market data...", loaded);
    }

    // Park until Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down...");

    // Ordered shutdown: stop producing, close connections, drain the bus
    registry.shutdown();
    executor.shutdown();
    data_engine.shutdown().await;
    bus.shutdown(constants::bus::SHUTDOWN_GRACE).await;

    info!("Shutdown complete");
    Ok(())
}
