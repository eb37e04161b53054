//! AccountRegistry: validates account configs and owns per-account identity
//! and enable/disable state. One `Account` per configured user; API
//! credentials stay in memory and are never logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::{AccountsConfig, ValidatedAccount};
use crate::error::TradingError;
use crate::events::{topics, Event};

/// A single trading account. Lifetime = process lifetime unless disabled.
#[derive(Clone, Debug)]
pub struct Account {
    pub user_id: String,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub strategy: String,
    pub testnet: bool,
    pub is_enabled: bool,
}

impl Account {
    fn from_validated(user_id: &str, validated: ValidatedAccount) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: validated.name,
            api_key: validated.api_key,
            api_secret: validated.api_secret,
            strategy: validated.strategy,
            testnet: validated.testnet,
            is_enabled: true,
        }
    }
}

#[derive(Clone)]
pub struct AccountRegistry {
    bus: EventBus,
    accounts: Arc<Mutex<HashMap<String, Account>>>,
    failed: Arc<Mutex<HashMap<String, String>>>,
}

impl AccountRegistry {
    pub fn new(bus: EventBus) -> Self {
        info!("[PM] AccountRegistry initialised");
        Self {
            bus,
            accounts: Arc::new(Mutex::new(HashMap::new())),
            failed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load every user entry from a parsed config. Invalid entries are
    /// skipped, recorded with their reason and reported via `pm.load.failed`;
    /// each valid entry publishes `pm.account.loaded`. Finishes with
    /// `pm.manager.ready`. Returns the number of accounts loaded.
    pub fn load_accounts(&self, config: &AccountsConfig) -> usize {
        info!("[PM] Loading {} account(s)", config.users.len());
        let mut loaded = 0usize;

        for (user_id, entry) in &config.users {
            match entry.validate() {
                Ok(validated) => {
                    let account = Account::from_validated(user_id, validated);
                    info!(
                        "[PM] 📦 Account loaded: user_id={} name={} strategy={} testnet={}",
                        user_id, account.name, account.strategy, account.testnet
                    );
                    self.publish_account_loaded(&account);
                    self.accounts
                        .lock()
                        .unwrap()
                        .insert(user_id.clone(), account);
                    loaded += 1;
                }
                Err(reason) => {
                    warn!(
                        "[PM] ⚠ Account config invalid: user_id={} reason={}",
                        user_id, reason
                    );
                    self.failed
                        .lock()
                        .unwrap()
                        .insert(user_id.clone(), reason.clone());
                    self.bus.publish(Event::with_source(
                        topics::pm::LOAD_FAILED,
                        json!({"user_id": user_id, "error": reason}),
                        "PM",
                    ));
                }
            }
        }

        let failed_count = self.failed.lock().unwrap().len();
        let user_ids = self.user_ids();
        self.bus.publish(Event::with_source(
            topics::pm::MANAGER_READY,
            json!({
                "loaded_count": loaded,
                "failed_count": failed_count,
                "user_ids": user_ids,
            }),
            "PM",
        ));
        info!(
            "[PM] Account load complete: loaded={} failed={}",
            loaded, failed_count
        );
        loaded
    }

    /// Load from the configuration file at `path`.
    pub fn load_accounts_from_file(&self, path: &str) -> Result<usize, TradingError> {
        let config = AccountsConfig::load(path).map_err(|e| {
            error!("[PM] ❌ Account config load failed: {}", e);
            e
        })?;
        Ok(self.load_accounts(&config))
    }

    fn publish_account_loaded(&self, account: &Account) {
        // Carries the credentials so DE can build the signed client.
        self.bus.publish(Event::with_source(
            topics::pm::ACCOUNT_LOADED,
            json!({
                "user_id": &account.user_id,
                "name": &account.name,
                "api_key": &account.api_key,
                "api_secret": &account.api_secret,
                "strategy": &account.strategy,
                "testnet": account.testnet,
            }),
            "PM",
        ));
    }

    pub fn get(&self, user_id: &str) -> Option<Account> {
        self.accounts.lock().unwrap().get(user_id).cloned()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.accounts.lock().unwrap().len()
    }

    pub fn failed_accounts(&self) -> HashMap<String, String> {
        self.failed.lock().unwrap().clone()
    }

    /// Re-enable an account. Publishes `pm.account.enabled`.
    pub fn enable(&self, user_id: &str) -> bool {
        let mut accounts = self.accounts.lock().unwrap();
        let Some(account) = accounts.get_mut(user_id) else {
            return false;
        };
        account.is_enabled = true;
        let name = account.name.clone();
        drop(accounts);

        self.bus.publish(Event::with_source(
            topics::pm::ACCOUNT_ENABLED,
            json!({"user_id": user_id, "name": name, "enabled": true}),
            "PM",
        ));
        info!("[PM] Account enabled: user_id={}", user_id);
        true
    }

    /// Disable an account. Publishes `pm.account.disabled`.
    pub fn disable(&self, user_id: &str) -> bool {
        self.disable_inner(user_id, true)
    }

    fn disable_inner(&self, user_id: &str, persist: bool) -> bool {
        let mut accounts = self.accounts.lock().unwrap();
        let Some(account) = accounts.get_mut(user_id) else {
            return false;
        };
        account.is_enabled = false;
        let name = account.name.clone();
        drop(accounts);

        let event = Event::with_source(
            topics::pm::ACCOUNT_DISABLED,
            json!({"user_id": user_id, "name": name, "enabled": false}),
            "PM",
        );
        if persist {
            self.bus.publish(event);
        } else {
            self.bus.publish_transient(event);
        }
        info!("[PM] Account disabled: user_id={}", user_id);
        true
    }

    /// Disable everything and announce the shutdown. Shutdown events skip
    /// the journal — the store may already be closing.
    pub fn shutdown(&self) {
        let user_ids = self.user_ids();
        info!("[PM] Shutting down, disabling {} account(s)", user_ids.len());
        for user_id in &user_ids {
            self.disable_inner(user_id, false);
        }
        self.bus.publish_transient(Event::with_source(
            topics::pm::MANAGER_SHUTDOWN,
            json!({"account_count": user_ids.len()}),
            "PM",
        ));
        self.accounts.lock().unwrap().clear();
        info!("[PM] AccountRegistry shut down");
    }
}
