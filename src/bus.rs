//! EventBus: the pub/sub core of the system.
//!
//! Supports exact-subject and glob-pattern subscriptions, concurrent
//! error-isolated dispatch, and synchronous journaling into the capped
//! events table. Handlers are async closures; a failing handler is logged
//! and never affects the other handlers or future publishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::data::journal::{EventJournal, JournalEntry};
use crate::error::TradingError;
use crate::events::{topics, Event};

pub type HandlerFuture = BoxFuture<'static, Result<(), TradingError>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Token returned by `subscribe`, used to remove the subscription at shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// A glob pattern compiled at subscribe time. Supports `*` (any sequence)
/// and `?` (any single character), fnmatch-style: `pm.*` matches
/// `pm.account.loaded` and every other `pm.`-prefixed subject.
#[derive(Clone, Debug)]
pub struct GlobPattern {
    tokens: Vec<GlobToken>,
}

#[derive(Clone, Debug, PartialEq)]
enum GlobToken {
    Literal(String),
    AnySequence,
    AnyChar,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' => {
                    if !literal.is_empty() {
                        tokens.push(GlobToken::Literal(std::mem::take(&mut literal)));
                    }
                    // collapse consecutive stars
                    if tokens.last() != Some(&GlobToken::AnySequence) {
                        tokens.push(GlobToken::AnySequence);
                    }
                }
                '?' => {
                    if !literal.is_empty() {
                        tokens.push(GlobToken::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(GlobToken::AnyChar);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            tokens.push(GlobToken::Literal(literal));
        }
        Self { tokens }
    }

    pub fn matches(&self, subject: &str) -> bool {
        Self::match_tokens(&self.tokens, subject)
    }

    fn match_tokens(tokens: &[GlobToken], text: &str) -> bool {
        match tokens.first() {
            None => text.is_empty(),
            Some(GlobToken::Literal(lit)) => text
                .strip_prefix(lit.as_str())
                .map(|rest| Self::match_tokens(&tokens[1..], rest))
                .unwrap_or(false),
            Some(GlobToken::AnyChar) => {
                let mut chars = text.chars();
                match chars.next() {
                    Some(_) => Self::match_tokens(&tokens[1..], chars.as_str()),
                    None => false,
                }
            }
            Some(GlobToken::AnySequence) => {
                if Self::match_tokens(&tokens[1..], text) {
                    return true;
                }
                let mut chars = text.chars();
                while chars.next().is_some() {
                    if Self::match_tokens(&tokens[1..], chars.as_str()) {
                        return true;
                    }
                }
                false
            }
        }
    }
}

struct Subscription {
    id: u64,
    name: String,
    handler: EventHandler,
}

/// Exact-subject table first, compiled glob patterns second.
#[derive(Default)]
struct SubscriptionTable {
    exact: HashMap<String, Vec<Subscription>>,
    globs: Vec<(GlobPattern, Subscription)>,
}

struct BusInner {
    table: RwLock<SubscriptionTable>,
    journal: Option<Arc<EventJournal>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Build a bus without persistence (used by most unit tests).
    pub fn new() -> Self {
        Self::with_journal(None)
    }

    /// Build a bus that journals every published event.
    pub fn with_journal(journal: Option<Arc<EventJournal>>) -> Self {
        info!("[BUS] Event bus initialised (journal={})", journal.is_some());
        Self {
            inner: Arc::new(BusInner {
                table: RwLock::new(SubscriptionTable::default()),
                journal,
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Register an async handler for an exact subject or a glob pattern.
    /// The handler name is used when logging failures.
    pub fn subscribe<F>(&self, pattern: &str, name: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(Event) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription {
            id,
            name: name.to_string(),
            handler: Arc::new(handler),
        };

        let mut table = self.inner.table.write().unwrap();
        if pattern.contains('*') || pattern.contains('?') {
            table.globs.push((GlobPattern::compile(pattern), sub));
        } else {
            table.exact.entry(pattern.to_string()).or_default().push(sub);
        }
        debug!("[BUS] Subscribed {} to {}", name, pattern);
        SubscriptionToken(id)
    }

    /// Remove a subscription by token. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut table = self.inner.table.write().unwrap();
        for subs in table.exact.values_mut() {
            subs.retain(|s| s.id != token.0);
        }
        table.exact.retain(|_, subs| !subs.is_empty());
        table.globs.retain(|(_, s)| s.id != token.0);
    }

    /// Publish an event: journal it, then dispatch every matching handler
    /// concurrently. Returns immediately; handlers run on spawned tasks.
    pub fn publish(&self, event: Event) {
        self.dispatch(event, true)
    }

    /// Publish without journaling (shutdown notifications, alert events).
    pub fn publish_transient(&self, event: Event) {
        self.dispatch(event, false)
    }

    fn dispatch(&self, event: Event, persist: bool) {
        if !self.inner.accepting.load(Ordering::Acquire) {
            debug!("[BUS] Dropping {} (bus is shut down)", event.subject);
            return;
        }
        if !event.is_valid() {
            warn!("[BUS] Dropping invalid event: subject={:?}", event.subject);
            return;
        }

        // 1. Journal synchronously, in publish order. A journal failure is
        //    logged and never propagated to the publisher.
        if persist {
            if let Some(journal) = &self.inner.journal {
                if let Err(e) = journal.insert_event(&event) {
                    error!("[BUS] Journal write failed for {}: {}", event.subject, e);
                }
            }
        }

        // 2. Match handlers: exact table first, then compiled globs.
        let matched: Vec<(String, EventHandler)> = {
            let table = self.inner.table.read().unwrap();
            let mut out = Vec::new();
            if let Some(subs) = table.exact.get(&event.subject) {
                for sub in subs {
                    out.push((sub.name.clone(), sub.handler.clone()));
                }
            }
            for (pattern, sub) in &table.globs {
                if pattern.matches(&event.subject) {
                    out.push((sub.name.clone(), sub.handler.clone()));
                }
            }
            out
        };

        if matched.is_empty() {
            debug!("[BUS] No subscribers for {}", event.subject);
            return;
        }

        // 3. Schedule every handler concurrently with error isolation.
        for (name, handler) in matched {
            let bus = self.clone();
            let event = event.clone();
            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                let subject = event.subject.clone();
                let event_id = event.event_id;
                if let Err(e) = handler(event).await {
                    error!(
                        "[BUS] Handler {} failed for {}: {}",
                        name, subject, e
                    );
                    bus.publish_alert(&subject, event_id, &name, &e);
                }
                if bus.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    bus.inner.drained.notify_waiters();
                }
            });
        }
    }

    fn publish_alert(
        &self,
        original_subject: &str,
        original_event_id: uuid::Uuid,
        handler_name: &str,
        error: &TradingError,
    ) {
        // Alert events are never journaled so a failing journal handler
        // cannot loop.
        let alert = Event::with_source(
            topics::system::HANDLER_ERROR,
            json!({
                "original_subject": original_subject,
                "original_event_id": original_event_id.to_string(),
                "handler_name": handler_name,
                "error": error.to_string(),
            }),
            "event_bus",
        );
        self.publish_transient(alert);
    }

    /// Most recent journal entries, newest first.
    pub fn query_recent(&self, limit: usize) -> Vec<JournalEntry> {
        match &self.inner.journal {
            Some(journal) => journal.query_recent(limit).unwrap_or_else(|e| {
                error!("[BUS] Journal query failed: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    /// Number of handlers currently running (used by tests and shutdown).
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Quiesce the bus: stop accepting events, then wait for in-flight
    /// handlers up to the grace period. Remaining handlers are abandoned
    /// with a warning.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::Release);
        info!("[BUS] Shutting down, waiting for in-flight handlers...");

        let wait = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(grace, wait).await {
            Ok(()) => info!("[BUS] All handlers finished"),
            Err(_) => warn!(
                "[BUS] ⚠ Abandoning {} in-flight handler(s) after {:?} grace",
                self.inner.in_flight.load(Ordering::Acquire),
                grace
            ),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
