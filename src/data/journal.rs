//! Append-only event journal backed by SQLite.
//!
//! Every published event is inserted synchronously; the table is trimmed to
//! the most recent `max_events` rows on each append. The journal is an audit
//! log, not a replay mechanism — in-memory state stays authoritative.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::bus::JOURNAL_MAX_EVENTS;
use crate::error::TradingError;
use crate::events::Event;

/// One journaled event row, as returned by queries (newest first).
#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub event_id: String,
    pub subject: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

pub struct EventJournal {
    conn: Mutex<Connection>,
    max_events: usize,
}

impl EventJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TradingError> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| TradingError::Config(format!("journal dir: {}", e)))?;
        }
        let conn = Connection::open(path.as_ref())?;
        let journal = Self {
            conn: Mutex::new(conn),
            max_events: JOURNAL_MAX_EVENTS,
        };
        journal.init_schema()?;
        info!("[JOURNAL] Event journal opened: {}", path.as_ref().display());
        Ok(journal)
    }

    /// In-memory journal for tests.
    pub fn in_memory() -> Result<Self, TradingError> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            max_events: JOURNAL_MAX_EVENTS,
        };
        journal.init_schema()?;
        Ok(journal)
    }

    #[cfg(test)]
    pub fn in_memory_capped(max_events: usize) -> Result<Self, TradingError> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            max_events,
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<(), TradingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject);
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
        )?;
        Ok(())
    }

    /// Insert one event and trim the oldest rows past the cap.
    pub fn insert_event(&self, event: &Event) -> Result<(), TradingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (event_id, subject, data, timestamp, source)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id.to_string(),
                event.subject,
                serde_json::to_string(&event.data)?,
                event.timestamp.to_rfc3339(),
                event.source,
            ],
        )?;

        let count: usize =
            conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        if count > self.max_events {
            let to_delete = count - self.max_events;
            conn.execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events ORDER BY id ASC LIMIT ?1
                )",
                params![to_delete],
            )?;
            debug!("[JOURNAL] Trimmed {} old event(s)", to_delete);
        }
        Ok(())
    }

    /// The most recent entries, newest first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<JournalEntry>, TradingError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, subject, data, timestamp, source
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Entries for an exact subject, newest first.
    pub fn query_by_subject(
        &self,
        subject: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, TradingError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, subject, data, timestamp, source
             FROM events WHERE subject = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![subject, limit], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count(&self) -> Result<usize, TradingError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let data_text: String = row.get(2)?;
    let timestamp_text: String = row.get(3)?;
    Ok(JournalEntry {
        event_id: row.get(0)?,
        subject: row.get(1)?,
        data: serde_json::from_str(&data_text).unwrap_or(Value::Null),
        timestamp: DateTime::parse_from_rfc3339(&timestamp_text)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        source: row.get(4)?,
    })
}

impl JournalEntry {
    /// Rebuild an `Event` from a journal row (audit tooling).
    pub fn to_event(&self) -> Option<Event> {
        Some(Event {
            subject: self.subject.clone(),
            data: self.data.clone(),
            event_id: Uuid::parse_str(&self.event_id).ok()?,
            timestamp: self.timestamp,
            source: self.source.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_query_recent() {
        let journal = EventJournal::in_memory().unwrap();
        for i in 0..5 {
            let event = Event::new("test.subject", json!({"seq": i}));
            journal.insert_event(&event).unwrap();
        }

        let recent = journal.query_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        // Newest first
        assert_eq!(recent[0].data["seq"], 4);
        assert_eq!(recent[2].data["seq"], 2);
    }

    #[test]
    fn cap_keeps_most_recent() {
        let journal = EventJournal::in_memory_capped(10).unwrap();
        for i in 0..25 {
            let event = Event::new("test.cap", json!({"seq": i}));
            journal.insert_event(&event).unwrap();
        }

        assert_eq!(journal.count().unwrap(), 10);
        let recent = journal.query_recent(100).unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].data["seq"], 24);
        assert_eq!(recent[9].data["seq"], 15);
    }

    #[test]
    fn query_by_subject_filters() {
        let journal = EventJournal::in_memory().unwrap();
        journal
            .insert_event(&Event::new("alpha.one", json!({"k": 1})))
            .unwrap();
        journal
            .insert_event(&Event::new("beta.two", json!({"k": 2})))
            .unwrap();
        journal
            .insert_event(&Event::new("alpha.one", json!({"k": 3})))
            .unwrap();

        let rows = journal.query_by_subject("alpha.one", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.subject == "alpha.one"));
    }

    #[test]
    fn journal_round_trip_preserves_event() {
        let journal = EventJournal::in_memory().unwrap();
        let event = Event::with_source("round.trip", json!({"price": "1.05"}), "tests");
        journal.insert_event(&event).unwrap();

        let restored = journal.query_recent(1).unwrap()[0].to_event().unwrap();
        assert_eq!(restored, event);
    }
}
