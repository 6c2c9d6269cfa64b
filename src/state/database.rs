//! SQLite state store with WAL mode and migration support.
//!
//! Single writer (the director); readers go through short-lived locks on the
//! shared handle. Owns the durable agent row, the chat log, the scratch pad,
//! and the provider/budget rows.

use crate::budget::models::{Currency, ProviderRecord, ProviderTier};
use crate::state::schema;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

/// Scratch pad capacity and expiry.
pub const NOTE_CAP: usize = 50;
pub const NOTE_MAX_AGE_HOURS: i64 = 48;

/// The vigil state database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema creation and migrations.
    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating state schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else {
            if version < 2 {
                info!("Migrating state database v1 -> v2");
                self.conn.execute_batch(schema::MIGRATE_V1_TO_V2)?;
            }
            if version < schema::SCHEMA_VERSION {
                self.conn.execute(
                    "UPDATE schema_version SET version = ?1",
                    params![schema::SCHEMA_VERSION],
                )?;
            }
        }

        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Key-value store
    // -----------------------------------------------------------------------

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let value = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(value)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent state row
    // -----------------------------------------------------------------------

    /// Load the singleton state row, creating it with defaults when absent.
    pub fn load_or_init_state(&self, initial_directive: &str) -> Result<AgentSnapshot> {
        let existing = self.try_snapshot()?;
        if let Some(snapshot) = existing {
            info!("State loaded at iteration {}", snapshot.iteration);
            return Ok(snapshot);
        }

        // Goals start empty; the agent sets its own on its first goal
        // review, or the creator seeds them through the API.
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO agent_state
               (id, directive, memory_config, started_at, last_heartbeat)
             VALUES (1, ?1, ?2, ?3, ?3)",
            params![
                initial_directive,
                serde_json::to_string(&MemoryConfig::default())?,
                now.to_rfc3339(),
            ],
        )?;
        info!("State created with default directive");
        self.snapshot()
    }

    /// Read the current state row.
    pub fn snapshot(&self) -> Result<AgentSnapshot> {
        self.try_snapshot()?
            .context("Agent state row missing; call load_or_init_state first")
    }

    fn try_snapshot(&self) -> Result<Option<AgentSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT directive, short_term_goals, mid_term_goals, long_term_goals,
                        active_task, iteration, paused, chat_cursor, memory_config, started_at
                 FROM agent_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, u64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            directive,
            short_json,
            mid_json,
            long_json,
            active_task,
            iteration,
            paused,
            chat_cursor,
            config_json,
            started_at,
        )) = row
        else {
            return Ok(None);
        };

        let goals = GoalSet {
            short_term: serde_json::from_str(&short_json).unwrap_or_default(),
            mid_term: serde_json::from_str(&mid_json).unwrap_or_default(),
            long_term: serde_json::from_str(&long_json).unwrap_or_default(),
        };
        let memory_config: MemoryConfig =
            serde_json::from_str(&config_json).unwrap_or_default();

        Ok(Some(AgentSnapshot {
            directive,
            goals,
            active_task,
            iteration,
            paused: paused != 0,
            chat_cursor,
            memory_config,
            started_at: parse_timestamp(&started_at),
        }))
    }

    pub fn set_directive(&self, directive: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET directive = ?1 WHERE id = 1",
            params![directive],
        )?;
        Ok(())
    }

    /// Replace all three goal horizons atomically.
    pub fn set_goals(&self, goals: &GoalSet) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET short_term_goals = ?1, mid_term_goals = ?2,
                    long_term_goals = ?3 WHERE id = 1",
            params![
                serde_json::to_string(&goals.short_term)?,
                serde_json::to_string(&goals.mid_term)?,
                serde_json::to_string(&goals.long_term)?,
            ],
        )?;
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET paused = ?1 WHERE id = 1",
            params![paused as i64],
        )?;
        Ok(())
    }

    pub fn is_paused(&self) -> Result<bool> {
        let paused: i64 = self
            .conn
            .query_row("SELECT paused FROM agent_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(paused != 0)
    }

    pub fn set_active_task(&self, task: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET active_task = ?1 WHERE id = 1",
            params![task],
        )?;
        Ok(())
    }

    /// Advance the iteration counter and return the new value.
    pub fn increment_iteration(&self) -> Result<u64> {
        self.conn.execute(
            "UPDATE agent_state SET iteration = iteration + 1, last_heartbeat = ?1 WHERE id = 1",
            params![Utc::now().to_rfc3339()],
        )?;
        let n: u64 = self
            .conn
            .query_row("SELECT iteration FROM agent_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(n)
    }

    pub fn set_memory_config(&self, config: &MemoryConfig) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET memory_config = ?1 WHERE id = 1",
            params![serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET last_heartbeat = ?1 WHERE id = 1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chat log
    // -----------------------------------------------------------------------

    /// Append a chat message and return its id.
    pub fn append_chat(
        &self,
        role: ChatRole,
        content: &str,
        channel: Channel,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO chat_messages (role, content, channel, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                role.to_string(),
                content,
                channel.to_string(),
                serde_json::to_string(metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The most recent `limit` messages, in chronological order.
    pub fn chat_history(&self, limit: usize) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, channel, metadata, timestamp
             FROM chat_messages ORDER BY id DESC LIMIT ?1",
        )?;
        let mut records = stmt
            .query_map(params![limit as i64], row_to_chat)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// Creator messages past the consumed cursor, oldest first.
    pub fn chat_after_cursor(&self, cursor: i64, limit: usize) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, channel, metadata, timestamp
             FROM chat_messages WHERE id > ?1 AND role = 'creator'
             ORDER BY id ASC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![cursor, limit as i64], row_to_chat)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record that all creator messages up to `id` have been consumed.
    pub fn advance_chat_cursor(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET chat_cursor = MAX(chat_cursor, ?1) WHERE id = 1",
            params![id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Short-term notes
    // -----------------------------------------------------------------------

    /// Insert a note, evicting the oldest entries above the cap (strict FIFO).
    pub fn add_note(&self, content: &str, iteration: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO short_term_notes (content, iteration, created_at) VALUES (?1, ?2, ?3)",
            params![content, iteration, Utc::now().to_rfc3339()],
        )?;
        self.conn.execute(
            "DELETE FROM short_term_notes WHERE idx NOT IN
               (SELECT idx FROM short_term_notes ORDER BY idx DESC LIMIT ?1)",
            params![NOTE_CAP as i64],
        )?;
        Ok(())
    }

    /// All notes, most recent first.
    pub fn notes(&self) -> Result<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, content, iteration, created_at
             FROM short_term_notes ORDER BY idx DESC",
        )?;
        let notes = stmt
            .query_map([], |row| {
                Ok(Note {
                    idx: row.get(0)?,
                    content: row.get(1)?,
                    iteration: row.get(2)?,
                    created_at: parse_timestamp(&row.get::<_, String>(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Drop notes older than the age limit; returns how many were evicted.
    pub fn expire_notes(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::hours(NOTE_MAX_AGE_HOURS);
        let evicted = self.conn.execute(
            "DELETE FROM short_term_notes WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(evicted)
    }

    pub fn note_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM short_term_notes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    /// Insert or update a provider row, preserving tracked spend on update.
    pub fn upsert_provider(&self, rec: &ProviderRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO providers
               (name, tier, currency, known_balance, balance_updated_at,
                spent_tracked, api_key_ref, input_per_1k, output_per_1k, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(name) DO UPDATE SET
                tier = ?2, currency = ?3, known_balance = ?4, balance_updated_at = ?5,
                api_key_ref = ?7, input_per_1k = ?8, output_per_1k = ?9, notes = ?10",
            params![
                rec.name,
                rec.tier.to_string(),
                rec.currency.to_string(),
                rec.known_balance,
                rec.balance_updated_at.map(|t| t.to_rfc3339()),
                rec.spent_tracked,
                rec.api_key_ref,
                rec.input_per_1k,
                rec.output_per_1k,
                rec.notes,
            ],
        )?;
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Result<Option<ProviderRecord>> {
        let rec = self
            .conn
            .query_row(
                "SELECT name, tier, currency, known_balance, balance_updated_at,
                        spent_tracked, api_key_ref, input_per_1k, output_per_1k, notes
                 FROM providers WHERE name = ?1",
                params![name],
                row_to_provider,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn list_providers(&self) -> Result<Vec<ProviderRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, tier, currency, known_balance, balance_updated_at,
                    spent_tracked, api_key_ref, input_per_1k, output_per_1k, notes
             FROM providers ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_provider)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Add to a provider's tracked spend. Never decreases.
    pub fn add_provider_spend(&self, name: &str, amount: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE providers SET spent_tracked = spent_tracked + ?2 WHERE name = ?1",
            params![name, amount.max(0.0)],
        )?;
        Ok(())
    }

    /// Set a creator-reported balance and restart spend tracking from it.
    pub fn set_provider_balance(&self, name: &str, balance: f64, currency: Currency) -> Result<()> {
        self.conn.execute(
            "UPDATE providers SET known_balance = ?2, currency = ?3,
                    balance_updated_at = ?4, spent_tracked = 0.0
             WHERE name = ?1",
            params![name, balance, currency.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Reset tracked spend for monetary-currency providers (month rollover).
    pub fn reset_monetary_spend(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE providers SET spent_tracked = 0.0
             WHERE currency IN ('USD', 'EUR', 'GBP')",
            [],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Monthly budget row
    // -----------------------------------------------------------------------

    /// Load the budget row, creating it when absent.
    pub fn budget_row(&self, default_cap: f64, current_month: &str) -> Result<(f64, f64, String)> {
        let row = self
            .conn
            .query_row(
                "SELECT monthly_cap_usd, spent_this_month_usd, current_month FROM budget WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some(row) = row {
            return Ok(row);
        }
        self.conn.execute(
            "INSERT INTO budget (id, monthly_cap_usd, spent_this_month_usd, current_month)
             VALUES (1, ?1, 0.0, ?2)",
            params![default_cap, current_month],
        )?;
        Ok((default_cap, 0.0, current_month.to_string()))
    }

    pub fn set_budget_row(&self, cap: f64, spent: f64, month: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE budget SET monthly_cap_usd = ?1, spent_this_month_usd = ?2,
                    current_month = ?3 WHERE id = 1",
            params![cap, spent, month],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Iteration summaries
    // -----------------------------------------------------------------------

    pub fn save_iteration(&self, record: &IterationRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO iterations
               (n, started_at, model, provider, tokens_in, tokens_out, cost,
                status_message, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.n,
                record.started_at.to_rfc3339(),
                record.model,
                record.provider,
                record.tokens_in,
                record.tokens_out,
                record.cost,
                record.status_message,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` iteration records, newest first.
    pub fn recent_iterations(&self, limit: usize) -> Result<Vec<IterationRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM iterations ORDER BY n DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        role: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or(ChatRole::Creator),
        content: row.get(2)?,
        channel: row.get::<_, String>(3)?.parse().unwrap_or(Channel::Web),
        metadata: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Null),
        timestamp: parse_timestamp(&row.get::<_, String>(5)?),
    })
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        name: row.get(0)?,
        tier: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or(ProviderTier::Unknown),
        currency: row.get::<_, String>(2)?.parse().unwrap_or(Currency::Usd),
        known_balance: row.get(3)?,
        balance_updated_at: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_timestamp(&s)),
        spent_tracked: row.get(5)?,
        api_key_ref: row.get(6)?,
        input_per_1k: row.get(7)?,
        output_per_1k: row.get(8)?,
        notes: row.get(9)?,
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_memory().unwrap()
    }

    #[test]
    fn first_boot_starts_at_zero_with_empty_goals() {
        let db = db();
        let snap = db.load_or_init_state("stay curious").unwrap();
        assert_eq!(snap.directive, "stay curious");
        assert_eq!(snap.iteration, 0);
        assert!(!snap.paused);
        assert!(snap.goals.short_term.is_empty());
        assert!(snap.goals.mid_term.is_empty());
        assert!(snap.goals.long_term.is_empty());
        assert_eq!(snap.chat_cursor, 0);
    }

    #[test]
    fn iteration_counter_is_monotonic() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        let a = db.increment_iteration().unwrap();
        let b = db.increment_iteration().unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(db.snapshot().unwrap().iteration, 2);
    }

    #[test]
    fn chat_log_preserves_order_and_cursor() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        let meta = serde_json::Value::Null;
        let id1 = db
            .append_chat(ChatRole::Creator, "hi", Channel::Web, &meta)
            .unwrap();
        let id2 = db
            .append_chat(ChatRole::Agent, "hello", Channel::Web, &meta)
            .unwrap();
        assert!(id2 > id1);

        let history = db.chat_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, ChatRole::Agent);

        // Only unconsumed creator messages come back.
        let pending = db.chat_after_cursor(0, 16).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "hi");

        db.advance_chat_cursor(id1).unwrap();
        assert!(db.chat_after_cursor(id1, 16).unwrap().is_empty());
    }

    #[test]
    fn notes_cap_is_strict_fifo() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        for i in 0..60 {
            db.add_note(&format!("note {i}"), 1).unwrap();
        }
        assert_eq!(db.note_count().unwrap(), NOTE_CAP);
        let notes = db.notes().unwrap();
        assert_eq!(notes[0].content, "note 59");
        assert_eq!(notes.last().unwrap().content, "note 10");
    }

    #[test]
    fn stale_notes_expire() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        db.add_note("fresh", 1).unwrap();
        // Expiry measured from a "now" two days later evicts everything.
        let later = Utc::now() + chrono::Duration::hours(NOTE_MAX_AGE_HOURS + 1);
        let evicted = db.expire_notes(later).unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(db.note_count().unwrap(), 0);
    }

    #[test]
    fn goals_replace_atomically() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        let goals = GoalSet {
            short_term: vec!["a".into()],
            mid_term: vec!["b".into()],
            long_term: vec!["c".into(), "d".into()],
        };
        db.set_goals(&goals).unwrap();
        let snap = db.snapshot().unwrap();
        assert_eq!(snap.goals.short_term, vec!["a"]);
        assert_eq!(snap.goals.long_term.len(), 2);
    }

    #[test]
    fn provider_spend_accumulates_and_resets_on_balance_update() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        let rec = ProviderRecord {
            name: "acme".into(),
            tier: ProviderTier::Paid,
            currency: Currency::Usd,
            known_balance: Some(20.0),
            balance_updated_at: None,
            spent_tracked: 0.0,
            api_key_ref: "ACME_KEY".into(),
            input_per_1k: 0.001,
            output_per_1k: 0.002,
            notes: None,
        };
        db.upsert_provider(&rec).unwrap();
        db.add_provider_spend("acme", 1.5).unwrap();
        db.add_provider_spend("acme", 0.5).unwrap();
        let loaded = db.get_provider("acme").unwrap().unwrap();
        assert!((loaded.spent_tracked - 2.0).abs() < 1e-9);
        assert_eq!(loaded.estimated_remaining(), Some(18.0));

        db.set_provider_balance("acme", 50.0, Currency::Usd).unwrap();
        let loaded = db.get_provider("acme").unwrap().unwrap();
        assert_eq!(loaded.spent_tracked, 0.0);
        assert_eq!(loaded.known_balance, Some(50.0));
    }

    #[test]
    fn monetary_reset_skips_request_currencies() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        for (name, currency) in [("usd_p", Currency::Usd), ("req_p", Currency::Requests)] {
            let rec = ProviderRecord {
                name: name.into(),
                tier: ProviderTier::Paid,
                currency,
                known_balance: None,
                balance_updated_at: None,
                spent_tracked: 0.0,
                api_key_ref: String::new(),
                input_per_1k: 0.0,
                output_per_1k: 0.0,
                notes: None,
            };
            db.upsert_provider(&rec).unwrap();
            db.add_provider_spend(name, 5.0).unwrap();
        }
        db.reset_monetary_spend().unwrap();
        assert_eq!(db.get_provider("usd_p").unwrap().unwrap().spent_tracked, 0.0);
        assert_eq!(db.get_provider("req_p").unwrap().unwrap().spent_tracked, 5.0);
    }

    #[test]
    fn iteration_records_roundtrip() {
        let db = db();
        db.load_or_init_state("d").unwrap();
        let record = IterationRecord {
            n: 7,
            started_at: Utc::now(),
            model: "m".into(),
            provider: "p".into(),
            tokens_in: 100,
            tokens_out: 40,
            cost: 0.002,
            thinking: "t".into(),
            status_message: "working".into(),
            actions: vec![ActionRecord {
                tool: "note".into(),
                tier: None,
                parameters_keys: vec!["content".into()],
            }],
            chat_reply: None,
            next_sleep_s: 30.0,
        };
        db.save_iteration(&record).unwrap();
        let recent = db.recent_iterations(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].n, 7);
        assert_eq!(recent[0].actions[0].tool, "note");
    }
}
