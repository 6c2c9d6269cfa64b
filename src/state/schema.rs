//! State database schema definitions and migrations.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Full DDL for the vigil state database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Key-value store for small runtime markers (listener cursors, flags)
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Singleton agent state row (id is always 1)
CREATE TABLE IF NOT EXISTS agent_state (
    id               INTEGER PRIMARY KEY CHECK (id = 1),
    directive        TEXT NOT NULL,
    short_term_goals TEXT NOT NULL DEFAULT '[]',
    mid_term_goals   TEXT NOT NULL DEFAULT '[]',
    long_term_goals  TEXT NOT NULL DEFAULT '[]',
    active_task      TEXT,
    iteration        INTEGER NOT NULL DEFAULT 0,
    paused           INTEGER NOT NULL DEFAULT 0,
    chat_cursor      INTEGER NOT NULL DEFAULT 0,
    memory_config    TEXT NOT NULL DEFAULT '{}',
    started_at       TEXT NOT NULL,
    last_heartbeat   TEXT NOT NULL
);

-- Creator/agent chat log, ordered by id
CREATE TABLE IF NOT EXISTS chat_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    role      TEXT NOT NULL,
    content   TEXT NOT NULL,
    channel   TEXT NOT NULL DEFAULT 'web',
    metadata  TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);

-- Bounded scratch pad
CREATE TABLE IF NOT EXISTS short_term_notes (
    idx        INTEGER PRIMARY KEY AUTOINCREMENT,
    content    TEXT NOT NULL,
    iteration  INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Provider accounts with currency-tagged balances
CREATE TABLE IF NOT EXISTS providers (
    name                TEXT PRIMARY KEY,
    tier                TEXT NOT NULL DEFAULT 'unknown',
    currency            TEXT NOT NULL DEFAULT 'USD',
    known_balance       REAL,
    balance_updated_at  TEXT,
    spent_tracked       REAL NOT NULL DEFAULT 0.0,
    api_key_ref         TEXT NOT NULL DEFAULT '',
    input_per_1k        REAL NOT NULL DEFAULT 0.0,
    output_per_1k       REAL NOT NULL DEFAULT 0.0,
    notes               TEXT
);

-- Singleton monthly budget row
CREATE TABLE IF NOT EXISTS budget (
    id                   INTEGER PRIMARY KEY CHECK (id = 1),
    monthly_cap_usd      REAL NOT NULL DEFAULT 100.0,
    spent_this_month_usd REAL NOT NULL DEFAULT 0.0,
    current_month        TEXT NOT NULL
);

-- Iteration summaries (full records live in the blob)
CREATE TABLE IF NOT EXISTS iterations (
    n              INTEGER PRIMARY KEY,
    started_at     TEXT NOT NULL,
    model          TEXT NOT NULL DEFAULT '',
    provider       TEXT NOT NULL DEFAULT '',
    tokens_in      INTEGER NOT NULL DEFAULT 0,
    tokens_out     INTEGER NOT NULL DEFAULT 0,
    cost           REAL NOT NULL DEFAULT 0.0,
    status_message TEXT NOT NULL DEFAULT '',
    record         TEXT NOT NULL DEFAULT '{}'
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_chat_timestamp ON chat_messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_notes_created ON short_term_notes(created_at);
"#;

/// Migration from version 1 to version 2.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE providers ADD COLUMN notes TEXT;
"#;
