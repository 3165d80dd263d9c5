//! WardenStore: dedicated SQLite database for the governance engine.

use crate::error::{Result, WardenError};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Wraps a dedicated SQLite connection pool for warden.db.
///
/// Kept separate from any host-application database so governance writes
/// (episode ingestion, batch passes) never contend with the host's
/// latency-sensitive queries.
pub struct WardenStore {
    pool: SqlitePool,
}

impl WardenStore {
    /// Connect to (or create) warden.db at the given path.
    ///
    /// Runs embedded migrations, enables WAL mode, and configures a small
    /// pool (one writer, one reader).
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| WardenError::Validation(format!("invalid db path: {error}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// Connect to an ephemeral in-memory database.
    ///
    /// Used by tests and by embedders that want a throwaway engine. A single
    /// connection is mandatory: each in-memory SQLite connection is its own
    /// database.
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|error| WardenError::Validation(format!("invalid db url: {error}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// Run the embedded schema. Uses raw SQL rather than sqlx::migrate!
    /// because warden.db is self-contained and ships inside the library.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::raw_sql(SCHEMA_V1).execute(pool).await?;
        sqlx::raw_sql(SCHEMA_V2).execute(pool).await?;
        Ok(())
    }

    /// Expose the pool for sub-modules that need direct query access.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a key-value pair to the warden_state table (upsert).
    pub async fn set_state(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        sqlx::query(
            "INSERT INTO warden_state (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a value from the warden_state table.
    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM warden_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Log a governance event to the audit trail.
    pub async fn log_event(
        &self,
        event_type: &str,
        summary: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let details_json = details.map(|d| d.to_string());
        sqlx::query(
            "INSERT INTO warden_events (id, event_type, summary, details, created_at) \
             VALUES (?, ?, ?, ?, datetime('now'))",
        )
        .bind(&id)
        .bind(event_type)
        .bind(summary)
        .bind(&details_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for WardenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenStore").finish_non_exhaustive()
    }
}

/// Embedded schema v1: knowledge store, episodic log, engine state, audit log.
///
/// All tables use `IF NOT EXISTS` so re-running is safe. Timestamps are bound
/// from Rust as RFC 3339 text (never `datetime('now')` on data rows) so batch
/// passes are deterministic in their `now` argument.
const SCHEMA_V1: &str = r#"
-- Knowledge chunks (atomic memory units)
CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_id TEXT,
    content TEXT NOT NULL,
    embedding TEXT,
    importance REAL NOT NULL,
    decay_score REAL NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON knowledge_chunks(source_type);
CREATE INDEX IF NOT EXISTS idx_chunks_decay ON knowledge_chunks(decay_score);

-- Typed edges between chunks; die with either endpoint
CREATE TABLE IF NOT EXISTS knowledge_edges (
    id TEXT PRIMARY KEY,
    from_chunk TEXT NOT NULL,
    to_chunk TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (from_chunk) REFERENCES knowledge_chunks(id) ON DELETE CASCADE,
    FOREIGN KEY (to_chunk) REFERENCES knowledge_chunks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_edges_from ON knowledge_edges(from_chunk);
CREATE INDEX IF NOT EXISTS idx_edges_to ON knowledge_edges(to_chunk);

-- Episodic log (append-only; rows are immutable once recorded)
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    action_name TEXT NOT NULL,
    outcome TEXT NOT NULL,
    confidence_at_decision REAL NOT NULL,
    context_summary TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_key ON episodes(agent_id, action_name, ended_at);
CREATE INDEX IF NOT EXISTS idx_episodes_outcome ON episodes(outcome);

-- Engine state (KV for heartbeats/cursors)
CREATE TABLE IF NOT EXISTS warden_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Governance events log (audit trail)
CREATE TABLE IF NOT EXISTS warden_events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_warden_events_type ON warden_events(event_type, created_at);
"#;

/// Schema v2: procedures, calibration history, mistake patterns, and the
/// autonomy transition log with its materialized current-state projection.
const SCHEMA_V2: &str = r#"
-- Learned procedures
CREATE TABLE IF NOT EXISTS procedures (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner_agent TEXT NOT NULL,
    action_name TEXT NOT NULL,
    steps TEXT NOT NULL DEFAULT '[]',
    preconditions TEXT NOT NULL DEFAULT '[]',
    postconditions TEXT NOT NULL DEFAULT '[]',
    execution_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    avg_duration_ms REAL NOT NULL DEFAULT 0.0,
    status TEXT NOT NULL DEFAULT 'draft',
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_procedures_key ON procedures(owner_agent, action_name);

-- Membership set: which episodes a procedure has already folded in.
-- The per-episode uniqueness means an episode consolidates exactly once.
CREATE TABLE IF NOT EXISTS procedure_episodes (
    procedure_id TEXT NOT NULL,
    episode_id TEXT NOT NULL,
    folded_at TEXT NOT NULL,
    PRIMARY KEY (procedure_id, episode_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_procedure_episodes_episode
    ON procedure_episodes(episode_id);

-- Calibration history (append-only; never overwritten)
CREATE TABLE IF NOT EXISTS calibration_records (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    action_name TEXT NOT NULL,
    window_days INTEGER NOT NULL,
    total_actions INTEGER NOT NULL,
    insufficient_data INTEGER NOT NULL DEFAULT 0,
    mean_confidence REAL,
    mean_success_rate REAL,
    calibration_error REAL,
    overconfidence_rate REAL,
    underconfidence_rate REAL,
    suggested_adjustment REAL,
    calculated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_calibration_key
    ON calibration_records(agent_id, action_name, calculated_at);

-- Mistake patterns (recurring failure modes with their own lifecycle)
CREATE TABLE IF NOT EXISTS mistake_patterns (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    action_name TEXT NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    trigger_conditions TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    clean_streak INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    autonomy_adjustment INTEGER NOT NULL DEFAULT -1,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    resolution_notes TEXT,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_patterns_key
    ON mistake_patterns(agent_id, action_name, status);

-- Autonomy transition log (event-sourced; the authoritative history)
CREATE TABLE IF NOT EXISTS autonomy_transitions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    action_name TEXT NOT NULL,
    previous_level INTEGER NOT NULL,
    new_level INTEGER NOT NULL,
    reason TEXT NOT NULL,
    evidence TEXT NOT NULL,
    status TEXT NOT NULL,
    approved_by TEXT,
    approved_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transitions_key
    ON autonomy_transitions(agent_id, action_name, created_at, id);
-- At most one pending escalation per key, enforced at the storage layer.
CREATE UNIQUE INDEX IF NOT EXISTS idx_transitions_pending
    ON autonomy_transitions(agent_id, action_name) WHERE status = 'pending';

-- Materialized current-level projection, updated transactionally with every
-- authoritative transition. Readers never re-derive the level from history.
CREATE TABLE IF NOT EXISTS autonomy_state (
    agent_id TEXT NOT NULL,
    action_name TEXT NOT NULL,
    level INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, action_name)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let store = WardenStore::connect_in_memory().await.unwrap();
        // Schema uses IF NOT EXISTS throughout; a second pass is a no-op.
        WardenStore::run_migrations(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn state_roundtrip_and_upsert() {
        let store = WardenStore::connect_in_memory().await.unwrap();

        assert_eq!(store.get_state("cursor").await.unwrap(), None);

        store.set_state("cursor", "41").await.unwrap();
        assert_eq!(store.get_state("cursor").await.unwrap(), Some("41".into()));

        store.set_state("cursor", "42").await.unwrap();
        assert_eq!(store.get_state("cursor").await.unwrap(), Some("42".into()));
    }

    #[tokio::test]
    async fn events_are_appended() {
        let store = WardenStore::connect_in_memory().await.unwrap();
        store
            .log_event("test", "first", Some(&serde_json::json!({"n": 1})))
            .await
            .unwrap();
        store.log_event("test", "second", None).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM warden_events")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 2);
    }
}
