//! Episodic log: append-only record of agent task executions.
//!
//! Episodes are produced by the external execution runtime, one per completed
//! task, and are immutable once recorded — consolidation membership is
//! tracked in a separate join table, never by mutating the episode row.

use crate::error::{Result, WardenError};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use sqlx::Row;

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Recorded outcome of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

impl Outcome {
    /// Strict parse; stored values are engine-written so anything else is a
    /// malformed record.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Binarized outcome used by calibration: a partial is not a success.
    pub fn as_binary(self) -> f64 {
        if self.is_success() {
            1.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// One recorded execution of an agent action.
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: String,
    pub agent_id: String,
    pub action_name: String,
    pub outcome: Outcome,
    /// Self-reported by the agent before the outcome was known.
    pub confidence_at_decision: f64,
    pub context_summary: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl Episode {
    /// Wall-clock duration of the execution.
    pub fn duration_ms(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64
    }
}

// ---------------------------------------------------------------------------
// EpisodeLog
// ---------------------------------------------------------------------------

/// Append-only episode ingestion and query surface.
pub struct EpisodeLog {
    store: Arc<WardenStore>,
}

impl EpisodeLog {
    pub fn new(store: Arc<WardenStore>) -> Self {
        Self { store }
    }

    /// Record one completed task execution. Called once per task by the
    /// external execution runtime; the resulting row is immutable.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        agent_id: &str,
        action_name: &str,
        outcome: Outcome,
        confidence_at_decision: f64,
        context_summary: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Episode> {
        if agent_id.trim().is_empty() {
            return Err(WardenError::Validation("agent_id must not be empty".into()));
        }
        if action_name.trim().is_empty() {
            return Err(WardenError::Validation(
                "action_name must not be empty".into(),
            ));
        }
        if !confidence_at_decision.is_finite()
            || !(0.0..=1.0).contains(&confidence_at_decision)
        {
            return Err(WardenError::Validation(format!(
                "confidence_at_decision must be in [0, 1], got {confidence_at_decision}"
            )));
        }
        if ended_at < started_at {
            return Err(WardenError::Validation(
                "ended_at precedes started_at".into(),
            ));
        }

        let episode = Episode {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            action_name: action_name.to_owned(),
            outcome,
            confidence_at_decision,
            context_summary: context_summary.to_owned(),
            started_at,
            ended_at,
            recorded_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO episodes (id, agent_id, action_name, outcome, confidence_at_decision, \
             context_summary, started_at, ended_at, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&episode.id)
        .bind(&episode.agent_id)
        .bind(&episode.action_name)
        .bind(episode.outcome.to_string())
        .bind(episode.confidence_at_decision)
        .bind(&episode.context_summary)
        .bind(episode.started_at)
        .bind(episode.ended_at)
        .bind(episode.recorded_at)
        .execute(self.store.pool())
        .await?;

        Ok(episode)
    }

    /// Fetch a single episode by id.
    pub async fn get(&self, id: &str) -> Result<Episode> {
        let row = sqlx::query("SELECT * FROM episodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| WardenError::not_found("episode", id))?;
        parse_episode_row(&row)
    }

    /// Episodes for a key that ended inside the window. Malformed rows are
    /// logged and skipped so windowed statistics never abort wholesale.
    pub async fn in_window(
        &self,
        agent_id: &str,
        action_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Episode>> {
        let rows = sqlx::query(
            "SELECT * FROM episodes \
             WHERE agent_id = ? AND action_name = ? AND ended_at >= ? \
             ORDER BY ended_at ASC, id ASC",
        )
        .bind(agent_id)
        .bind(action_name)
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;

        Ok(collect_episodes(rows))
    }

    /// Distinct (agent_id, action_name) keys with at least one episode ending
    /// inside the window.
    pub async fn keys_since(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT agent_id, action_name FROM episodes WHERE ended_at >= ? \
             ORDER BY agent_id, action_name",
        )
        .bind(since)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Episodes not yet folded into any procedure, oldest first.
    pub async fn unfolded(&self, limit: usize) -> Result<Vec<Episode>> {
        let rows = sqlx::query(
            "SELECT * FROM episodes \
             WHERE id NOT IN (SELECT episode_id FROM procedure_episodes) \
             ORDER BY ended_at ASC, id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.store.pool())
        .await?;

        Ok(collect_episodes(rows))
    }

    /// Episodes recorded after the given rowid cursor, in insertion order.
    /// Drives the mistake tracker's incremental pass; the returned cursor
    /// value is the rowid of the last episode in the batch.
    pub async fn recorded_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Episode)>> {
        let rows = sqlx::query(
            "SELECT rowid AS row_seq, * FROM episodes WHERE rowid > ? ORDER BY rowid ASC LIMIT ?",
        )
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("row_seq")?;
            match parse_episode_row(&row) {
                Ok(episode) => out.push((seq, episode)),
                Err(error) => tracing::warn!(%error, seq, "skipping malformed episode row"),
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for EpisodeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeLog").finish_non_exhaustive()
    }
}

fn collect_episodes(rows: Vec<sqlx::sqlite::SqliteRow>) -> Vec<Episode> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_episode_row(&row) {
            Ok(episode) => out.push(episode),
            Err(error) => tracing::warn!(%error, "skipping malformed episode row"),
        }
    }
    out
}

pub(crate) fn parse_episode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Episode> {
    let outcome_raw: String = row.try_get("outcome")?;
    let outcome = Outcome::parse(&outcome_raw).ok_or_else(|| {
        WardenError::Validation(format!("unknown episode outcome: {outcome_raw}"))
    })?;

    Ok(Episode {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        action_name: row.try_get("action_name")?,
        outcome,
        confidence_at_decision: row.try_get("confidence_at_decision")?,
        context_summary: row.try_get("context_summary")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
