//! Decay engine: recomputes chunk relevance from age and reinforcement.
//!
//! Runs as a periodic batch over all chunks. The score is a pure function of
//! (importance, per-source rate, effective age), so invoking the batch twice
//! with the same `now` produces identical scores. Reinforcement happens on
//! the retrieval path (`KnowledgeStore::record_access`) and resets the
//! effective age the next pass sees.

use crate::error::Result;
use crate::knowledge::SourceType;
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Decay engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DecayConfig {
    /// Per-source-type decay rates (per day). Keys are the lowercase source
    /// type names. A rate of 0.0 means the source never decays.
    pub lambda_per_source: HashMap<String, f64>,
    /// Fallback rate when no per-source rate applies.
    pub default_lambda: f64,
    /// Fraction of the remaining headroom restored on a retrieval hit.
    pub restore_factor: f64,
    /// Decay score below which chunks are considered for pruning.
    pub prune_floor: f64,
    /// Minimum age in days before a chunk can be pruned.
    pub prune_min_age_days: i64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        let mut rates = HashMap::new();
        // Ephemeral conversational exchanges fade within days.
        rates.insert("conversation".into(), 0.12);
        rates.insert("observation".into(), 0.08);
        // Consolidated episodic knowledge holds for weeks.
        rates.insert("episode".into(), 0.05);
        // Documents fade over months.
        rates.insert("document".into(), 0.02);
        // Curated knowledge is effectively permanent.
        rates.insert("curated".into(), 0.0005);

        Self {
            lambda_per_source: rates,
            default_lambda: 0.05,
            restore_factor: 0.5,
            prune_floor: 0.05,
            prune_min_age_days: 30,
        }
    }
}

impl DecayConfig {
    /// Resolve the decay rate for a source type.
    pub fn lambda_for(&self, source_type: SourceType) -> f64 {
        self.lambda_per_source
            .get(&source_type.to_string())
            .copied()
            .unwrap_or(self.default_lambda)
    }
}

// ---------------------------------------------------------------------------
// Core scoring
// ---------------------------------------------------------------------------

/// `clamp(importance * e^(-lambda * age_days), 0, 1)`.
///
/// Deriving from importance rather than the previous score makes the batch
/// idempotent in `now` and monotonically non-increasing between reinforcement
/// events.
pub fn decay_score(importance: f64, lambda: f64, age_days: f64) -> f64 {
    (importance * (-lambda * age_days).exp()).clamp(0.0, 1.0)
}

/// Result counts from one decay batch pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecayReport {
    /// Chunks whose score was recomputed.
    pub scored: usize,
    /// Fully-decayed chunks removed.
    pub pruned: usize,
    /// Malformed rows logged and left untouched.
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Batch pass
// ---------------------------------------------------------------------------

/// Recompute decay scores for every chunk, then prune the fully decayed.
///
/// Per-item failures (unknown source type, corrupt importance, unparseable
/// timestamps) are logged and skipped; the batch never aborts on a single
/// bad record.
pub async fn run_decay(
    store: &WardenStore,
    config: &DecayConfig,
    now: DateTime<Utc>,
) -> Result<DecayReport> {
    let rows = sqlx::query(
        "SELECT id, source_type, importance, last_accessed_at FROM knowledge_chunks",
    )
    .fetch_all(store.pool())
    .await?;

    let mut report = DecayReport::default();

    for row in rows {
        let id: String = match row.try_get("id") {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(%error, "decay: row without readable id, skipping");
                report.skipped += 1;
                continue;
            }
        };

        match score_row(&row, config, now) {
            Some(score) => {
                sqlx::query("UPDATE knowledge_chunks SET decay_score = ? WHERE id = ?")
                    .bind(score)
                    .bind(&id)
                    .execute(store.pool())
                    .await?;
                report.scored += 1;
            }
            None => {
                tracing::warn!(chunk_id = %id, "decay: malformed chunk row, skipping");
                report.skipped += 1;
            }
        }
    }

    report.pruned = prune_fully_decayed(store, config, now).await?;

    tracing::debug!(
        scored = report.scored,
        pruned = report.pruned,
        skipped = report.skipped,
        "decay pass complete"
    );
    Ok(report)
}

/// Compute the new score for one raw chunk row, or None if the row is
/// malformed.
fn score_row(row: &sqlx::sqlite::SqliteRow, config: &DecayConfig, now: DateTime<Utc>) -> Option<f64> {
    let source_raw: String = row.try_get("source_type").ok()?;
    let source_type = SourceType::parse(&source_raw)?;

    let importance: f64 = row.try_get("importance").ok()?;
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return None;
    }

    let last_accessed: DateTime<Utc> = row.try_get("last_accessed_at").ok()?;
    let age_days = (now - last_accessed).num_seconds().max(0) as f64 / 86_400.0;

    Some(decay_score(importance, config.lambda_for(source_type), age_days))
}

/// Delete chunks that decayed below the prune floor and are old enough.
/// Curated chunks are never pruned; edges die with their endpoints.
async fn prune_fully_decayed(
    store: &WardenStore,
    config: &DecayConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::days(config.prune_min_age_days);

    let mut tx = store.pool().begin().await?;
    let result = sqlx::query(
        "DELETE FROM knowledge_chunks \
         WHERE decay_score < ? AND created_at < ? AND source_type != 'curated'",
    )
    .bind(config.prune_floor)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    // Edge hygiene for pools without the foreign-key pragma.
    sqlx::query(
        "DELETE FROM knowledge_edges \
         WHERE from_chunk NOT IN (SELECT id FROM knowledge_chunks) \
            OR to_chunk NOT IN (SELECT id FROM knowledge_chunks)",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(result.rows_affected() as usize)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
