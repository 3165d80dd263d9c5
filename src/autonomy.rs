//! Autonomy transition state machine.
//!
//! Levels are small non-negative integers per (agent, action): 0 is
//! manual-only, higher levels run increasingly unattended. Escalations are
//! earned deliberately — they start `pending` and only become authoritative
//! on approval. Demotions bypass the gate entirely: autonomy can be revoked
//! instantly by the calibration engine or an active mistake pattern.
//!
//! The transition table is the event-sourced history; the current level per
//! key is materialized in `autonomy_state` and updated in the same
//! transaction as every authoritative transition, guarded by a per-key
//! version counter (optimistic compare-and-swap; a losing writer re-reads
//! and retries).

use crate::error::{Result, WardenError};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use std::sync::Arc;

/// Bounded retries for the per-key compare-and-swap.
const CAS_ATTEMPTS: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle state of a transition. `approved` is terminal for escalations,
/// `active` for demotions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Pending,
    Approved,
    Rejected,
    Active,
}

impl TransitionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "active" => Some(Self::Active),
            _ => None,
        }
    }

    /// Whether a transition in this status contributes to the current level.
    pub fn is_authoritative(self) -> bool {
        matches!(self, Self::Approved | Self::Active)
    }
}

impl std::fmt::Display for TransitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Payload version written into new evidence blobs.
pub const EVIDENCE_VERSION: u32 = 1;

/// Versioned structured evidence attached to a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub version: u32,
    /// Which subsystem produced the evidence.
    pub source: String,
    pub summary: String,
    pub details: serde_json::Value,
}

impl Evidence {
    pub fn new(source: &str, summary: &str, details: serde_json::Value) -> Self {
        Self {
            version: EVIDENCE_VERSION,
            source: source.to_owned(),
            summary: summary.to_owned(),
            details,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|error| WardenError::Validation(format!("unencodable evidence: {error}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|error| WardenError::Validation(format!("corrupt evidence: {error}")))
    }
}

/// One entry in the transition log.
#[derive(Debug, Clone)]
pub struct AutonomyTransition {
    pub id: String,
    pub agent_id: String,
    pub action_name: String,
    pub previous_level: u8,
    pub new_level: u8,
    pub reason: String,
    pub evidence: Evidence,
    pub status: TransitionStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Event-sourced autonomy ledger with a materialized current-level
/// projection.
pub struct AutonomyLedger {
    store: Arc<WardenStore>,
    max_level: u8,
}

impl AutonomyLedger {
    pub fn new(store: Arc<WardenStore>, max_level: u8) -> Self {
        Self { store, max_level }
    }

    /// The authoritative current level for a key, read from the projection.
    ///
    /// A key with no authoritative transitions is level 0 (manual-only).
    /// Errors propagate: an unavailable answer must fail closed at the
    /// caller, never silently report a level above 0.
    pub async fn current_level(&self, agent_id: &str, action_name: &str) -> Result<u8> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT level FROM autonomy_state WHERE agent_id = ? AND action_name = ?",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.map(|(level,)| level as u8).unwrap_or(0))
    }

    /// Request an escalation to a higher level. At most one pending
    /// escalation may exist per key at any time.
    pub async fn request_escalation(
        &self,
        agent_id: &str,
        action_name: &str,
        proposed_level: u8,
        reason: &str,
        evidence: Evidence,
        now: DateTime<Utc>,
    ) -> Result<AutonomyTransition> {
        if agent_id.trim().is_empty() || action_name.trim().is_empty() {
            return Err(WardenError::Validation(
                "agent_id and action_name must not be empty".into(),
            ));
        }
        if proposed_level > self.max_level {
            return Err(WardenError::Validation(format!(
                "proposed level {proposed_level} exceeds maximum {}",
                self.max_level
            )));
        }

        let mut tx = self.store.pool().begin().await?;

        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM autonomy_transitions \
             WHERE agent_id = ? AND action_name = ? AND status = 'pending'",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_one(&mut *tx)
        .await?;
        if pending > 0 {
            return Err(WardenError::Conflict(format!(
                "a pending transition already exists for ({agent_id}, {action_name})"
            )));
        }

        let current = read_level(&mut tx, agent_id, action_name).await?;
        if proposed_level <= current {
            return Err(WardenError::Validation(format!(
                "proposed level {proposed_level} does not exceed current level {current}"
            )));
        }

        let transition = AutonomyTransition {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            action_name: action_name.to_owned(),
            previous_level: current,
            new_level: proposed_level,
            reason: reason.to_owned(),
            evidence,
            status: TransitionStatus::Pending,
            approved_by: None,
            approved_at: None,
            created_at: now,
        };

        insert_transition(&mut tx, &transition)
            .await
            // The partial unique index backstops the explicit check against
            // a racing writer.
            .map_err(|error| {
                if let WardenError::Database(sqlx::Error::Database(db)) = &error {
                    if db.message().contains("UNIQUE") {
                        return WardenError::Conflict(format!(
                            "a pending transition already exists for ({agent_id}, {action_name})"
                        ));
                    }
                }
                error
            })?;

        tx.commit().await?;

        tracing::info!(
            transition_id = %transition.id,
            %agent_id,
            %action_name,
            from = current,
            to = proposed_level,
            "escalation requested"
        );
        Ok(transition)
    }

    /// Approve a pending escalation. The transition becomes the authoritative
    /// state for its key in the same transaction.
    pub async fn approve(
        &self,
        transition_id: &str,
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<AutonomyTransition> {
        if approver.trim().is_empty() {
            return Err(WardenError::Validation("approver must not be empty".into()));
        }

        for _ in 0..CAS_ATTEMPTS {
            let mut tx = self.store.pool().begin().await?;

            let transition = load_transition(&mut tx, transition_id).await?;
            if transition.status != TransitionStatus::Pending {
                return Err(WardenError::Validation(format!(
                    "transition {transition_id} is {}, not pending",
                    transition.status
                )));
            }

            sqlx::query(
                "UPDATE autonomy_transitions SET status = 'approved', approved_by = ?, \
                 approved_at = ? WHERE id = ? AND status = 'pending'",
            )
            .bind(approver)
            .bind(now)
            .bind(transition_id)
            .execute(&mut *tx)
            .await?;

            if project_level(
                &mut tx,
                &transition.agent_id,
                &transition.action_name,
                transition.new_level,
                now,
            )
            .await?
            {
                tx.commit().await?;
                tracing::info!(
                    %transition_id,
                    agent_id = %transition.agent_id,
                    action_name = %transition.action_name,
                    level = transition.new_level,
                    %approver,
                    "escalation approved"
                );
                return load_committed(&self.store, transition_id).await;
            }

            // Lost the CAS race; re-read and retry.
            tx.rollback().await?;
        }

        Err(WardenError::Conflict(format!(
            "lost the projection race approving {transition_id} after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Reject a pending escalation. The current level is unaffected.
    pub async fn reject(&self, transition_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;

        let transition = load_transition(&mut tx, transition_id).await?;
        if transition.status != TransitionStatus::Pending {
            return Err(WardenError::Validation(format!(
                "transition {transition_id} is {}, not pending",
                transition.status
            )));
        }

        sqlx::query(
            "UPDATE autonomy_transitions SET status = 'rejected', approved_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(transition_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(%transition_id, "escalation rejected");
        Ok(())
    }

    /// Revoke autonomy without approval. Invoked by the calibration engine
    /// (persistent overconfidence) or the mistake tracker (active pattern).
    /// Returns `None` when the key is already at or below the target level.
    pub async fn auto_demote(
        &self,
        agent_id: &str,
        action_name: &str,
        new_level: u8,
        reason: &str,
        evidence: Evidence,
        now: DateTime<Utc>,
    ) -> Result<Option<AutonomyTransition>> {
        for _ in 0..CAS_ATTEMPTS {
            let mut tx = self.store.pool().begin().await?;

            let current = read_level(&mut tx, agent_id, action_name).await?;
            if current <= new_level {
                return Ok(None);
            }

            let transition = AutonomyTransition {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_owned(),
                action_name: action_name.to_owned(),
                previous_level: current,
                new_level,
                reason: reason.to_owned(),
                evidence: evidence.clone(),
                status: TransitionStatus::Active,
                approved_by: None,
                approved_at: None,
                created_at: now,
            };
            insert_transition(&mut tx, &transition).await?;

            if project_level(&mut tx, agent_id, action_name, new_level, now).await? {
                tx.commit().await?;
                tracing::warn!(
                    transition_id = %transition.id,
                    %agent_id,
                    %action_name,
                    from = current,
                    to = new_level,
                    %reason,
                    "autonomy demoted"
                );
                return Ok(Some(transition));
            }

            tx.rollback().await?;
        }

        Err(WardenError::Conflict(format!(
            "lost the projection race demoting ({agent_id}, {action_name}) after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Full transition history for a key, oldest first, id as tiebreak.
    pub async fn history(&self, agent_id: &str, action_name: &str) -> Result<Vec<AutonomyTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM autonomy_transitions WHERE agent_id = ? AND action_name = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_transition_row(&row) {
                Ok(transition) => out.push(transition),
                Err(error) => tracing::warn!(%error, "skipping malformed transition row"),
            }
        }
        Ok(out)
    }

    /// The pending escalation for a key, if one exists.
    pub async fn pending_for(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Option<AutonomyTransition>> {
        let row = sqlx::query(
            "SELECT * FROM autonomy_transitions WHERE agent_id = ? AND action_name = ? \
             AND status = 'pending'",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref().map(parse_transition_row).transpose()
    }

    /// Re-derive the level from the event log: the most recent authoritative
    /// transition by (created_at, id). The projection must always agree;
    /// this exists for audits and tests, not the read path.
    pub async fn derive_level(&self, agent_id: &str, action_name: &str) -> Result<u8> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT new_level FROM autonomy_transitions \
             WHERE agent_id = ? AND action_name = ? AND status IN ('approved', 'active') \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.map(|(level,)| level as u8).unwrap_or(0))
    }
}

impl std::fmt::Debug for AutonomyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomyLedger")
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

async fn read_level(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    agent_id: &str,
    action_name: &str,
) -> Result<u8> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT level FROM autonomy_state WHERE agent_id = ? AND action_name = ?",
    )
    .bind(agent_id)
    .bind(action_name)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(level,)| level as u8).unwrap_or(0))
}

async fn insert_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    transition: &AutonomyTransition,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO autonomy_transitions (id, agent_id, action_name, previous_level, new_level, \
         reason, evidence, status, approved_by, approved_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transition.id)
    .bind(&transition.agent_id)
    .bind(&transition.action_name)
    .bind(transition.previous_level as i64)
    .bind(transition.new_level as i64)
    .bind(&transition.reason)
    .bind(transition.evidence.to_json()?)
    .bind(transition.status.to_string())
    .bind(&transition.approved_by)
    .bind(transition.approved_at)
    .bind(transition.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Compare-and-swap the projection row to the new level. Returns false when
/// the version moved underneath us and the caller must retry.
async fn project_level(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    agent_id: &str,
    action_name: &str,
    level: u8,
    now: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT version FROM autonomy_state WHERE agent_id = ? AND action_name = ?",
    )
    .bind(agent_id)
    .bind(action_name)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some((version,)) => {
            let result = sqlx::query(
                "UPDATE autonomy_state SET level = ?, version = version + 1, updated_at = ? \
                 WHERE agent_id = ? AND action_name = ? AND version = ?",
            )
            .bind(level as i64)
            .bind(now)
            .bind(agent_id)
            .bind(action_name)
            .bind(version)
            .execute(&mut **tx)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        None => {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO autonomy_state (agent_id, action_name, level, version, \
                 updated_at) VALUES (?, ?, ?, 1, ?)",
            )
            .bind(agent_id)
            .bind(action_name)
            .bind(level as i64)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(result.rows_affected() == 1)
        }
    }
}

async fn load_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    transition_id: &str,
) -> Result<AutonomyTransition> {
    let row = sqlx::query("SELECT * FROM autonomy_transitions WHERE id = ?")
        .bind(transition_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| WardenError::not_found("autonomy transition", transition_id))?;
    parse_transition_row(&row)
}

async fn load_committed(store: &WardenStore, transition_id: &str) -> Result<AutonomyTransition> {
    let row = sqlx::query("SELECT * FROM autonomy_transitions WHERE id = ?")
        .bind(transition_id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| WardenError::not_found("autonomy transition", transition_id))?;
    parse_transition_row(&row)
}

fn parse_transition_row(row: &sqlx::sqlite::SqliteRow) -> Result<AutonomyTransition> {
    let status_raw: String = row.try_get("status")?;
    let status = TransitionStatus::parse(&status_raw)
        .ok_or_else(|| WardenError::Validation(format!("unknown transition status: {status_raw}")))?;

    let evidence_json: String = row.try_get("evidence")?;
    let previous_level: i64 = row.try_get("previous_level")?;
    let new_level: i64 = row.try_get("new_level")?;

    Ok(AutonomyTransition {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        action_name: row.try_get("action_name")?,
        previous_level: previous_level as u8,
        new_level: new_level as u8,
        reason: row.try_get("reason")?,
        evidence: Evidence::from_json(&evidence_json)?,
        status,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    fn ev(summary: &str) -> Evidence {
        Evidence::new("test", summary, serde_json::json!({}))
    }

    async fn ledger() -> AutonomyLedger {
        AutonomyLedger::new(WardenStore::connect_in_memory().await.unwrap(), 3)
    }

    #[tokio::test]
    async fn unknown_key_is_manual_only() {
        let ledger = ledger().await;
        assert_eq!(ledger.current_level("ghost", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn escalation_is_not_authoritative_until_approved() {
        let ledger = ledger().await;
        let transition = ledger
            .request_escalation("a1", "send_email", 1, "track record", ev("ok"), t0())
            .await
            .unwrap();
        assert_eq!(transition.status, TransitionStatus::Pending);
        assert_eq!(transition.previous_level, 0);
        assert_eq!(ledger.current_level("a1", "send_email").await.unwrap(), 0);

        let approved = ledger.approve(&transition.id, "operator@host", t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(approved.status, TransitionStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("operator@host"));
        assert!(approved.approved_at.is_some());
        assert_eq!(ledger.current_level("a1", "send_email").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_pending_escalation_conflicts() {
        let ledger = ledger().await;
        ledger
            .request_escalation("a1", "send_email", 1, "first", ev("a"), t0())
            .await
            .unwrap();

        let second = ledger
            .request_escalation("a1", "send_email", 2, "second", ev("b"), t0())
            .await;
        assert!(matches!(second, Err(WardenError::Conflict(_))));

        // A different key is unaffected.
        ledger
            .request_escalation("a1", "summarize_doc", 1, "other key", ev("c"), t0())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn escalation_validates_levels() {
        let ledger = ledger().await;

        // Above the configured maximum.
        let result = ledger.request_escalation("a1", "x", 4, "r", ev("e"), t0()).await;
        assert!(matches!(result, Err(WardenError::Validation(_))));

        // Not above the current level (0).
        let result = ledger.request_escalation("a1", "x", 0, "r", ev("e"), t0()).await;
        assert!(matches!(result, Err(WardenError::Validation(_))));

        // Equal to current after an approval.
        let transition = ledger.request_escalation("a1", "x", 2, "r", ev("e"), t0()).await.unwrap();
        ledger.approve(&transition.id, "op", t0()).await.unwrap();
        let result = ledger.request_escalation("a1", "x", 2, "r", ev("e"), t0()).await;
        assert!(matches!(result, Err(WardenError::Validation(_))));
    }

    #[tokio::test]
    async fn reject_leaves_level_untouched_and_frees_the_slot() {
        let ledger = ledger().await;
        let transition = ledger
            .request_escalation("a1", "x", 2, "r", ev("e"), t0())
            .await
            .unwrap();

        ledger.reject(&transition.id, t0()).await.unwrap();
        assert_eq!(ledger.current_level("a1", "x").await.unwrap(), 0);
        assert!(ledger.pending_for("a1", "x").await.unwrap().is_none());

        // The key accepts a fresh escalation afterwards.
        ledger.request_escalation("a1", "x", 1, "retry", ev("e"), t0()).await.unwrap();
    }

    #[tokio::test]
    async fn approve_and_reject_require_a_pending_transition() {
        let ledger = ledger().await;
        assert!(matches!(
            ledger.approve("no-such-id", "op", t0()).await,
            Err(WardenError::NotFound { .. })
        ));
        assert!(matches!(
            ledger.reject("no-such-id", t0()).await,
            Err(WardenError::NotFound { .. })
        ));

        let transition = ledger.request_escalation("a1", "x", 1, "r", ev("e"), t0()).await.unwrap();
        ledger.approve(&transition.id, "op", t0()).await.unwrap();

        assert!(matches!(
            ledger.approve(&transition.id, "op", t0()).await,
            Err(WardenError::Validation(_))
        ));
        assert!(matches!(
            ledger.reject(&transition.id, t0()).await,
            Err(WardenError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn demotion_bypasses_approval_and_never_carries_an_approver() {
        let ledger = ledger().await;
        let transition = ledger.request_escalation("a1", "x", 2, "r", ev("e"), t0()).await.unwrap();
        ledger.approve(&transition.id, "op", t0()).await.unwrap();

        let demotion = ledger
            .auto_demote("a1", "x", 1, "overconfidence", ev("calibration"), t0() + Duration::hours(1))
            .await
            .unwrap()
            .expect("demotion applies");
        assert_eq!(demotion.status, TransitionStatus::Active);
        assert_eq!(demotion.approved_by, None);
        assert_eq!(demotion.previous_level, 2);
        assert_eq!(ledger.current_level("a1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn demotion_at_or_below_current_is_a_noop() {
        let ledger = ledger().await;
        // Level 0 key: nothing to revoke.
        let result = ledger.auto_demote("a1", "x", 0, "r", ev("e"), t0()).await.unwrap();
        assert!(result.is_none());

        let transition = ledger.request_escalation("a1", "x", 1, "r", ev("e"), t0()).await.unwrap();
        ledger.approve(&transition.id, "op", t0()).await.unwrap();
        let result = ledger.auto_demote("a1", "x", 1, "r", ev("e"), t0()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(ledger.current_level("a1", "x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn send_email_scenario_escalate_approve_then_demote() {
        let ledger = ledger().await;

        // send_email starts at level 1.
        let bootstrap = ledger
            .request_escalation("a1", "send_email", 1, "initial grant", ev("bootstrap"), t0())
            .await
            .unwrap();
        ledger.approve(&bootstrap.id, "op", t0()).await.unwrap();
        assert_eq!(ledger.current_level("a1", "send_email").await.unwrap(), 1);

        // Escalation to 2, approved.
        let escalation = ledger
            .request_escalation(
                "a1",
                "send_email",
                2,
                "calibrated track record",
                ev("calibration trend"),
                t0() + Duration::hours(1),
            )
            .await
            .unwrap();
        ledger.approve(&escalation.id, "op", t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(ledger.current_level("a1", "send_email").await.unwrap(), 2);

        // A failed episode opens an active pattern with adjustment -1; the
        // tracker's veto demotes back to 1 without approval.
        let demotion = ledger
            .auto_demote(
                "a1",
                "send_email",
                1,
                "active mistake pattern",
                ev("pattern veto"),
                t0() + Duration::hours(3),
            )
            .await
            .unwrap()
            .expect("demotion applies");
        assert_eq!(demotion.previous_level, 2);
        assert_eq!(ledger.current_level("a1", "send_email").await.unwrap(), 1);

        // The projection always agrees with the event log.
        assert_eq!(
            ledger.derive_level("a1", "send_email").await.unwrap(),
            ledger.current_level("a1", "send_email").await.unwrap()
        );
        assert_eq!(ledger.history("a1", "send_email").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn derivation_breaks_created_at_ties_by_id() {
        let ledger = ledger().await;

        // Two authoritative transitions with an identical created_at; the
        // greater id wins deterministically.
        for (id, level) in [("00-first", 1_i64), ("zz-last", 2_i64)] {
            sqlx::query(
                "INSERT INTO autonomy_transitions (id, agent_id, action_name, previous_level, \
                 new_level, reason, evidence, status, created_at) \
                 VALUES (?, 'a1', 'x', 0, ?, 'seed', ?, 'active', ?)",
            )
            .bind(id)
            .bind(level)
            .bind(ev("seed").to_json().unwrap())
            .bind(t0())
            .execute(ledger.store.pool())
            .await
            .unwrap();
        }

        assert_eq!(ledger.derive_level("a1", "x").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn evidence_roundtrips_with_version() {
        let ledger = ledger().await;
        let evidence = Evidence::new(
            "calibration",
            "error 0.3 over 12 actions",
            serde_json::json!({"calibration_error": 0.3, "total_actions": 12}),
        );
        let transition = ledger
            .request_escalation("a1", "x", 1, "r", evidence.clone(), t0())
            .await
            .unwrap();

        let history = ledger.history("a1", "x").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, transition.id);
        assert_eq!(history[0].evidence, evidence);
        assert_eq!(history[0].evidence.version, EVIDENCE_VERSION);
    }
}
