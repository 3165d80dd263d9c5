//! Consolidation engine: folds raw episodes into durable procedures.
//!
//! A periodic pass scans episodes not yet folded into any procedure, groups
//! them by (agent, action), and clusters each group by outcome-signature
//! similarity. A cluster of sufficiently similar episodes seeds a draft
//! procedure; once a procedure exists for the key, later passes fold new
//! episodes into its counters. Folding is membership-checked, so re-running
//! a pass over already-folded episodes changes nothing.

use crate::claims::KeyClaims;
use crate::episodes::{Episode, EpisodeLog};
use crate::error::{Result, WardenError};
use crate::knowledge::{KnowledgeStore, SourceType};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Consolidation engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConsolidationConfig {
    /// Minimum cluster size before a new draft procedure is created.
    pub min_episodes: usize,
    /// Executions at which a draft procedure is promoted to active.
    pub promote_execution_count: i64,
    /// Trailing-window success rate below which a procedure is deprecated.
    pub deprecate_floor: f64,
    /// Days in the trailing window used for the deprecation check.
    pub deprecate_window_days: i64,
    /// Jaccard similarity at which two episodes share an outcome signature.
    pub cluster_similarity_threshold: f64,
    /// Maximum unfolded episodes pulled per pass.
    pub batch_limit: usize,
    /// Importance inherited by the knowledge chunk written alongside a new
    /// procedure.
    pub procedure_chunk_importance: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            min_episodes: 5,
            promote_execution_count: 20,
            deprecate_floor: 0.4,
            deprecate_window_days: 30,
            cluster_similarity_threshold: 0.25,
            batch_limit: 256,
            procedure_chunk_importance: 0.6,
        }
    }
}

// ---------------------------------------------------------------------------
// Procedure
// ---------------------------------------------------------------------------

/// Lifecycle state of a learned procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    Draft,
    Active,
    Deprecated,
}

impl ProcedureStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
        }
    }
}

/// A learned, versioned, statistically-tracked repeatable action sequence.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub id: String,
    pub name: String,
    pub owner_agent: String,
    pub action_name: String,
    pub steps: Vec<String>,
    pub preconditions: Vec<String>,
    pub postconditions: Vec<String>,
    pub execution_count: i64,
    pub success_count: i64,
    pub avg_duration_ms: f64,
    pub status: ProcedureStatus,
    /// Increments on step change only.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Procedure {
    /// success_count / execution_count; 0 when nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.execution_count as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome signatures
// ---------------------------------------------------------------------------

/// Lowercased alphanumeric token set of a context summary.
pub fn signature_tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity over token sets. Two empty signatures are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Greedy single-pass clustering: each episode joins the first cluster whose
/// seed it resembles, else starts a new one. Deterministic for a given input
/// order (callers pass episodes in (ended_at, id) order).
pub fn cluster_episodes<'a>(
    episodes: &'a [Episode],
    threshold: f64,
) -> Vec<Vec<&'a Episode>> {
    let mut clusters: Vec<(HashSet<String>, Vec<&Episode>)> = Vec::new();

    for episode in episodes {
        let tokens = signature_tokens(&episode.context_summary);
        match clusters
            .iter_mut()
            .find(|(seed, _)| jaccard(seed, &tokens) >= threshold)
        {
            Some((_, members)) => members.push(episode),
            None => clusters.push((tokens, vec![episode])),
        }
    }

    clusters.into_iter().map(|(_, members)| members).collect()
}

// ---------------------------------------------------------------------------
// Consolidator
// ---------------------------------------------------------------------------

/// Result counts from one consolidation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// New draft procedures created.
    pub procedures_created: usize,
    /// Episodes folded into procedure counters.
    pub folded: usize,
    /// Procedures promoted draft -> active.
    pub promoted: usize,
    /// Procedures deprecated on trailing success rate.
    pub deprecated: usize,
    /// Keys skipped because another pass held their claim.
    pub keys_deferred: usize,
    /// Keys skipped because their update failed (logged).
    pub keys_failed: usize,
}

/// Periodic consolidation pass over the episodic log.
pub struct Consolidator {
    store: Arc<WardenStore>,
    log: EpisodeLog,
    knowledge: KnowledgeStore,
    claims: KeyClaims,
}

impl Consolidator {
    pub fn new(store: Arc<WardenStore>, claims: KeyClaims) -> Self {
        let log = EpisodeLog::new(store.clone());
        let knowledge = KnowledgeStore::new(store.clone());
        Self {
            store,
            log,
            knowledge,
            claims,
        }
    }

    /// Run one consolidation pass. Work for distinct keys is independent;
    /// same-key work is serialized through the claim table. Per-key failures
    /// are logged and counted, never fatal to the pass.
    pub async fn run(
        &self,
        config: &ConsolidationConfig,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let episodes = self.log.unfolded(config.batch_limit).await?;

        let mut by_key: BTreeMap<(String, String), Vec<Episode>> = BTreeMap::new();
        for episode in episodes {
            by_key
                .entry((episode.agent_id.clone(), episode.action_name.clone()))
                .or_default()
                .push(episode);
        }

        let mut report = ConsolidationReport::default();

        for ((agent_id, action_name), group) in by_key {
            let _guard = match self.claims.try_claim(&agent_id, &action_name) {
                Ok(guard) => guard,
                Err(WardenError::Conflict(_)) => {
                    tracing::debug!(%agent_id, %action_name, "consolidation claim held, deferring key");
                    report.keys_deferred += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };

            match self
                .consolidate_key(&agent_id, &action_name, &group, config, now)
                .await
            {
                Ok(key_report) => {
                    report.procedures_created += key_report.procedures_created;
                    report.folded += key_report.folded;
                    report.promoted += key_report.promoted;
                    report.deprecated += key_report.deprecated;
                }
                Err(error) => {
                    tracing::warn!(%error, %agent_id, %action_name, "consolidation failed for key");
                    report.keys_failed += 1;
                }
            }
        }

        tracing::debug!(
            created = report.procedures_created,
            folded = report.folded,
            "consolidation pass complete"
        );
        Ok(report)
    }

    /// Consolidate one key's unfolded episodes. Caller holds the key claim.
    async fn consolidate_key(
        &self,
        agent_id: &str,
        action_name: &str,
        episodes: &[Episode],
        config: &ConsolidationConfig,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport::default();

        let procedure = match self.procedure_for_key(agent_id, action_name).await? {
            Some(existing) => existing,
            None => {
                // No procedure yet: a cluster of mutually similar episodes
                // must reach the floor before one is created.
                let clusters =
                    cluster_episodes(episodes, config.cluster_similarity_threshold);
                let Some(seed_cluster) = clusters
                    .iter()
                    .filter(|cluster| cluster.len() >= config.min_episodes)
                    .max_by_key(|cluster| cluster.len())
                else {
                    return Ok(report);
                };

                let created = self
                    .create_draft(agent_id, action_name, seed_cluster, config, now)
                    .await?;
                report.procedures_created += 1;
                created
            }
        };

        for episode in episodes {
            if self.fold_episode(&procedure.id, episode, now).await? {
                report.folded += 1;
            }
        }

        let refreshed = self
            .get_procedure(&procedure.id)
            .await?;

        if refreshed.status == ProcedureStatus::Draft
            && refreshed.execution_count >= config.promote_execution_count
        {
            self.set_status(&refreshed.id, ProcedureStatus::Active, now).await?;
            report.promoted += 1;
            tracing::info!(procedure_id = %refreshed.id, %action_name, "procedure promoted to active");
        }

        if self.should_deprecate(&refreshed, config, now).await? {
            self.set_status(&refreshed.id, ProcedureStatus::Deprecated, now).await?;
            report.deprecated += 1;
            tracing::info!(
                procedure_id = %refreshed.id,
                %action_name,
                success_rate = refreshed.success_rate(),
                "procedure deprecated on trailing success rate"
            );
        }

        Ok(report)
    }

    /// Fold one episode into a procedure. Membership is checked first, so an
    /// episode already recorded in the membership set never double-counts.
    /// Returns whether the counters were actually updated.
    async fn fold_episode(
        &self,
        procedure_id: &str,
        episode: &Episode,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.store.pool().begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO procedure_episodes (procedure_id, episode_id, folded_at) \
             VALUES (?, ?, ?)",
        )
        .bind(procedure_id)
        .bind(&episode.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let success_increment: i64 = if episode.outcome.is_success() { 1 } else { 0 };
        // Right-hand sides see pre-update values, so the running mean divides
        // by the incremented count while the counters still hold old values.
        sqlx::query(
            "UPDATE procedures SET \
             execution_count = execution_count + 1, \
             success_count = success_count + ?, \
             avg_duration_ms = avg_duration_ms + ((? - avg_duration_ms) / (execution_count + 1)), \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(success_increment)
        .bind(episode.duration_ms())
        .bind(now)
        .bind(procedure_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn create_draft(
        &self,
        agent_id: &str,
        action_name: &str,
        seed_cluster: &[&Episode],
        config: &ConsolidationConfig,
        now: DateTime<Utc>,
    ) -> Result<Procedure> {
        let cluster_size = seed_cluster.len();
        let procedure = Procedure {
            id: uuid::Uuid::new_v4().to_string(),
            name: action_name.to_owned(),
            owner_agent: agent_id.to_owned(),
            action_name: action_name.to_owned(),
            steps: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            execution_count: 0,
            success_count: 0,
            avg_duration_ms: 0.0,
            status: ProcedureStatus::Draft,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO procedures (id, name, owner_agent, action_name, steps, preconditions, \
             postconditions, execution_count, success_count, avg_duration_ms, status, version, \
             created_at, updated_at) VALUES (?, ?, ?, ?, '[]', '[]', '[]', 0, 0, 0.0, 'draft', 1, ?, ?)",
        )
        .bind(&procedure.id)
        .bind(&procedure.name)
        .bind(&procedure.owner_agent)
        .bind(&procedure.action_name)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        // Consolidation also feeds the knowledge store: the new procedure is
        // itself a durable piece of episodic knowledge, linked by provenance.
        let representative = seed_cluster
            .first()
            .map(|episode| episode.context_summary.as_str())
            .unwrap_or_default();
        self.knowledge
            .insert_chunk(
                SourceType::Episode,
                Some(&procedure.id),
                &format!(
                    "{agent_id} learned a repeatable {action_name} procedure from \
                     {cluster_size} episodes: {representative}"
                ),
                None,
                config.procedure_chunk_importance,
                now,
            )
            .await?;

        tracing::info!(
            procedure_id = %procedure.id,
            %agent_id,
            %action_name,
            cluster_size,
            "created draft procedure"
        );
        Ok(procedure)
    }

    /// Trailing-window deprecation check: enough folded episodes in the
    /// window and a success rate under the floor.
    async fn should_deprecate(
        &self,
        procedure: &Procedure,
        config: &ConsolidationConfig,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if procedure.status == ProcedureStatus::Deprecated {
            return Ok(false);
        }

        let cutoff = now - chrono::Duration::days(config.deprecate_window_days);
        let (total, successes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN e.outcome = 'success' THEN 1 ELSE 0 END), 0) \
             FROM procedure_episodes pe JOIN episodes e ON e.id = pe.episode_id \
             WHERE pe.procedure_id = ? AND e.ended_at >= ?",
        )
        .bind(&procedure.id)
        .bind(cutoff)
        .fetch_one(self.store.pool())
        .await?;

        if (total as usize) < config.min_episodes {
            return Ok(false);
        }
        Ok((successes as f64 / total as f64) < config.deprecate_floor)
    }

    async fn set_status(
        &self,
        procedure_id: &str,
        status: ProcedureStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE procedures SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now)
            .bind(procedure_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    // -- Accessors ----------------------------------------------------------

    pub async fn get_procedure(&self, id: &str) -> Result<Procedure> {
        let row = sqlx::query("SELECT * FROM procedures WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| WardenError::not_found("procedure", id))?;
        parse_procedure_row(&row)
    }

    /// The procedure owning a key's action signature, if one exists.
    pub async fn procedure_for_key(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Option<Procedure>> {
        let row = sqlx::query(
            "SELECT * FROM procedures WHERE owner_agent = ? AND action_name = ? \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref().map(parse_procedure_row).transpose()
    }

    /// Episode ids already folded into a procedure.
    pub async fn learned_from(&self, procedure_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT episode_id FROM procedure_episodes WHERE procedure_id = ? \
             ORDER BY folded_at ASC, episode_id ASC",
        )
        .bind(procedure_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Replace a procedure's step sequence. Bumps the version.
    pub async fn set_steps(
        &self,
        procedure_id: &str,
        steps: &[String],
        now: DateTime<Utc>,
    ) -> Result<Procedure> {
        let steps_json = serde_json::to_string(steps)
            .map_err(|error| WardenError::Validation(format!("unencodable steps: {error}")))?;

        let result = sqlx::query(
            "UPDATE procedures SET steps = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(&steps_json)
        .bind(now)
        .bind(procedure_id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(WardenError::not_found("procedure", procedure_id));
        }
        self.get_procedure(procedure_id).await
    }
}

impl std::fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consolidator").finish_non_exhaustive()
    }
}

fn parse_procedure_row(row: &sqlx::sqlite::SqliteRow) -> Result<Procedure> {
    let status_raw: String = row.try_get("status")?;
    let status = ProcedureStatus::parse(&status_raw)
        .ok_or_else(|| WardenError::Validation(format!("unknown procedure status: {status_raw}")))?;

    let steps: Vec<String> = parse_json_list(row.try_get("steps")?)?;
    let preconditions: Vec<String> = parse_json_list(row.try_get("preconditions")?)?;
    let postconditions: Vec<String> = parse_json_list(row.try_get("postconditions")?)?;

    Ok(Procedure {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_agent: row.try_get("owner_agent")?,
        action_name: row.try_get("action_name")?,
        steps,
        preconditions,
        postconditions,
        execution_count: row.try_get("execution_count")?,
        success_count: row.try_get("success_count")?,
        avg_duration_ms: row.try_get("avg_duration_ms")?,
        status,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_json_list(json: String) -> Result<Vec<String>> {
    serde_json::from_str(&json)
        .map_err(|error| WardenError::Validation(format!("corrupt list column: {error}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodes::Outcome;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    struct Fixture {
        store: Arc<WardenStore>,
        log: EpisodeLog,
        claims: KeyClaims,
        consolidator: Consolidator,
    }

    async fn fixture() -> Fixture {
        let store = WardenStore::connect_in_memory().await.unwrap();
        let claims = KeyClaims::new();
        Fixture {
            log: EpisodeLog::new(store.clone()),
            consolidator: Consolidator::new(store.clone(), claims.clone()),
            claims,
            store,
        }
    }

    async fn record_n(
        fixture: &Fixture,
        agent: &str,
        action: &str,
        summary: &str,
        outcomes: &[Outcome],
        duration_secs: i64,
    ) {
        for (i, outcome) in outcomes.iter().enumerate() {
            let started = t0() + Duration::minutes(i as i64);
            fixture
                .log
                .record(
                    agent,
                    action,
                    *outcome,
                    0.5,
                    summary,
                    started,
                    started + Duration::seconds(duration_secs),
                )
                .await
                .unwrap();
        }
    }

    // --- signatures and clustering ---

    #[test]
    fn signature_tokens_normalize_case_and_punctuation() {
        let tokens = signature_tokens("Timeout: SMTP relay refused, retrying!");
        assert!(tokens.contains("timeout"));
        assert!(tokens.contains("smtp"));
        assert!(tokens.contains("retrying"));
        assert!(!tokens.contains(""));
    }

    #[test]
    fn jaccard_full_and_zero_overlap() {
        let a = signature_tokens("alpha beta gamma");
        assert_eq!(jaccard(&a, &a), 1.0);

        let b = signature_tokens("delta epsilon");
        assert_eq!(jaccard(&a, &b), 0.0);

        let empty = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);
    }

    #[tokio::test]
    async fn clustering_separates_dissimilar_signatures() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "smtp timeout while relaying", &[Outcome::Failure; 3], 1).await;
        record_n(&fixture, "a1", "x", "quota exceeded on mailbox", &[Outcome::Failure; 2], 1).await;

        let episodes = fixture.log.unfolded(100).await.unwrap();
        let clusters = cluster_episodes(&episodes, 0.25);
        assert_eq!(clusters.len(), 2);
        let mut sizes: Vec<usize> = clusters.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 3]);
    }

    // --- creation / folding ---

    #[tokio::test]
    async fn ten_episodes_eight_success_yield_draft_procedure() {
        let fixture = fixture().await;
        let mut outcomes = vec![Outcome::Success; 8];
        outcomes.extend([Outcome::Failure, Outcome::Failure]);
        record_n(&fixture, "a1", "summarize_doc", "summarized the document", &outcomes, 2).await;

        let report = fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.procedures_created, 1);
        assert_eq!(report.folded, 10);

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "summarize_doc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(procedure.execution_count, 10);
        assert_eq!(procedure.success_count, 8);
        assert!((procedure.success_rate() - 0.8).abs() < 1e-9);
        // Below the >= 20 execution promotion threshold.
        assert_eq!(procedure.status, ProcedureStatus::Draft);
        assert!((procedure.avg_duration_ms - 2000.0).abs() < 1e-6);

        let learned = fixture.consolidator.learned_from(&procedure.id).await.unwrap();
        assert_eq!(learned.len(), 10);
    }

    #[tokio::test]
    async fn below_min_episodes_creates_nothing() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 4], 1).await;

        let report = fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0())
            .await
            .unwrap();

        assert_eq!(report.procedures_created, 0);
        assert_eq!(report.folded, 0);
        assert!(fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rerunning_consolidation_never_double_counts() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 6], 1).await;
        let config = ConsolidationConfig::default();

        fixture.consolidator.run(&config, t0()).await.unwrap();
        let first = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();

        let report = fixture.consolidator.run(&config, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.folded, 0);
        assert_eq!(report.procedures_created, 0);

        let second = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.execution_count, first.execution_count);
        assert_eq!(second.success_count, first.success_count);
        assert_eq!(second.avg_duration_ms, first.avg_duration_ms);
    }

    #[tokio::test]
    async fn later_episodes_fold_into_existing_procedure_below_min() {
        let fixture = fixture().await;
        let config = ConsolidationConfig::default();

        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 5], 1).await;
        fixture.consolidator.run(&config, t0()).await.unwrap();

        // Two more episodes, fewer than min_episodes; the existing procedure
        // still absorbs them.
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Failure; 2], 1).await;
        let report = fixture.consolidator.run(&config, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.folded, 2);

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(procedure.execution_count, 7);
        assert_eq!(procedure.success_count, 5);
    }

    #[tokio::test]
    async fn promotion_at_twenty_executions() {
        let fixture = fixture().await;
        let config = ConsolidationConfig::default();
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 20], 1).await;

        let report = fixture.consolidator.run(&config, t0()).await.unwrap();
        assert_eq!(report.promoted, 1);

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(procedure.status, ProcedureStatus::Active);
    }

    #[tokio::test]
    async fn deprecation_when_trailing_success_rate_under_floor() {
        let fixture = fixture().await;
        let config = ConsolidationConfig::default();
        let mut outcomes = vec![Outcome::Success; 2];
        outcomes.extend(vec![Outcome::Failure; 6]);
        record_n(&fixture, "a1", "x", "same summary", &outcomes, 1).await;

        let report = fixture.consolidator.run(&config, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.deprecated, 1);

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(procedure.status, ProcedureStatus::Deprecated);
    }

    #[tokio::test]
    async fn held_claim_defers_the_key() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 6], 1).await;

        let _held = fixture.claims.try_claim("a1", "x").unwrap();
        let report = fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0())
            .await
            .unwrap();

        assert_eq!(report.keys_deferred, 1);
        assert_eq!(report.folded, 0);
        assert!(fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn set_steps_bumps_version_only_on_step_change() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 5], 1).await;
        fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0())
            .await
            .unwrap();

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(procedure.version, 1);

        let steps = vec!["open mailbox".to_string(), "draft reply".to_string()];
        let updated = fixture
            .consolidator
            .set_steps(&procedure.id, &steps, t0() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.steps, steps);

        let missing = fixture
            .consolidator
            .set_steps("no-such-procedure", &steps, t0())
            .await;
        assert!(matches!(missing, Err(WardenError::NotFound { .. })));
    }

    #[tokio::test]
    async fn new_procedure_writes_a_knowledge_chunk() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 5], 1).await;
        fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0())
            .await
            .unwrap();

        let procedure = fixture
            .consolidator
            .procedure_for_key("a1", "x")
            .await
            .unwrap()
            .unwrap();

        let (source_type, importance): (String, f64) = sqlx::query_as(
            "SELECT source_type, importance FROM knowledge_chunks WHERE source_id = ?",
        )
        .bind(&procedure.id)
        .fetch_one(fixture.store.pool())
        .await
        .unwrap();
        assert_eq!(source_type, "episode");
        assert!((importance - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn distinct_keys_consolidate_in_one_pass() {
        let fixture = fixture().await;
        record_n(&fixture, "a1", "x", "same summary", &[Outcome::Success; 5], 1).await;
        record_n(&fixture, "a2", "y", "other summary", &[Outcome::Success; 5], 1).await;

        let report = fixture
            .consolidator
            .run(&ConsolidationConfig::default(), t0())
            .await
            .unwrap();
        assert_eq!(report.procedures_created, 2);
        assert_eq!(report.folded, 10);

        // The claim table is empty again after the pass.
        assert!(!fixture.claims.is_held("a1", "x"));
        assert!(!fixture.claims.is_held("a2", "y"));
    }
}
