//! Mistake pattern tracker: recurring failure modes with their own lifecycle.
//!
//! Every recorded episode flows through the tracker. Failures are matched
//! against the key's open patterns by similarity over structured trigger
//! conditions; successes advance a clean streak that walks a pattern from
//! `active` through `monitoring` to `resolved`. While a pattern is active,
//! its autonomy adjustment is a live veto consumed by the engine loop.

use crate::episodes::{Episode, Outcome};
use crate::error::{Result, WardenError};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Mistake pattern tracker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MistakeConfig {
    /// Trigger-condition similarity at which a failure matches a pattern.
    pub match_threshold: f64,
    /// Consecutive successes after which an active pattern starts monitoring.
    pub monitoring_after: i64,
    /// Further consecutive successes after which a monitored pattern resolves.
    pub resolved_after: i64,
    /// Autonomy levels subtracted while a pattern is active.
    pub default_adjustment: i64,
    /// Salient context terms captured into trigger conditions.
    pub max_facet_terms: usize,
}

impl Default for MistakeConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            monitoring_after: 5,
            resolved_after: 10,
            default_adjustment: -1,
            max_facet_terms: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger conditions
// ---------------------------------------------------------------------------

/// Payload version written into new trigger-condition blobs.
pub const TRIGGER_CONDITIONS_VERSION: u32 = 1;

/// Versioned structured trigger conditions: a set of key/value facets.
///
/// Replaces the free-text matching of earlier designs with an explicit,
/// testable metric: Jaccard similarity over the facet pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConditions {
    pub version: u32,
    pub facets: BTreeMap<String, String>,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "was", "were", "that", "this", "from", "into", "while", "when",
];

impl TriggerConditions {
    /// Deterministic extraction from an episode: the action name plus the
    /// first distinct salient terms of the context summary.
    pub fn from_episode(episode: &Episode, max_terms: usize) -> Self {
        let mut facets = BTreeMap::new();
        facets.insert("action".to_string(), episode.action_name.clone());

        let mut seen = BTreeSet::new();
        for token in episode
            .context_summary
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(str::to_lowercase)
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
        {
            if seen.len() >= max_terms {
                break;
            }
            if seen.insert(token.clone()) {
                facets.insert(format!("term:{token}"), "1".to_string());
            }
        }

        Self {
            version: TRIGGER_CONDITIONS_VERSION,
            facets,
        }
    }

    fn pairs(&self) -> BTreeSet<(&str, &str)> {
        self.facets
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Jaccard similarity over facet pairs. Two empty payloads are identical.
    pub fn similarity(&self, other: &Self) -> f64 {
        let a = self.pairs();
        let b = other.pairs();
        let union = a.union(&b).count();
        if union == 0 {
            return 1.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|error| WardenError::Validation(format!("unencodable trigger conditions: {error}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|error| WardenError::Validation(format!("corrupt trigger conditions: {error}")))
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Lifecycle state of a mistake pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Active,
    Monitoring,
    Resolved,
}

impl PatternStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "monitoring" => Some(Self::Monitoring),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A recurring, named failure mode.
#[derive(Debug, Clone)]
pub struct MistakePattern {
    pub id: String,
    pub agent_id: String,
    pub action_name: String,
    pub description: String,
    pub category: String,
    pub trigger_conditions: TriggerConditions,
    pub occurrence_count: i64,
    /// Consecutive successes for the key since the last matching failure.
    pub clean_streak: i64,
    pub status: PatternStatus,
    /// Negative: levels subtracted while the pattern is active.
    pub autonomy_adjustment: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Coarse failure category derived from the context summary.
pub fn categorize(summary: &str) -> &'static str {
    let lower = summary.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("denied") || lower.contains("permission") || lower.contains("forbidden") {
        "permissions"
    } else if lower.contains("invalid") || lower.contains("malformed") || lower.contains("missing") {
        "validation"
    } else if lower.contains("rate limit") || lower.contains("quota") {
        "throttling"
    } else {
        "general"
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// What one observed episode did to the key's patterns.
#[derive(Debug, Default)]
pub struct Observation {
    /// Patterns newly created or reactivated by a matching failure. These
    /// carry live autonomy vetoes.
    pub activated: Vec<MistakePattern>,
    /// Patterns that moved active -> monitoring on this success.
    pub moved_to_monitoring: usize,
    /// Patterns that auto-resolved on this success.
    pub resolved: usize,
}

/// Failure clustering and lifecycle tracking per (agent, action) key.
pub struct MistakeTracker {
    store: Arc<WardenStore>,
}

impl MistakeTracker {
    pub fn new(store: Arc<WardenStore>) -> Self {
        Self { store }
    }

    /// Feed one recorded episode through the tracker.
    pub async fn observe(
        &self,
        episode: &Episode,
        config: &MistakeConfig,
        now: DateTime<Utc>,
    ) -> Result<Observation> {
        match episode.outcome {
            Outcome::Failure => self.observe_failure(episode, config, now).await,
            Outcome::Success => self.observe_success(episode, config, now).await,
            // A partial outcome is not a failure worth a pattern, but it is
            // not a clean run either: the streak starts over.
            Outcome::Partial => {
                sqlx::query(
                    "UPDATE mistake_patterns SET clean_streak = 0 \
                     WHERE agent_id = ? AND action_name = ? AND status != 'resolved'",
                )
                .bind(&episode.agent_id)
                .bind(&episode.action_name)
                .execute(self.store.pool())
                .await?;
                Ok(Observation::default())
            }
        }
    }

    async fn observe_failure(
        &self,
        episode: &Episode,
        config: &MistakeConfig,
        now: DateTime<Utc>,
    ) -> Result<Observation> {
        let conditions = TriggerConditions::from_episode(episode, config.max_facet_terms);
        let open = self
            .open_patterns(&episode.agent_id, &episode.action_name)
            .await?;

        let best = open
            .iter()
            .map(|pattern| (pattern, pattern.trigger_conditions.similarity(&conditions)))
            .filter(|(_, similarity)| *similarity >= config.match_threshold)
            .max_by(|(_, a), (_, b)| a.total_cmp(b));

        let mut observation = Observation::default();

        if let Some((matched, similarity)) = best {
            let reactivated = matched.status == PatternStatus::Monitoring;
            sqlx::query(
                "UPDATE mistake_patterns SET occurrence_count = occurrence_count + 1, \
                 clean_streak = 0, status = 'active', last_seen_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(&matched.id)
            .execute(self.store.pool())
            .await?;

            tracing::info!(
                pattern_id = %matched.id,
                agent_id = %episode.agent_id,
                action_name = %episode.action_name,
                similarity,
                reactivated,
                "failure matched mistake pattern"
            );
            observation.activated.push(self.get(&matched.id).await?);
            return Ok(observation);
        }

        let pattern = MistakePattern {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: episode.agent_id.clone(),
            action_name: episode.action_name.clone(),
            description: format!(
                "recurring failure in {}: {}",
                episode.action_name,
                truncate(&episode.context_summary, 120)
            ),
            category: categorize(&episode.context_summary).to_string(),
            trigger_conditions: conditions,
            occurrence_count: 1,
            clean_streak: 0,
            status: PatternStatus::Active,
            autonomy_adjustment: config.default_adjustment,
            first_seen_at: now,
            last_seen_at: now,
            resolution_notes: None,
            resolved_at: None,
        };

        sqlx::query(
            "INSERT INTO mistake_patterns (id, agent_id, action_name, description, category, \
             trigger_conditions, occurrence_count, clean_streak, status, autonomy_adjustment, \
             first_seen_at, last_seen_at) VALUES (?, ?, ?, ?, ?, ?, 1, 0, 'active', ?, ?, ?)",
        )
        .bind(&pattern.id)
        .bind(&pattern.agent_id)
        .bind(&pattern.action_name)
        .bind(&pattern.description)
        .bind(&pattern.category)
        .bind(pattern.trigger_conditions.to_json()?)
        .bind(pattern.autonomy_adjustment)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        tracing::info!(
            pattern_id = %pattern.id,
            agent_id = %pattern.agent_id,
            action_name = %pattern.action_name,
            category = %pattern.category,
            "opened new mistake pattern"
        );
        observation.activated.push(pattern);
        Ok(observation)
    }

    async fn observe_success(
        &self,
        episode: &Episode,
        config: &MistakeConfig,
        now: DateTime<Utc>,
    ) -> Result<Observation> {
        let open = self
            .open_patterns(&episode.agent_id, &episode.action_name)
            .await?;

        let mut observation = Observation::default();

        for pattern in open {
            let streak = pattern.clean_streak + 1;
            match pattern.status {
                PatternStatus::Active if streak >= config.monitoring_after => {
                    // The streak restarts: resolution needs this many more.
                    sqlx::query(
                        "UPDATE mistake_patterns SET status = 'monitoring', clean_streak = 0 \
                         WHERE id = ?",
                    )
                    .bind(&pattern.id)
                    .execute(self.store.pool())
                    .await?;
                    observation.moved_to_monitoring += 1;
                    tracing::info!(pattern_id = %pattern.id, "mistake pattern moved to monitoring");
                }
                PatternStatus::Monitoring if streak >= config.resolved_after => {
                    sqlx::query(
                        "UPDATE mistake_patterns SET status = 'resolved', clean_streak = ?, \
                         resolution_notes = ?, resolved_at = ? WHERE id = ?",
                    )
                    .bind(streak)
                    .bind(format!(
                        "auto-resolved after {} consecutive successes in monitoring",
                        config.resolved_after
                    ))
                    .bind(now)
                    .bind(&pattern.id)
                    .execute(self.store.pool())
                    .await?;
                    observation.resolved += 1;
                    tracing::info!(pattern_id = %pattern.id, "mistake pattern auto-resolved");
                }
                _ => {
                    sqlx::query("UPDATE mistake_patterns SET clean_streak = ? WHERE id = ?")
                        .bind(streak)
                        .bind(&pattern.id)
                        .execute(self.store.pool())
                        .await?;
                }
            }
        }

        Ok(observation)
    }

    /// Manual resolution from the operator surface.
    pub async fn resolve(&self, pattern_id: &str, notes: &str, now: DateTime<Utc>) -> Result<()> {
        let pattern = self.get(pattern_id).await?;
        if pattern.status == PatternStatus::Resolved {
            return Err(WardenError::Validation(format!(
                "pattern {pattern_id} is already resolved"
            )));
        }

        sqlx::query(
            "UPDATE mistake_patterns SET status = 'resolved', resolution_notes = ?, resolved_at = ? \
             WHERE id = ?",
        )
        .bind(notes)
        .bind(now)
        .bind(pattern_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Patterns currently vetoing a key, for the dispatch layer.
    pub async fn active_patterns(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Vec<MistakePattern>> {
        self.patterns_with_status(agent_id, action_name, &["active"]).await
    }

    /// Active and monitoring patterns for a key.
    async fn open_patterns(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Vec<MistakePattern>> {
        self.patterns_with_status(agent_id, action_name, &["active", "monitoring"])
            .await
    }

    async fn patterns_with_status(
        &self,
        agent_id: &str,
        action_name: &str,
        statuses: &[&str],
    ) -> Result<Vec<MistakePattern>> {
        // statuses is a fixed internal list; build the placeholders.
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM mistake_patterns WHERE agent_id = ? AND action_name = ? \
             AND status IN ({placeholders}) ORDER BY first_seen_at ASC, id ASC"
        );

        let mut query = sqlx::query(&sql).bind(agent_id).bind(action_name);
        for status in statuses {
            query = query.bind(*status);
        }
        let rows = query.fetch_all(self.store.pool()).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_pattern_row(&row) {
                Ok(pattern) => out.push(pattern),
                Err(error) => tracing::warn!(%error, "skipping malformed pattern row"),
            }
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<MistakePattern> {
        let row = sqlx::query("SELECT * FROM mistake_patterns WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| WardenError::not_found("mistake pattern", id))?;
        parse_pattern_row(&row)
    }
}

impl std::fmt::Debug for MistakeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MistakeTracker").finish_non_exhaustive()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn parse_pattern_row(row: &sqlx::sqlite::SqliteRow) -> Result<MistakePattern> {
    let status_raw: String = row.try_get("status")?;
    let status = PatternStatus::parse(&status_raw)
        .ok_or_else(|| WardenError::Validation(format!("unknown pattern status: {status_raw}")))?;

    let conditions_json: String = row.try_get("trigger_conditions")?;

    Ok(MistakePattern {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        action_name: row.try_get("action_name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        trigger_conditions: TriggerConditions::from_json(&conditions_json)?,
        occurrence_count: row.try_get("occurrence_count")?,
        clean_streak: row.try_get("clean_streak")?,
        status,
        autonomy_adjustment: row.try_get("autonomy_adjustment")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        resolution_notes: row.try_get("resolution_notes")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodes::EpisodeLog;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    struct Fixture {
        log: EpisodeLog,
        tracker: MistakeTracker,
        config: MistakeConfig,
    }

    async fn fixture() -> Fixture {
        let store = WardenStore::connect_in_memory().await.unwrap();
        Fixture {
            log: EpisodeLog::new(store.clone()),
            tracker: MistakeTracker::new(store),
            config: MistakeConfig::default(),
        }
    }

    async fn episode(fixture: &Fixture, outcome: Outcome, summary: &str) -> Episode {
        fixture
            .log
            .record("a1", "send_email", outcome, 0.7, summary, t0(), t0() + Duration::seconds(3))
            .await
            .unwrap()
    }

    async fn observe(fixture: &Fixture, outcome: Outcome, summary: &str) -> Observation {
        let ep = episode(fixture, outcome, summary).await;
        fixture.tracker.observe(&ep, &fixture.config, t0()).await.unwrap()
    }

    // --- trigger conditions ---

    #[test]
    fn extractor_is_deterministic_and_versioned() {
        let make = |summary: &str| Episode {
            id: "e".into(),
            agent_id: "a1".into(),
            action_name: "send_email".into(),
            outcome: Outcome::Failure,
            confidence_at_decision: 0.5,
            context_summary: summary.into(),
            started_at: t0(),
            ended_at: t0(),
            recorded_at: t0(),
        };

        let a = TriggerConditions::from_episode(&make("SMTP relay timeout, the retry failed"), 8);
        let b = TriggerConditions::from_episode(&make("SMTP relay timeout, the retry failed"), 8);
        assert_eq!(a, b);
        assert_eq!(a.version, TRIGGER_CONDITIONS_VERSION);
        assert_eq!(a.facets.get("action").map(String::as_str), Some("send_email"));
        // Stopwords and short tokens never become facets.
        assert!(!a.facets.contains_key("term:the"));
        assert!(a.facets.contains_key("term:timeout"));
    }

    #[test]
    fn similarity_is_jaccard_over_facet_pairs() {
        let mut a = BTreeMap::new();
        a.insert("action".to_string(), "x".to_string());
        a.insert("term:timeout".to_string(), "1".to_string());
        a.insert("term:smtp".to_string(), "1".to_string());
        let a = TriggerConditions { version: 1, facets: a };

        let mut b = BTreeMap::new();
        b.insert("action".to_string(), "x".to_string());
        b.insert("term:timeout".to_string(), "1".to_string());
        b.insert("term:quota".to_string(), "1".to_string());
        let b = TriggerConditions { version: 1, facets: b };

        // intersection 2, union 4.
        assert!((a.similarity(&b) - 0.5).abs() < 1e-9);
        assert_eq!(a.similarity(&a), 1.0);
    }

    #[test]
    fn categorize_covers_known_failure_families() {
        assert_eq!(categorize("connection timed out"), "timeout");
        assert_eq!(categorize("permission denied by relay"), "permissions");
        assert_eq!(categorize("invalid recipient address"), "validation");
        assert_eq!(categorize("hit the rate limit"), "throttling");
        assert_eq!(categorize("something odd happened"), "general");
    }

    // --- failure matching ---

    #[tokio::test]
    async fn first_failure_opens_an_active_pattern() {
        let fixture = fixture().await;
        let observation = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;

        assert_eq!(observation.activated.len(), 1);
        let pattern = &observation.activated[0];
        assert_eq!(pattern.status, PatternStatus::Active);
        assert_eq!(pattern.occurrence_count, 1);
        assert_eq!(pattern.autonomy_adjustment, -1);

        let active = fixture.tracker.active_patterns("a1", "send_email").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn similar_failure_increments_existing_pattern() {
        let fixture = fixture().await;
        observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let observation =
            observe(&fixture, Outcome::Failure, "smtp relay timeout on send again").await;

        assert_eq!(observation.activated.len(), 1);
        assert_eq!(observation.activated[0].occurrence_count, 2);

        let active = fixture.tracker.active_patterns("a1", "send_email").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn dissimilar_failure_opens_a_second_pattern() {
        let fixture = fixture().await;
        observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        observe(&fixture, Outcome::Failure, "recipient mailbox quota exceeded hard bounce").await;

        let active = fixture.tracker.active_patterns("a1", "send_email").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    // --- lifecycle ---

    #[tokio::test]
    async fn five_successes_move_active_to_monitoring() {
        let fixture = fixture().await;
        observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;

        for i in 0..4 {
            let observation = observe(&fixture, Outcome::Success, "sent").await;
            assert_eq!(observation.moved_to_monitoring, 0, "after success {}", i + 1);
        }
        let observation = observe(&fixture, Outcome::Success, "sent").await;
        assert_eq!(observation.moved_to_monitoring, 1);

        // No longer an active veto, but not resolved either.
        assert!(fixture.tracker.active_patterns("a1", "send_email").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn matching_failure_during_monitoring_reactivates() {
        let fixture = fixture().await;
        let opened = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let pattern_id = opened.activated[0].id.clone();

        for _ in 0..5 {
            observe(&fixture, Outcome::Success, "sent").await;
        }
        assert_eq!(
            fixture.tracker.get(&pattern_id).await.unwrap().status,
            PatternStatus::Monitoring
        );

        let observation = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        assert_eq!(observation.activated.len(), 1);
        assert_eq!(observation.activated[0].id, pattern_id);
        assert_eq!(observation.activated[0].status, PatternStatus::Active);
        assert_eq!(observation.activated[0].occurrence_count, 2);
    }

    #[tokio::test]
    async fn ten_further_successes_resolve_a_monitored_pattern() {
        let fixture = fixture().await;
        let opened = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let pattern_id = opened.activated[0].id.clone();

        // 5 to reach monitoring, then 10 more to resolve.
        for _ in 0..5 {
            observe(&fixture, Outcome::Success, "sent").await;
        }
        for i in 0..9 {
            let observation = observe(&fixture, Outcome::Success, "sent").await;
            assert_eq!(observation.resolved, 0, "after monitored success {}", i + 1);
        }
        let observation = observe(&fixture, Outcome::Success, "sent").await;
        assert_eq!(observation.resolved, 1);

        let pattern = fixture.tracker.get(&pattern_id).await.unwrap();
        assert_eq!(pattern.status, PatternStatus::Resolved);
        assert!(pattern.resolved_at.is_some());
        assert!(pattern.resolution_notes.unwrap().contains("auto-resolved"));
    }

    #[tokio::test]
    async fn partial_outcome_restarts_the_streak() {
        let fixture = fixture().await;
        let opened = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let pattern_id = opened.activated[0].id.clone();

        for _ in 0..4 {
            observe(&fixture, Outcome::Success, "sent").await;
        }
        observe(&fixture, Outcome::Partial, "sent to some recipients").await;
        assert_eq!(fixture.tracker.get(&pattern_id).await.unwrap().clean_streak, 0);

        // One more success is not enough any more.
        let observation = observe(&fixture, Outcome::Success, "sent").await;
        assert_eq!(observation.moved_to_monitoring, 0);
        assert_eq!(
            fixture.tracker.get(&pattern_id).await.unwrap().status,
            PatternStatus::Active
        );
    }

    // --- manual resolution ---

    #[tokio::test]
    async fn manual_resolution_records_notes_and_time() {
        let fixture = fixture().await;
        let opened = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let pattern_id = opened.activated[0].id.clone();

        fixture
            .tracker
            .resolve(&pattern_id, "relay credentials rotated", t0() + Duration::hours(1))
            .await
            .unwrap();

        let pattern = fixture.tracker.get(&pattern_id).await.unwrap();
        assert_eq!(pattern.status, PatternStatus::Resolved);
        assert_eq!(pattern.resolution_notes.as_deref(), Some("relay credentials rotated"));
        assert_eq!(pattern.resolved_at, Some(t0() + Duration::hours(1)));

        // Resolving twice is a validation error; resolving a ghost is not found.
        assert!(matches!(
            fixture.tracker.resolve(&pattern_id, "again", t0()).await,
            Err(WardenError::Validation(_))
        ));
        assert!(matches!(
            fixture.tracker.resolve("no-such-pattern", "x", t0()).await,
            Err(WardenError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolved_patterns_never_match_new_failures() {
        let fixture = fixture().await;
        let opened = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        let pattern_id = opened.activated[0].id.clone();
        fixture.tracker.resolve(&pattern_id, "fixed", t0()).await.unwrap();

        let observation = observe(&fixture, Outcome::Failure, "smtp relay timeout on send").await;
        assert_eq!(observation.activated.len(), 1);
        assert_ne!(observation.activated[0].id, pattern_id);
    }
}
