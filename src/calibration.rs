//! Confidence calibration: reported confidence vs. real outcomes.
//!
//! Over a sliding window, for each (agent, action) pair with outcome data,
//! compares the confidence the agent reported before acting with what
//! actually happened. Results are appended to an immutable history so trend
//! queries across calculation runs stay possible. Windows with too few
//! samples produce an explicit insufficient-data record — downstream
//! consumers must treat that distinctly from a real error of zero.

use crate::episodes::{Episode, EpisodeLog};
use crate::error::{Result, WardenError};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Calibration engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CalibrationConfig {
    /// Sliding window length in days.
    pub window_days: i64,
    /// Minimum episodes in the window before numbers are reported.
    pub min_sample: u64,
    /// Per-episode gap beyond which an episode counts as over/underconfident.
    pub confidence_gap_threshold: f64,
    /// Cap on the magnitude of the suggested adjustment.
    pub max_adjustment: f64,
    /// Calibration error at which persistent overconfidence demotes autonomy.
    pub demotion_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            min_sample: 10,
            confidence_gap_threshold: 0.2,
            max_adjustment: 0.25,
            demotion_threshold: 0.25,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One appended calibration calculation for a key.
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub id: String,
    pub agent_id: String,
    pub action_name: String,
    pub window_days: i64,
    pub total_actions: u64,
    pub mean_confidence: f64,
    pub mean_success_rate: f64,
    /// |mean_confidence - mean_success_rate|.
    pub calibration_error: f64,
    pub overconfidence_rate: f64,
    pub underconfidence_rate: f64,
    pub suggested_adjustment: f64,
    pub calculated_at: DateTime<Utc>,
}

/// Calibration answer for a key: real numbers, or an explicit marker that
/// the window held too few samples to say anything.
#[derive(Debug, Clone)]
pub enum Calibration {
    Ready(CalibrationReport),
    InsufficientData {
        agent_id: String,
        action_name: String,
        total_actions: u64,
    },
}

impl Calibration {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }

    /// The report, or an [`WardenError::InsufficientData`] for callers that
    /// need numbers.
    pub fn require_ready(self, required: u64) -> Result<CalibrationReport> {
        match self {
            Self::Ready(report) => Ok(report),
            Self::InsufficientData { total_actions, .. } => Err(WardenError::InsufficientData {
                observed: total_actions,
                required,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowStats {
    pub total: u64,
    pub mean_confidence: f64,
    pub mean_success_rate: f64,
    pub calibration_error: f64,
    pub overconfidence_rate: f64,
    pub underconfidence_rate: f64,
}

/// Window statistics over a non-empty episode slice.
pub(crate) fn window_stats(episodes: &[Episode], gap_threshold: f64) -> WindowStats {
    let total = episodes.len() as u64;
    let n = episodes.len() as f64;

    let mean_confidence =
        episodes.iter().map(|e| e.confidence_at_decision).sum::<f64>() / n;
    let mean_success_rate =
        episodes.iter().filter(|e| e.outcome.is_success()).count() as f64 / n;

    let overconfident = episodes
        .iter()
        .filter(|e| e.confidence_at_decision - e.outcome.as_binary() > gap_threshold)
        .count() as f64;
    let underconfident = episodes
        .iter()
        .filter(|e| e.outcome.as_binary() - e.confidence_at_decision > gap_threshold)
        .count() as f64;

    WindowStats {
        total,
        mean_confidence,
        mean_success_rate,
        calibration_error: (mean_confidence - mean_success_rate).abs(),
        overconfidence_rate: overconfident / n,
        underconfidence_rate: underconfident / n,
    }
}

/// `-sign(mean_confidence - mean_success_rate) * min(error, max_adjustment)`.
///
/// Overconfidence yields a negative adjustment (autonomy should shrink or
/// confidence be discounted), underconfidence a positive one.
pub fn suggested_adjustment(
    mean_confidence: f64,
    mean_success_rate: f64,
    max_adjustment: f64,
) -> f64 {
    let gap = mean_confidence - mean_success_rate;
    if gap == 0.0 {
        return 0.0;
    }
    -gap.signum() * gap.abs().min(max_adjustment)
}

/// Whether a calibration report signals demotion-worthy overconfidence.
pub fn needs_demotion(report: &CalibrationReport, config: &CalibrationConfig) -> bool {
    report.mean_confidence > report.mean_success_rate
        && report.calibration_error >= config.demotion_threshold
}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

/// Result counts from one calibration calculation run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CalibrationRunReport {
    /// Keys with a full numeric record appended.
    pub recorded: usize,
    /// Keys below the sample minimum, tagged insufficient.
    pub insufficient: usize,
}

/// Windowed calibration calculations against the episodic log.
pub struct Calibrator {
    store: Arc<WardenStore>,
    log: EpisodeLog,
}

impl Calibrator {
    pub fn new(store: Arc<WardenStore>) -> Self {
        let log = EpisodeLog::new(store.clone());
        Self { store, log }
    }

    /// Run one calculation pass over every key with window data. Appends one
    /// record per key; never overwrites prior records.
    pub async fn run(
        &self,
        config: &CalibrationConfig,
        now: DateTime<Utc>,
    ) -> Result<CalibrationRunReport> {
        let since = now - chrono::Duration::days(config.window_days);
        let keys = self.log.keys_since(since).await?;

        let mut report = CalibrationRunReport::default();
        for (agent_id, action_name) in keys {
            match self.calibrate_key(&agent_id, &action_name, config, now).await {
                Ok(Calibration::Ready(_)) => report.recorded += 1,
                Ok(Calibration::InsufficientData { .. }) => report.insufficient += 1,
                Err(error) => {
                    tracing::warn!(%error, %agent_id, %action_name, "calibration failed for key");
                }
            }
        }

        tracing::debug!(
            recorded = report.recorded,
            insufficient = report.insufficient,
            "calibration run complete"
        );
        Ok(report)
    }

    /// Calculate and append one calibration record for a key.
    pub async fn calibrate_key(
        &self,
        agent_id: &str,
        action_name: &str,
        config: &CalibrationConfig,
        now: DateTime<Utc>,
    ) -> Result<Calibration> {
        let since = now - chrono::Duration::days(config.window_days);
        let episodes = self.log.in_window(agent_id, action_name, since).await?;
        let total = episodes.len() as u64;

        if total < config.min_sample {
            self.append_insufficient(agent_id, action_name, config, total, now).await?;
            return Ok(Calibration::InsufficientData {
                agent_id: agent_id.to_owned(),
                action_name: action_name.to_owned(),
                total_actions: total,
            });
        }

        let stats = window_stats(&episodes, config.confidence_gap_threshold);
        let report = CalibrationReport {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            action_name: action_name.to_owned(),
            window_days: config.window_days,
            total_actions: stats.total,
            mean_confidence: stats.mean_confidence,
            mean_success_rate: stats.mean_success_rate,
            calibration_error: stats.calibration_error,
            overconfidence_rate: stats.overconfidence_rate,
            underconfidence_rate: stats.underconfidence_rate,
            suggested_adjustment: suggested_adjustment(
                stats.mean_confidence,
                stats.mean_success_rate,
                config.max_adjustment,
            ),
            calculated_at: now,
        };

        sqlx::query(
            "INSERT INTO calibration_records (id, agent_id, action_name, window_days, \
             total_actions, insufficient_data, mean_confidence, mean_success_rate, \
             calibration_error, overconfidence_rate, underconfidence_rate, \
             suggested_adjustment, calculated_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&report.id)
        .bind(&report.agent_id)
        .bind(&report.action_name)
        .bind(report.window_days)
        .bind(report.total_actions as i64)
        .bind(report.mean_confidence)
        .bind(report.mean_success_rate)
        .bind(report.calibration_error)
        .bind(report.overconfidence_rate)
        .bind(report.underconfidence_rate)
        .bind(report.suggested_adjustment)
        .bind(report.calculated_at)
        .execute(self.store.pool())
        .await?;

        Ok(Calibration::Ready(report))
    }

    async fn append_insufficient(
        &self,
        agent_id: &str,
        action_name: &str,
        config: &CalibrationConfig,
        total: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO calibration_records (id, agent_id, action_name, window_days, \
             total_actions, insufficient_data, calculated_at) VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(agent_id)
        .bind(action_name)
        .bind(config.window_days)
        .bind(total as i64)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// The most recent calibration answer for a key. A key with no history
    /// at all is insufficient data by definition.
    pub async fn latest(&self, agent_id: &str, action_name: &str) -> Result<Calibration> {
        let row = sqlx::query(
            "SELECT * FROM calibration_records WHERE agent_id = ? AND action_name = ? \
             ORDER BY calculated_at DESC, id DESC LIMIT 1",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(row) = row else {
            return Ok(Calibration::InsufficientData {
                agent_id: agent_id.to_owned(),
                action_name: action_name.to_owned(),
                total_actions: 0,
            });
        };
        parse_calibration_row(&row)
    }

    /// Full calibration history for a key, oldest first.
    pub async fn history(&self, agent_id: &str, action_name: &str) -> Result<Vec<Calibration>> {
        let rows = sqlx::query(
            "SELECT * FROM calibration_records WHERE agent_id = ? AND action_name = ? \
             ORDER BY calculated_at ASC, id ASC",
        )
        .bind(agent_id)
        .bind(action_name)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_calibration_row(&row) {
                Ok(calibration) => out.push(calibration),
                Err(error) => tracing::warn!(%error, "skipping malformed calibration row"),
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Calibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calibrator").finish_non_exhaustive()
    }
}

fn parse_calibration_row(row: &sqlx::sqlite::SqliteRow) -> Result<Calibration> {
    let insufficient: i64 = row.try_get("insufficient_data")?;
    let agent_id: String = row.try_get("agent_id")?;
    let action_name: String = row.try_get("action_name")?;
    let total_actions: i64 = row.try_get("total_actions")?;

    if insufficient != 0 {
        return Ok(Calibration::InsufficientData {
            agent_id,
            action_name,
            total_actions: total_actions as u64,
        });
    }

    Ok(Calibration::Ready(CalibrationReport {
        id: row.try_get("id")?,
        agent_id,
        action_name,
        window_days: row.try_get("window_days")?,
        total_actions: total_actions as u64,
        mean_confidence: row.try_get("mean_confidence")?,
        mean_success_rate: row.try_get("mean_success_rate")?,
        calibration_error: row.try_get("calibration_error")?,
        overconfidence_rate: row.try_get("overconfidence_rate")?,
        underconfidence_rate: row.try_get("underconfidence_rate")?,
        suggested_adjustment: row.try_get("suggested_adjustment")?,
        calculated_at: row.try_get("calculated_at")?,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
