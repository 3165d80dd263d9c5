//! Warden engine: async coordinator for the governance batch passes.
//!
//! Runs decay, consolidation, and calibration on independent schedules and
//! drains newly recorded episodes through the mistake tracker each tick.
//! All periodic work is fail-open: errors are logged and the loop keeps
//! running. The demotion signals it evaluates, by contrast, go through the
//! autonomy ledger's all-or-nothing writes.

use crate::autonomy::{AutonomyLedger, Evidence};
use crate::calibration::{needs_demotion, Calibration, Calibrator};
use crate::claims::KeyClaims;
use crate::config::WardenConfig;
use crate::consolidation::Consolidator;
use crate::decay::run_decay;
use crate::episodes::EpisodeLog;
use crate::error::Result;
use crate::mistakes::MistakeTracker;
use crate::store::WardenStore;

use chrono::Utc;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// State key holding the episode rowid cursor for the mistake pass.
const MISTAKE_CURSOR_KEY: &str = "mistake_cursor";
/// Episodes drained per mistake pass.
const MISTAKE_BATCH: usize = 128;

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Spawn the governance engine as a background task.
///
/// The loop owns its subsystems; the embedding process keeps using the same
/// store handle for the ingestion and query surfaces.
pub fn spawn_warden_loop(
    store: Arc<WardenStore>,
    config: WardenConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = run_warden_loop(store, config).await {
            tracing::error!(%error, "warden loop exited with error");
        }
    })
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// All subsystems and timers for the engine, kept together so the tick
/// handler can pass a single reference around.
struct EngineState {
    log: EpisodeLog,
    consolidator: Consolidator,
    calibrator: Calibrator,
    tracker: MistakeTracker,
    ledger: AutonomyLedger,
    last_decay: Instant,
    last_consolidation: Instant,
    last_calibration: Instant,
}

impl EngineState {
    fn new(store: &Arc<WardenStore>, config: &WardenConfig) -> Self {
        let now = Instant::now();
        Self {
            log: EpisodeLog::new(store.clone()),
            consolidator: Consolidator::new(store.clone(), KeyClaims::new()),
            calibrator: Calibrator::new(store.clone()),
            tracker: MistakeTracker::new(store.clone()),
            ledger: AutonomyLedger::new(store.clone(), config.max_level),
            last_decay: now,
            last_consolidation: now,
            last_calibration: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

async fn run_warden_loop(store: Arc<WardenStore>, config: WardenConfig) -> Result<()> {
    if !config.enabled {
        tracing::info!("warden engine disabled, loop not starting");
        return Ok(());
    }

    tracing::info!(
        tick_interval_secs = config.tick_interval_secs,
        "warden engine started"
    );

    let mut state = EngineState::new(&store, &config);

    let tick_interval = Duration::from_secs(config.tick_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval(tick_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        heartbeat.tick().await;
        run_tick(&store, &mut state, &config).await;
    }
}

// ---------------------------------------------------------------------------
// Tick handler
// ---------------------------------------------------------------------------

/// Periodic work: heartbeat, mistake pass, then whichever batch engines are
/// due. Every stage is fail-open.
async fn run_tick(store: &Arc<WardenStore>, state: &mut EngineState, config: &WardenConfig) {
    if let Err(error) = store
        .set_state("warden_heartbeat", Utc::now().to_rfc3339())
        .await
    {
        tracing::warn!(%error, "failed to update warden heartbeat");
    }

    if let Err(error) = run_mistake_pass(store, state, config).await {
        tracing::warn!(%error, "mistake pass failed");
    }

    let now = Utc::now();

    if state.last_decay.elapsed() >= Duration::from_secs(config.decay_interval_secs) {
        state.last_decay = Instant::now();
        match run_decay(store, &config.decay, now).await {
            Ok(report) => {
                if report.scored + report.pruned + report.skipped > 0 {
                    tracing::info!(
                        scored = report.scored,
                        pruned = report.pruned,
                        skipped = report.skipped,
                        "decay batch complete"
                    );
                }
            }
            Err(error) => tracing::warn!(%error, "decay batch failed"),
        }
    }

    if state.last_consolidation.elapsed()
        >= Duration::from_secs(config.consolidation_interval_secs)
    {
        state.last_consolidation = Instant::now();
        if let Err(error) = state.consolidator.run(&config.consolidation, now).await {
            tracing::warn!(%error, "consolidation pass failed");
        }
    }

    if state.last_calibration.elapsed() >= Duration::from_secs(config.calibration_interval_secs) {
        state.last_calibration = Instant::now();
        match state.calibrator.run(&config.calibration, now).await {
            Ok(_) => {
                if let Err(error) = apply_calibration_demotions(
                    &state.log,
                    &state.calibrator,
                    &state.ledger,
                    config,
                )
                .await
                {
                    tracing::warn!(%error, "calibration demotion evaluation failed");
                }
            }
            Err(error) => tracing::warn!(%error, "calibration run failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Mistake pass
// ---------------------------------------------------------------------------

/// Result counts from one mistake pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MistakePassReport {
    /// Episodes drained through the tracker.
    pub observed: usize,
    /// Demotions applied from activated patterns.
    pub vetoes_applied: usize,
}

async fn run_mistake_pass(
    store: &Arc<WardenStore>,
    state: &mut EngineState,
    config: &WardenConfig,
) -> Result<MistakePassReport> {
    drain_new_episodes(store, &state.log, &state.tracker, &state.ledger, config).await
}

/// Drain episodes recorded since the cursor through the mistake tracker and
/// apply the autonomy veto of any pattern that came out active.
pub async fn drain_new_episodes(
    store: &Arc<WardenStore>,
    log: &EpisodeLog,
    tracker: &MistakeTracker,
    ledger: &AutonomyLedger,
    config: &WardenConfig,
) -> Result<MistakePassReport> {
    let cursor: i64 = store
        .get_state(MISTAKE_CURSOR_KEY)
        .await?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let batch = log.recorded_after(cursor, MISTAKE_BATCH).await?;
    let mut report = MistakePassReport::default();
    let mut last_seq = cursor;

    for (seq, episode) in batch {
        last_seq = seq;
        let now = Utc::now();

        let observation = match tracker.observe(&episode, &config.mistakes, now).await {
            Ok(observation) => observation,
            Err(error) => {
                tracing::warn!(%error, episode_id = %episode.id, "mistake observation failed");
                continue;
            }
        };
        report.observed += 1;

        for pattern in observation.activated {
            if pattern.autonomy_adjustment >= 0 {
                continue;
            }
            let current = ledger
                .current_level(&pattern.agent_id, &pattern.action_name)
                .await?;
            let target =
                (current as i64 + pattern.autonomy_adjustment).max(0) as u8;

            let evidence = Evidence::new(
                "mistake_pattern",
                &pattern.description,
                serde_json::json!({
                    "pattern_id": pattern.id,
                    "category": pattern.category,
                    "occurrence_count": pattern.occurrence_count,
                    "autonomy_adjustment": pattern.autonomy_adjustment,
                }),
            );

            match ledger
                .auto_demote(
                    &pattern.agent_id,
                    &pattern.action_name,
                    target,
                    "active mistake pattern veto",
                    evidence,
                    now,
                )
                .await
            {
                Ok(Some(transition)) => {
                    report.vetoes_applied += 1;
                    if let Err(error) = store
                        .log_event(
                            "autonomy_demotion",
                            &format!(
                                "{}:{} demoted {} -> {} by pattern {}",
                                pattern.agent_id,
                                pattern.action_name,
                                transition.previous_level,
                                transition.new_level,
                                pattern.id
                            ),
                            None,
                        )
                        .await
                    {
                        tracing::warn!(%error, "failed to audit demotion");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, pattern_id = %pattern.id, "pattern veto demotion failed");
                }
            }
        }
    }

    if last_seq > cursor {
        store
            .set_state(MISTAKE_CURSOR_KEY, last_seq.to_string())
            .await?;
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Calibration demotions
// ---------------------------------------------------------------------------

/// Demote one level on every key whose latest calibration shows persistent
/// overconfidence. Returns the number of demotions applied.
pub async fn apply_calibration_demotions(
    log: &EpisodeLog,
    calibrator: &Calibrator,
    ledger: &AutonomyLedger,
    config: &WardenConfig,
) -> Result<usize> {
    let since = Utc::now() - chrono::Duration::days(config.calibration.window_days);
    let keys = log.keys_since(since).await?;

    let mut applied = 0;
    for (agent_id, action_name) in keys {
        let report = match calibrator.latest(&agent_id, &action_name).await? {
            Calibration::Ready(report) => report,
            Calibration::InsufficientData { .. } => continue,
        };
        if !needs_demotion(&report, &config.calibration) {
            continue;
        }

        let current = ledger.current_level(&agent_id, &action_name).await?;
        if current == 0 {
            continue;
        }

        let evidence = Evidence::new(
            "calibration",
            &format!(
                "calibration error {:.2} over {} actions",
                report.calibration_error, report.total_actions
            ),
            serde_json::json!({
                "calibration_record_id": report.id,
                "calibration_error": report.calibration_error,
                "mean_confidence": report.mean_confidence,
                "mean_success_rate": report.mean_success_rate,
                "total_actions": report.total_actions,
            }),
        );

        if ledger
            .auto_demote(
                &agent_id,
                &action_name,
                current - 1,
                "persistent overconfidence",
                evidence,
                Utc::now(),
            )
            .await?
            .is_some()
        {
            applied += 1;
        }
    }

    Ok(applied)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::Evidence;
    use crate::episodes::Outcome;
    use chrono::{DateTime, Duration as ChronoDuration};

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    struct Fixture {
        store: Arc<WardenStore>,
        log: EpisodeLog,
        tracker: MistakeTracker,
        ledger: AutonomyLedger,
        calibrator: Calibrator,
        config: WardenConfig,
    }

    async fn fixture() -> Fixture {
        let store = WardenStore::connect_in_memory().await.unwrap();
        let config = WardenConfig::default();
        Fixture {
            log: EpisodeLog::new(store.clone()),
            tracker: MistakeTracker::new(store.clone()),
            ledger: AutonomyLedger::new(store.clone(), config.max_level),
            calibrator: Calibrator::new(store.clone()),
            config,
            store,
        }
    }

    async fn grant_level(fixture: &Fixture, agent: &str, action: &str, level: u8) {
        for step in 1..=level {
            let transition = fixture
                .ledger
                .request_escalation(agent, action, step, "bootstrap", Evidence::new("test", "seed", serde_json::json!({})), t0())
                .await
                .unwrap();
            fixture.ledger.approve(&transition.id, "op", t0()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn failed_episode_opens_pattern_and_demotes() {
        let fixture = fixture().await;
        grant_level(&fixture, "a1", "send_email", 2).await;

        fixture
            .log
            .record("a1", "send_email", Outcome::Failure, 0.9, "smtp relay timeout", t0(), t0())
            .await
            .unwrap();

        let report = drain_new_episodes(
            &fixture.store,
            &fixture.log,
            &fixture.tracker,
            &fixture.ledger,
            &fixture.config,
        )
        .await
        .unwrap();

        assert_eq!(report.observed, 1);
        assert_eq!(report.vetoes_applied, 1);
        assert_eq!(fixture.ledger.current_level("a1", "send_email").await.unwrap(), 1);
        assert_eq!(
            fixture.tracker.active_patterns("a1", "send_email").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn cursor_prevents_reprocessing() {
        let fixture = fixture().await;
        grant_level(&fixture, "a1", "send_email", 2).await;

        fixture
            .log
            .record("a1", "send_email", Outcome::Failure, 0.9, "smtp relay timeout", t0(), t0())
            .await
            .unwrap();

        drain_new_episodes(&fixture.store, &fixture.log, &fixture.tracker, &fixture.ledger, &fixture.config)
            .await
            .unwrap();
        let second = drain_new_episodes(
            &fixture.store,
            &fixture.log,
            &fixture.tracker,
            &fixture.ledger,
            &fixture.config,
        )
        .await
        .unwrap();

        assert_eq!(second.observed, 0);
        // Occurrence count stayed at 1: the failure was not re-observed.
        let patterns = fixture.tracker.active_patterns("a1", "send_email").await.unwrap();
        assert_eq!(patterns[0].occurrence_count, 1);
    }

    #[tokio::test]
    async fn veto_at_level_zero_does_nothing() {
        let fixture = fixture().await;

        fixture
            .log
            .record("a1", "send_email", Outcome::Failure, 0.9, "smtp relay timeout", t0(), t0())
            .await
            .unwrap();

        let report = drain_new_episodes(
            &fixture.store,
            &fixture.log,
            &fixture.tracker,
            &fixture.ledger,
            &fixture.config,
        )
        .await
        .unwrap();

        assert_eq!(report.vetoes_applied, 0);
        assert_eq!(fixture.ledger.current_level("a1", "send_email").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn overconfident_calibration_demotes_one_level() {
        let fixture = fixture().await;
        grant_level(&fixture, "a1", "summarize_doc", 1).await;

        // Twelve recent episodes: high confidence, mostly failures.
        let now = Utc::now();
        for i in 0..12 {
            let started = now - ChronoDuration::hours(i + 1);
            let outcome = if i < 2 { Outcome::Success } else { Outcome::Failure };
            fixture
                .log
                .record("a1", "summarize_doc", outcome, 0.95, "summary", started, started)
                .await
                .unwrap();
        }

        fixture
            .calibrator
            .run(&fixture.config.calibration, now)
            .await
            .unwrap();

        let applied = apply_calibration_demotions(
            &fixture.log,
            &fixture.calibrator,
            &fixture.ledger,
            &fixture.config,
        )
        .await
        .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(fixture.ledger.current_level("a1", "summarize_doc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn well_calibrated_keys_are_left_alone() {
        let fixture = fixture().await;
        grant_level(&fixture, "a1", "summarize_doc", 2).await;

        let now = Utc::now();
        for i in 0..12 {
            let started = now - ChronoDuration::hours(i + 1);
            fixture
                .log
                .record("a1", "summarize_doc", Outcome::Success, 0.9, "summary", started, started)
                .await
                .unwrap();
        }

        fixture
            .calibrator
            .run(&fixture.config.calibration, now)
            .await
            .unwrap();

        let applied = apply_calibration_demotions(
            &fixture.log,
            &fixture.calibrator,
            &fixture.ledger,
            &fixture.config,
        )
        .await
        .unwrap();

        assert_eq!(applied, 0);
        assert_eq!(fixture.ledger.current_level("a1", "summarize_doc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn disabled_engine_exits_immediately() {
        let store = WardenStore::connect_in_memory().await.unwrap();
        let config = WardenConfig {
            enabled: false,
            ..WardenConfig::default()
        };
        spawn_warden_loop(store, config).await.unwrap();
    }
}
