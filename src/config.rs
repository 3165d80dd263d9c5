//! Engine configuration.

use crate::calibration::CalibrationConfig;
use crate::consolidation::ConsolidationConfig;
use crate::decay::DecayConfig;
use crate::mistakes::MistakeConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the governance engine.
///
/// Loaded by the embedding process and handed to [`crate::spawn_warden_loop`].
/// All fields have defaults suitable for a single-agent deployment; the
/// per-engine sub-configs live next to the engines they tune.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WardenConfig {
    /// Whether the background loop is active.
    pub enabled: bool,
    /// Seconds between heartbeat writes to warden_state.
    pub tick_interval_secs: u64,
    /// Seconds between decay batch passes.
    pub decay_interval_secs: u64,
    /// Seconds between consolidation passes.
    pub consolidation_interval_secs: u64,
    /// Seconds between calibration calculation runs.
    pub calibration_interval_secs: u64,
    /// Highest grantable autonomy level. Level 0 is always manual-only.
    pub max_level: u8,
    /// Decay engine tuning.
    pub decay: DecayConfig,
    /// Consolidation engine tuning.
    pub consolidation: ConsolidationConfig,
    /// Calibration engine tuning.
    pub calibration: CalibrationConfig,
    /// Mistake pattern tracker tuning.
    pub mistakes: MistakeConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 30,
            decay_interval_secs: 3600,
            consolidation_interval_secs: 600,
            calibration_interval_secs: 3600,
            max_level: 3,
            decay: DecayConfig::default(),
            consolidation: ConsolidationConfig::default(),
            calibration: CalibrationConfig::default(),
            mistakes: MistakeConfig::default(),
        }
    }
}
