//! Agent memory lifecycle and autonomy governance engine.
//!
//! Turns an autonomous agent's past episodes into durable knowledge, decays
//! and consolidates that knowledge over time, checks the agent's self-reported
//! confidence against real outcomes, and grants or strips operating autonomy
//! per (agent, action) based on that track record. Everything persists to a
//! dedicated `warden.db` SQLite database; the batch engines run as an async
//! loop alongside the host process.
//!
//! The engine decides *how much independence* an agent is allowed and *what
//! it is allowed to remember* — never what it should do next. Action
//! dispatch, episode production, and human approval are external
//! collaborators that talk to the interfaces in [`episodes`], [`autonomy`],
//! [`calibration`], and [`mistakes`].

pub mod autonomy;
pub mod calibration;
pub mod claims;
pub mod config;
pub mod consolidation;
pub mod decay;
pub mod engine;
pub mod episodes;
pub mod error;
pub mod knowledge;
pub mod mistakes;
pub mod store;

pub use autonomy::AutonomyLedger;
pub use calibration::Calibrator;
pub use config::WardenConfig;
pub use consolidation::Consolidator;
pub use engine::spawn_warden_loop;
pub use episodes::{Episode, EpisodeLog, Outcome};
pub use error::{Result, WardenError};
pub use knowledge::KnowledgeStore;
pub use mistakes::MistakeTracker;
pub use store::WardenStore;
