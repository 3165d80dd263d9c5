//! Per-key claims serializing same-key batch work.
//!
//! Consolidation for distinct (agent, action) keys may run in parallel;
//! passes over the same key must not. A claim is acquired for the duration
//! of the update and released by the guard's `Drop`, which covers every exit
//! path including errors and panics.

use crate::error::{Result, WardenError};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

type ClaimKey = (String, String);

/// In-memory claim table keyed by (agent_id, action_name).
#[derive(Debug, Clone, Default)]
pub struct KeyClaims {
    held: Arc<Mutex<HashSet<ClaimKey>>>,
}

impl KeyClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the claim for a key, or fail with `Conflict` if another pass
    /// already holds it.
    pub fn try_claim(&self, agent_id: &str, action_name: &str) -> Result<ClaimGuard> {
        let key = (agent_id.to_owned(), action_name.to_owned());
        let mut held = self.held.lock().expect("claim table poisoned");
        if !held.insert(key.clone()) {
            return Err(WardenError::Conflict(format!(
                "consolidation claim already held for ({agent_id}, {action_name})"
            )));
        }
        Ok(ClaimGuard {
            key,
            held: Arc::clone(&self.held),
        })
    }

    /// Whether a claim is currently held for the key.
    pub fn is_held(&self, agent_id: &str, action_name: &str) -> bool {
        let key = (agent_id.to_owned(), action_name.to_owned());
        self.held.lock().expect("claim table poisoned").contains(&key)
    }
}

/// RAII claim over one key. Releasing is dropping.
#[derive(Debug)]
pub struct ClaimGuard {
    key: ClaimKey,
    held: Arc<Mutex<HashSet<ClaimKey>>>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        // A poisoned lock still releases the claim; ignore the poison flag.
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
    }
}
