//! Sync cycle states, triggers and summaries.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// The current phase of the sync orchestrator.
///
/// A cycle walks `Idle -> Checking -> Pushing -> Pulling -> Reconciling ->
/// Idle`. `Error` is entered from any in-flight phase and left by the next
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// Checking connectivity.
    Checking,
    /// Pushing queued changes.
    Pushing,
    /// Pulling server changes.
    Pulling,
    /// Applying pulled changes and recording conflicts.
    Reconciling,
    /// The last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if a cycle is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Checking | SyncState::Pushing | SyncState::Pulling | SyncState::Reconciling
        )
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncState::Idle => "idle",
            SyncState::Checking => "checking",
            SyncState::Pushing => "pushing",
            SyncState::Pulling => "pulling",
            SyncState::Reconciling => "reconciling",
            SyncState::Error => "error",
        })
    }
}

/// Why a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// The background interval elapsed.
    Interval,
    /// The app regained focus.
    Focus,
    /// Connectivity came back.
    Online,
    /// A caller asked for it.
    Manual,
    /// Backoff after a failed cycle elapsed.
    Retry,
}

/// Counts from one sync flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Changes the server acknowledged.
    pub synced: usize,
    /// Changes flagged as failed during the flight.
    pub failed: usize,
    /// Server changes applied locally.
    pub pulled: usize,
    /// Conflicts detected or updated.
    pub conflicts: usize,
}

impl SyncSummary {
    /// Returns true if any change moved in either direction.
    pub fn transferred(&self) -> bool {
        self.synced > 0 || self.pulled > 0
    }
}

impl Add for SyncSummary {
    type Output = SyncSummary;

    fn add(self, other: SyncSummary) -> SyncSummary {
        SyncSummary {
            synced: self.synced + other.synced,
            failed: self.failed + other.failed,
            pulled: self.pulled + other.pulled,
            conflicts: self.conflicts + other.conflicts,
        }
    }
}

impl AddAssign for SyncSummary {
    fn add_assign(&mut self, other: SyncSummary) {
        *self = *self + other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(!SyncState::Idle.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(SyncState::Reconciling.is_active());
        assert!(!SyncState::Error.is_active());
    }

    #[test]
    fn summaries_add_up() {
        let mut total = SyncSummary {
            synced: 2,
            ..SyncSummary::default()
        };
        total += SyncSummary {
            synced: 1,
            pulled: 4,
            ..SyncSummary::default()
        };
        assert_eq!(total.synced, 3);
        assert_eq!(total.pulled, 4);
        assert!(total.transferred());
        assert!(!SyncSummary::default().transferred());
    }
}
