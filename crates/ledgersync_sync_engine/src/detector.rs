//! Classification of server changes against local pending changes.
//!
//! Pure functions: nothing here touches storage.

use ledgersync_sync_protocol::{
    Entity, EntityDelta, LocalChange, Operation, PendingChange, PushConflict, ServerChange,
};
use serde_json::Value;

/// What to do with one server change.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconcile {
    /// No local change competes: write the server state locally.
    Apply,
    /// The change is already reflected locally (an echo or a stale delta).
    Skip,
    /// Both sides hold the same data: write the server state and drop the
    /// pending change.
    Converge,
    /// The sides diverged.
    Conflict {
        /// Local side.
        local: LocalChange,
        /// Server side.
        server: ServerChange,
    },
}

/// Classifies server changes for the reconciliation phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies a pulled delta.
    ///
    /// - No pending change: apply, unless the local entity already holds this
    ///   or a newer server version.
    /// - Server version not past the change's base version: the delta is an
    ///   echo of what the change was based on, so skip it.
    /// - Same data on both sides: converge.
    /// - Otherwise: conflict. Comparison is whole-entity.
    pub fn classify_delta(
        entity: Option<&Entity>,
        pending: Option<&PendingChange>,
        delta: &EntityDelta,
    ) -> Reconcile {
        let Some(pending) = pending else {
            let stale = entity
                .and_then(|entity| entity.server_version)
                .is_some_and(|known| delta.server_version <= known);
            return if stale { Reconcile::Skip } else { Reconcile::Apply };
        };

        if pending
            .base_version
            .is_some_and(|base| delta.server_version <= base)
        {
            return Reconcile::Skip;
        }

        let server = ServerChange {
            data: delta.effective_payload(),
            server_timestamp: delta.server_timestamp,
            server_version: Some(delta.server_version),
        };
        Self::compare(pending, server)
    }

    /// Classifies a conflict reported by the server in a push response.
    ///
    /// Never returns [`Reconcile::Apply`] or [`Reconcile::Skip`].
    pub fn classify_push_conflict(pending: &PendingChange, reported: &PushConflict) -> Reconcile {
        let server = ServerChange {
            data: reported.server_data.clone(),
            server_timestamp: reported.server_timestamp,
            server_version: reported.server_version,
        };
        Self::compare(pending, server)
    }

    fn compare(pending: &PendingChange, server: ServerChange) -> Reconcile {
        if local_data(pending) == server.data {
            return Reconcile::Converge;
        }
        Reconcile::Conflict {
            local: LocalChange {
                operation: pending.operation,
                data: local_data(pending),
                client_timestamp: pending.client_timestamp,
                base_version: pending.base_version,
            },
            server,
        }
    }
}

fn local_data(pending: &PendingChange) -> Value {
    match pending.operation {
        Operation::Delete => Value::Null,
        Operation::Create | Operation::Update => pending.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn delta(version: u64, payload: Value) -> EntityDelta {
        EntityDelta {
            entity_id: "budget-1".into(),
            entity_type: "budget".into(),
            deleted: payload.is_null(),
            payload,
            server_version: version,
            server_timestamp: 50,
        }
    }

    fn pending(operation: Operation, payload: Value, base: Option<u64>) -> PendingChange {
        PendingChange::new("budget-1", "budget", operation, payload, 40, base, 0)
    }

    #[test]
    fn delta_without_pending_is_applied() {
        let d = delta(2, json!({"amount": 1}));
        assert_eq!(ConflictDetector::classify_delta(None, None, &d), Reconcile::Apply);
    }

    #[test]
    fn stale_delta_without_pending_is_skipped() {
        let mut entity = Entity::local("budget-1", "budget", json!({"amount": 1}), 1);
        entity.server_version = Some(3);
        let d = delta(3, json!({"amount": 1}));
        assert_eq!(
            ConflictDetector::classify_delta(Some(&entity), None, &d),
            Reconcile::Skip
        );
    }

    #[test]
    fn echo_of_base_version_is_skipped() {
        let p = pending(Operation::Update, json!({"amount": 5}), Some(4));
        let d = delta(4, json!({"amount": 1}));
        assert_eq!(ConflictDetector::classify_delta(None, Some(&p), &d), Reconcile::Skip);
    }

    #[test]
    fn equal_payloads_converge() {
        let p = pending(Operation::Update, json!({"amount": 5}), Some(1));
        let d = delta(2, json!({"amount": 5}));
        assert_eq!(
            ConflictDetector::classify_delta(None, Some(&p), &d),
            Reconcile::Converge
        );
    }

    #[test]
    fn divergent_budget_edit_conflicts() {
        let p = pending(
            Operation::Update,
            json!({"amount": 500000, "alertThreshold": 80}),
            Some(1),
        );
        let d = delta(2, json!({"amount": 600000, "alertThreshold": 90}));

        match ConflictDetector::classify_delta(None, Some(&p), &d) {
            Reconcile::Conflict { local, server } => {
                assert_eq!(local.data["amount"], 500000);
                assert_eq!(server.data["amount"], 600000);
                assert_eq!(server.server_version, Some(2));
                assert_eq!(local.base_version, Some(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_field_edits_still_conflict() {
        let p = pending(Operation::Update, json!({"amount": 1, "name": "Food"}), Some(1));
        let d = delta(2, json!({"amount": 0, "name": "Groceries"}));
        assert!(matches!(
            ConflictDetector::classify_delta(None, Some(&p), &d),
            Reconcile::Conflict { .. }
        ));
    }

    #[test]
    fn server_delete_against_local_update_conflicts() {
        let p = pending(Operation::Update, json!({"amount": 1}), Some(1));
        let d = delta(2, Value::Null);
        match ConflictDetector::classify_delta(None, Some(&p), &d) {
            Reconcile::Conflict { server, .. } => assert!(server.data.is_null()),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn both_deleted_converges() {
        let p = pending(Operation::Delete, Value::Null, Some(1));
        let d = delta(2, Value::Null);
        assert_eq!(
            ConflictDetector::classify_delta(None, Some(&p), &d),
            Reconcile::Converge
        );
    }

    #[test]
    fn push_conflict_is_classified() {
        let p = pending(Operation::Delete, Value::Null, Some(1));
        let reported = PushConflict {
            entity_id: "budget-1".into(),
            server_data: json!({"amount": 9}),
            server_timestamp: 70,
            server_version: Some(3),
        };
        match ConflictDetector::classify_push_conflict(&p, &reported) {
            Reconcile::Conflict { local, server } => {
                assert!(local.data.is_null());
                assert_eq!(local.operation, Operation::Delete);
                assert_eq!(server.server_timestamp, 70);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
