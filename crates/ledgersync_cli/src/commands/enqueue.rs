//! Enqueue command implementation.

use super::{open_queue, open_store, CliResult};
use ledgersync_sync_protocol::Operation;
use serde_json::Value;
use std::path::Path;

/// Parses the payload argument of an enqueue.
///
/// Deletes take no payload; creates and updates require a JSON object.
pub fn parse_payload(operation: Operation, payload: Option<&str>) -> CliResult<Value> {
    match (operation, payload) {
        (Operation::Delete, None) => Ok(Value::Null),
        (Operation::Delete, Some(_)) => Err("DELETE takes no payload".into()),
        (_, None) => Err(format!("{operation} requires a JSON payload").into()),
        (_, Some(raw)) => Ok(serde_json::from_str(raw)?),
    }
}

/// Runs the enqueue command.
pub fn run(
    path: &Path,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: Option<&str>,
) -> CliResult<()> {
    let operation: Operation = operation.parse()?;
    let payload = parse_payload(operation, payload)?;

    let store = open_store(path)?;
    let queue = open_queue(&store)?;

    match queue.enqueue(entity_type, entity_id, operation, payload)? {
        Some(change) => println!(
            "Queued {} {} {} (seq {}, {} pending)",
            change.operation,
            entity_type,
            entity_id,
            change.seq,
            queue.len()?
        ),
        None => println!("Cancelled unsynced create of {entity_type} {entity_id}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_rules() {
        assert_eq!(parse_payload(Operation::Delete, None).unwrap(), Value::Null);
        assert!(parse_payload(Operation::Delete, Some("{}")).is_err());
        assert!(parse_payload(Operation::Create, None).is_err());
        assert!(parse_payload(Operation::Update, Some("not json")).is_err());
        assert_eq!(
            parse_payload(Operation::Update, Some(r#"{"amount": 5}"#)).unwrap(),
            json!({"amount": 5})
        );
    }

    #[test]
    fn enqueue_coalesces_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), "budget", "b-1", "create", Some(r#"{"amount": 1}"#)).unwrap();
        run(dir.path(), "budget", "b-1", "update", Some(r#"{"amount": 2}"#)).unwrap();

        let store = open_store(dir.path()).unwrap();
        let pending = store.pending_changes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Create);
        assert_eq!(pending[0].payload, json!({"amount": 2}));
    }

    #[test]
    fn rejects_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), "budget", "b-1", "upsert", Some("{}")).is_err());
    }
}
