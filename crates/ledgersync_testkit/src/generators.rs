//! Property-based test generators using proptest.
//!
//! Write sequences draw entity IDs from a small pool so that several writes
//! land on the same entity and exercise coalescing.

use crate::fixtures::{ACCOUNT, BUDGET, TRANSACTION};
use ledgersync_sync_protocol::Operation;
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for entity IDs such as `txn-42`.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    (prop_oneof!["acct", "txn", "budget"], 0u16..1000)
        .prop_map(|(prefix, n)| format!("{prefix}-{n}"))
}

/// Strategy for the finance entity types.
pub fn entity_type_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(ACCOUNT), Just(TRANSACTION), Just(BUDGET)]
}

/// Strategy for operations, weighted towards updates.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        2 => Just(Operation::Create),
        5 => Just(Operation::Update),
        1 => Just(Operation::Delete),
    ]
}

/// Strategy for flat JSON object payloads.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    let field = prop_oneof!["amount", "memo", "category", "name", "balance"];
    let value = prop_oneof![
        any::<i32>().prop_map(Value::from),
        "[a-z ]{0,12}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ];
    prop::collection::btree_map(field, value, 1..5)
        .prop_map(|fields| Value::Object(fields.into_iter().collect()))
}

/// One local write as a domain layer would issue it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    /// Entity type.
    pub entity_type: &'static str,
    /// Entity ID.
    pub entity_id: String,
    /// Requested operation.
    pub operation: Operation,
    /// Payload (`null` for deletes).
    pub payload: Value,
}

/// Strategy for one write against an entity drawn from `pool_size` IDs.
pub fn local_write_strategy(pool_size: usize) -> impl Strategy<Value = LocalWrite> {
    let pool_size = pool_size.max(1);
    (
        0..pool_size,
        entity_type_strategy(),
        operation_strategy(),
        payload_strategy(),
    )
        .prop_map(|(n, entity_type, operation, payload)| LocalWrite {
            entity_type,
            entity_id: format!("entity-{n}"),
            operation,
            payload: if operation.has_payload() {
                payload
            } else {
                Value::Null
            },
        })
}

/// Strategy for a sequence of writes over a small ID pool.
pub fn write_sequence_strategy(
    pool_size: usize,
    min_writes: usize,
    max_writes: usize,
) -> impl Strategy<Value = Vec<LocalWrite>> {
    prop::collection::vec(local_write_strategy(pool_size), min_writes..max_writes)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn payloads_are_non_empty_objects(payload in payload_strategy()) {
            let fields = payload.as_object().map_or(0, Map::len);
            prop_assert!(fields >= 1);
        }

        #[test]
        fn writes_stay_in_the_pool(writes in write_sequence_strategy(3, 1, 20)) {
            for write in &writes {
                let n: usize = write.entity_id["entity-".len()..].parse().unwrap();
                prop_assert!(n < 3);
                prop_assert_eq!(write.payload.is_null(), write.operation == Operation::Delete);
            }
        }

        #[test]
        fn entity_ids_have_a_prefix(id in entity_id_strategy()) {
            prop_assert!(id.contains('-'));
        }
    }
}
