//! Property test: checkpoints restore to an identical state

use procflow_core::ProcessState;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// Arbitrary JSON-ish scalar values
fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        // Finite floats only: NaN does not round-trip through JSON
        (-1.0e9f64..1.0e9).prop_map(|f| json!(f)),
        "[a-zA-Z0-9 _-]{0,24}".prop_map(Value::String),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn variables() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", value(), 0..8)
        .prop_map(|map| map.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn checkpoint_round_trips_state(
        vars in variables(),
        sensitive in prop::collection::vec("[a-z_]{1,12}", 0..3),
        completed in prop::collection::vec("[a-z0-9_-]{1,10}", 0..6),
        skipped in prop::collection::vec("[a-z0-9_-]{1,10}", 0..3),
        items in prop::collection::vec(scalar(), 1..5),
        counter in 0u64..100,
    ) {
        let mut state = ProcessState::new(vars, sensitive);
        for node_id in &completed {
            state.mark_completed(node_id.clone(), json!({"done": node_id}));
        }
        for node_id in &skipped {
            state.mark_skipped(node_id.clone());
        }
        state.set_current_node("current");
        state.push_loop(items, "item", "index");
        state.set_loop_item("loop");
        state.set_counter("while_w_count", counter);
        state.start_parallel("par", vec![vec!["a".to_string()], vec!["b".to_string()]]);
        state.complete_branch("par", 0, json!({"branch": 0}));

        let checkpoint = state.create_checkpoint();
        let mut restored = ProcessState::default();
        restored.restore_checkpoint(&checkpoint);

        prop_assert_eq!(restored.variables(), state.variables());
        prop_assert_eq!(restored.completed_nodes(), state.completed_nodes());
        prop_assert_eq!(restored.skipped_nodes(), state.skipped_nodes());
        prop_assert_eq!(restored.current_node(), state.current_node());
        prop_assert_eq!(restored.current_loop(), state.current_loop());
        prop_assert_eq!(restored.parallel_frame("par"), state.parallel_frame("par"));
        prop_assert_eq!(restored.counter("while_w_count"), counter);
        prop_assert_eq!(restored.sensitive_names(), state.sensitive_names());

        // A second generation of the checkpoint is identical
        prop_assert_eq!(restored.create_checkpoint(), checkpoint);
    }
}
