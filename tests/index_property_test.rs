use graphvault::{Graph, GraphConfig, Transaction, VertexId};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const VALUES: [&str; 4] = ["Microsoft", "NOKIA", "Apiphany", "Skype"];

#[derive(Debug, Clone)]
enum Operation {
    Create { value: Option<usize> },
    Set { slot: usize, value: usize },
    Remove { slot: usize },
    Delete { slot: usize },
    Commit,
    Rollback,
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => prop::option::of(0..VALUES.len()).prop_map(|value| Operation::Create { value }),
        3 => (any::<usize>(), 0..VALUES.len()).prop_map(|(slot, value)| Operation::Set { slot, value }),
        1 => any::<usize>().prop_map(|slot| Operation::Remove { slot }),
        1 => any::<usize>().prop_map(|slot| Operation::Delete { slot }),
        2 => Just(Operation::Commit),
        1 => Just(Operation::Rollback),
    ]
}

/// Picks an existing vertex by slot, so generated ops always hit something.
fn pick(model: &BTreeMap<VertexId, Option<String>>, slot: usize) -> Option<VertexId> {
    if model.is_empty() {
        return None;
    }
    model.keys().nth(slot % model.len()).copied()
}

fn expected(model: &BTreeMap<VertexId, Option<String>>, value: &str) -> BTreeSet<VertexId> {
    model
        .iter()
        .filter(|(_, v)| v.as_deref() == Some(value))
        .map(|(id, _)| *id)
        .collect()
}

fn assert_lookups_match(
    txn: &Transaction,
    model: &BTreeMap<VertexId, Option<String>>,
) -> Result<(), TestCaseError> {
    for value in VALUES {
        prop_assert_eq!(txn.lookup("name", value).unwrap(), expected(model, value));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_lookup_matches_committed_properties(ops in prop::collection::vec(arb_operation(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let graph = Graph::open(
            GraphConfig::new(dir.path()).with_index("name").with_sync_writes(false),
        )
        .unwrap();

        // What is committed, and what the open transaction would make of it.
        let mut committed: BTreeMap<VertexId, Option<String>> = BTreeMap::new();
        let mut pending = committed.clone();
        let mut txn = graph.begin().unwrap();

        for op in ops {
            match op {
                Operation::Create { value } => {
                    let id = txn.add_vertex().unwrap();
                    let value = value.map(|i| VALUES[i].to_string());
                    if let Some(value) = &value {
                        txn.set_property(id, "name", value.as_str()).unwrap();
                    }
                    pending.insert(id, value);
                }
                Operation::Set { slot, value } => {
                    if let Some(id) = pick(&pending, slot) {
                        txn.set_property(id, "name", VALUES[value]).unwrap();
                        pending.insert(id, Some(VALUES[value].to_string()));
                    }
                }
                Operation::Remove { slot } => {
                    if let Some(id) = pick(&pending, slot) {
                        txn.remove_property(id, "name").unwrap();
                        pending.insert(id, None);
                    }
                }
                Operation::Delete { slot } => {
                    if let Some(id) = pick(&pending, slot) {
                        txn.delete_vertex(id).unwrap();
                        pending.remove(&id);
                    }
                }
                Operation::Commit => {
                    txn.commit().unwrap();
                    committed = pending.clone();
                    txn = graph.begin().unwrap();
                }
                Operation::Rollback => {
                    txn.rollback().unwrap();
                    pending = committed.clone();
                    txn = graph.begin().unwrap();
                }
            }
            assert_lookups_match(&txn, &pending)?;
        }

        txn.rollback().unwrap();
        drop(txn);
        let reader = graph.begin().unwrap();
        assert_lookups_match(&reader, &committed)?;
        drop(reader);

        prop_assert_eq!(graph.reindex("name").unwrap(), 0);
        graph.shutdown().unwrap();

        // Everything committed is found again after a reopen.
        let graph = Graph::open(GraphConfig::new(dir.path()).with_sync_writes(false)).unwrap();
        let reader = graph.begin().unwrap();
        assert_lookups_match(&reader, &committed)?;
    }
}
