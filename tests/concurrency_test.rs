use graphvault::{Graph, GraphConfig, GraphError};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn open_graph(path: &std::path::Path) -> Graph {
    Graph::open(GraphConfig::new(path).with_index("name").with_sync_writes(false)).unwrap()
}

#[test]
fn test_concurrent_writers_to_one_property_exactly_one_wins() {
    let dir = tempdir().unwrap();
    let graph = open_graph(dir.path());

    let mut setup = graph.begin().unwrap();
    let target = setup.add_vertex().unwrap();
    setup.set_property(target, "name", "start").unwrap();
    setup.commit().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|value| {
            let graph = graph.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut txn = graph.begin().unwrap();
                txn.set_property(target, "name", value).unwrap();
                // Both snapshots are taken before either commit.
                barrier.wait();
                txn.commit().map(|_| value)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, GraphError::TransactionConflict(_)));
    assert!(loser.is_retryable());

    let reader = graph.begin().unwrap();
    assert_eq!(
        reader.get_property(target, "name").unwrap().as_deref(),
        Some(*winners[0])
    );
    assert_eq!(reader.lookup("name", winners[0]).unwrap(), BTreeSet::from([target]));
    assert!(reader.lookup("name", "start").unwrap().is_empty());
    assert_eq!(graph.active_transactions(), 1);
}

#[test]
fn test_parallel_edges_on_a_shared_vertex_both_commit() {
    let dir = tempdir().unwrap();
    let graph = open_graph(dir.path());

    let mut setup = graph.begin().unwrap();
    let hub = setup.add_vertex().unwrap();
    setup.commit().unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let graph = graph.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut txn = graph.begin().unwrap();
                let leaf = txn.add_vertex().unwrap();
                txn.set_property(leaf, "name", format!("leaf-{i}")).unwrap();
                txn.add_edge(hub, leaf, "owns").unwrap();
                barrier.wait();
                txn.commit().unwrap();
                leaf
            })
        })
        .collect();
    let leaves: BTreeSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let reader = graph.begin().unwrap();
    let owned: BTreeSet<_> = reader
        .neighbors(hub, "owns")
        .unwrap()
        .map(|v| v.unwrap().id)
        .collect();
    assert_eq!(owned, leaves);
}

#[test]
fn test_readers_see_stable_snapshots_while_writers_commit() {
    let dir = tempdir().unwrap();
    let graph = open_graph(dir.path());

    let mut setup = graph.begin().unwrap();
    let counter = setup.add_vertex().unwrap();
    setup.set_property(counter, "name", "0").unwrap();
    setup.commit().unwrap();

    let writer = {
        let graph = graph.clone();
        thread::spawn(move || {
            for i in 1..=50 {
                let mut txn = graph.begin().unwrap();
                txn.set_property(counter, "name", i.to_string()).unwrap();
                txn.commit().unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let graph = graph.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let txn = graph.begin().unwrap();
                    let first = txn.get_property(counter, "name").unwrap().unwrap();
                    thread::yield_now();
                    // The value and its index entry never move under a snapshot.
                    assert_eq!(txn.get_property(counter, "name").unwrap().unwrap(), first);
                    assert_eq!(
                        txn.lookup("name", &first).unwrap(),
                        BTreeSet::from([counter])
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let txn = graph.begin().unwrap();
    assert_eq!(txn.get_property(counter, "name").unwrap().as_deref(), Some("50"));
    drop(txn);
    graph.vacuum().unwrap();
    assert_eq!(graph.active_transactions(), 0);
}
