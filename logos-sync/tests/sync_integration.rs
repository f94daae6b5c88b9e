//! Integration tests for multi-node sync.
//!
//! Two managers share one in-process broker and relay every recorded
//! operation to each other, the way two server processes behind a load
//! balancer would.

use logos_sync::{
    CanvasRelay, InMemoryPubSub, NewOperation, PubSub, SharedSessionManager, SyncConfig,
    SyncSessionManager, VectorClock, spawn_idle_sweeper, spawn_relay_listener,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, sleep, timeout};

fn move_op(target: &str, user: &str, x: i64) -> NewOperation {
    NewOperation::new("move", target, "shape", json!({"x": x, "y": 0}), user)
}

async fn wait_for_version(manager: &SharedSessionManager, canvas: &str, version: u64) {
    timeout(Duration::from_secs(2), async {
        loop {
            let caught_up = manager
                .lock()
                .await
                .get_operation_log(canvas)
                .is_some_and(|log| log.version() >= version);
            if caught_up {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("replica should catch up");
}

#[tokio::test]
async fn test_relay_with_writers_on_both_nodes() {
    let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::from_config(&SyncConfig::default()));
    let relay_a = CanvasRelay::new("node-a", pubsub.clone());
    let relay_b = CanvasRelay::new("node-b", pubsub);

    let node_a = SyncSessionManager::new(SyncConfig::for_node("node-a")).into_shared();
    let node_b = SyncSessionManager::new(SyncConfig::for_node("node-b")).into_shared();

    node_a
        .lock()
        .await
        .create_session("alice", "board", "conn-a", None, None);
    node_b
        .lock()
        .await
        .create_session("bob", "board", "conn-b", None, None);

    let listener_a = spawn_relay_listener(relay_a.clone(), node_a.clone(), "board".to_string());
    let listener_b = spawn_relay_listener(relay_b.clone(), node_b.clone(), "board".to_string());

    // Interleaved writes on both nodes; carol syncs with node-a halfway
    let mut carol = None;
    for x in 0..4 {
        let a = node_a
            .lock()
            .await
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-1", "alice", x));
        relay_a.publish_operation("board", &a).unwrap();

        let b = node_b
            .lock()
            .await
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-2", "bob", x));
        relay_b.publish_operation("board", &b).unwrap();

        if x == 1 {
            let guard = node_a.lock().await;
            let log = guard.get_operation_log("board").unwrap();
            carol = Some((
                log.version(),
                log.vector_clock(),
                log.operations_since(0)
                    .iter()
                    .map(|op| op.id)
                    .collect::<HashSet<_>>(),
            ));
        }
    }

    wait_for_version(&node_a, "board", 8).await;
    wait_for_version(&node_b, "board", 8).await;

    let (version, clock, seen) = carol.unwrap();
    let everything: HashSet<_> = node_a
        .lock()
        .await
        .get_operation_log("board")
        .unwrap()
        .operations_since(0)
        .iter()
        .map(|op| op.id)
        .collect();
    let expected: HashSet<_> = everything.difference(&seen).copied().collect();

    for node in [&node_a, &node_b] {
        let mut guard = node.lock().await;
        let handshake =
            guard.create_session("carol", "board", "conn-c", Some(version), Some(clock.clone()));
        assert!(!handshake.resync_required);

        let delta = handshake.delta.expect("carol is behind");
        let ids: Vec<_> = delta.operations.iter().map(|op| op.id).collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len(), "duplicate in delta");
        assert_eq!(unique, expected);

        let versions: Vec<u64> = delta.operations.iter().map(|op| op.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert!(versions.iter().all(|v| *v > delta.from_version && *v <= delta.to_version));
    }

    // Both replicas saw every edit
    let clock_a = node_a.lock().await.get_operation_log("board").unwrap().vector_clock();
    let clock_b = node_b.lock().await.get_operation_log("board").unwrap().vector_clock();
    assert_eq!(clock_a, clock_b);

    listener_a.abort();
    listener_b.abort();
}

#[tokio::test]
async fn test_concurrent_handlers_keep_versions_gap_free() {
    let manager = SyncSessionManager::with_defaults().into_shared();

    let mut handles = Vec::new();
    for user in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for x in 0..25 {
                manager
                    .lock()
                    .await
                    .get_or_create_operation_log("board")
                    .record_operation(move_op("rect-1", &format!("user-{user}"), x));
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let guard = manager.lock().await;
    let log = guard.get_operation_log("board").unwrap();
    let versions: Vec<u64> = log.operations_since(0).iter().map(|op| op.version).collect();
    assert_eq!(versions, (1..=200).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_idle_sweeper_evicts_abandoned_canvas() {
    let config = SyncConfig {
        idle_log_ttl: Duration::ZERO,
        idle_sweep_interval: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let manager = SyncSessionManager::new(config).into_shared();

    {
        let mut guard = manager.lock().await;
        guard.create_session("alice", "live", "conn-1", None, None);
        guard
            .get_or_create_operation_log("live")
            .record_operation(move_op("rect-1", "alice", 1));
        guard
            .get_or_create_operation_log("abandoned")
            .record_operation(move_op("rect-2", "bob", 2));
        assert_eq!(guard.idle_canvas_count(), 1);
    }

    let sweeper = spawn_idle_sweeper(manager.clone());

    timeout(Duration::from_secs(2), async {
        while manager.lock().await.get_operation_log("abandoned").is_some() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("abandoned canvas should be evicted");

    let guard = manager.lock().await;
    assert!(guard.get_operation_log("live").is_some());
    assert_eq!(guard.stats().idle_canvases, 0);
    drop(guard);

    sweeper.abort();
}

#[test]
fn test_reconnect_cycle_delivers_exact_gap() {
    let mut manager = SyncSessionManager::with_defaults();
    manager.create_session("alice", "board", "conn-1", None, None);

    for x in 0..4 {
        manager
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-1", "alice", x));
    }
    let seen = manager.get_operation_log("board").unwrap().vector_clock();
    assert!(manager.update_session("conn-1", 4, seen.clone()));
    manager.remove_session("conn-1");

    // Edits land while alice is offline
    manager.create_session("bob", "board", "conn-2", None, None);
    for x in 0..2 {
        manager
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-1", "bob", x));
    }

    let handshake = manager.create_session("alice", "board", "conn-3", Some(4), Some(seen.clone()));
    let delta = handshake.delta.unwrap();
    assert_eq!(
        delta.operations.iter().map(|op| op.version).collect::<Vec<_>>(),
        vec![5, 6]
    );
    assert!(
        delta
            .operations
            .iter()
            .all(|op| op.vector_clock.dominates(&seen) && op.user_id == "bob")
    );
    assert_eq!(handshake.session.last_sync_clock, seen);

    // Caught-up client gets nothing
    let handshake = manager.create_session("alice", "board", "conn-4", Some(6), None);
    assert!(handshake.delta.is_none());
    assert!(manager.get_session("conn-3").is_none());
    assert!(manager.indices_consistent());
}

#[test]
fn test_reactivated_canvas_flags_stale_clients() {
    let config = SyncConfig {
        idle_log_ttl: Duration::ZERO,
        ..SyncConfig::default()
    };
    let mut manager = SyncSessionManager::new(config);
    manager.create_session("alice", "board", "conn-1", None, None);
    for x in 0..5 {
        manager
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-1", "alice", x));
    }
    manager.remove_session("conn-1");
    assert_eq!(manager.sweep_idle(std::time::Instant::now()), 1);

    manager.create_session("bob", "board", "conn-2", None, None);
    for x in 0..6 {
        manager
            .get_or_create_operation_log("board")
            .record_operation(move_op("rect-1", "bob", x));
    }

    let handshake = manager.create_session("alice", "board", "conn-3", Some(3), None);
    assert!(handshake.resync_required);
    let versions: Vec<u64> = handshake
        .delta
        .unwrap()
        .operations
        .iter()
        .map(|op| op.version)
        .collect();
    assert_eq!(versions, (6..=11).collect::<Vec<_>>());
}

#[test]
fn test_clock_wire_format_survives_transport() {
    let clock: VectorClock = [("node-a", 2u64), ("node-b", 5)].into_iter().collect();
    let wire = clock.encode();
    assert_eq!(wire, r#"{"node-a":2,"node-b":5}"#);
    assert_eq!(VectorClock::decode(&wire), clock);
}
