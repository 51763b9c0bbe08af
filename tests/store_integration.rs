mod common;

use std::sync::{Arc, Mutex};

use common::{compute_id, make_sandbox, make_service, open_store, wait_until};
use weft::context::Context;
use weft::entity::codec::{decode_entity, encode_entity};
use weft::entity::{Attr, Id, Value};
use weft::error::Error;
use weft::model::Kinded;
use weft::model::compute::{Node, NodeStatus, Sandbox};
use weft::model::network::Service;
use weft::store::{EventOp, WatchCallback};

// ══════════════════════════════════════════════════════════════════
// Store integration tests
//
// Exercises the revisioned store through the typed model kinds: codec
// round-trips, CAS behaviour, index consistency, watch completeness,
// and schema discovery by tag.
// ══════════════════════════════════════════════════════════════════

// ── codec round-trips over real kinds ──

#[test]
fn test_full_sandbox_survives_wire_roundtrip() {
    let mut sandbox = make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80);
    sandbox.containers.push(weft::model::compute::ContainerSpec {
        name: "main".into(),
        image: "nginx:1.25".into(),
        env: vec![("MODE".into(), "prod".into())],
        ..Default::default()
    });

    let entity = sandbox.encode();
    let decoded = decode_entity(&encode_entity(&entity)).unwrap();
    assert_eq!(decoded, entity);
    assert_eq!(Sandbox::decode(&decoded).unwrap(), sandbox);
}

#[test]
fn test_service_survives_wire_roundtrip() {
    let mut service = make_service("svc-a", ("app", "nginx"), 80, 8080);
    service.ips.push("10.96.3.4".into());
    let entity = service.encode();
    let decoded = decode_entity(&encode_entity(&entity)).unwrap();
    assert_eq!(Service::decode(&decoded).unwrap(), service);
}

// ── revision and CAS behaviour through typed puts ──

#[test]
fn test_typed_put_revisions_are_monotonic() {
    let store = open_store();
    let ctx = Context::background();
    let node = Node::new(compute_id("n1")).with_status(NodeStatus::Unknown);
    assert_eq!(store.put(&ctx, node.encode(), 0).unwrap(), 1);

    let ready = Node::new(compute_id("n1")).with_status(NodeStatus::Ready);
    assert_eq!(store.put(&ctx, ready.encode(), 1).unwrap(), 2);

    let stale = Node::new(compute_id("n1")).with_status(NodeStatus::Disabled);
    assert!(matches!(
        store.put(&ctx, stale.encode(), 1),
        Err(Error::CasFailed { .. })
    ));
}

// ── index consistency across status transitions ──

#[test]
fn test_status_index_tracks_node_transitions() {
    let store = open_store();
    let ctx = Context::background();
    let status_attr = Id::new(weft::model::compute::NODE_STATUS);
    let ready_value = Value::Enum(NodeStatus::Ready.id());

    store
        .put(&ctx, Node::new(compute_id("n1")).with_status(NodeStatus::Ready).encode(), 0)
        .unwrap();
    store
        .put(&ctx, Node::new(compute_id("n2")).with_status(NodeStatus::Unhealthy).encode(), 0)
        .unwrap();

    let ready = store.list(&ctx, &status_attr, &ready_value).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0.id(), Some(compute_id("n1")));

    // n1 degrades; the ready index must empty out.
    store
        .put(&ctx, Node::new(compute_id("n1")).with_status(NodeStatus::Unhealthy).encode(), 1)
        .unwrap();
    assert!(store.list(&ctx, &status_attr, &ready_value).unwrap().is_empty());
}

// ── watch completeness (replay + one event per mutation) ──

#[tokio::test]
async fn test_watch_sees_replay_plus_every_mutation_in_order() {
    let store = open_store();
    let ctx = Context::background();
    store
        .put(&ctx, Node::new(compute_id("n1")).with_status(NodeStatus::Ready).encode(), 0)
        .unwrap();

    let seen: Arc<Mutex<Vec<(EventOp, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let callback: WatchCallback = Arc::new(move |event| {
        let seen = seen_cb.clone();
        Box::pin(async move {
            seen.lock().unwrap().push((event.op, event.revision));
            Ok(())
        })
    });

    let sub = store.watch_kind(&ctx, &Node::kind(), callback).unwrap();

    store
        .put(&ctx, Node::new(compute_id("n1")).with_status(NodeStatus::Disabled).encode(), 1)
        .unwrap();
    store
        .put(&ctx, Node::new(compute_id("n2")).with_status(NodeStatus::Ready).encode(), 0)
        .unwrap();
    store.delete(&ctx, &compute_id("n2")).unwrap();

    wait_until(|| seen.lock().unwrap().len() == 4).await;
    let events = seen.lock().unwrap().clone();
    assert_eq!(events[0], (EventOp::Added, 1)); // replay of n1
    assert_eq!(events[1], (EventOp::Updated, 2)); // n1 status change
    assert_eq!(events[2], (EventOp::Added, 1)); // n2 created
    assert_eq!(events[3], (EventOp::Deleted, 1)); // n2 deleted
    sub.close().await;
}

// ── selectors must be indexed ──

#[test]
fn test_unindexed_selector_is_rejected() {
    let store = open_store();
    let ctx = Context::background();
    let err = store
        .list(
            &ctx,
            &Id::new(weft::model::network::SERVICE_IP),
            &Value::String("10.96.0.1".into()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotIndexed(_)));
}

// ── schema discovery ──

#[test]
fn test_attributes_discoverable_by_tag() {
    let store = open_store();
    let ctx = Context::background();
    let observed = store.get_attributes_by_tag(&ctx, "observed").unwrap();
    let ids: Vec<String> = observed
        .iter()
        .map(|e| e.id().unwrap().to_string())
        .collect();
    assert!(ids.contains(&weft::model::compute::NODE_STATUS.to_string()));
}

// ── deletion is terminal, recreation restarts revisions ──

#[test]
fn test_recreated_entity_restarts_at_revision_one() {
    let store = open_store();
    let ctx = Context::background();
    let sandbox = make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80);
    store.put(&ctx, sandbox.encode(), 0).unwrap();
    store.put(&ctx, sandbox.encode(), 1).unwrap();
    store.delete(&ctx, &compute_id("sb1")).unwrap();

    let (_, revision) = {
        store.put(&ctx, sandbox.encode(), 0).unwrap();
        store.get(&ctx, &compute_id("sb1")).unwrap()
    };
    assert_eq!(revision, 1);
}

// ── disk-backed store replays across reopen ──

#[test]
fn test_reopen_preserves_typed_entities() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::background();
    {
        let store =
            weft::store::EntityStore::open_at(dir.path(), weft::model::registry()).unwrap();
        store
            .put(&ctx, make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80).encode(), 0)
            .unwrap();
    }

    let store = weft::store::EntityStore::open_at(dir.path(), weft::model::registry()).unwrap();
    let (entity, revision) = store.get(&ctx, &compute_id("sb1")).unwrap();
    assert_eq!(revision, 1);
    let sandbox = Sandbox::decode(&entity).unwrap();
    assert_eq!(sandbox.ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(sandbox.labels, vec![("app".to_string(), "nginx".to_string())]);

    // The label index was rebuilt from the log.
    let matched = store
        .list(
            &ctx,
            &Id::new(weft::model::compute::SANDBOX_LABELS),
            &Value::Label {
                key: "app".into(),
                value: "nginx".into(),
            },
        )
        .unwrap();
    assert_eq!(matched.len(), 1);
}

// ── create ident handling ──

#[test]
fn test_create_entity_rejects_double_ident() {
    let store = open_store();
    let ctx = Context::background();
    let attrs = vec![
        Attr::ref_(weft::entity::DB_ID, compute_id("x")),
        Attr::ref_(weft::entity::DB_ID, compute_id("y")),
    ];
    assert!(matches!(
        store.create_entity(&ctx, attrs),
        Err(Error::Malformed(_))
    ));
}
