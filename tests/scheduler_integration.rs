mod common;

use common::{compute_id, open_store, put_node, wait_until};
use weft::context::Context;
use weft::controllers::scheduler;
use weft::entity::Id;
use weft::model::Kinded;
use weft::model::compute::{NodeStatus, Sandbox};
use weft::store::EntityStore;

// ══════════════════════════════════════════════════════════════════
// Scheduler integration tests
//
// Drives the placement loop through the reconcile framework: a sandbox
// put converges to a schedule.key stamp, a cluster without ready nodes
// converges once a node arrives, and placements stay stable.
// ══════════════════════════════════════════════════════════════════

fn assigned_node(store: &EntityStore, ctx: &Context, id: &Id) -> Option<String> {
    let (entity, _) = store.get(ctx, id).ok()?;
    Sandbox::decode(&entity)
        .unwrap()
        .schedule
        .map(|key| key.node.name().to_string())
}

#[tokio::test]
async fn test_sandbox_acquires_schedule_key() {
    let store = open_store();
    let ctx = Context::background();
    put_node(&store, &ctx, "n1", NodeStatus::Ready);

    let handles = scheduler::start(&store, &ctx).unwrap();

    let sandbox = Sandbox::new(compute_id("s1")).label("app", "web");
    store.put(&ctx, sandbox.encode(), 0).unwrap();

    wait_until(|| assigned_node(&store, &ctx, &compute_id("s1")).is_some()).await;
    assert_eq!(
        assigned_node(&store, &ctx, &compute_id("s1")).as_deref(),
        Some("n1")
    );

    // The stamp decodes as a (kind, node) pair referencing the sandbox kind.
    let (entity, _) = store.get(&ctx, &compute_id("s1")).unwrap();
    let key = Sandbox::decode(&entity).unwrap().schedule.unwrap();
    assert_eq!(key.kind, Sandbox::kind());
    handles.close().await;
}

#[tokio::test]
async fn test_no_nodes_then_node_arrival_converges() {
    let store = open_store();
    let ctx = Context::background();
    let handles = scheduler::start(&store, &ctx).unwrap();

    let sandbox = Sandbox::new(compute_id("s1")).label("app", "web");
    store.put(&ctx, sandbox.encode(), 0).unwrap();

    // No mutation while no node is ready.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let (_, revision) = store.get(&ctx, &compute_id("s1")).unwrap();
    assert_eq!(revision, 1);
    assert!(assigned_node(&store, &ctx, &compute_id("s1")).is_none());

    put_node(&store, &ctx, "n1", NodeStatus::Ready);
    wait_until(|| assigned_node(&store, &ctx, &compute_id("s1")).is_some()).await;
    assert_eq!(
        assigned_node(&store, &ctx, &compute_id("s1")).as_deref(),
        Some("n1")
    );
    handles.close().await;
}

#[tokio::test]
async fn test_placement_is_stable_across_re_reconcile() {
    let store = open_store();
    let ctx = Context::background();
    put_node(&store, &ctx, "n1", NodeStatus::Ready);
    put_node(&store, &ctx, "n2", NodeStatus::Ready);

    let handles = scheduler::start(&store, &ctx).unwrap();
    store
        .put(&ctx, Sandbox::new(compute_id("s1")).label("app", "web").encode(), 0)
        .unwrap();
    wait_until(|| assigned_node(&store, &ctx, &compute_id("s1")).is_some()).await;
    let (_, revision_after_stamp) = store.get(&ctx, &compute_id("s1")).unwrap();

    // A second ready node appearing must not move the placement.
    put_node(&store, &ctx, "n3", NodeStatus::Ready);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let (_, revision_now) = store.get(&ctx, &compute_id("s1")).unwrap();
    assert_eq!(revision_after_stamp, revision_now);
    assert_eq!(
        assigned_node(&store, &ctx, &compute_id("s1")).as_deref(),
        Some("n1")
    );
    handles.close().await;
}

#[tokio::test]
async fn test_disabled_and_unhealthy_nodes_are_skipped() {
    let store = open_store();
    let ctx = Context::background();
    put_node(&store, &ctx, "n1", NodeStatus::Disabled);
    put_node(&store, &ctx, "n2", NodeStatus::Unhealthy);
    put_node(&store, &ctx, "n3", NodeStatus::Ready);

    let handles = scheduler::start(&store, &ctx).unwrap();
    store
        .put(&ctx, Sandbox::new(compute_id("s1")).label("app", "web").encode(), 0)
        .unwrap();

    wait_until(|| assigned_node(&store, &ctx, &compute_id("s1")).is_some()).await;
    assert_eq!(
        assigned_node(&store, &ctx, &compute_id("s1")).as_deref(),
        Some("n3")
    );
    handles.close().await;
}
