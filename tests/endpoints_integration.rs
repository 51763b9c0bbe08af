mod common;

use common::{compute_id, make_sandbox, make_service, network_id, open_store, wait_until};
use weft::context::Context;
use weft::controllers::endpoints;
use weft::entity::{Id, Value};
use weft::model::Kinded;
use weft::model::network::{ENDPOINTS_SERVICE, Endpoints};
use weft::store::EntityStore;

// ══════════════════════════════════════════════════════════════════
// Endpoints projection integration tests
//
// The bijection invariant: one Endpoints entity per (service, sandbox)
// pair satisfying selector and port match, torn down within a reconcile
// round when either side goes away.
// ══════════════════════════════════════════════════════════════════

fn projections(store: &EntityStore, ctx: &Context, service: &str) -> Vec<Endpoints> {
    store
        .list(
            ctx,
            &Id::new(ENDPOINTS_SERVICE),
            &Value::Ref(network_id(service)),
        )
        .unwrap()
        .iter()
        .map(|(e, _)| Endpoints::decode(e).unwrap())
        .collect()
}

#[tokio::test]
async fn test_matching_pair_projects_single_endpoint() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    store
        .put(&ctx, make_service("svc-b", ("app", "nginx"), 80, 80).encode(), 0)
        .unwrap();
    store
        .put(&ctx, make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80).encode(), 0)
        .unwrap();

    wait_until(|| projections(&store, &ctx, "svc-b").len() == 1).await;
    let eps = projections(&store, &ctx, "svc-b");
    assert_eq!(eps[0].service, network_id("svc-b"));
    assert_eq!(eps[0].endpoints, vec![("10.0.0.5".to_string(), 80)]);
    assert_eq!(
        eps[0].id.as_str(),
        "io.weft.network/endpoints-svc-b-sb1"
    );
    handles.close().await;
}

#[tokio::test]
async fn test_sandbox_delete_tears_down_projection() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    store
        .put(&ctx, make_service("svc-b", ("app", "nginx"), 80, 80).encode(), 0)
        .unwrap();
    store
        .put(&ctx, make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80).encode(), 0)
        .unwrap();
    wait_until(|| projections(&store, &ctx, "svc-b").len() == 1).await;

    store.delete(&ctx, &compute_id("sb1")).unwrap();
    wait_until(|| projections(&store, &ctx, "svc-b").is_empty()).await;
    handles.close().await;
}

#[tokio::test]
async fn test_service_delete_tears_down_projection() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    store
        .put(&ctx, make_service("svc-b", ("app", "nginx"), 80, 80).encode(), 0)
        .unwrap();
    store
        .put(&ctx, make_sandbox("sb1", ("app", "nginx"), "10.0.0.5", 80).encode(), 0)
        .unwrap();
    wait_until(|| projections(&store, &ctx, "svc-b").len() == 1).await;

    store.delete(&ctx, &network_id("svc-b")).unwrap();
    wait_until(|| projections(&store, &ctx, "svc-b").is_empty()).await;
    handles.close().await;
}

#[tokio::test]
async fn test_multiple_sandboxes_one_projection_each() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    store
        .put(&ctx, make_service("svc-b", ("app", "nginx"), 80, 80).encode(), 0)
        .unwrap();
    for (name, ip) in [("sb1", "10.0.0.5"), ("sb2", "10.0.0.6"), ("sb3", "10.0.0.7")] {
        store
            .put(&ctx, make_sandbox(name, ("app", "nginx"), ip, 80).encode(), 0)
            .unwrap();
    }

    wait_until(|| projections(&store, &ctx, "svc-b").len() == 3).await;
    let mut ips: Vec<String> = projections(&store, &ctx, "svc-b")
        .iter()
        .map(|e| e.endpoints[0].0.clone())
        .collect();
    ips.sort();
    assert_eq!(ips, vec!["10.0.0.5", "10.0.0.6", "10.0.0.7"]);
    handles.close().await;
}

#[tokio::test]
async fn test_non_matching_labels_never_project() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    store
        .put(&ctx, make_service("svc-b", ("app", "nginx"), 80, 80).encode(), 0)
        .unwrap();
    store
        .put(&ctx, make_sandbox("sb1", ("app", "redis"), "10.0.0.5", 80).encode(), 0)
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert!(projections(&store, &ctx, "svc-b").is_empty());
    handles.close().await;
}

#[tokio::test]
async fn test_service_event_before_sandbox_converges() {
    let store = open_store();
    let ctx = Context::background();
    let handles = endpoints::start(&store, &ctx).unwrap();

    // Service first, nothing matches yet; sandbox arrives later.
    store
        .put(&ctx, make_service("svc-b", ("app", "api"), 8080, 8080).encode(), 0)
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    store
        .put(&ctx, make_sandbox("sb9", ("app", "api"), "10.0.0.9", 8080).encode(), 0)
        .unwrap();

    wait_until(|| projections(&store, &ctx, "svc-b").len() == 1).await;
    assert_eq!(
        projections(&store, &ctx, "svc-b")[0].endpoints,
        vec![("10.0.0.9".to_string(), 8080)]
    );
    handles.close().await;
}
