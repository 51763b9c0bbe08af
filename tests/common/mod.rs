#![allow(dead_code)]

use std::time::Duration;

use weft::context::Context;
use weft::entity::Id;
use weft::model::compute::{Node, NodeStatus, Sandbox};
use weft::model::network::{Port, Service};
use weft::model::{self, Kinded};
use weft::store::EntityStore;

pub fn open_store() -> EntityStore {
    EntityStore::open(model::registry()).unwrap()
}

pub fn compute_id(name: &str) -> Id {
    Id::new(&format!("io.weft.compute/{name}"))
}

pub fn network_id(name: &str) -> Id {
    Id::new(&format!("io.weft.network/{name}"))
}

pub fn ingress_id(name: &str) -> Id {
    Id::new(&format!("io.weft.ingress/{name}"))
}

pub fn put_node(store: &EntityStore, ctx: &Context, name: &str, status: NodeStatus) {
    let node = Node::new(compute_id(name)).with_status(status);
    store.put(ctx, node.encode(), 0).unwrap();
}

pub fn make_sandbox(name: &str, label: (&str, &str), ip: &str, port: i64) -> Sandbox {
    let mut sb = Sandbox::new(compute_id(name)).label(label.0, label.1);
    sb.ip = Some(ip.to_string());
    sb.ports.push(Port {
        port,
        ..Default::default()
    });
    sb
}

pub fn make_service(name: &str, label: (&str, &str), port: i64, target: i64) -> Service {
    Service::new(network_id(name))
        .match_label(label.0, label.1)
        .port(Port {
            port,
            target_port: target,
            ..Default::default()
        })
}

/// Poll until `cond` holds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should hold within the timeout");
}
