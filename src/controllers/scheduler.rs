//! The scheduler: assigns unscheduled sandboxes to ready nodes.
//!
//! Placement is deliberately simple: the first node advertising `ready`, in
//! index insertion order. A sandbox already carrying a placement stamp is
//! left alone, so event re-delivery is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::Context;
use crate::entity::Id;
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::model::compute::{self, Node, NodeStatus, Sandbox, ScheduleKey};
use crate::reconcile::{self, Controller, ControllerHandle, Meta};
use crate::store::EntityStore;

const CAS_ATTEMPTS: u32 = 3;

/* ============================= SCHEDULER ============================= */

pub struct Scheduler {
    store: EntityStore,
    /// Controller-wide placement lock: one assignment decision at a time.
    assign: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: EntityStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            assign: Mutex::new(()),
        })
    }

    /// Assign `sandbox_id` to a ready node if it has no placement yet.
    ///
    /// CAS losses refetch and retry up to three times; beyond that the error
    /// surfaces to the framework's retry. A cluster with no ready node is
    /// logged and left unmutated — the next sandbox event or node readiness
    /// change re-triggers reconciliation.
    pub async fn schedule_sandbox(&self, ctx: &Context, sandbox_id: &Id) -> Result<()> {
        let mut last_err = None;
        for _ in 0..CAS_ATTEMPTS {
            let (entity, revision) = match self.store.get(ctx, sandbox_id) {
                Ok(found) => found,
                // Deleted between event and reconcile; nothing to place.
                Err(Error::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err),
            };
            if compute::has_schedule(&entity) {
                return Ok(());
            }

            let _placement = self.assign.lock().await;
            let Some(node) = self.first_ready_node(ctx)? else {
                info!(sandbox = %sandbox_id, "schedule_no_ready_nodes");
                return Ok(());
            };

            let key = ScheduleKey::sandbox(node.clone());
            let stamped = compute::stamp_schedule(&entity, &key);
            match self.store.put(ctx, stamped, revision) {
                Ok(new_revision) => {
                    info!(
                        sandbox = %sandbox_id,
                        node = %node,
                        revision = new_revision,
                        "schedule_assigned"
                    );
                    return Ok(());
                }
                Err(err @ Error::CasFailed { .. }) => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        warn!(sandbox = %sandbox_id, "schedule_cas_retries_exhausted");
        Err(last_err.unwrap_or(Error::Canceled))
    }

    /// First `ready` node in index insertion order.
    fn first_ready_node(&self, ctx: &Context) -> Result<Option<Id>> {
        for (entity, _) in self.store.list_kind(ctx, &Node::kind())? {
            let node = Node::decode(&entity)?;
            if node.status == NodeStatus::Ready {
                return Ok(Some(node.id));
            }
        }
        Ok(None)
    }

    /// Assign every sandbox still lacking a placement. Used when a node
    /// turns ready.
    async fn sweep_unscheduled(&self, ctx: &Context) -> Result<()> {
        for (entity, _) in self.store.list_kind(ctx, &Sandbox::kind())? {
            if compute::has_schedule(&entity) {
                continue;
            }
            let Some(id) = entity.id() else { continue };
            self.schedule_sandbox(ctx, &id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Controller<Sandbox> for Scheduler {
    async fn create(&self, ctx: &Context, obj: Sandbox, _meta: Meta) -> Result<()> {
        self.schedule_sandbox(ctx, &obj.entity_id()).await
    }

    async fn delete(&self, _ctx: &Context, _id: Id) -> Result<()> {
        // Placement dies with the sandbox.
        Ok(())
    }
}

/* ============================= NODE SWEEP ============================= */

/// Companion controller: a node turning ready re-triggers scheduling for
/// every sandbox that missed placement while no node was available.
struct NodeSweep {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl Controller<Node> for NodeSweep {
    async fn create(&self, ctx: &Context, obj: Node, _meta: Meta) -> Result<()> {
        if obj.status == NodeStatus::Ready {
            self.scheduler.sweep_unscheduled(ctx).await?;
        }
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, _id: Id) -> Result<()> {
        Ok(())
    }
}

/* ============================= START ============================= */

pub struct SchedulerHandles {
    sandboxes: ControllerHandle,
    nodes: ControllerHandle,
}

impl SchedulerHandles {
    pub async fn close(self) {
        self.sandboxes.close().await;
        self.nodes.close().await;
    }
}

/// Start the sandbox-placement loop and its node-readiness companion.
pub fn start(store: &EntityStore, ctx: &Context) -> Result<SchedulerHandles> {
    let scheduler = Scheduler::new(store.clone());
    let sandboxes = reconcile::run::<Sandbox, _>(store, scheduler.clone(), ctx)?;
    let nodes = reconcile::run::<Node, _>(store, Arc::new(NodeSweep { scheduler }), ctx)?;
    Ok(SchedulerHandles { sandboxes, nodes })
}

/* ============================= TESTS ============================= */
