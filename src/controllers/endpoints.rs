//! Service → Endpoints projection.
//!
//! For every `(service, sandbox)` pair where the sandbox's labels satisfy
//! the service selector and a declared container port matches a service
//! port, exactly one Endpoints entity exists. Three subscriptions share one
//! core: service events resync that service, sandbox events resync every
//! service, and externally deleted Endpoints are recovered by a full
//! resync.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::Context;
use crate::entity::{Id, Value};
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::model::compute::{SANDBOX_LABELS, Sandbox};
use crate::model::network::{ENDPOINTS_SERVICE, Endpoints, Service};
use crate::reconcile::{self, Controller, ControllerHandle, Meta};
use crate::store::EntityStore;

/* ============================= CORE ============================= */

pub struct EndpointsCore {
    store: EntityStore,
}

impl EndpointsCore {
    pub fn new(store: EntityStore) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Sandboxes whose labels satisfy every `match` label of the service:
    /// one indexed lookup per label, intersected. An empty selector matches
    /// nothing.
    fn matching_sandboxes(&self, ctx: &Context, service: &Service) -> Result<Vec<Sandbox>> {
        if service.match_labels.is_empty() {
            return Ok(Vec::new());
        }
        let labels_attr = Id::new(SANDBOX_LABELS);
        let mut candidates: Option<Vec<Sandbox>> = None;
        for (key, value) in &service.match_labels {
            let selector = Value::Label {
                key: key.clone(),
                value: value.clone(),
            };
            let matched = self.store.list(ctx, &labels_attr, &selector)?;
            let ids: HashSet<Id> = matched.iter().filter_map(|(e, _)| e.id()).collect();
            candidates = Some(match candidates {
                None => {
                    let mut decoded = Vec::with_capacity(matched.len());
                    for (entity, _) in &matched {
                        decoded.push(Sandbox::decode(entity)?);
                    }
                    decoded
                }
                Some(prior) => prior
                    .into_iter()
                    .filter(|sb| sb.id.as_ref().is_some_and(|id| ids.contains(id)))
                    .collect(),
            });
        }
        Ok(candidates.unwrap_or_default())
    }

    /// The Endpoints entity a `(service, sandbox)` pair should project:
    /// one `(ip, port)` per service port whose target matches a declared
    /// sandbox port. `None` when nothing matches or the sandbox has no
    /// address yet.
    fn desired_endpoints(service: &Service, sandbox: &Sandbox) -> Option<Endpoints> {
        let ip = sandbox.ip.as_ref()?;
        let mut endpoints = Vec::new();
        for service_port in &service.ports {
            let target = service_port.target();
            if sandbox.ports.iter().any(|p| p.port == target) {
                endpoints.push((ip.clone(), target));
            }
        }
        if endpoints.is_empty() {
            return None;
        }
        Some(Endpoints {
            id: Endpoints::id_for(&service.entity_id(), &sandbox.entity_id()),
            service: service.entity_id(),
            endpoints,
        })
    }

    /// Converge the Endpoints set for one service: create/update projections
    /// for matching sandboxes, delete projections whose sandbox no longer
    /// matches.
    fn sync_service(&self, ctx: &Context, service: &Service) -> Result<()> {
        let service_id = service.entity_id();
        let matching = self.matching_sandboxes(ctx, service)?;

        let mut desired_ids = HashSet::new();
        for sandbox in &matching {
            let Some(desired) = Self::desired_endpoints(service, sandbox) else {
                continue;
            };
            desired_ids.insert(desired.id.clone());
            self.ensure(ctx, &desired)?;
        }

        let existing = self.store.list(
            ctx,
            &Id::new(ENDPOINTS_SERVICE),
            &Value::Ref(service_id.clone()),
        )?;
        for (entity, _) in existing {
            let Some(id) = entity.id() else { continue };
            if !desired_ids.contains(&id) {
                match self.store.delete(ctx, &id) {
                    Ok(_) => debug!(endpoints = %id, service = %service_id, "endpoints_removed"),
                    Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Write `desired` unless an identical projection is already stored.
    fn ensure(&self, ctx: &Context, desired: &Endpoints) -> Result<()> {
        match self.store.get(ctx, &desired.id) {
            Ok((entity, revision)) => {
                let current = Endpoints::decode(&entity)?;
                if &current == desired {
                    return Ok(());
                }
                self.store.put(ctx, desired.encode(), revision)?;
            }
            Err(Error::NotFound(_)) => {
                self.store.create_entity(ctx, desired.encode().into_attrs())?;
            }
            Err(err) => return Err(err),
        }
        debug!(endpoints = %desired.id, "endpoints_projected");
        Ok(())
    }

    /// Re-run the per-service logic for every service.
    fn sync_all(&self, ctx: &Context) -> Result<()> {
        for (entity, _) in self.store.list_kind(ctx, &Service::kind())? {
            let service = Service::decode(&entity)?;
            self.sync_service(ctx, &service)?;
        }
        Ok(())
    }

    /// Drop every projection referencing a deleted service.
    fn drop_service(&self, ctx: &Context, service_id: &Id) -> Result<()> {
        let existing = self.store.list(
            ctx,
            &Id::new(ENDPOINTS_SERVICE),
            &Value::Ref(service_id.clone()),
        )?;
        for (entity, _) in existing {
            if let Some(id) = entity.id() {
                match self.store.delete(ctx, &id) {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        info!(service = %service_id, "service_endpoints_dropped");
        Ok(())
    }
}

/* ============================= CONTROLLERS ============================= */

struct ServiceController {
    core: Arc<EndpointsCore>,
}

#[async_trait]
impl Controller<Service> for ServiceController {
    async fn create(&self, ctx: &Context, obj: Service, _meta: Meta) -> Result<()> {
        self.core.sync_service(ctx, &obj)
    }

    async fn delete(&self, ctx: &Context, id: Id) -> Result<()> {
        self.core.drop_service(ctx, &id)
    }
}

struct SandboxController {
    core: Arc<EndpointsCore>,
}

#[async_trait]
impl Controller<Sandbox> for SandboxController {
    async fn create(&self, ctx: &Context, _obj: Sandbox, _meta: Meta) -> Result<()> {
        // A sandbox change can enter or leave any service's selector;
        // services are few, resync them all.
        self.core.sync_all(ctx)
    }

    async fn delete(&self, ctx: &Context, _id: Id) -> Result<()> {
        self.core.sync_all(ctx)
    }
}

/// Recovers from external Endpoints deletion by re-running the projection.
struct RecoveryController {
    core: Arc<EndpointsCore>,
}

#[async_trait]
impl Controller<Endpoints> for RecoveryController {
    async fn create(&self, _ctx: &Context, _obj: Endpoints, _meta: Meta) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, ctx: &Context, _id: Id) -> Result<()> {
        self.core.sync_all(ctx)
    }
}

/* ============================= START ============================= */

pub struct EndpointsHandles {
    services: ControllerHandle,
    sandboxes: ControllerHandle,
    recovery: ControllerHandle,
}

impl EndpointsHandles {
    pub async fn close(self) {
        self.services.close().await;
        self.sandboxes.close().await;
        self.recovery.close().await;
    }
}

pub fn start(store: &EntityStore, ctx: &Context) -> Result<EndpointsHandles> {
    let core = EndpointsCore::new(store.clone());
    let services = reconcile::run::<Service, _>(store, Arc::new(ServiceController { core: core.clone() }), ctx)?;
    let sandboxes = reconcile::run::<Sandbox, _>(store, Arc::new(SandboxController { core: core.clone() }), ctx)?;
    let recovery = reconcile::run::<Endpoints, _>(store, Arc::new(RecoveryController { core }), ctx)?;
    Ok(EndpointsHandles {
        services,
        sandboxes,
        recovery,
    })
}

/* ============================= TESTS ============================= */
