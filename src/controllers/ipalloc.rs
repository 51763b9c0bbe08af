//! Cluster-IP allocation from operator-configured prefixes.
//!
//! The first candidate for an owner is derived from a BLAKE2b hash of the
//! owner id seeding a PRNG, so a freshly restarted allocator proposes the
//! same address for the same owner. Collision fallbacks come from an
//! entropy-seeded PRNG; an exhausted prefix surfaces as an error.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blake2::{Blake2b512, Digest};
use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::context::Context;
use crate::entity::{Attr, Id};
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::model::network::{SERVICE_IP, Service};
use crate::reconcile::{self, Controller, ControllerHandle, Meta};
use crate::store::EntityStore;

const RANDOM_ATTEMPTS: u32 = 1024;
const SCAN_LIMIT: u128 = 1 << 20;
const CAS_ATTEMPTS: u32 = 3;

/* ============================= PREFIX MATH ============================= */

/// Offset range of assignable hosts inside a prefix: v4 skips the network
/// and broadcast addresses when there is room, v6 skips the network address.
fn host_range(net: &IpNet) -> (u128, u128) {
    match net {
        IpNet::V4(n) => {
            let bits = 32 - u32::from(n.prefix_len());
            let total = 1u128 << bits;
            if bits >= 2 { (1, total - 2) } else { (0, total) }
        }
        IpNet::V6(n) => {
            let bits = 128 - u32::from(n.prefix_len());
            if bits == 0 {
                (0, 1)
            } else if bits >= 128 {
                (1, u128::MAX)
            } else {
                (1, (1u128 << bits) - 1)
            }
        }
    }
}

fn host_at(net: &IpNet, offset: u128) -> IpAddr {
    match net {
        IpNet::V4(n) => {
            let base = u32::from(n.network());
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset as u32)))
        }
        IpNet::V6(n) => {
            let base = u128::from(n.network());
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

/* ============================= ALLOCATOR ============================= */

pub struct IpAllocator {
    prefixes: Vec<IpNet>,
    /// Guarded across read → candidate pick → insert, so two concurrent
    /// allocations cannot land on the same address.
    owners: Mutex<HashMap<IpAddr, Id>>,
}

impl IpAllocator {
    pub fn new(prefixes: Vec<IpNet>) -> Arc<Self> {
        Arc::new(Self {
            prefixes,
            owners: Mutex::new(HashMap::new()),
        })
    }

    pub fn prefixes(&self) -> &[IpNet] {
        &self.prefixes
    }

    /// The deterministic first candidate for `owner` in `prefix`.
    pub fn hashed_candidate(prefix: &IpNet, owner: &Id) -> IpAddr {
        let digest = Blake2b512::digest(owner.as_str().as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest[..32]);
        let mut rng = StdRng::from_seed(seed);
        let (first, count) = host_range(prefix);
        host_at(prefix, first + rng.r#gen::<u128>() % count)
    }

    /// Full rescan of Service entities, seeding the address map from their
    /// `service.ip` attributes. Malformed addresses aggregate into one error
    /// without aborting the scan.
    pub fn refresh(&self, ctx: &Context, store: &EntityStore) -> Result<()> {
        let services = store.list_kind(ctx, &Service::kind())?;
        let mut malformed = Vec::new();
        let mut owners = self.owners.lock().expect("allocator lock");
        owners.clear();
        for (entity, _) in services {
            let service = Service::decode(&entity)?;
            let owner = service.id.clone().expect("decoded service has an id");
            for ip in &service.ips {
                match ip.parse::<IpAddr>() {
                    Ok(addr) => {
                        owners.insert(addr, owner.clone());
                    }
                    Err(_) => malformed.push(format!("{owner}: {ip}")),
                }
            }
        }
        drop(owners);
        if malformed.is_empty() {
            Ok(())
        } else {
            Err(Error::Provider(format!(
                "malformed service addresses: {}",
                malformed.join(", ")
            )))
        }
    }

    /// One address per configured prefix, recorded under `owner`.
    pub fn allocate(&self, ctx: &Context, owner: &Id) -> Result<Vec<IpAddr>> {
        ctx.check()?;
        let mut owners = self.owners.lock().expect("allocator lock");
        let mut out = Vec::with_capacity(self.prefixes.len());
        for prefix in &self.prefixes {
            let addr = Self::pick(&owners, prefix, owner)?;
            owners.insert(addr, owner.clone());
            out.push(addr);
        }
        Ok(out)
    }

    /// Forget every address recorded for `owner`.
    pub fn release(&self, owner: &Id) {
        let mut owners = self.owners.lock().expect("allocator lock");
        owners.retain(|_, o| o != owner);
    }

    pub fn owner_of(&self, addr: &IpAddr) -> Option<Id> {
        self.owners.lock().expect("allocator lock").get(addr).cloned()
    }

    fn pick(owners: &HashMap<IpAddr, Id>, prefix: &IpNet, owner: &Id) -> Result<IpAddr> {
        let (first, count) = host_range(prefix);
        let in_use = owners.keys().filter(|a| prefix.contains(*a)).count() as u128;
        if in_use >= count {
            return Err(Error::Exhausted(prefix.to_string()));
        }

        let stable = Self::hashed_candidate(prefix, owner);
        if !owners.contains_key(&stable) {
            return Ok(stable);
        }

        let mut rng = StdRng::from_entropy();
        for _ in 0..RANDOM_ATTEMPTS {
            let addr = host_at(prefix, first + rng.r#gen::<u128>() % count);
            if !owners.contains_key(&addr) {
                return Ok(addr);
            }
        }
        // Small prefixes get a deterministic sweep before giving up.
        if count <= SCAN_LIMIT {
            for offset in 0..count {
                let addr = host_at(prefix, first + offset);
                if !owners.contains_key(&addr) {
                    return Ok(addr);
                }
            }
        }
        Err(Error::Exhausted(prefix.to_string()))
    }
}

/* ============================= SERVICE IP CONTROLLER ============================= */

/// Watches the Service kind and CAS-writes allocated addresses onto any
/// service that lacks them.
struct ServiceIpController {
    allocator: Arc<IpAllocator>,
    store: EntityStore,
}

impl ServiceIpController {
    async fn ensure_ips(&self, ctx: &Context, id: &Id) -> Result<()> {
        let mut last_err = None;
        for _ in 0..CAS_ATTEMPTS {
            let (entity, revision) = match self.store.get(ctx, id) {
                Ok(found) => found,
                Err(Error::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err),
            };
            let service = Service::decode(&entity)?;
            if !service.ips.is_empty() {
                return Ok(());
            }

            let addrs = match self.allocator.allocate(ctx, id) {
                Ok(addrs) => addrs,
                Err(err @ Error::Exhausted(_)) => {
                    // Left without a cluster IP until operator action.
                    warn!(service = %id, error = %err, "service_ip_prefixes_exhausted");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let mut updated = (*entity).clone();
            for addr in &addrs {
                updated.push(Attr::string(SERVICE_IP, addr.to_string()));
            }
            match self.store.put(ctx, updated, revision) {
                Ok(_) => {
                    info!(service = %id, addrs = ?addrs, "service_ip_assigned");
                    return Ok(());
                }
                Err(err @ Error::CasFailed { .. }) => {
                    self.allocator.release(id);
                    last_err = Some(err);
                    continue;
                }
                Err(err) => {
                    self.allocator.release(id);
                    return Err(err);
                }
            }
        }
        Err(last_err.unwrap_or(Error::Canceled))
    }
}

#[async_trait]
impl Controller<Service> for ServiceIpController {
    async fn create(&self, ctx: &Context, obj: Service, _meta: Meta) -> Result<()> {
        self.ensure_ips(ctx, &obj.entity_id()).await
    }

    async fn delete(&self, _ctx: &Context, id: Id) -> Result<()> {
        self.allocator.release(&id);
        Ok(())
    }
}

/// Seed the allocator from current services, then keep every service
/// supplied with cluster IPs.
pub fn watch(
    allocator: Arc<IpAllocator>,
    store: &EntityStore,
    ctx: &Context,
) -> Result<ControllerHandle> {
    // Malformed recorded addresses are reported but never block startup.
    if let Err(err) = allocator.refresh(ctx, store) {
        warn!(error = %err, "ip_allocator_refresh_incomplete");
    }
    let controller = Arc::new(ServiceIpController {
        allocator,
        store: store.clone(),
    });
    reconcile::run::<Service, _>(store, controller, ctx)
}

/* ============================= TESTS ============================= */
