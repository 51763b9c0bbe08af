//! Typed views over the entity kinds the controllers operate on.
//!
//! Each kind implements [`Kinded`]: a capability bundle of kind tag, entity
//! identity, and codec in both directions. Controllers stay polymorphic over
//! this trait; there are no runtime type tables.

pub mod compute;
pub mod ingress;
pub mod network;

use crate::entity::{Entity, Id};
use crate::error::Result;
use crate::schema::SchemaRegistry;

/// Capability set required by the reconcile framework: `{Encode, Decode,
/// Kind, EntityId}`.
pub trait Kinded: Sized + Send + Sync + 'static {
    /// The kind entity this type decodes.
    fn kind() -> Id;

    /// The identity of this instance.
    fn entity_id(&self) -> Id;

    /// Decode a typed view from a stored entity.
    fn decode(entity: &Entity) -> Result<Self>;

    /// Encode back into the full attribute form the store accepts.
    fn encode(&self) -> Entity;
}

/// Register every model domain on a registry. Call once per registry.
pub fn register_all(registry: &mut SchemaRegistry) -> Result<()> {
    registry.register(compute::domain())?;
    registry.register(network::domain())?;
    registry.register(ingress::domain())?;
    Ok(())
}

/// A fresh registry carrying the builtin schema plus all model domains.
pub fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    register_all(&mut registry).expect("model domains register once per registry");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_is_single_shot() {
        let mut r = SchemaRegistry::new();
        register_all(&mut r).unwrap();
        assert!(register_all(&mut r).is_err());
    }

    #[test]
    fn test_registry_knows_core_attrs() {
        let r = registry();
        assert!(r.is_indexed(&Id::new(compute::SANDBOX_LABELS)));
        assert!(r.is_indexed(&Id::new(network::ENDPOINTS_SERVICE)));
        assert!(r.is_indexed(&Id::new(ingress::HTTP_ROUTE_HOST)));
    }
}
