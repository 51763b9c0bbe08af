//! Ingress domain: host → app route entities.

use crate::entity::{Attr, Entity, Id};
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::schema::{AttrSpec, AttrType, Domain};

/* ============================= ATTRIBUTE IDS ============================= */

pub const DOMAIN: &str = "io.weft.ingress";

pub const KIND_HTTP_ROUTE: &str = "io.weft.ingress/kind.http_route";
pub const HTTP_ROUTE_APP: &str = "io.weft.ingress/http_route.app";
pub const HTTP_ROUTE_DEFAULT: &str = "io.weft.ingress/http_route.default";
pub const HTTP_ROUTE_HOST: &str = "io.weft.ingress/http_route.host";

/* ============================= SCHEMA ============================= */

pub fn domain() -> Domain {
    Domain::new(DOMAIN)
        .attr(AttrSpec::new("http-route-app", HTTP_ROUTE_APP, AttrType::Ref))
        // Encoded only when true, so the unique constraint admits at most
        // one default route cluster-wide.
        .attr(AttrSpec::new("http-route-default", HTTP_ROUTE_DEFAULT, AttrType::Bool).unique())
        .attr(AttrSpec::new("http-route-host", HTTP_ROUTE_HOST, AttrType::String).indexed())
        .singleton(KIND_HTTP_ROUTE)
}

/* ============================= HTTP ROUTE ============================= */

/// A host → app mapping driving the ingress router.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpRoute {
    pub id: Option<Id>,
    pub host: String,
    pub app: Option<Id>,
    pub default: bool,
}

impl HttpRoute {
    pub fn new(id: Id) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn app(mut self, app: Id) -> Self {
        self.app = Some(app);
        self
    }

    pub fn default_route(mut self) -> Self {
        self.default = true;
        self
    }
}

impl Kinded for HttpRoute {
    fn kind() -> Id {
        Id::new(KIND_HTTP_ROUTE)
    }

    fn entity_id(&self) -> Id {
        self.id.clone().expect("http route carries an id")
    }

    fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("http_route without db/id".into()))?;
        let mut route = HttpRoute::new(id);
        route.host = entity
            .get_str(&Id::new(HTTP_ROUTE_HOST))?
            .unwrap_or_default()
            .to_string();
        route.app = entity.get_ref(&Id::new(HTTP_ROUTE_APP))?.cloned();
        route.default = entity
            .get_bool(&Id::new(HTTP_ROUTE_DEFAULT))?
            .unwrap_or(false);
        Ok(route)
    }

    fn encode(&self) -> Entity {
        let mut e = Entity::new(self.entity_id());
        e.declare_kind(Self::kind());
        if !self.host.is_empty() {
            e.push(Attr::string(HTTP_ROUTE_HOST, self.host.as_str()));
        }
        if let Some(app) = &self.app {
            e.push(Attr::ref_(HTTP_ROUTE_APP, app.clone()));
        }
        if self.default {
            e.push(Attr::bool(HTTP_ROUTE_DEFAULT, true));
        }
        e
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_roundtrip() {
        let route = HttpRoute::new(Id::new("io.weft.ingress/r1"))
            .host("example.test")
            .app(Id::new("io.weft.compute/app1"));
        let decoded = HttpRoute::decode(&route.encode()).unwrap();
        assert_eq!(decoded, route);
    }

    #[test]
    fn test_default_flag_encoded_only_when_true() {
        let plain = HttpRoute::new(Id::new("io.weft.ingress/r1")).host("example.test");
        assert!(plain.encode().get(&Id::new(HTTP_ROUTE_DEFAULT)).is_none());

        let default = HttpRoute::new(Id::new("io.weft.ingress/r2")).default_route();
        let entity = default.encode();
        assert_eq!(entity.get_bool(&Id::new(HTTP_ROUTE_DEFAULT)).unwrap(), Some(true));
        assert!(HttpRoute::decode(&entity).unwrap().default);
    }

    #[test]
    fn test_route_without_host_decodes_empty() {
        let route = HttpRoute::new(Id::new("io.weft.ingress/r1")).default_route();
        let decoded = HttpRoute::decode(&route.encode()).unwrap();
        assert!(decoded.host.is_empty());
        assert!(decoded.app.is_none());
    }
}
