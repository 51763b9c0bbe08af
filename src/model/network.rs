//! Network domain: services, ports, and the projected endpoint sets.

use crate::entity::{Attr, Entity, Id};
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::schema::{AttrSpec, AttrType, Domain};

/* ============================= ATTRIBUTE IDS ============================= */

pub const DOMAIN: &str = "io.weft.network";

pub const KIND_SERVICE: &str = "io.weft.network/kind.service";
pub const SERVICE_IP: &str = "io.weft.network/service.ip";
pub const SERVICE_MATCH: &str = "io.weft.network/service.match";
pub const SERVICE_PORT: &str = "io.weft.network/service.port";

pub const PORT_NAME: &str = "io.weft.network/port.name";
pub const PORT_PORT: &str = "io.weft.network/port.port";
pub const PORT_NODE_PORT: &str = "io.weft.network/port.node_port";
pub const PORT_TARGET_PORT: &str = "io.weft.network/port.target_port";
pub const PORT_PROTOCOL: &str = "io.weft.network/port.protocol";
pub const PORT_TYPE: &str = "io.weft.network/port.type";
pub const PROTOCOL_TCP: &str = "io.weft.network/protocol.tcp";
pub const PROTOCOL_UDP: &str = "io.weft.network/protocol.udp";

pub const KIND_ENDPOINTS: &str = "io.weft.network/kind.endpoints";
pub const ENDPOINTS_ENDPOINT: &str = "io.weft.network/endpoints.endpoint";
pub const ENDPOINTS_SERVICE: &str = "io.weft.network/endpoints.service";
pub const ENDPOINT_IP: &str = "io.weft.network/endpoint.ip";
pub const ENDPOINT_PORT: &str = "io.weft.network/endpoint.port";

/* ============================= SCHEMA ============================= */

pub fn domain() -> Domain {
    Domain::new(DOMAIN)
        .attr(AttrSpec::new("service-ip", SERVICE_IP, AttrType::String).many())
        .attr(AttrSpec::new("service-match", SERVICE_MATCH, AttrType::Label).many())
        .attr(
            AttrSpec::new("service-port", SERVICE_PORT, AttrType::Component)
                .many()
                .component_of(vec![
                    AttrSpec::new("port-name", PORT_NAME, AttrType::String),
                    AttrSpec::new("port-port", PORT_PORT, AttrType::Int64),
                    AttrSpec::new("port-node-port", PORT_NODE_PORT, AttrType::Int64),
                    AttrSpec::new("port-target-port", PORT_TARGET_PORT, AttrType::Int64),
                    AttrSpec::new("port-protocol", PORT_PROTOCOL, AttrType::Enum)
                        .choices(&[PROTOCOL_TCP, PROTOCOL_UDP]),
                    AttrSpec::new("port-type", PORT_TYPE, AttrType::Keyword),
                ]),
        )
        .attr(AttrSpec::new("endpoints-service", ENDPOINTS_SERVICE, AttrType::Ref).indexed())
        .attr(
            AttrSpec::new("endpoints-endpoint", ENDPOINTS_ENDPOINT, AttrType::Component)
                .many()
                .component_of(vec![
                    AttrSpec::new("endpoint-ip", ENDPOINT_IP, AttrType::String),
                    AttrSpec::new("endpoint-port", ENDPOINT_PORT, AttrType::Int64),
                ]),
        )
        .singleton(KIND_SERVICE)
        .singleton(KIND_ENDPOINTS)
        .singleton(PROTOCOL_TCP)
        .singleton(PROTOCOL_UDP)
}

/* ============================= PORT ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn id(self) -> Id {
        Id::new(match self {
            Protocol::Tcp => PROTOCOL_TCP,
            Protocol::Udp => PROTOCOL_UDP,
        })
    }

    pub fn from_id(id: &Id) -> Result<Self> {
        match id.as_str() {
            PROTOCOL_TCP => Ok(Protocol::Tcp),
            PROTOCOL_UDP => Ok(Protocol::Udp),
            other => Err(Error::Malformed(format!("unknown protocol {other}"))),
        }
    }
}

/// One declared port, on a service or a sandbox.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Port {
    pub name: String,
    pub port: i64,
    pub node_port: i64,
    pub target_port: i64,
    pub protocol: Option<Protocol>,
    pub port_type: String,
}

impl Port {
    /// Empty iff every scalar is zero, the protocol is unset, and no
    /// name/type is present.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.port == 0
            && self.node_port == 0
            && self.target_port == 0
            && self.protocol.is_none()
            && self.port_type.is_empty()
    }

    /// The container-side port this service port selects: `target_port`
    /// when set, otherwise `port`.
    pub fn target(&self) -> i64 {
        if self.target_port != 0 {
            self.target_port
        } else {
            self.port
        }
    }

    pub(crate) fn decode(attrs: &[Attr]) -> Result<Self> {
        let e = Entity::from_attrs(attrs.to_vec());
        let mut port = Port {
            name: e.get_str(&Id::new(PORT_NAME))?.unwrap_or_default().to_string(),
            port: e.get_i64(&Id::new(PORT_PORT))?.unwrap_or(0),
            node_port: e.get_i64(&Id::new(PORT_NODE_PORT))?.unwrap_or(0),
            target_port: e.get_i64(&Id::new(PORT_TARGET_PORT))?.unwrap_or(0),
            protocol: None,
            port_type: e
                .get_keyword(&Id::new(PORT_TYPE))?
                .unwrap_or_default()
                .to_string(),
        };
        if let Some(attr) = e.get(&Id::new(PORT_PROTOCOL)) {
            port.protocol = Some(Protocol::from_id(attr.value.as_enum()?)?);
        }
        Ok(port)
    }

    pub(crate) fn encode(&self) -> Vec<Attr> {
        let mut attrs = Vec::new();
        if !self.name.is_empty() {
            attrs.push(Attr::string(PORT_NAME, self.name.as_str()));
        }
        if self.port != 0 {
            attrs.push(Attr::int64(PORT_PORT, self.port));
        }
        if self.node_port != 0 {
            attrs.push(Attr::int64(PORT_NODE_PORT, self.node_port));
        }
        if self.target_port != 0 {
            attrs.push(Attr::int64(PORT_TARGET_PORT, self.target_port));
        }
        if let Some(protocol) = self.protocol {
            attrs.push(Attr::enum_(PORT_PROTOCOL, protocol.id()));
        }
        if !self.port_type.is_empty() {
            attrs.push(Attr::keyword(PORT_TYPE, self.port_type.as_str()));
        }
        attrs
    }
}

/* ============================= SERVICE ============================= */

/// A label-selector plus port set addressed by cluster IPs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Service {
    pub id: Option<Id>,
    pub match_labels: Vec<(String, String)>,
    pub ports: Vec<Port>,
    pub ips: Vec<String>,
}

impl Service {
    pub fn new(id: Id) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn match_label(mut self, key: &str, value: &str) -> Self {
        self.match_labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }
}

impl Kinded for Service {
    fn kind() -> Id {
        Id::new(KIND_SERVICE)
    }

    fn entity_id(&self) -> Id {
        self.id.clone().expect("service carries an id")
    }

    fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("service without db/id".into()))?;
        let mut service = Service::new(id);
        for attr in entity.get_all(&Id::new(SERVICE_MATCH)) {
            let (k, v) = attr.value.as_label()?;
            service.match_labels.push((k.to_string(), v.to_string()));
        }
        for attr in entity.get_all(&Id::new(SERVICE_PORT)) {
            service.ports.push(Port::decode(attr.value.as_component()?)?);
        }
        for attr in entity.get_all(&Id::new(SERVICE_IP)) {
            service.ips.push(attr.value.as_str()?.to_string());
        }
        Ok(service)
    }

    fn encode(&self) -> Entity {
        let mut e = Entity::new(self.entity_id());
        e.declare_kind(Self::kind());
        for (k, v) in &self.match_labels {
            e.push(Attr::label(SERVICE_MATCH, k.as_str(), v.as_str()));
        }
        for port in &self.ports {
            e.push(Attr::component(SERVICE_PORT, port.encode()));
        }
        for ip in &self.ips {
            e.push(Attr::string(SERVICE_IP, ip.as_str()));
        }
        e
    }
}

/* ============================= ENDPOINTS ============================= */

/// The projected backend set for one `(service, sandbox)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub id: Id,
    pub service: Id,
    pub endpoints: Vec<(String, i64)>,
}

impl Endpoints {
    /// Deterministic identity for the `(service, sandbox)` projection.
    pub fn id_for(service: &Id, sandbox: &Id) -> Id {
        Id::new(&format!(
            "{DOMAIN}/endpoints-{}-{}",
            service.name(),
            sandbox.name()
        ))
    }
}

impl Kinded for Endpoints {
    fn kind() -> Id {
        Id::new(KIND_ENDPOINTS)
    }

    fn entity_id(&self) -> Id {
        self.id.clone()
    }

    fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("endpoints without db/id".into()))?;
        let service = entity
            .get_ref(&Id::new(ENDPOINTS_SERVICE))?
            .cloned()
            .ok_or_else(|| Error::Malformed("endpoints without service ref".into()))?;
        let mut endpoints = Vec::new();
        for attr in entity.get_all(&Id::new(ENDPOINTS_ENDPOINT)) {
            let inner = Entity::from_attrs(attr.value.as_component()?.to_vec());
            let ip = inner
                .get_str(&Id::new(ENDPOINT_IP))?
                .unwrap_or_default()
                .to_string();
            let port = inner.get_i64(&Id::new(ENDPOINT_PORT))?.unwrap_or(0);
            endpoints.push((ip, port));
        }
        Ok(Self {
            id,
            service,
            endpoints,
        })
    }

    fn encode(&self) -> Entity {
        let mut e = Entity::new(self.id.clone());
        e.declare_kind(Self::kind());
        e.push(Attr::ref_(ENDPOINTS_SERVICE, self.service.clone()));
        for (ip, port) in &self.endpoints {
            e.push(Attr::component(
                ENDPOINTS_ENDPOINT,
                vec![
                    Attr::string(ENDPOINT_IP, ip.as_str()),
                    Attr::int64(ENDPOINT_PORT, *port),
                ],
            ));
        }
        e
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_is_empty_requires_everything_unset() {
        assert!(Port::default().is_empty());
        assert!(!Port { port: 80, ..Default::default() }.is_empty());
        assert!(!Port { name: "http".into(), ..Default::default() }.is_empty());
        assert!(
            !Port {
                protocol: Some(Protocol::Tcp),
                ..Default::default()
            }
            .is_empty()
        );
        assert!(
            !Port {
                port_type: "node".into(),
                ..Default::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn test_port_target_prefers_target_port() {
        let p = Port {
            port: 80,
            target_port: 8080,
            ..Default::default()
        };
        assert_eq!(p.target(), 8080);
        let p = Port { port: 80, ..Default::default() };
        assert_eq!(p.target(), 80);
    }

    #[test]
    fn test_port_roundtrip() {
        let port = Port {
            name: "http".into(),
            port: 80,
            node_port: 30080,
            target_port: 8080,
            protocol: Some(Protocol::Tcp),
            port_type: "cluster".into(),
        };
        let decoded = Port::decode(&port.encode()).unwrap();
        assert_eq!(decoded, port);
    }

    #[test]
    fn test_service_roundtrip() {
        let svc = Service::new(Id::new("io.weft.network/svc-a"))
            .match_label("app", "nginx")
            .port(Port {
                port: 80,
                target_port: 80,
                ..Default::default()
            });
        let mut svc = svc;
        svc.ips.push("10.96.4.2".into());

        let entity = svc.encode();
        assert!(entity.has_kind(&Service::kind()));
        assert_eq!(Service::decode(&entity).unwrap(), svc);
    }

    #[test]
    fn test_endpoints_roundtrip() {
        let eps = Endpoints {
            id: Endpoints::id_for(
                &Id::new("io.weft.network/svc-a"),
                &Id::new("io.weft.compute/sb1"),
            ),
            service: Id::new("io.weft.network/svc-a"),
            endpoints: vec![("10.0.0.5".into(), 80)],
        };
        let decoded = Endpoints::decode(&eps.encode()).unwrap();
        assert_eq!(decoded, eps);
    }

    #[test]
    fn test_endpoints_id_shape() {
        let id = Endpoints::id_for(
            &Id::new("io.weft.network/svc-a"),
            &Id::new("io.weft.compute/sb1"),
        );
        assert_eq!(id.as_str(), "io.weft.network/endpoints-svc-a-sb1");
    }

    #[test]
    fn test_endpoints_decode_requires_service_ref() {
        let mut e = Entity::new(Id::new("io.weft.network/endpoints-x-y"));
        e.declare_kind(Endpoints::kind());
        assert!(Endpoints::decode(&e).is_err());
    }

    #[test]
    fn test_protocol_ids_roundtrip() {
        assert_eq!(Protocol::from_id(&Protocol::Tcp.id()).unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::from_id(&Protocol::Udp.id()).unwrap(), Protocol::Udp);
        assert!(Protocol::from_id(&Id::new("io.weft.network/protocol.sctp")).is_err());
    }
}
