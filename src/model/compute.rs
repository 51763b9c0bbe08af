//! Compute domain: nodes, sandboxes, and the scheduler's placement stamp.

use crate::entity::{Attr, Entity, Id, Value};
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::model::network::{self, Port};
use crate::schema::{AttrSpec, AttrType, Domain};

/* ============================= ATTRIBUTE IDS ============================= */

pub const DOMAIN: &str = "io.weft.compute";

pub const KIND_NODE: &str = "io.weft.compute/kind.node";
pub const NODE_CONSTRAINTS: &str = "io.weft.compute/node.constraints";
pub const NODE_STATUS: &str = "io.weft.compute/node.status";
pub const STATUS_UNKNOWN: &str = "io.weft.compute/status.unknown";
pub const STATUS_READY: &str = "io.weft.compute/status.ready";
pub const STATUS_DISABLED: &str = "io.weft.compute/status.disabled";
pub const STATUS_UNHEALTHY: &str = "io.weft.compute/status.unhealthy";

pub const KIND_SANDBOX: &str = "io.weft.compute/kind.sandbox";
pub const SANDBOX_CONTAINER: &str = "io.weft.compute/sandbox.container";
pub const SANDBOX_NETWORK: &str = "io.weft.compute/sandbox.network";
pub const SANDBOX_PORT: &str = "io.weft.compute/sandbox.port";
pub const SANDBOX_ROUTE: &str = "io.weft.compute/sandbox.route";
pub const SANDBOX_VOLUME: &str = "io.weft.compute/sandbox.volume";
pub const SANDBOX_LABELS: &str = "io.weft.compute/sandbox.labels";
pub const SANDBOX_HOST_NETWORK: &str = "io.weft.compute/sandbox.hostNetwork";

pub const CONTAINER_COMMAND: &str = "io.weft.compute/container.command";
pub const CONTAINER_DIRECTORY: &str = "io.weft.compute/container.directory";
pub const CONTAINER_ENV: &str = "io.weft.compute/container.env";
pub const CONTAINER_IMAGE: &str = "io.weft.compute/container.image";
pub const CONTAINER_MOUNT: &str = "io.weft.compute/container.mount";
pub const CONTAINER_NAME: &str = "io.weft.compute/container.name";
pub const CONTAINER_OOM_SCORE: &str = "io.weft.compute/container.oom_score";
pub const CONTAINER_PRIVILEGED: &str = "io.weft.compute/container.privileged";

pub const NETWORK_IP: &str = "io.weft.compute/network.ip";

pub const KIND_SCHEDULE: &str = "io.weft.compute/kind.schedule";
pub const SCHEDULE_KEY: &str = "io.weft.compute/schedule.key";
pub const KEY_KIND: &str = "io.weft.compute/key.kind";
pub const KEY_NODE: &str = "io.weft.compute/key.node";

/* ============================= SCHEMA ============================= */

pub fn domain() -> Domain {
    Domain::new(DOMAIN)
        .attr(AttrSpec::new("node-constraints", NODE_CONSTRAINTS, AttrType::Label).many())
        .attr(
            AttrSpec::new("node-status", NODE_STATUS, AttrType::Enum)
                .indexed()
                .choices(&[STATUS_UNKNOWN, STATUS_READY, STATUS_DISABLED, STATUS_UNHEALTHY])
                .tag("observed"),
        )
        .attr(
            AttrSpec::new("sandbox-container", SANDBOX_CONTAINER, AttrType::Component)
                .many()
                .component_of(vec![
                    AttrSpec::new("container-command", CONTAINER_COMMAND, AttrType::String).many(),
                    AttrSpec::new("container-directory", CONTAINER_DIRECTORY, AttrType::String),
                    AttrSpec::new("container-env", CONTAINER_ENV, AttrType::Label).many(),
                    AttrSpec::new("container-image", CONTAINER_IMAGE, AttrType::String),
                    AttrSpec::new("container-mount", CONTAINER_MOUNT, AttrType::String).many(),
                    AttrSpec::new("container-name", CONTAINER_NAME, AttrType::String),
                    AttrSpec::new("container-oom-score", CONTAINER_OOM_SCORE, AttrType::Int64),
                    AttrSpec::new("container-privileged", CONTAINER_PRIVILEGED, AttrType::Bool),
                ]),
        )
        .attr(
            AttrSpec::new("sandbox-network", SANDBOX_NETWORK, AttrType::Component).component_of(
                vec![AttrSpec::new("network-ip", NETWORK_IP, AttrType::String)],
            ),
        )
        // Inner port attrs belong to the network domain.
        .attr(AttrSpec::new("sandbox-port", SANDBOX_PORT, AttrType::Component).many())
        .attr(AttrSpec::new("sandbox-route", SANDBOX_ROUTE, AttrType::Component).many())
        .attr(AttrSpec::new("sandbox-volume", SANDBOX_VOLUME, AttrType::Component).many())
        .attr(AttrSpec::new("sandbox-labels", SANDBOX_LABELS, AttrType::Label).many().indexed())
        .attr(AttrSpec::new("sandbox-host-network", SANDBOX_HOST_NETWORK, AttrType::Bool))
        .attr(
            AttrSpec::new("schedule-key", SCHEDULE_KEY, AttrType::Component).component_of(vec![
                AttrSpec::new("key-kind", KEY_KIND, AttrType::Ref),
                AttrSpec::new("key-node", KEY_NODE, AttrType::Ref),
            ]),
        )
        .singleton(KIND_NODE)
        .singleton(KIND_SANDBOX)
        .singleton(KIND_SCHEDULE)
        .singleton(STATUS_UNKNOWN)
        .singleton(STATUS_READY)
        .singleton(STATUS_DISABLED)
        .singleton(STATUS_UNHEALTHY)
}

/* ============================= NODE ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Ready,
    Disabled,
    Unhealthy,
}

impl NodeStatus {
    pub fn id(self) -> Id {
        Id::new(match self {
            NodeStatus::Unknown => STATUS_UNKNOWN,
            NodeStatus::Ready => STATUS_READY,
            NodeStatus::Disabled => STATUS_DISABLED,
            NodeStatus::Unhealthy => STATUS_UNHEALTHY,
        })
    }

    pub fn from_id(id: &Id) -> Result<Self> {
        match id.as_str() {
            STATUS_UNKNOWN => Ok(NodeStatus::Unknown),
            STATUS_READY => Ok(NodeStatus::Ready),
            STATUS_DISABLED => Ok(NodeStatus::Disabled),
            STATUS_UNHEALTHY => Ok(NodeStatus::Unhealthy),
            other => Err(Error::Malformed(format!("unknown node status {other}"))),
        }
    }
}

/// A compute host advertising readiness and label constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: Id,
    pub constraints: Vec<(String, String)>,
    pub status: NodeStatus,
}

impl Node {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            constraints: Vec::new(),
            status: NodeStatus::Unknown,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }
}

impl Kinded for Node {
    fn kind() -> Id {
        Id::new(KIND_NODE)
    }

    fn entity_id(&self) -> Id {
        self.id.clone()
    }

    fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("node without db/id".into()))?;
        let mut node = Node::new(id);
        for attr in entity.get_all(&Id::new(NODE_CONSTRAINTS)) {
            let (k, v) = attr.value.as_label()?;
            node.constraints.push((k.to_string(), v.to_string()));
        }
        if let Some(attr) = entity.get(&Id::new(NODE_STATUS)) {
            node.status = NodeStatus::from_id(attr.value.as_enum()?)?;
        }
        Ok(node)
    }

    fn encode(&self) -> Entity {
        let mut e = Entity::new(self.id.clone());
        e.declare_kind(Self::kind());
        for (k, v) in &self.constraints {
            e.push(Attr::label(NODE_CONSTRAINTS, k.as_str(), v.as_str()));
        }
        e.push(Attr::enum_(NODE_STATUS, self.status.id()));
        e
    }
}

/* ============================= SANDBOX ============================= */

/// One container in a sandbox's declarative grouping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub directory: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<String>,
    pub oom_score: i64,
    pub privileged: bool,
}

impl ContainerSpec {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.image.is_empty()
            && self.command.is_empty()
            && self.directory.is_empty()
            && self.env.is_empty()
            && self.mounts.is_empty()
            && self.oom_score == 0
            && !self.privileged
    }

    fn decode(attrs: &[Attr]) -> Result<Self> {
        let mut c = ContainerSpec::default();
        for attr in attrs {
            match attr.id.as_str() {
                CONTAINER_NAME => c.name = attr.value.as_str()?.to_string(),
                CONTAINER_IMAGE => c.image = attr.value.as_str()?.to_string(),
                CONTAINER_COMMAND => c.command.push(attr.value.as_str()?.to_string()),
                CONTAINER_DIRECTORY => c.directory = attr.value.as_str()?.to_string(),
                CONTAINER_ENV => {
                    let (k, v) = attr.value.as_label()?;
                    c.env.push((k.to_string(), v.to_string()));
                }
                CONTAINER_MOUNT => c.mounts.push(attr.value.as_str()?.to_string()),
                CONTAINER_OOM_SCORE => c.oom_score = attr.value.as_i64()?,
                CONTAINER_PRIVILEGED => c.privileged = attr.value.as_bool()?,
                _ => {}
            }
        }
        Ok(c)
    }

    fn encode(&self) -> Vec<Attr> {
        let mut attrs = Vec::new();
        if !self.name.is_empty() {
            attrs.push(Attr::string(CONTAINER_NAME, self.name.as_str()));
        }
        if !self.image.is_empty() {
            attrs.push(Attr::string(CONTAINER_IMAGE, self.image.as_str()));
        }
        for arg in &self.command {
            attrs.push(Attr::string(CONTAINER_COMMAND, arg.as_str()));
        }
        if !self.directory.is_empty() {
            attrs.push(Attr::string(CONTAINER_DIRECTORY, self.directory.as_str()));
        }
        for (k, v) in &self.env {
            attrs.push(Attr::label(CONTAINER_ENV, k.as_str(), v.as_str()));
        }
        for mount in &self.mounts {
            attrs.push(Attr::string(CONTAINER_MOUNT, mount.as_str()));
        }
        if self.oom_score != 0 {
            attrs.push(Attr::int64(CONTAINER_OOM_SCORE, self.oom_score));
        }
        if self.privileged {
            attrs.push(Attr::bool(CONTAINER_PRIVILEGED, true));
        }
        attrs
    }
}

/// Placement stamp added by the scheduler: `(kind, node-id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleKey {
    pub kind: Id,
    pub node: Id,
}

impl ScheduleKey {
    pub fn sandbox(node: Id) -> Self {
        Self {
            kind: Id::new(KIND_SANDBOX),
            node,
        }
    }

    fn decode(attrs: &[Attr]) -> Result<Self> {
        let e = Entity::from_attrs(attrs.to_vec());
        let kind = e
            .get_ref(&Id::new(KEY_KIND))?
            .cloned()
            .ok_or_else(|| Error::Malformed("schedule.key without key.kind".into()))?;
        let node = e
            .get_ref(&Id::new(KEY_NODE))?
            .cloned()
            .ok_or_else(|| Error::Malformed("schedule.key without key.node".into()))?;
        Ok(Self { kind, node })
    }

    fn encode(&self) -> Vec<Attr> {
        vec![
            Attr::ref_(KEY_KIND, self.kind.clone()),
            Attr::ref_(KEY_NODE, self.node.clone()),
        ]
    }
}

/// A declarative grouping of containers placed onto a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sandbox {
    pub id: Option<Id>,
    pub labels: Vec<(String, String)>,
    pub containers: Vec<ContainerSpec>,
    /// Assigned container address, once the node agent has one.
    pub ip: Option<String>,
    pub ports: Vec<Port>,
    pub host_network: bool,
    pub schedule: Option<ScheduleKey>,
    /// Opaque route/volume components, carried through untouched.
    pub routes: Vec<Vec<Attr>>,
    pub volumes: Vec<Vec<Attr>>,
}

impl Sandbox {
    pub fn new(id: Id) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn scheduled(&self) -> bool {
        self.schedule.is_some()
    }
}

impl Kinded for Sandbox {
    fn kind() -> Id {
        Id::new(KIND_SANDBOX)
    }

    fn entity_id(&self) -> Id {
        self.id.clone().expect("sandbox carries an id")
    }

    fn decode(entity: &Entity) -> Result<Self> {
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("sandbox without db/id".into()))?;
        let mut sandbox = Sandbox::new(id);

        for attr in entity.get_all(&Id::new(SANDBOX_LABELS)) {
            let (k, v) = attr.value.as_label()?;
            sandbox.labels.push((k.to_string(), v.to_string()));
        }
        for attr in entity.get_all(&Id::new(SANDBOX_CONTAINER)) {
            sandbox.containers.push(ContainerSpec::decode(attr.value.as_component()?)?);
        }
        if let Some(attr) = entity.get(&Id::new(SANDBOX_NETWORK)) {
            let inner = Entity::from_attrs(attr.value.as_component()?.to_vec());
            sandbox.ip = inner.get_str(&Id::new(NETWORK_IP))?.map(str::to_string);
        }
        for attr in entity.get_all(&Id::new(SANDBOX_PORT)) {
            sandbox.ports.push(Port::decode(attr.value.as_component()?)?);
        }
        sandbox.host_network = entity
            .get_bool(&Id::new(SANDBOX_HOST_NETWORK))?
            .unwrap_or(false);
        if let Some(attr) = entity.get(&Id::new(SCHEDULE_KEY)) {
            sandbox.schedule = Some(ScheduleKey::decode(attr.value.as_component()?)?);
        }
        for attr in entity.get_all(&Id::new(SANDBOX_ROUTE)) {
            sandbox.routes.push(attr.value.as_component()?.to_vec());
        }
        for attr in entity.get_all(&Id::new(SANDBOX_VOLUME)) {
            sandbox.volumes.push(attr.value.as_component()?.to_vec());
        }
        Ok(sandbox)
    }

    fn encode(&self) -> Entity {
        let mut e = Entity::new(self.entity_id());
        e.declare_kind(Self::kind());
        for (k, v) in &self.labels {
            e.push(Attr::label(SANDBOX_LABELS, k.as_str(), v.as_str()));
        }
        for container in &self.containers {
            e.push(Attr::component(SANDBOX_CONTAINER, container.encode()));
        }
        if let Some(ip) = &self.ip {
            e.push(Attr::component(
                SANDBOX_NETWORK,
                vec![Attr::string(NETWORK_IP, ip.as_str())],
            ));
        }
        for port in &self.ports {
            e.push(Attr::component(SANDBOX_PORT, port.encode()));
        }
        if self.host_network {
            e.push(Attr::bool(SANDBOX_HOST_NETWORK, true));
        }
        if let Some(schedule) = &self.schedule {
            e.push(Attr::component(SCHEDULE_KEY, schedule.encode()));
        }
        for route in &self.routes {
            e.push(Attr::component(SANDBOX_ROUTE, route.clone()));
        }
        for volume in &self.volumes {
            e.push(Attr::component(SANDBOX_VOLUME, volume.clone()));
        }
        e
    }
}

/// Stamp `schedule.key` onto a raw sandbox entity without disturbing other
/// attributes. Used by the scheduler's CAS loop.
pub fn stamp_schedule(entity: &Entity, key: &ScheduleKey) -> Entity {
    let mut stamped = entity.clone();
    stamped.remove(&Id::new(SCHEDULE_KEY));
    stamped.push(Attr::component(SCHEDULE_KEY, key.encode()));
    stamped
}

/// Whether a raw sandbox entity already carries a placement stamp.
pub fn has_schedule(entity: &Entity) -> bool {
    entity.get(&Id::new(SCHEDULE_KEY)).is_some()
}

/* ============================= TESTS ============================= */
