pub mod codec;
pub mod value;

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};

use crate::error::Result;

pub use value::{Value, ValueKind};

/* ============================= IDS ============================= */

/// System attribute carrying the entity's identity.
pub const DB_ID: &str = "db/id";
/// System attribute declaring the entity's kinds (id-references, many).
pub const ENTITY_KIND: &str = "entity/kind";

static INTERN: LazyLock<Mutex<HashSet<Arc<str>>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// An interned identifier of the form `<domain>/<name>`.
///
/// Ids compare byte-exact. Interning keeps repeated attribute keys cheap to
/// clone and hash.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(Arc<str>);

impl Id {
    pub fn new(s: &str) -> Self {
        let mut table = INTERN.lock().expect("intern table lock");
        if let Some(existing) = table.get(s) {
            return Id(existing.clone());
        }
        let arc: Arc<str> = Arc::from(s);
        table.insert(arc.clone());
        Id(arc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `<domain>` part, or the whole id when there is no slash.
    pub fn domain(&self) -> &str {
        self.0.split_once('/').map_or(&*self.0, |(d, _)| d)
    }

    /// The `<name>` part, or "" when there is no slash.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, n)| n)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::new(s)
    }
}

pub fn db_id() -> Id {
    Id::new(DB_ID)
}

pub fn entity_kind() -> Id {
    Id::new(ENTITY_KIND)
}

/* ============================= ATTRS ============================= */

/// An `(attribute-id, value)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub id: Id,
    pub value: Value,
}

impl Attr {
    pub fn new(id: Id, value: Value) -> Self {
        Self { id, value }
    }

    pub fn string(id: impl Into<Id>, s: impl Into<String>) -> Self {
        Self::new(id.into(), Value::String(s.into()))
    }

    pub fn bool(id: impl Into<Id>, b: bool) -> Self {
        Self::new(id.into(), Value::Bool(b))
    }

    pub fn int64(id: impl Into<Id>, n: i64) -> Self {
        Self::new(id.into(), Value::Int64(n))
    }

    pub fn float(id: impl Into<Id>, x: f64) -> Self {
        Self::new(id.into(), Value::Float(x))
    }

    pub fn bytes(id: impl Into<Id>, b: Vec<u8>) -> Self {
        Self::new(id.into(), Value::Bytes(b))
    }

    /// Truncated to millisecond precision so codec round-trips are exact.
    pub fn time(id: impl Into<Id>, t: DateTime<Utc>) -> Self {
        let millis = t.timestamp_millis();
        let t = DateTime::from_timestamp_millis(millis).unwrap_or(t);
        Self::new(id.into(), Value::Time(t))
    }

    pub fn keyword(id: impl Into<Id>, k: impl Into<String>) -> Self {
        Self::new(id.into(), Value::Keyword(k.into()))
    }

    pub fn label(id: impl Into<Id>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            id.into(),
            Value::Label {
                key: key.into(),
                value: value.into(),
            },
        )
    }

    pub fn ref_(id: impl Into<Id>, target: Id) -> Self {
        Self::new(id.into(), Value::Ref(target))
    }

    pub fn component(id: impl Into<Id>, inner: Vec<Attr>) -> Self {
        Self::new(id.into(), Value::Component(inner))
    }

    pub fn enum_(id: impl Into<Id>, choice: Id) -> Self {
        Self::new(id.into(), Value::Enum(choice))
    }
}

/* ============================= ENTITY ============================= */

/// An ordered multiset of attributes identified by its `db/id` attribute.
///
/// Revisions are store state, not entity state; an entity value is the same
/// whether it was read at revision 3 or 7.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    attrs: Vec<Attr>,
}

impl Entity {
    /// A fresh entity carrying only its identity.
    pub fn new(id: Id) -> Self {
        Self {
            attrs: vec![Attr::ref_(db_id(), id)],
        }
    }

    pub fn from_attrs(attrs: Vec<Attr>) -> Self {
        Self { attrs }
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    pub fn into_attrs(self) -> Vec<Attr> {
        self.attrs
    }

    /// The entity's identity, if a `db/id` attribute is present.
    pub fn id(&self) -> Option<Id> {
        self.get(&db_id())
            .and_then(|a| a.value.as_ref_id().ok().cloned())
    }

    pub fn kinds(&self) -> Vec<Id> {
        self.get_all(&entity_kind())
            .iter()
            .filter_map(|a| a.value.as_ref_id().ok().cloned())
            .collect()
    }

    pub fn has_kind(&self, kind: &Id) -> bool {
        self.kinds().iter().any(|k| k == kind)
    }

    pub fn declare_kind(&mut self, kind: Id) {
        if !self.has_kind(&kind) {
            self.attrs.push(Attr::ref_(entity_kind(), kind));
        }
    }

    /// First attribute with the given id.
    pub fn get(&self, id: &Id) -> Option<&Attr> {
        self.attrs.iter().find(|a| &a.id == id)
    }

    /// Every attribute with the given id, in entity order.
    pub fn get_all(&self, id: &Id) -> Vec<&Attr> {
        self.attrs.iter().filter(|a| &a.id == id).collect()
    }

    pub fn push(&mut self, attr: Attr) {
        self.attrs.push(attr);
    }

    /// Replace the first attribute with this id, or append.
    pub fn set(&mut self, attr: Attr) {
        match self.attrs.iter_mut().find(|a| a.id == attr.id) {
            Some(slot) => *slot = attr,
            None => self.attrs.push(attr),
        }
    }

    /// Remove every attribute with the given id. Returns how many went.
    pub fn remove(&mut self, id: &Id) -> usize {
        let before = self.attrs.len();
        self.attrs.retain(|a| &a.id != id);
        before - self.attrs.len()
    }

    // ── typed getters (absent ⇒ Ok(None), wrong kind ⇒ Err) ──

    pub fn get_str(&self, id: &Id) -> Result<Option<&str>> {
        self.get(id).map(|a| a.value.as_str()).transpose()
    }

    pub fn get_bool(&self, id: &Id) -> Result<Option<bool>> {
        self.get(id).map(|a| a.value.as_bool()).transpose()
    }

    pub fn get_i64(&self, id: &Id) -> Result<Option<i64>> {
        self.get(id).map(|a| a.value.as_i64()).transpose()
    }

    pub fn get_ref(&self, id: &Id) -> Result<Option<&Id>> {
        self.get(id).map(|a| a.value.as_ref_id()).transpose()
    }

    pub fn get_keyword(&self, id: &Id) -> Result<Option<&str>> {
        self.get(id).map(|a| a.value.as_keyword()).transpose()
    }

    pub fn get_time(&self, id: &Id) -> Result<Option<DateTime<Utc>>> {
        self.get(id).map(|a| a.value.as_time()).transpose()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups_allocations() {
        let a = Id::new("io.weft.compute/kind.node");
        let b = Id::new("io.weft.compute/kind.node");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_id_domain_and_name() {
        let id = Id::new("io.weft.compute/kind.sandbox");
        assert_eq!(id.domain(), "io.weft.compute");
        assert_eq!(id.name(), "kind.sandbox");

        let bare = Id::new("loose");
        assert_eq!(bare.domain(), "loose");
        assert_eq!(bare.name(), "");
    }

    #[test]
    fn test_new_entity_carries_identity() {
        let id = Id::new("io.weft.compute/n1");
        let e = Entity::new(id.clone());
        assert_eq!(e.id(), Some(id));
    }

    #[test]
    fn test_declare_kind_is_idempotent() {
        let kind = Id::new("io.weft.compute/kind.node");
        let mut e = Entity::new(Id::new("io.weft.compute/n1"));
        e.declare_kind(kind.clone());
        e.declare_kind(kind.clone());
        assert_eq!(e.kinds(), vec![kind.clone()]);
        assert!(e.has_kind(&kind));
    }

    #[test]
    fn test_get_returns_first_match() {
        let labels = Id::new("io.weft.compute/sandbox.labels");
        let mut e = Entity::new(Id::new("io.weft.compute/s1"));
        e.push(Attr::label(labels.clone(), "app", "nginx"));
        e.push(Attr::label(labels.clone(), "tier", "web"));

        let first = e.get(&labels).unwrap();
        assert_eq!(first.value.as_label().unwrap(), ("app", "nginx"));
        assert_eq!(e.get_all(&labels).len(), 2);
    }

    #[test]
    fn test_set_replaces_first_instance() {
        let status = Id::new("io.weft.compute/node.status");
        let mut e = Entity::new(Id::new("io.weft.compute/n1"));
        e.set(Attr::keyword(status.clone(), "unknown"));
        e.set(Attr::keyword(status.clone(), "ready"));
        assert_eq!(e.get_all(&status).len(), 1);
        assert_eq!(e.get_keyword(&status).unwrap(), Some("ready"));
    }

    #[test]
    fn test_remove_strips_all_instances() {
        let labels = Id::new("io.weft.compute/sandbox.labels");
        let mut e = Entity::new(Id::new("io.weft.compute/s1"));
        e.push(Attr::label(labels.clone(), "a", "1"));
        e.push(Attr::label(labels.clone(), "b", "2"));
        assert_eq!(e.remove(&labels), 2);
        assert!(e.get(&labels).is_none());
    }

    #[test]
    fn test_typed_getter_absent_vs_wrong_kind() {
        let host = Id::new("io.weft.ingress/http_route.host");
        let mut e = Entity::new(Id::new("io.weft.ingress/r1"));
        assert_eq!(e.get_str(&host).unwrap(), None);

        e.push(Attr::int64(host.clone(), 7));
        assert!(e.get_str(&host).is_err());
    }

    #[test]
    fn test_time_attr_truncates_to_millis() {
        let at = Id::new("io.weft.compute/node.heartbeat");
        let t = Utc::now();
        let attr = Attr::time(at.clone(), t);
        let stored = attr.value.as_time().unwrap();
        assert_eq!(stored.timestamp_millis(), t.timestamp_millis());
        assert_eq!(stored.timestamp_subsec_micros() % 1000, 0);
    }
}
