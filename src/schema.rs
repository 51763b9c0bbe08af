//! Attribute schema registry.
//!
//! Each domain registers its attribute metadata before the store is opened;
//! on open the store applies every registered schema idempotently, turning
//! attributes and singletons into entities. The process-wide registry is
//! initialised once at startup; tests use standalone registries or the
//! [`reset_global`] hook.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::entity::{Attr, Entity, Id, ValueKind};
use crate::error::{Error, Result};

/* ============================= META ATTRIBUTE IDS ============================= */

pub const ATTR_NAME: &str = "attr/name";
pub const ATTR_TYPE: &str = "attr/type";
pub const ATTR_CARDINALITY: &str = "attr/cardinality";
pub const ATTR_INDEXED: &str = "attr/indexed";
pub const ATTR_UNIQUE: &str = "attr/unique";
pub const ATTR_REQUIRED: &str = "attr/required";
pub const ATTR_SESSION: &str = "attr/session";
pub const ATTR_TAG: &str = "attr/tag";
pub const ATTR_CHOICE: &str = "attr/choice";

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    String,
    Bool,
    Int64,
    Float,
    Bytes,
    Time,
    Keyword,
    Label,
    Ref,
    Component,
    Enum,
}

impl AttrType {
    pub fn value_kind(self) -> ValueKind {
        match self {
            AttrType::String => ValueKind::String,
            AttrType::Bool => ValueKind::Bool,
            AttrType::Int64 => ValueKind::Int64,
            AttrType::Float => ValueKind::Float,
            AttrType::Bytes => ValueKind::Bytes,
            AttrType::Time => ValueKind::Time,
            AttrType::Keyword => ValueKind::Keyword,
            AttrType::Label => ValueKind::Label,
            AttrType::Ref => ValueKind::Ref,
            AttrType::Component => ValueKind::Component,
            AttrType::Enum => ValueKind::Enum,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            AttrType::String => "string",
            AttrType::Bool => "bool",
            AttrType::Int64 => "int64",
            AttrType::Float => "float",
            AttrType::Bytes => "bytes",
            AttrType::Time => "time",
            AttrType::Keyword => "keyword",
            AttrType::Label => "label",
            AttrType::Ref => "ref",
            AttrType::Component => "component",
            AttrType::Enum => "enum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

/// Declared metadata for one attribute.
#[derive(Debug, Clone)]
pub struct AttrSpec {
    pub name: String,
    pub id: Id,
    pub ty: AttrType,
    pub cardinality: Cardinality,
    pub indexed: bool,
    /// At most one entity may carry a given `(attr, value)` pair.
    pub unique: bool,
    pub required: bool,
    /// Session attributes are never persisted.
    pub session: bool,
    /// Valid reference targets for ref-backed enums.
    pub choices: Vec<Id>,
    /// Free-form tags; discoverable through `GetAttributesByTag`.
    pub tags: Vec<String>,
    /// Inner attribute specs for component attributes.
    pub components: Vec<AttrSpec>,
}

impl AttrSpec {
    pub fn new(name: &str, id: &str, ty: AttrType) -> Self {
        Self {
            name: name.to_string(),
            id: Id::new(id),
            ty,
            cardinality: Cardinality::One,
            indexed: false,
            unique: false,
            required: false,
            session: false,
            choices: Vec::new(),
            tags: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn session(mut self) -> Self {
        self.session = true;
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| Id::new(c)).collect();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn component_of(mut self, inner: Vec<AttrSpec>) -> Self {
        self.components = inner;
        self
    }

    /// The schema entity stored for this attribute on store open.
    fn schema_entity(&self) -> Entity {
        let mut e = Entity::new(self.id.clone());
        e.push(Attr::string(ATTR_NAME, self.name.as_str()));
        e.push(Attr::keyword(ATTR_TYPE, self.ty.keyword()));
        e.push(Attr::keyword(
            ATTR_CARDINALITY,
            match self.cardinality {
                Cardinality::One => "one",
                Cardinality::Many => "many",
            },
        ));
        if self.indexed {
            e.push(Attr::bool(ATTR_INDEXED, true));
        }
        if self.unique {
            e.push(Attr::bool(ATTR_UNIQUE, true));
        }
        if self.required {
            e.push(Attr::bool(ATTR_REQUIRED, true));
        }
        if self.session {
            e.push(Attr::bool(ATTR_SESSION, true));
        }
        for choice in &self.choices {
            e.push(Attr::ref_(ATTR_CHOICE, choice.clone()));
        }
        for tag in &self.tags {
            e.push(Attr::string(ATTR_TAG, tag.as_str()));
        }
        e
    }
}

/// One domain's attribute declarations plus pre-created reference targets.
#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub attrs: Vec<AttrSpec>,
    pub singletons: Vec<Id>,
}

impl Domain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            singletons: Vec::new(),
        }
    }

    pub fn attr(mut self, spec: AttrSpec) -> Self {
        self.attrs.push(spec);
        self
    }

    pub fn singleton(mut self, id: &str) -> Self {
        self.singletons.push(Id::new(id));
        self
    }

    /// Entities the store creates when this domain is applied: one per
    /// attribute (components flattened) and one bare entity per singleton.
    pub fn schema_entities(&self) -> Vec<Entity> {
        let mut out = Vec::new();
        fn walk(spec: &AttrSpec, out: &mut Vec<Entity>) {
            out.push(spec.schema_entity());
            for inner in &spec.components {
                walk(inner, out);
            }
        }
        for spec in &self.attrs {
            walk(spec, &mut out);
        }
        for id in &self.singletons {
            out.push(Entity::new(id.clone()));
        }
        out
    }
}

/* ============================= REGISTRY ============================= */

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    domains: HashMap<String, Domain>,
    by_id: HashMap<Id, AttrSpec>,
}

impl SchemaRegistry {
    /// A registry pre-loaded with the built-in `db`/`entity`/`attr` schema.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry
            .register(builtin_domain())
            .expect("builtin domain registers exactly once");
        registry
    }

    /// Registering the same domain twice is a program error.
    pub fn register(&mut self, domain: Domain) -> Result<()> {
        if self.domains.contains_key(&domain.name) {
            return Err(Error::AlreadyExists(Id::new(&domain.name)));
        }
        fn index(spec: &AttrSpec, by_id: &mut HashMap<Id, AttrSpec>) {
            by_id.insert(spec.id.clone(), spec.clone());
            for inner in &spec.components {
                index(inner, by_id);
            }
        }
        for spec in &domain.attrs {
            index(spec, &mut self.by_id);
        }
        self.domains.insert(domain.name.clone(), domain);
        Ok(())
    }

    pub fn attr(&self, id: &Id) -> Option<&AttrSpec> {
        self.by_id.get(id)
    }

    pub fn is_indexed(&self, id: &Id) -> bool {
        self.attr(id).is_some_and(|s| s.indexed)
    }

    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    /// Validate an entity's top-level attributes against declared types and
    /// cardinalities. Unknown attributes pass (treated as unindexed, many).
    pub fn validate_entity(&self, entity: &Entity) -> Result<()> {
        let mut seen_one: HashMap<&Id, u32> = HashMap::new();
        for attr in entity.attrs() {
            let Some(spec) = self.attr(&attr.id) else {
                continue;
            };
            let declared = spec.ty.value_kind();
            if attr.value.kind() != declared {
                return Err(Error::SchemaMismatch {
                    attr: attr.id.clone(),
                    declared,
                    got: attr.value.kind(),
                });
            }
            if spec.cardinality == Cardinality::One {
                let count = seen_one.entry(&attr.id).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(Error::CardinalityViolation(attr.id.clone()));
                }
            }
        }
        Ok(())
    }
}

/// System attributes every store understands.
fn builtin_domain() -> Domain {
    Domain::new("db")
        .attr(AttrSpec::new("id", crate::entity::DB_ID, AttrType::Ref).required())
        .attr(
            AttrSpec::new("kind", crate::entity::ENTITY_KIND, AttrType::Ref)
                .many()
                .indexed(),
        )
        .attr(AttrSpec::new("attr-name", ATTR_NAME, AttrType::String))
        .attr(AttrSpec::new("attr-type", ATTR_TYPE, AttrType::Keyword))
        .attr(AttrSpec::new("attr-cardinality", ATTR_CARDINALITY, AttrType::Keyword))
        .attr(AttrSpec::new("attr-indexed", ATTR_INDEXED, AttrType::Bool))
        .attr(AttrSpec::new("attr-unique", ATTR_UNIQUE, AttrType::Bool))
        .attr(AttrSpec::new("attr-required", ATTR_REQUIRED, AttrType::Bool))
        .attr(AttrSpec::new("attr-session", ATTR_SESSION, AttrType::Bool))
        .attr(AttrSpec::new("attr-choice", ATTR_CHOICE, AttrType::Ref).many())
        .attr(
            AttrSpec::new("attr-tag", ATTR_TAG, AttrType::String)
                .many()
                .indexed(),
        )
}

/* ============================= GLOBAL REGISTRY ============================= */

static GLOBAL: LazyLock<RwLock<SchemaRegistry>> =
    LazyLock::new(|| RwLock::new(SchemaRegistry::new()));

/// Register a domain on the process-wide registry. Call once per domain at
/// startup, before opening the store.
pub fn register_global(domain: Domain) -> Result<()> {
    GLOBAL.write().expect("schema registry lock").register(domain)
}

/// Snapshot of the process-wide registry for store opening.
pub fn global_snapshot() -> SchemaRegistry {
    GLOBAL.read().expect("schema registry lock").clone()
}

/// Test hook: drop every registration back to the builtins.
pub fn reset_global() {
    *GLOBAL.write().expect("schema registry lock") = SchemaRegistry::new();
}

/* ============================= TESTS ============================= */
