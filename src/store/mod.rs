//! The revisioned, attribute-indexed entity store.
//!
//! Single-writer semantics per entity via compare-and-set revisions; readers
//! never block writers beyond the brief state lock. Index membership is
//! derived from the current attributes only, and every index key carries an
//! event log that watch subscriptions replay and tail.

pub mod watch;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Context;
use crate::entity::{Attr, Entity, Id, Value, codec, entity_kind};
use crate::error::{Error, Result};
use crate::schema::{self, SchemaRegistry};

pub use watch::{Event, EventOp, Subscription, WatchCallback};

/* ============================= TYPES ============================= */

/// Index key: an attribute id plus the canonical byte form of one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    attr: Id,
    value: Vec<u8>,
}

impl IndexKey {
    fn new(attr: &Id, value: &Value) -> Self {
        Self {
            attr: attr.clone(),
            value: codec::value_key(value),
        }
    }
}

/// Membership (insertion-ordered) and the event log for one index key.
struct IndexEntry {
    members: Vec<Id>,
    log: Arc<watch::IndexLog>,
}

impl Default for IndexEntry {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            log: Arc::new(watch::IndexLog::default()),
        }
    }
}

struct Stored {
    entity: Arc<Entity>,
    revision: u64,
}

#[derive(Default)]
struct State {
    entities: HashMap<Id, Stored>,
    indexes: HashMap<IndexKey, IndexEntry>,
}

struct Inner {
    registry: SchemaRegistry,
    state: RwLock<State>,
    persist: Option<Mutex<std::fs::File>>,
}

/// Handle to the store; cheap to clone and share across controllers.
#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<Inner>,
}

/// The index selector used to list/watch every entity of a kind.
pub fn kind_selector(kind: &Id) -> (Id, Value) {
    (entity_kind(), Value::Ref(kind.clone()))
}

/* ============================= PERSISTENCE ============================= */

const LOG_FILE: &str = "entities.log";

#[derive(Serialize, Deserialize)]
struct LogRecord {
    op: String,
    id: String,
    revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

/* ============================= STORE ============================= */

impl EntityStore {
    /// In-memory store; applies every schema in `registry`.
    pub fn open(registry: SchemaRegistry) -> Result<Self> {
        Self::open_inner(registry, None)
    }

    /// Disk-backed store: replays `<dir>/entities.log`, then appends every
    /// committed mutation to it. Only revision monotonicity is promised.
    pub fn open_at(dir: impl AsRef<Path>, registry: SchemaRegistry) -> Result<Self> {
        Self::open_inner(registry, Some(dir.as_ref().to_path_buf()))
    }

    fn open_inner(registry: SchemaRegistry, dir: Option<PathBuf>) -> Result<Self> {
        let mut state = State::default();

        let persist = match dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .map_err(|e| Error::Provider(format!("create store dir: {e}")))?;
                let path = dir.join(LOG_FILE);
                if path.exists() {
                    let file = std::fs::File::open(&path)
                        .map_err(|e| Error::Provider(format!("open store log: {e}")))?;
                    replay_log(&mut state, &registry, file)?;
                    info!(entities = state.entities.len(), "store_log_replayed");
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| Error::Provider(format!("append store log: {e}")))?;
                Some(Mutex::new(file))
            }
            None => None,
        };

        let store = Self {
            inner: Arc::new(Inner {
                registry,
                state: RwLock::new(state),
                persist,
            }),
        };
        store.apply_schemas()?;
        Ok(store)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// Idempotent: every registered attribute and singleton becomes an
    /// entity, ignoring `already exists` from prior opens.
    fn apply_schemas(&self) -> Result<()> {
        let ctx = Context::background();
        let domains: Vec<_> = self.inner.registry.domains().cloned().collect();
        for domain in domains {
            for entity in domain.schema_entities() {
                match self.create_entity(&ctx, entity.into_attrs()) {
                    Ok(_) | Err(Error::AlreadyExists(_)) => {}
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }

    /* ── reads ── */

    pub fn get(&self, ctx: &Context, id: &Id) -> Result<(Arc<Entity>, u64)> {
        ctx.check()?;
        let state = self.inner.state.read().expect("store lock");
        state
            .entities
            .get(id)
            .map(|s| (s.entity.clone(), s.revision))
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Entities currently carrying `(attr, value)`, in index insertion order.
    pub fn list(&self, ctx: &Context, attr: &Id, value: &Value) -> Result<Vec<(Arc<Entity>, u64)>> {
        ctx.check()?;
        if !self.inner.registry.is_indexed(attr) {
            return Err(Error::NotIndexed(attr.clone()));
        }
        let key = IndexKey::new(attr, value);
        let state = self.inner.state.read().expect("store lock");
        let Some(entry) = state.indexes.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .members
            .iter()
            .filter_map(|id| state.entities.get(id))
            .map(|s| (s.entity.clone(), s.revision))
            .collect())
    }

    /// Every entity declaring `kind` through `entity/kind`.
    pub fn list_kind(&self, ctx: &Context, kind: &Id) -> Result<Vec<(Arc<Entity>, u64)>> {
        let (attr, value) = kind_selector(kind);
        self.list(ctx, &attr, &value)
    }

    /// Schema entities whose `attr/tag` contains `tag`.
    pub fn get_attributes_by_tag(&self, ctx: &Context, tag: &str) -> Result<Vec<Arc<Entity>>> {
        let entities = self.list(
            ctx,
            &Id::new(schema::ATTR_TAG),
            &Value::String(tag.to_string()),
        )?;
        Ok(entities.into_iter().map(|(e, _)| e).collect())
    }

    /* ── writes ── */

    /// Create a fresh entity. The attribute list must carry exactly one
    /// `db/id`. Returns the new id and revision 1.
    pub fn create_entity(&self, ctx: &Context, attrs: Vec<Attr>) -> Result<(Id, u64)> {
        ctx.check()?;
        let ident_count = attrs
            .iter()
            .filter(|a| a.id.as_str() == crate::entity::DB_ID)
            .count();
        if ident_count != 1 {
            return Err(Error::Malformed(format!(
                "entity must carry exactly one {}, found {ident_count}",
                crate::entity::DB_ID
            )));
        }
        let entity = Entity::from_attrs(attrs);
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed(format!("{} must be an id-reference", crate::entity::DB_ID)))?;

        self.inner.registry.validate_entity(&entity)?;

        let mut state = self.inner.state.write().expect("store lock");
        if state.entities.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        self.check_unique(&state, &id, &entity)?;
        let revision = self.commit_put(&mut state, id.clone(), entity, 1);
        Ok((id, revision))
    }

    /// Store the whole attribute set under CAS semantics.
    ///
    /// `from_revision == 0` skips the revision check; otherwise the put
    /// succeeds only when the store's current revision equals it. A put on a
    /// nonexistent id creates the entity at revision 1.
    pub fn put(&self, ctx: &Context, entity: Entity, from_revision: u64) -> Result<u64> {
        ctx.check()?;
        let id = entity
            .id()
            .ok_or_else(|| Error::Malformed("put requires a db/id attribute".into()))?;
        self.inner.registry.validate_entity(&entity)?;

        let mut state = self.inner.state.write().expect("store lock");
        let current = state.entities.get(&id).map_or(0, |s| s.revision);
        if from_revision != 0 && from_revision != current {
            return Err(Error::CasFailed {
                id,
                expected: from_revision,
                actual: current,
            });
        }
        self.check_unique(&state, &id, &entity)?;
        let revision = self.commit_put(&mut state, id, entity, current + 1);
        Ok(revision)
    }

    /// Terminal removal: emits a final `Deleted` event carrying the
    /// pre-deletion attributes and frees the id for re-creation.
    pub fn delete(&self, ctx: &Context, id: &Id) -> Result<u64> {
        ctx.check()?;
        let mut state = self.inner.state.write().expect("store lock");
        let Some(stored) = state.entities.remove(id) else {
            return Err(Error::NotFound(id.clone()));
        };
        let revision = stored.revision;
        let old = stored.entity;

        for key in self.index_keys(&old) {
            if let Some(entry) = state.indexes.get_mut(&key) {
                entry.members.retain(|m| m != id);
                entry.log.append(Event {
                    op: EventOp::Deleted,
                    revision,
                    entity: old.clone(),
                });
            }
        }

        self.persist_record(&LogRecord {
            op: "delete".into(),
            id: id.to_string(),
            revision,
            data: None,
        });
        debug!(entity = %id, revision, "entity_deleted");
        Ok(revision)
    }

    /* ── watches ── */

    /// Replay `Added` for every currently matching entity, then stream
    /// subsequent events for `(attr, value)` in commit order.
    pub fn watch_index(
        &self,
        ctx: &Context,
        attr: &Id,
        value: &Value,
        callback: WatchCallback,
    ) -> Result<Subscription> {
        ctx.check()?;
        if !self.inner.registry.is_indexed(attr) {
            return Err(Error::NotIndexed(attr.clone()));
        }
        let key = IndexKey::new(attr, value);

        // Write lock so the replay snapshot and tail cursor are consistent:
        // no commit can land between the two.
        let mut guard = self.inner.state.write().expect("store lock");
        let state = &mut *guard;
        let entry = state.indexes.entry(key).or_default();
        let log = entry.log.clone();
        let cursor = log.len();
        let members = entry.members.clone();
        let replay: Vec<Event> = members
            .iter()
            .filter_map(|id| state.entities.get(id))
            .map(|s| Event {
                op: EventOp::Added,
                revision: s.revision,
                entity: s.entity.clone(),
            })
            .collect();
        drop(guard);

        let label = format!("{attr}");
        Ok(watch::spawn_subscription(
            label,
            ctx.child(),
            replay,
            log,
            cursor,
            callback,
        ))
    }

    /// Watch every entity of a kind.
    pub fn watch_kind(
        &self,
        ctx: &Context,
        kind: &Id,
        callback: WatchCallback,
    ) -> Result<Subscription> {
        let (attr, value) = kind_selector(kind);
        self.watch_index(ctx, &attr, &value, callback)
    }

    /* ── internals ── */

    /// Indexed `(attr, value)` keys derived from an entity's current attrs.
    /// Duplicate pairs collapse to one membership.
    fn index_keys(&self, entity: &Entity) -> HashSet<IndexKey> {
        entity
            .attrs()
            .iter()
            .filter(|a| self.inner.registry.is_indexed(&a.id))
            .map(|a| IndexKey::new(&a.id, &a.value))
            .collect()
    }

    /// `unique` attrs admit at most one carrier per value.
    fn check_unique(&self, state: &State, id: &Id, entity: &Entity) -> Result<()> {
        for attr in entity.attrs() {
            let Some(spec) = self.inner.registry.attr(&attr.id) else {
                continue;
            };
            if !spec.unique {
                continue;
            }
            let key = IndexKey::new(&attr.id, &attr.value);
            if let Some(entry) = state.indexes.get(&key)
                && entry.members.iter().any(|m| m != id)
            {
                return Err(Error::CardinalityViolation(attr.id.clone()));
            }
        }
        Ok(())
    }

    fn commit_put(
        &self,
        state: &mut RwLockWriteGuard<'_, State>,
        id: Id,
        entity: Entity,
        revision: u64,
    ) -> u64 {
        let old = state.entities.get(&id).map(|s| s.entity.clone());
        let old_keys = old.as_deref().map(|e| self.index_keys(e)).unwrap_or_default();
        let new = Arc::new(entity);
        let new_keys = self.index_keys(&new);

        for key in old_keys.difference(&new_keys) {
            if let Some(entry) = state.indexes.get_mut(key) {
                entry.members.retain(|m| m != &id);
                entry.log.append(Event {
                    op: EventOp::Deleted,
                    revision,
                    entity: old.clone().expect("old entity exists for removed keys"),
                });
            }
        }
        for key in new_keys.difference(&old_keys) {
            let entry = state.indexes.entry(key.clone()).or_default();
            entry.members.push(id.clone());
            entry.log.append(Event {
                op: EventOp::Added,
                revision,
                entity: new.clone(),
            });
        }
        for key in new_keys.intersection(&old_keys) {
            if let Some(entry) = state.indexes.get(key) {
                entry.log.append(Event {
                    op: EventOp::Updated,
                    revision,
                    entity: new.clone(),
                });
            }
        }

        self.persist_record(&LogRecord {
            op: "put".into(),
            id: id.to_string(),
            revision,
            data: Some(BASE64.encode(codec::encode_entity(&self.strip_session(&new)))),
        });

        state.entities.insert(id.clone(), Stored {
            entity: new,
            revision,
        });
        debug!(entity = %id, revision, "entity_put");
        revision
    }

    /// Session attributes never reach the persistence log.
    fn strip_session(&self, entity: &Entity) -> Entity {
        let attrs = entity
            .attrs()
            .iter()
            .filter(|a| !self.inner.registry.attr(&a.id).is_some_and(|s| s.session))
            .cloned()
            .collect();
        Entity::from_attrs(attrs)
    }

    fn persist_record(&self, record: &LogRecord) {
        if let Some(file) = &self.inner.persist {
            let mut file = file.lock().expect("persist lock");
            let line = serde_json::to_string(record).expect("log record serializes");
            // A failed append is surfaced as a log line, not an error: the
            // in-memory commit already happened and durability is best-effort
            // beyond revision monotonicity.
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(error = %e, "store_log_append_failed");
            }
        }
    }
}

/// Rebuild in-memory state from the append log. Events emitted during
/// replay predate every subscription cursor and are never delivered.
fn replay_log(state: &mut State, registry: &SchemaRegistry, file: std::fs::File) -> Result<()> {
    let keys_of = |entity: &Entity| -> HashSet<IndexKey> {
        entity
            .attrs()
            .iter()
            .filter(|a| registry.is_indexed(&a.id))
            .map(|a| IndexKey::new(&a.id, &a.value))
            .collect()
    };

    let reader = std::io::BufReader::new(file);
    for line in reader.lines() {
        let line = line.map_err(|e| Error::Provider(format!("read store log: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line)
            .map_err(|e| Error::Malformed(format!("store log record: {e}")))?;
        let id = Id::new(&record.id);
        match record.op.as_str() {
            "put" => {
                let data = record
                    .data
                    .ok_or_else(|| Error::Malformed("put record without data".into()))?;
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| Error::Malformed(format!("store log base64: {e}")))?;
                let entity = Arc::new(codec::decode_entity(&bytes)?);
                // Membership rebuild mirrors commit_put: kept keys hold
                // their index position; the record was validated when
                // originally committed.
                let old_keys = state
                    .entities
                    .get(&id)
                    .map(|s| keys_of(&s.entity))
                    .unwrap_or_default();
                let new_keys = keys_of(&entity);
                for key in old_keys.difference(&new_keys) {
                    if let Some(entry) = state.indexes.get_mut(key) {
                        entry.members.retain(|m| m != &id);
                    }
                }
                for key in new_keys.difference(&old_keys) {
                    let entry = state.indexes.entry(key.clone()).or_default();
                    entry.members.push(id.clone());
                }
                state.entities.insert(id, Stored {
                    entity,
                    revision: record.revision,
                });
            }
            "delete" => {
                if let Some(stored) = state.entities.remove(&id) {
                    for key in keys_of(&stored.entity) {
                        if let Some(entry) = state.indexes.get_mut(&key) {
                            entry.members.retain(|m| m != &id);
                        }
                    }
                }
            }
            other => {
                return Err(Error::Malformed(format!("unknown store log op {other}")));
            }
        }
    }
    Ok(())
}

/* ============================= TESTS ============================= */
