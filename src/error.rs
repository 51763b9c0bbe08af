use crate::entity::Id;
use crate::entity::value::ValueKind;

/* ============================= ERROR ============================= */

/// Error kinds surfaced by the store, the controllers, and the serving
/// surfaces.
///
/// Store-level errors are returned to callers verbatim; controller callbacks
/// surface them to the reconcile framework, which retries with backoff.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entity or required attribute missing.
    #[error("not found: {0}")]
    NotFound(Id),

    /// `CreateEntity` ident collision.
    #[error("already exists: {0}")]
    AlreadyExists(Id),

    /// `Put` revision mismatch. Refetch and retry.
    #[error("cas failed for {id}: put at revision {expected}, store at {actual}")]
    CasFailed { id: Id, expected: u64, actual: u64 },

    /// Attribute value kind disagrees with its declared schema type.
    #[error("schema mismatch for {attr}: declared {declared}, got {got}")]
    SchemaMismatch {
        attr: Id,
        declared: ValueKind,
        got: ValueKind,
    },

    /// A consumer asked a value for the wrong kind.
    #[error("kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: ValueKind, got: ValueKind },

    /// Multiple values on an attribute declared `one`, or a `unique`
    /// attribute value carried by a second entity.
    #[error("cardinality violation on {0}")]
    CardinalityViolation(Id),

    /// `List`/`WatchIndex` selector is not backed by an index.
    #[error("not indexed: {0}")]
    NotIndexed(Id),

    /// Codec failure at a strict decode boundary.
    #[error("malformed: {0}")]
    Malformed(String),

    /// The allocator has no more addresses in a prefix.
    #[error("prefix exhausted: {0}")]
    Exhausted(String),

    /// Upstream ACME/DNS/HTTP dependency failure.
    #[error("provider: {0}")]
    Provider(String),

    /// The cancellation token fired or the deadline passed.
    #[error("canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn provider(err: impl std::fmt::Display) -> Self {
        Error::Provider(err.to_string())
    }

    /// True for errors a caller can clear by refetching and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CasFailed { .. })
    }
}

/* ============================= TESTS ============================= */
