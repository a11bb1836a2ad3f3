//! Error kinds surfaced by watchers, stores and the callback dispatcher.
use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while tracking watches.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The referenced id does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind, e.g. `"watch"` or `"callback"`.
        kind: &'static str,
        /// The id that was looked up.
        id: Uuid,
    },

    /// Null or malformed input.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The persisted status is no longer pending.
    #[error("{kind} {id} is no longer pending")]
    InvalidTransition {
        /// Entity kind.
        kind: &'static str,
        /// Id of the entity whose transition was refused.
        id: Uuid,
    },

    /// The requested status is not a terminal one.
    #[error("status `{0}` is not a valid transition target")]
    InvalidTarget(String),

    /// A watch lacks the domain context required to persist or load it.
    #[error("watch {0} has no associated context")]
    ContextMissing(Uuid),

    /// A watch with the same id is already stored.
    #[error("watch {0} already exists")]
    DuplicateId(Uuid),

    /// The operation observed a cancelled token before committing.
    #[error("operation cancelled")]
    Cancelled,

    /// Unresolved failure of the backing store.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_transition(kind: &'static str, id: Uuid) -> Self {
        Self::InvalidTransition { kind, id }
    }

    /// True when another task already resolved the entity. Callers drop the
    /// work item instead of retrying.
    pub fn is_transition_race(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

#[cfg(feature = "store-sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage(err.into())
    }
}
