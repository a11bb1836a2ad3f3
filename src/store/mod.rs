//! Persistence contracts consumed by the watchers and the callback dispatcher,
//! with a durable SQLite implementation and an in-memory one for tests.
use std::net::IpAddr;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use crate::{
    callback::{Callback, CallbackHistory, CallbackResult},
    error::Result,
    rule::{NewRule, Rule, RuleStatus},
    watch::{WatchStatus, WatchToRemove},
};

/// Durable set of watches. Every call is a single atomic unit of work.
#[async_trait]
pub trait WatchStorage<W>: Send + Sync {
    /// Prepare the store (open connections, load working sets).
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources acquired by [`WatchStorage::start`].
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Insert all of `watches` or none. A duplicate id fails with
    /// [`crate::Error::DuplicateId`].
    async fn add(&self, watches: &[W]) -> Result<()>;

    /// Watches currently in `status`. A removed watch is never pending.
    async fn list(&self, status: WatchStatus) -> Result<Vec<W>>;

    /// Retire all of `watches` or none.
    async fn remove(&self, watches: &[WatchToRemove<W>]) -> Result<()>;

    /// Move a pending watch to a terminal status. Concurrent attempts on the
    /// same id never both succeed.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `InvalidTransition` when the stored
    /// status is not pending, `InvalidTarget` when `status` is `Pending`.
    async fn update_status(&self, id: Uuid, status: WatchStatus) -> Result<()>;
}

/// Confirmation rules. Everything but the status is immutable.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persist a new rule in `Pending` status.
    async fn add_rule(&self, rule: NewRule) -> Result<Rule>;

    /// Rule by id, `None` if absent.
    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>>;

    /// Rules in `status`.
    async fn list_rules(&self, status: RuleStatus) -> Result<Vec<Rule>>;

    /// Same contract as [`WatchStorage::update_status`].
    async fn update_rule_status(&self, id: Uuid, status: RuleStatus) -> Result<()>;
}

/// Registered callback targets and their append-only delivery history.
#[async_trait]
pub trait CallbackStore: Send + Sync {
    /// Register a target; returns it with a fresh id and `completed = false`.
    async fn add_callback(&self, registered_ip: IpAddr, url: Url) -> Result<Callback>;

    /// Callback by id, `None` if absent.
    async fn get_callback(&self, id: Uuid) -> Result<Option<Callback>>;

    /// Append the next history entry for `id`.
    ///
    /// # Errors
    /// `InvalidArgument` when `result` is `None`, `NotFound` for an unknown id.
    async fn add_history(&self, id: Uuid, result: Option<&CallbackResult>)
        -> Result<CallbackHistory>;

    /// Mark the callback completed. Idempotent.
    async fn set_completed(&self, id: Uuid) -> Result<()>;

    /// History of `id`, ordered by sequence number.
    async fn history(&self, id: Uuid) -> Result<Vec<CallbackHistory>>;
}

// submodules / concrete stores live here
pub mod memory;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use memory::{MemoryStore, MemoryWatchStorage};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
