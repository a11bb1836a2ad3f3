#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! chain-watch: block-event watchers with exactly-once result delivery.
//!
//! ## What you implement
//! - [`CallbackTransport`]: put a result on the wire (HTTP POST, queue, ...).
//! - Drive a [`BlockListener`] from your chain synchronizer, in chain order.
//! - Optionally your own [`WatchHooks`] for watch kinds beyond confirmations.
//!
//! ## What the crate does
//! - [`BlockWatcher`] turns block-added / block-removing events into batched,
//!   atomic watch creation and retirement.
//! - [`ConfirmationWatcher`] tracks "transaction reached N confirmations"
//!   rules, times them out, and survives reorgs and restarts.
//! - Stores guard every status transition so a confirmation and a timeout
//!   racing on the same rule never both notify.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use chain_watch::prelude::*;
//! use std::sync::Arc;
//!
//! struct Http;
//! #[async_trait::async_trait]
//! impl CallbackTransport for Http {
//!     async fn execute(&self, cb: &Callback, r: &CallbackResult) -> anyhow::Result<()> {
//!         // POST `r` to `cb.url`
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> chain_watch::Result<()> {
//!     let config = WatcherConfig::default();
//!     let store = Arc::new(SqliteStore::new(&config.database_path)?);
//!     let dispatcher = Arc::new(CallbackDispatcher::new(store.clone(), Http));
//!     let watcher = ConfirmationWatcher::new(store.clone(), store, dispatcher, config);
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     watcher.start(&cancel).await?;
//!     // synchronizer: watcher.on_block_added(&block, height, &cancel).await?;
//!     watcher.stop(&cancel).await
//! }
//! ```
/// Callback targets, history and the dispatcher.
pub mod callback;

/// Watcher settings.
pub mod config;

/// Confirmation rules tracked to a depth or a timeout.
pub mod confirmation;

/// Generic block-event engine.
pub mod engine;

/// Error kinds.
pub mod error;

/// Strategy and listener traits.
pub mod hooks;

/// `tracing` subscriber setup.
pub mod logging;

/// Rules and their registration requests.
pub mod rule;

/// Persistence layer (traits, SQLite and in-memory implementations).
pub mod store;

/// Watches, statuses and removal reasons.
pub mod watch;

// Public re-exports
pub use callback::{
    Callback, CallbackDispatcher, CallbackHistory, CallbackResult, CallbackTransport,
    DeliveryOutcome,
};
pub use config::WatcherConfig;
pub use confirmation::{ConfirmationHooks, ConfirmationWatch, ConfirmationWatcher};
pub use engine::BlockWatcher;
pub use error::{Error, Result};
pub use hooks::{BlockListener, WatchHooks};
pub use rule::{NewRule, Rule, RuleStatus};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{CallbackStore, MemoryStore, MemoryWatchStorage, RuleStore, WatchStorage};
pub use watch::{BlockEventType, Identifiable, RemoveReason, Watch, WatchStatus, WatchToRemove};

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
    pub use crate::{
        BlockListener, Callback, CallbackDispatcher, CallbackResult, CallbackTransport,
        ConfirmationWatcher, NewRule, WatchStatus, WatcherConfig,
    };
}
