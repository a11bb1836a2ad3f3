//! Domain glue: decide which watches to create, evaluate and retire.
use async_trait::async_trait;
use bitcoin::Block;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, watch::BlockEventType};

/// Strategy plugged into [`crate::BlockWatcher`]. All storage writes for
/// watch creation and removal stay in the engine; hooks only return decisions.
#[async_trait]
pub trait WatchHooks<W>: Send + Sync {
    /// Watches that start as of `block` at `height`.
    async fn create_watches(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<W>>;

    /// Pending watches that must be evaluated for `block` at `height`.
    async fn get_watches(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<W>>;

    /// Evaluate one candidate. `true` means the watch is finished and must be
    /// retired.
    async fn execute_matched_watch(
        &self,
        watch: &W,
        block: &Block,
        height: u32,
        event: BlockEventType,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

/// Receiver of ordered chain events from a synchronizer. Events are delivered
/// in chain order and one is fully processed before the next arrives.
#[async_trait]
pub trait BlockListener: Send + Sync {
    /// `block` was appended at `height`.
    async fn on_block_added(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// `block` at `height` is about to be retracted.
    async fn on_block_removing(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
