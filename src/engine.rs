//! Generic block-event engine:
//! 1) ask the hooks which watches start at a new block and store them,
//! 2) evaluate the candidate watches against the block,
//! 3) retire finished watches in one batch.
use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use bitcoin::Block;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    error::{Error, Result},
    hooks::{BlockListener, WatchHooks},
    store::WatchStorage,
    watch::{BlockEventType, Identifiable, RemoveReason, WatchToRemove},
};

/// Core engine. `W` = watch type, `S` = watch storage, `H` = domain hooks.
pub struct BlockWatcher<W, S, H> {
    storage: Arc<S>,
    hooks: H,
    // Serializes block events so candidate reads and removals never interleave.
    events: Mutex<()>,
    _watch: PhantomData<fn() -> W>,
}

impl<W, S, H> BlockWatcher<W, S, H>
where
    W: Identifiable + Clone + Send + Sync + 'static,
    S: WatchStorage<W> + 'static,
    H: WatchHooks<W> + 'static,
{
    /// Create an engine over a shared `storage` with the given `hooks`.
    pub fn new(storage: Arc<S>, hooks: H) -> Self {
        Self {
            storage,
            hooks,
            events: Mutex::new(()),
            _watch: PhantomData,
        }
    }

    /// Watch storage shared with the hooks.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Domain hooks.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Start the underlying storage.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_live(cancel)?;
        self.storage.start().await
    }

    /// Stop the underlying storage.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_live(cancel)?;
        self.storage.stop().await
    }

    /// Process a block appended at `height`.
    ///
    /// # Errors
    /// Propagates hook and storage failures; returns [`Error::Cancelled`] if
    /// `cancel` fires before a batch is committed. A hook failure still
    /// retires the watches settled before it. Cancellation commits nothing,
    /// so watches settled before it stay unretired; they have left `Pending`
    /// and are not evaluated again.
    #[instrument(skip_all, fields(height = height, block = %block.block_hash()))]
    pub async fn block_added(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.events.lock().await;

        let created = self.hooks.create_watches(block, height, cancel).await?;
        if !created.is_empty() {
            ensure_live(cancel)?;
            self.storage.add(&created).await?;
            debug!(count = created.len(), "created watches");
        }

        self.execute_watches(block, height, BlockEventType::Added, cancel)
            .await
    }

    /// Process a block at `height` that is about to be retracted. No watches
    /// are created; finished ones are retired as [`RemoveReason::BlockRemoved`].
    #[instrument(skip_all, fields(height = height, block = %block.block_hash()))]
    pub async fn block_removing(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.events.lock().await;
        self.execute_watches(block, height, BlockEventType::Removing, cancel)
            .await
    }

    async fn execute_watches(
        &self,
        block: &Block,
        height: u32,
        event: BlockEventType,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let candidates = self.hooks.get_watches(block, height, cancel).await?;

        let mut finished = Vec::new();
        for watch in candidates {
            ensure_live(cancel)?;
            match self
                .hooks
                .execute_matched_watch(&watch, block, height, event, cancel)
                .await
            {
                Ok(true) => finished.push(watch),
                Ok(false) => {}
                Err(e) => {
                    // Watches settled earlier in this event are retired
                    // before the failure propagates.
                    if let Err(retire) = self.retire(finished, event, cancel).await {
                        warn!(error = %retire, "could not retire settled watches");
                    }
                    return Err(e);
                }
            }
        }

        self.retire(finished, event, cancel).await
    }

    async fn retire(
        &self,
        finished: Vec<W>,
        event: BlockEventType,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if finished.is_empty() {
            return Ok(());
        }

        let reason = match event {
            BlockEventType::Added => RemoveReason::Completed,
            BlockEventType::Removing => RemoveReason::BlockRemoved,
        };
        let batch: Vec<_> = finished
            .into_iter()
            .map(|w| WatchToRemove::new(w, reason))
            .collect();

        ensure_live(cancel)?;
        self.storage.remove(&batch).await?;
        debug!(count = batch.len(), reason = reason.as_str(), "retired watches");
        Ok(())
    }
}

#[async_trait]
impl<W, S, H> BlockListener for BlockWatcher<W, S, H>
where
    W: Identifiable + Clone + Send + Sync + 'static,
    S: WatchStorage<W> + 'static,
    H: WatchHooks<W> + 'static,
{
    async fn on_block_added(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.block_added(block, height, cancel).await
    }

    async fn on_block_removing(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.block_removing(block, height, cancel).await
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
