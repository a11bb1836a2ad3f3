//! Transaction confirmation tracking on top of [`BlockWatcher`].
//!
//! A watch starts when a rule's transaction first appears in a block and
//! succeeds once the block is buried `confirmations` deep. Rules that do not
//! succeed within their waiting time are timed out by a periodic sweep.
//! Both paths go through the stores' guarded status transitions, so exactly
//! one of them delivers a result for a given rule.
use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use bitcoin::{Block, Txid};
use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    callback::{CallbackDispatcher, CallbackResult, CallbackTransport},
    config::WatcherConfig,
    engine::BlockWatcher,
    error::{Error, Result},
    hooks::{BlockListener, WatchHooks},
    rule::{NewRule, Rule, RuleStatus},
    store::{CallbackStore, RuleStore, WatchStorage},
    watch::{BlockEventType, Watch, WatchStatus},
};

/// A watch following one rule's transaction.
pub type ConfirmationWatch = Watch<Rule>;

/// Outcome of a transition attempt that may lose a race.
fn won(res: Result<()>) -> Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.is_transition_race() => {
            debug!(error = %e, "transition already resolved elsewhere");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Confirmation-counting strategy for the block engine. Also owns the timeout
/// and redelivery logic, which share its stores.
pub struct ConfirmationHooks<WS, R, C, T> {
    watches: Arc<WS>,
    rules: Arc<R>,
    dispatcher: Arc<CallbackDispatcher<C, T>>,
}

impl<WS, R, C, T> Clone for ConfirmationHooks<WS, R, C, T> {
    fn clone(&self) -> Self {
        Self {
            watches: Arc::clone(&self.watches),
            rules: Arc::clone(&self.rules),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<WS, R, C, T> ConfirmationHooks<WS, R, C, T>
where
    WS: WatchStorage<ConfirmationWatch>,
    R: RuleStore,
    C: CallbackStore,
    T: CallbackTransport,
{
    /// Build hooks over the given stores.
    pub fn new(
        watches: Arc<WS>,
        rules: Arc<R>,
        dispatcher: Arc<CallbackDispatcher<C, T>>,
    ) -> Self {
        Self {
            watches,
            rules,
            dispatcher,
        }
    }

    async fn settle_success(&self, watch: &ConfirmationWatch) -> Result<()> {
        let rule = &watch.context;
        if !won(self.watches.update_status(watch.id, WatchStatus::Success).await)? {
            return Ok(());
        }
        if !won(self.rules.update_rule_status(rule.id, RuleStatus::Success).await)? {
            return Ok(());
        }
        info!(rule = %rule.id, watch = %watch.id, tx = %rule.transaction_id, "rule confirmed");
        self.dispatcher
            .dispatch(rule.callback, &CallbackResult::success(rule.success_result.clone()))
            .await?;
        Ok(())
    }

    /// Time out every pending rule whose deadline is at or before `now`.
    /// Returns how many timeout results this pass delivered.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Rule> = self
            .rules
            .list_rules(RuleStatus::Pending)
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        // Pending before Success: a watch confirmed between the two reads
        // still shows up in the second one.
        let pending = self.watches.list(WatchStatus::Pending).await?;
        let confirmed: HashSet<Uuid> = self
            .watches
            .list(WatchStatus::Success)
            .await?
            .into_iter()
            .map(|w| w.context.id)
            .collect();

        let mut timed_out = 0;
        for rule in expired {
            // The watch transition already picked success; the block path or
            // `redeliver_owed` finishes the rule.
            if confirmed.contains(&rule.id) {
                debug!(rule = %rule.id, "expired rule has a confirmed watch");
                continue;
            }
            if let Some(watch) = pending.iter().find(|w| w.context.id == rule.id) {
                // Lost to a confirmation, or retracted meanwhile. A retracted
                // watch leaves a bare rule for the next pass.
                if !won(self.watches.update_status(watch.id, WatchStatus::Rejected).await)? {
                    continue;
                }
            }
            if !won(self.rules.update_rule_status(rule.id, RuleStatus::Timeout).await)? {
                continue;
            }
            info!(rule = %rule.id, tx = %rule.transaction_id, "rule timed out");
            self.dispatcher
                .dispatch(rule.callback, &CallbackResult::timeout(rule.timeout_result.clone()))
                .await?;
            timed_out += 1;
        }
        Ok(timed_out)
    }

    /// Re-send results of terminal rules whose callback never completed,
    /// e.g. after a crash between a transition and its delivery.
    ///
    /// A confirmed watch whose rule is still pending was interrupted between
    /// its two transitions; its rule is settled as a success first.
    pub async fn redeliver_owed(&self) -> Result<usize> {
        let mut sent = 0;
        let mut settled = HashSet::new();
        for watch in self.watches.list(WatchStatus::Success).await? {
            let Some(rule) = self.rules.get_rule(watch.context.id).await? else {
                continue;
            };
            if rule.status != RuleStatus::Pending {
                continue;
            }
            if !won(self.rules.update_rule_status(rule.id, RuleStatus::Success).await)? {
                continue;
            }
            info!(rule = %rule.id, watch = %watch.id, "finished interrupted confirmation");
            self.dispatcher
                .dispatch(rule.callback, &CallbackResult::success(rule.success_result.clone()))
                .await?;
            settled.insert(rule.id);
            sent += 1;
        }

        for status in [RuleStatus::Success, RuleStatus::Timeout] {
            for rule in self.rules.list_rules(status).await? {
                if settled.contains(&rule.id) {
                    continue;
                }
                let Some(callback) = self.dispatcher.get(rule.callback).await? else {
                    warn!(rule = %rule.id, callback = %rule.callback, "owed result has no callback");
                    continue;
                };
                if callback.completed {
                    continue;
                }
                let result = match status {
                    RuleStatus::Success => CallbackResult::success(rule.success_result.clone()),
                    _ => CallbackResult::timeout(rule.timeout_result.clone()),
                };
                self.dispatcher.dispatch(callback.id, &result).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }
}

#[async_trait]
impl<WS, R, C, T> WatchHooks<ConfirmationWatch> for ConfirmationHooks<WS, R, C, T>
where
    WS: WatchStorage<ConfirmationWatch>,
    R: RuleStore,
    C: CallbackStore,
    T: CallbackTransport,
{
    async fn create_watches(
        &self,
        block: &Block,
        height: u32,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ConfirmationWatch>> {
        let rules = self.rules.list_rules(RuleStatus::Pending).await?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let txids: HashSet<Txid> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();
        let watched: HashSet<Uuid> = self
            .watches
            .list(WatchStatus::Pending)
            .await?
            .into_iter()
            .map(|w| w.context.id)
            .collect();

        let hash = block.block_hash();
        Ok(rules
            .into_iter()
            .filter(|r| txids.contains(&r.transaction_id) && !watched.contains(&r.id))
            .map(|r| {
                let txid = r.transaction_id;
                Watch::new(r, hash, height, txid)
            })
            .collect())
    }

    async fn get_watches(
        &self,
        _block: &Block,
        _height: u32,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ConfirmationWatch>> {
        self.watches.list(WatchStatus::Pending).await
    }

    async fn execute_matched_watch(
        &self,
        watch: &ConfirmationWatch,
        block: &Block,
        height: u32,
        event: BlockEventType,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        match event {
            BlockEventType::Added => {
                if watch.depth_at(height) < watch.context.confirmations {
                    return Ok(false);
                }
                self.settle_success(watch).await?;
                Ok(true)
            }
            // Only the start block anchors the watch; retracting anything
            // above it just lowers the depth until the chain grows again.
            BlockEventType::Removing => Ok(block.block_hash() == watch.start_block),
        }
    }
}

/// Block engine specialized for confirmation watches.
pub type ConfirmationEngine<WS, R, C, T> =
    BlockWatcher<ConfirmationWatch, WS, ConfirmationHooks<WS, R, C, T>>;

/// Confirmation watcher: block engine, rule registration and timeout sweep.
/// `WS` = watch storage, `R` = rule store, `C` = callback store,
/// `T` = callback transport.
pub struct ConfirmationWatcher<WS, R, C, T> {
    engine: ConfirmationEngine<WS, R, C, T>,
    config: WatcherConfig,
    sweep: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<WS, R, C, T> ConfirmationWatcher<WS, R, C, T>
where
    WS: WatchStorage<ConfirmationWatch> + 'static,
    R: RuleStore + 'static,
    C: CallbackStore + 'static,
    T: CallbackTransport + 'static,
{
    /// Wire a watcher over its stores and dispatcher.
    pub fn new(
        watches: Arc<WS>,
        rules: Arc<R>,
        dispatcher: Arc<CallbackDispatcher<C, T>>,
        config: WatcherConfig,
    ) -> Self {
        let hooks = ConfirmationHooks::new(Arc::clone(&watches), rules, dispatcher);
        Self {
            engine: BlockWatcher::new(watches, hooks),
            config,
            sweep: Mutex::new(None),
        }
    }

    /// Underlying block engine.
    pub fn engine(&self) -> &ConfirmationEngine<WS, R, C, T> {
        &self.engine
    }

    /// Start storage, settle owed results and launch the timeout sweep.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.engine.start(cancel).await?;
        if self.config.redeliver_on_start {
            let sent = self.engine.hooks().redeliver_owed().await?;
            if sent > 0 {
                info!(count = sent, "redelivered owed callback results");
            }
        }

        let mut sweep = self.sweep.lock().await;
        if sweep.is_none() {
            let token = cancel.child_token();
            let handle = spawn_timeout_sweep(
                self.engine.hooks().clone(),
                self.config.sweep_interval(),
                token.clone(),
            );
            *sweep = Some((token, handle));
        }
        Ok(())
    }

    /// Stop the sweep and wait for it, then stop storage.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some((token, handle)) = self.sweep.lock().await.take() {
            token.cancel();
            handle.await?;
        }
        self.engine.stop(cancel).await
    }

    /// Validate and persist a rule. The callback must already be registered.
    pub async fn register_rule(&self, rule: NewRule) -> Result<Rule> {
        rule.validate()?;
        let hooks = self.engine.hooks();
        if hooks.dispatcher.get(rule.callback).await?.is_none() {
            return Err(Error::not_found("callback", rule.callback));
        }
        let rule = hooks.rules.add_rule(rule).await?;
        info!(rule = %rule.id, tx = %rule.transaction_id, confirmations = rule.confirmations, "registered rule");
        Ok(rule)
    }

    /// Watches in `status`.
    pub async fn list_watches(&self, status: WatchStatus) -> Result<Vec<ConfirmationWatch>> {
        self.engine.storage().list(status).await
    }

    /// Process an appended block.
    pub async fn block_added(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.engine.block_added(block, height, cancel).await
    }

    /// Process a block about to be retracted.
    pub async fn block_removing(
        &self,
        block: &Block,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.engine.block_removing(block, height, cancel).await
    }

    /// One timeout sweep pass as of `now`.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.engine.hooks().sweep_timeouts_at(now).await
    }

    /// Re-send owed terminal results.
    pub async fn redeliver_owed(&self) -> Result<usize> {
        self.engine.hooks().redeliver_owed().await
    }
}

#[async_trait]
impl<WS, R, C, T> BlockListener for ConfirmationWatcher<WS, R, C, T>
where
    WS: WatchStorage<ConfirmationWatch> + 'static,
    R: RuleStore + 'static,
    C: CallbackStore + 'static,
    T: CallbackTransport + 'static,
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

/// Run [`ConfirmationHooks::sweep_timeouts_at`] every `interval` until
/// `cancel` fires. A failed pass is logged and retried on the next tick.
pub fn spawn_timeout_sweep<WS, R, C, T>(
    hooks: ConfirmationHooks<WS, R, C, T>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    WS: WatchStorage<ConfirmationWatch> + 'static,
    R: RuleStore + 'static,
    C: CallbackStore + 'static,
    T: CallbackTransport + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match hooks.sweep_timeouts_at(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "timeout sweep delivered results"),
                        Err(e) => warn!(error = %e, "timeout sweep failed"),
                    }
                }
            }
        }
        debug!("timeout sweep stopped");
    })
}
