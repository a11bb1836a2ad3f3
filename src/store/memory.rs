//! In-memory stores. Same contracts as the SQLite store, used for fast tests
//! of watcher logic in isolation. Nothing here survives a restart.
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Mutex, MutexGuard},
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::{
    callback::{Callback, CallbackHistory, CallbackResult},
    error::{Error, Result},
    rule::{NewRule, Rule, RuleStatus},
    store::{CallbackStore, RuleStore, WatchStorage},
    watch::{RemoveReason, Watch, WatchStatus, WatchToRemove},
};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| Error::Storage(anyhow!("memory store poisoned")))
}

struct Slot<C> {
    watch: Watch<C>,
    removed: Option<RemoveReason>,
}

impl<C> Slot<C> {
    fn listed_as(&self, status: WatchStatus) -> bool {
        match self.removed {
            None => self.watch.status == status,
            Some(RemoveReason::Completed) => {
                self.watch.status == status && status != WatchStatus::Pending
            }
            Some(RemoveReason::BlockRemoved) => false,
        }
    }
}

/// Watch storage backed by a `Vec`, preserving insertion order.
pub struct MemoryWatchStorage<C> {
    slots: Mutex<Vec<Slot<C>>>,
}

impl<C> MemoryWatchStorage<C> {
    /// Empty storage.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl<C> Default for MemoryWatchStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C> WatchStorage<Watch<C>> for MemoryWatchStorage<C>
where
    C: Clone + Send + Sync,
{
    async fn add(&self, watches: &[Watch<C>]) -> Result<()> {
        let mut slots = lock(&self.slots)?;
        for (i, w) in watches.iter().enumerate() {
            let clash = slots.iter().any(|s| s.watch.id == w.id)
                || watches[..i].iter().any(|o| o.id == w.id);
            if clash {
                return Err(Error::DuplicateId(w.id));
            }
        }
        slots.extend(watches.iter().map(|w| Slot {
            watch: Watch {
                status: WatchStatus::Pending,
                ..w.clone()
            },
            removed: None,
        }));
        Ok(())
    }

    async fn list(&self, status: WatchStatus) -> Result<Vec<Watch<C>>> {
        Ok(lock(&self.slots)?
            .iter()
            .filter(|s| s.listed_as(status))
            .map(|s| s.watch.clone())
            .collect())
    }

    async fn remove(&self, watches: &[WatchToRemove<Watch<C>>]) -> Result<()> {
        let mut slots = lock(&self.slots)?;
        let mut idx = Vec::with_capacity(watches.len());
        for r in watches {
            let i = slots
                .iter()
                .position(|s| s.watch.id == r.watch.id)
                .ok_or_else(|| Error::not_found("watch", r.watch.id))?;
            idx.push((i, r.reason));
        }
        for (i, reason) in idx {
            slots[i].removed = Some(reason);
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: WatchStatus) -> Result<()> {
        let mut slots = lock(&self.slots)?;
        let slot = slots
            .iter_mut()
            .find(|s| s.watch.id == id)
            .ok_or_else(|| Error::not_found("watch", id))?;
        if slot.watch.status != WatchStatus::Pending || slot.removed.is_some() {
            return Err(Error::invalid_transition("watch", id));
        }
        if !status.is_terminal() {
            return Err(Error::InvalidTarget(status.to_string()));
        }
        slot.watch.status = status;
        Ok(())
    }
}

#[derive(Default)]
struct Callbacks {
    entries: HashMap<Uuid, Callback>,
    history: HashMap<Uuid, Vec<CallbackHistory>>,
}

/// Rule and callback store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    rules: Mutex<Vec<Rule>>,
    callbacks: Mutex<Callbacks>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn add_rule(&self, rule: NewRule) -> Result<Rule> {
        rule.validate()?;
        let rule = rule.into_rule(Utc::now());
        lock(&self.rules)?.push(rule.clone());
        Ok(rule)
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        Ok(lock(&self.rules)?.iter().find(|r| r.id == id).cloned())
    }

    async fn list_rules(&self, status: RuleStatus) -> Result<Vec<Rule>> {
        Ok(lock(&self.rules)?
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn update_rule_status(&self, id: Uuid, status: RuleStatus) -> Result<()> {
        let mut rules = lock(&self.rules)?;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::not_found("rule", id))?;
        if rule.status != RuleStatus::Pending {
            return Err(Error::invalid_transition("rule", id));
        }
        if !status.is_terminal() {
            return Err(Error::InvalidTarget(status.to_string()));
        }
        rule.status = status;
        Ok(())
    }
}

#[async_trait]
impl CallbackStore for MemoryStore {
    async fn add_callback(&self, registered_ip: IpAddr, url: Url) -> Result<Callback> {
        let callback = Callback {
            id: Uuid::new_v4(),
            registered_ip,
            url,
            registered_time: Utc::now(),
            completed: false,
        };
        lock(&self.callbacks)?
            .entries
            .insert(callback.id, callback.clone());
        Ok(callback)
    }

    async fn get_callback(&self, id: Uuid) -> Result<Option<Callback>> {
        Ok(lock(&self.callbacks)?.entries.get(&id).cloned())
    }

    async fn add_history(
        &self,
        id: Uuid,
        result: Option<&CallbackResult>,
    ) -> Result<CallbackHistory> {
        let result = result.ok_or_else(|| Error::invalid_argument("result", "is missing"))?;
        let data = serde_json::to_string(&result.data).map_err(anyhow::Error::from)?;

        let mut cbs = lock(&self.callbacks)?;
        if !cbs.entries.contains_key(&id) {
            return Err(Error::not_found("callback", id));
        }
        let history = cbs.history.entry(id).or_default();
        let entry = CallbackHistory {
            callback_id: id,
            sequence: history.len() as u64 + 1,
            status: result.status.clone(),
            invoked_time: Utc::now(),
            data,
        };
        history.push(entry.clone());
        Ok(entry)
    }

    async fn set_completed(&self, id: Uuid) -> Result<()> {
        let mut cbs = lock(&self.callbacks)?;
        let callback = cbs
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("callback", id))?;
        callback.completed = true;
        Ok(())
    }

    async fn history(&self, id: Uuid) -> Result<Vec<CallbackHistory>> {
        Ok(lock(&self.callbacks)?
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{hashes::Hash, BlockHash, Txid};

    fn watch() -> Watch<u8> {
        Watch::new(7, BlockHash::all_zeros(), 10, Txid::all_zeros())
    }

    #[tokio::test]
    async fn duplicate_batch_writes_nothing() -> anyhow::Result<()> {
        let store = MemoryWatchStorage::new();
        let w = watch();
        let err = store.add(&[w.clone(), w.clone()]).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == w.id));
        assert!(store.list(WatchStatus::Pending).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn block_removed_watch_disappears() -> anyhow::Result<()> {
        let store = MemoryWatchStorage::new();
        let w = watch();
        store.add(&[w.clone()]).await?;
        store
            .remove(&[WatchToRemove::new(w.clone(), RemoveReason::BlockRemoved)])
            .await?;
        for s in [WatchStatus::Pending, WatchStatus::Success, WatchStatus::Rejected] {
            assert!(store.list(s).await?.is_empty());
        }

        let err = store
            .update_status(w.id, WatchStatus::Rejected)
            .await
            .unwrap_err();
        assert!(err.is_transition_race());
        assert!(store.list(WatchStatus::Rejected).await?.is_empty());
        Ok(())
    }
}
