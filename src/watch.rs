//! Units of tracked chain state and the values used to retire them.
use std::{fmt, str::FromStr};

use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Minimal contract the engine needs from a watch type.
pub trait Identifiable {
    /// Globally unique id assigned at creation.
    fn id(&self) -> Uuid;
}

/// Persisted status of a watch. `Pending` is the only non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    /// Still being evaluated against new blocks.
    Pending,
    /// Condition met.
    Success,
    /// Gave up (timed out).
    Rejected,
}

impl WatchStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Rejected => "rejected",
        }
    }

    /// Whether `self → next` is an allowed transition.
    pub fn can_become(self, next: WatchStatus) -> bool {
        self == Self::Pending && next.is_terminal()
    }

    /// `Success` or `Rejected`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidTarget(other.to_owned())),
        }
    }
}

/// A single tracked condition, anchored at the block where it started.
///
/// `C` is the domain context; for confirmation tracking it is the [`crate::Rule`].
#[derive(Debug, Clone, PartialEq)]
pub struct Watch<C> {
    /// Unique id.
    pub id: Uuid,
    /// Domain payload.
    pub context: C,
    /// Hash of the block that started the watch.
    pub start_block: BlockHash,
    /// Height of `start_block` when the watch was created.
    pub start_height: u32,
    /// Wall-clock time the watch was created.
    pub start_time: DateTime<Utc>,
    /// Transaction the watch follows.
    pub transaction_id: Txid,
    /// Status snapshot as of loading.
    pub status: WatchStatus,
}

impl<C> Watch<C> {
    /// New pending watch with a fresh id.
    pub fn new(
        context: C,
        start_block: BlockHash,
        start_height: u32,
        transaction_id: Txid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            start_block,
            start_height,
            start_time: Utc::now(),
            transaction_id,
            status: WatchStatus::Pending,
        }
    }

    /// Inclusive number of blocks from `start_height` to `height`.
    /// Zero when `height` is below the start block.
    pub fn depth_at(&self, height: u32) -> u32 {
        height
            .checked_sub(self.start_height)
            .map_or(0, |d| d.saturating_add(1))
    }
}

impl<C> Identifiable for Watch<C> {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Why a watch leaves the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoveReason {
    /// The watch ran to completion.
    Completed,
    /// The block it depended on was retracted.
    BlockRemoved,
}

impl RemoveReason {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BlockRemoved => "block_removed",
        }
    }
}

/// A watch paired with the reason it is being retired.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchToRemove<W> {
    /// The watch.
    pub watch: W,
    /// Why.
    pub reason: RemoveReason,
}

impl<W> WatchToRemove<W> {
    /// Pair `watch` with `reason`.
    pub fn new(watch: W, reason: RemoveReason) -> Self {
        Self { watch, reason }
    }
}

/// Which block event a watch is being evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEventType {
    /// A block was appended to the chain.
    Added,
    /// A block is about to be retracted.
    Removing,
}
