//! Callback targets, delivery history and the dispatcher deciding what is
//! delivered and recorded for each outcome.
use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    store::CallbackStore,
};

/// Registered delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    /// Unique id.
    pub id: Uuid,
    /// Network origin of the registering caller.
    pub registered_ip: IpAddr,
    /// Where results are delivered.
    pub url: Url,
    /// Server-assigned registration time.
    pub registered_time: DateTime<Utc>,
    /// Set once a terminal result has been delivered.
    pub completed: bool,
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackHistory {
    /// Owning callback.
    pub callback_id: Uuid,
    /// 1-based, gapless per callback.
    pub sequence: u64,
    /// Result status tag.
    pub status: String,
    /// When the attempt happened.
    pub invoked_time: DateTime<Utc>,
    /// JSON serialization of the result data.
    pub data: String,
}

/// Payload handed to a callback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    /// Status tag, see the `STATUS_*` constants.
    pub status: String,
    /// Arbitrary payload.
    pub data: serde_json::Value,
}

impl CallbackResult {
    /// Intermediate progress report.
    pub const STATUS_UPDATE: &'static str = "update";
    /// Rule succeeded.
    pub const STATUS_SUCCESS: &'static str = "success";
    /// Rule timed out.
    pub const STATUS_TIMEOUT: &'static str = "timeout";

    /// Build a result with an arbitrary tag.
    pub fn new(status: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: status.into(),
            data,
        }
    }

    /// Success result carrying `data`.
    pub fn success(data: serde_json::Value) -> Self {
        Self::new(Self::STATUS_SUCCESS, data)
    }

    /// Timeout result carrying `data`.
    pub fn timeout(data: serde_json::Value) -> Self {
        Self::new(Self::STATUS_TIMEOUT, data)
    }

    /// Terminal results complete their callback once delivered.
    pub fn is_final(&self) -> bool {
        self.status != Self::STATUS_UPDATE
    }
}

/// Wire delivery of a result (HTTP POST, queue, ...). Retries over the wire
/// are the transport's own business.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Deliver `result` to `callback`.
    async fn execute(&self, callback: &Callback, result: &CallbackResult) -> anyhow::Result<()>;
}

/// What happened to one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Transport accepted the payload.
    Delivered,
    /// Transport failed; the attempt is recorded and the result stays owed.
    Failed,
}

/// Registers callbacks and records every delivery attempt.
pub struct CallbackDispatcher<S, T> {
    store: Arc<S>,
    transport: T,
}

impl<S, T> CallbackDispatcher<S, T>
where
    S: CallbackStore,
    T: CallbackTransport,
{
    /// Create a dispatcher over `store` delivering through `transport`.
    pub fn new(store: Arc<S>, transport: T) -> Self {
        Self { store, transport }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register a new callback target.
    pub async fn add(&self, registered_ip: IpAddr, url: Url) -> Result<Callback> {
        self.store.add_callback(registered_ip, url).await
    }

    /// Callback by id; absence is not an error.
    pub async fn get(&self, id: Uuid) -> Result<Option<Callback>> {
        self.store.get_callback(id).await
    }

    /// Append a history entry.
    pub async fn add_history(
        &self,
        id: Uuid,
        result: Option<&CallbackResult>,
    ) -> Result<CallbackHistory> {
        self.store.add_history(id, result).await
    }

    /// Mark `id` completed. Idempotent.
    pub async fn set_completed(&self, id: Uuid) -> Result<()> {
        self.store.set_completed(id).await
    }

    /// Deliver `result` to callback `id` and record the attempt.
    ///
    /// The history entry is written whatever the transport reports; the
    /// callback is completed only when a final result went through.
    pub async fn dispatch(&self, id: Uuid, result: &CallbackResult) -> Result<DeliveryOutcome> {
        let callback = self
            .store
            .get_callback(id)
            .await?
            .ok_or_else(|| Error::not_found("callback", id))?;

        let outcome = match self.transport.execute(&callback, result).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                warn!(callback = %id, url = %callback.url, error = %e, "callback delivery failed");
                DeliveryOutcome::Failed
            }
        };

        let entry = self.store.add_history(id, Some(result)).await?;
        debug!(callback = %id, seq = entry.sequence, status = %entry.status, "recorded callback attempt");

        if outcome == DeliveryOutcome::Delivered && result.is_final() {
            self.store.set_completed(id).await?;
        }
        Ok(outcome)
    }
}
