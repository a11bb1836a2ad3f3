//! Confirmation rules: what to wait for and what to deliver on each outcome.
use std::{fmt, str::FromStr, time::Duration};

use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle of a rule. Moves once, from `Pending` to a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// Waiting for confirmations.
    Pending,
    /// Required confirmations reached.
    Success,
    /// Waiting time elapsed first.
    Timeout,
}

impl RuleStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Timeout => "timeout",
        }
    }

    /// `Success` or `Timeout`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "timeout" => Ok(Self::Timeout),
            other => Err(Error::InvalidTarget(other.to_owned())),
        }
    }
}

/// Registration request for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    /// Transaction to follow.
    pub transaction_id: Txid,
    /// Required confirmation depth, at least 1.
    pub confirmations: u32,
    /// Time after registration at which an unmet rule times out.
    pub waiting_time: Duration,
    /// Payload delivered when the confirmations are reached.
    pub success_result: serde_json::Value,
    /// Payload delivered on timeout.
    pub timeout_result: serde_json::Value,
    /// Callback target id.
    pub callback: Uuid,
}

impl NewRule {
    /// Reject values no rule can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.confirmations == 0 {
            return Err(Error::invalid_argument(
                "confirmations",
                "must be greater than zero",
            ));
        }
        if self.waiting_time.is_zero() {
            return Err(Error::invalid_argument(
                "waiting_time",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Materialize as a pending rule registered at `registered_time`.
    pub fn into_rule(self, registered_time: DateTime<Utc>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            transaction_id: self.transaction_id,
            confirmations: self.confirmations,
            waiting_time: self.waiting_time,
            success_result: self.success_result,
            timeout_result: self.timeout_result,
            callback: self.callback,
            registered_time,
            status: RuleStatus::Pending,
        }
    }
}

/// A stored confirmation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id.
    pub id: Uuid,
    /// Transaction to follow.
    pub transaction_id: Txid,
    /// Required confirmation depth.
    pub confirmations: u32,
    /// Time after registration at which an unmet rule times out.
    pub waiting_time: Duration,
    /// Delivered on success.
    pub success_result: serde_json::Value,
    /// Delivered on timeout.
    pub timeout_result: serde_json::Value,
    /// Callback target id.
    pub callback: Uuid,
    /// When the rule was stored.
    pub registered_time: DateTime<Utc>,
    /// Status snapshot as of loading.
    pub status: RuleStatus,
}

impl Rule {
    /// Instant at which the rule times out.
    pub fn deadline(&self) -> DateTime<Utc> {
        // Saturate absurd durations instead of overflowing.
        chrono::Duration::from_std(self.waiting_time)
            .ok()
            .and_then(|d| self.registered_time.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the waiting time has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline() <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use serde_json::json;

    fn new_rule(confirmations: u32, waiting_time: Duration) -> NewRule {
        NewRule {
            transaction_id: Txid::all_zeros(),
            confirmations,
            waiting_time,
            success_result: json!("ok"),
            timeout_result: json!("late"),
            callback: Uuid::new_v4(),
        }
    }

    #[test]
    fn validate_rejects_zero_values() {
        let err = new_rule(0, Duration::from_secs(1)).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "confirmations", .. }));

        let err = new_rule(1, Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "waiting_time", .. }));

        new_rule(6, Duration::from_secs(3600)).validate().unwrap();
    }

    #[test]
    fn expires_at_deadline() {
        let now = Utc::now();
        let rule = new_rule(1, Duration::from_secs(3600)).into_rule(now);
        assert_eq!(rule.status, RuleStatus::Pending);
        assert!(!rule.is_expired(now + chrono::Duration::minutes(59)));
        assert!(rule.is_expired(now + chrono::Duration::hours(1)));
    }
}
