//! Per-message attempt state owned by the scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::FailureKind;
use crate::envelope::DeliveryKey;
use crate::messaging::MessageId;

/// Lifecycle of an [`AttemptRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Failure observed, no redelivery scheduled yet
    Pending,
    /// A redelivery is scheduled or in flight
    Redelivering,
    /// Persisted to quarantine
    Quarantined,
    /// Succeeded downstream
    Resolved,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Quarantined | Self::Resolved)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Redelivering => write!(f, "redelivering"),
            Self::Quarantined => write!(f, "quarantined"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "redelivering" => Ok(Self::Redelivering),
            "quarantined" => Ok(Self::Quarantined),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid attempt status: {s}")),
        }
    }
}

/// One observed failure and what was decided for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub attempt_count: u32,
    pub kind: FailureKind,
    pub reason: String,
    pub status: AttemptStatus,
    pub observed_at: DateTime<Utc>,
    pub delivery: DeliveryKey,
    pub delay_ms: Option<u64>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub route: Option<String>,
}

/// Attempt state of one logical message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub message_id: MessageId,
    /// Redeliveries scheduled so far; never decreases
    pub attempt_count: u32,
    pub last_error_kind: FailureKind,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub first_failed_at: DateTime<Utc>,
    /// Delivery most recently acted on
    pub last_delivery: Option<DeliveryKey>,
    /// When the current redelivery was published; `None` while held
    pub redelivered_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptSnapshot>,
}

impl AttemptRecord {
    pub fn new(message_id: MessageId, kind: FailureKind, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            attempt_count: 0,
            last_error_kind: kind,
            next_eligible_at: None,
            status: AttemptStatus::Pending,
            first_failed_at: now,
            last_delivery: None,
            redelivered_at: None,
            history: Vec::new(),
        }
    }

    /// Redelivery scheduled but not yet published
    pub fn is_held(&self) -> bool {
        self.status == AttemptStatus::Redelivering && self.redelivered_at.is_none()
    }

    /// Latest instant the record was touched or scheduled for
    pub fn last_activity(&self) -> DateTime<Utc> {
        [
            self.next_eligible_at,
            self.redelivered_at,
            self.history.last().map(|snapshot| snapshot.observed_at),
        ]
        .into_iter()
        .flatten()
        .fold(self.first_failed_at, |latest, at| latest.max(at))
    }

    /// Time left before the message may be redelivered
    pub fn remaining_backoff(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        if self.status != AttemptStatus::Redelivering {
            return None;
        }
        self.next_eligible_at
            .filter(|next| *next > now)
            .and_then(|next| (next - now).to_std().ok())
    }
}
