//! Persisted queue types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{QueueRecordId, QueueStatus, RecipientStatus};

/// The entity an email was sent on behalf of, e.g. `("User", "Administrator")`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub doctype: String,
    pub name: String,
}

impl Reference {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.doctype, self.name)
    }
}

/// One queued send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: QueueRecordId,
    pub sender: String,
    pub subject: String,
    /// Rendered body, still holding the per-recipient markers
    pub message: String,
    pub reply_to: Option<String>,
    pub status: QueueStatus,
    pub reference: Option<Reference>,
    /// Not eligible for flushing before this instant
    pub send_after: Option<DateTime<Utc>>,
    pub expose_recipients: bool,
    /// Number of flushes that ended with at least one failed recipient
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl QueueRecord {
    /// Whether a flush at `now` may pick this record up
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::NotSent
            && self.send_after.is_none_or(|at| at <= now)
            && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// A recipient row, owned by exactly one [`QueueRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecipient {
    pub parent: QueueRecordId,
    pub recipient: String,
    pub is_cc: bool,
    pub status: RecipientStatus,
    pub error: Option<String>,
}

impl QueueRecipient {
    #[must_use]
    pub const fn new(parent: QueueRecordId, recipient: String, is_cc: bool) -> Self {
        Self {
            parent,
            recipient,
            is_cc,
            status: RecipientStatus::NotSent,
            error: None,
        }
    }
}

/// Opt-out of future mail
///
/// Without a reference the opt-out applies to every reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnsubscribeEntry {
    pub reference: Option<Reference>,
    /// Always lowercase
    pub email: String,
}

impl UnsubscribeEntry {
    pub fn new(reference: Option<Reference>, email: &str) -> Self {
        Self {
            reference,
            email: email.trim().to_lowercase(),
        }
    }

    #[must_use]
    pub const fn is_global(&self) -> bool {
        self.reference.is_none()
    }
}
