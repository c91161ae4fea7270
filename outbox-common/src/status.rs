//! Queue and recipient statuses with their transition rules.

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a queue record
///
/// ```text
/// NotSent ──claim──▶ Sending ──▶ Sent | Error
///    │                  │
///    │                  └──retry──▶ NotSent
///    └──expire──▶ Expired
/// ```
///
/// `Sent`, `Expired` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    NotSent,
    /// Claimed by a flush that is transmitting it right now
    Sending,
    Sent,
    Expired,
    Error,
}

impl QueueStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Expired | Self::Error)
    }

    /// Whether a record may move from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotSent, Self::Sending | Self::Expired | Self::Sent | Self::Error)
                | (Self::Sending, Self::NotSent | Self::Sent | Self::Error)
        )
    }

    /// Validate a transition, returning the error the stores report
    ///
    /// # Errors
    ///
    /// If `next` is not reachable from `self`.
    pub const fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSent => "Not Sent",
            Self::Sending => "Sending",
            Self::Sent => "Sent",
            Self::Expired => "Expired",
            Self::Error => "Error",
        }
    }
}

impl Display for QueueStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "notsent" => Ok(Self::NotSent),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "expired" => Ok(Self::Expired),
            "error" => Ok(Self::Error),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Status of a single recipient of a queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientStatus {
    NotSent,
    Sent,
    /// The last transmission to this recipient failed. It is retried while
    /// the parent record is still pending.
    Error,
}

impl RecipientStatus {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotSent | Self::Error, Self::Sent | Self::Error)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSent => "Not Sent",
            Self::Sent => "Sent",
            Self::Error => "Error",
        }
    }
}

impl Display for RecipientStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: QueueStatus,
    pub to: QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown queue status: {0}")]
pub struct UnknownStatus(pub String);
