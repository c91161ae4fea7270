//! Typed errors for queue operations.
//!
//! Transport failures are split the way SMTP splits them:
//! - Temporary (4xx replies, connection trouble): retried with backoff
//! - Permanent (5xx replies, unbuildable messages): never retried

use outbox_common::QueueRecordId;
use outbox_store::StoreError;
use thiserror::Error;

/// Failure handing one message to a mail transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Temporary failure: {0}")]
    Temporary(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The message could not be built (bad address, bad header)
    #[error("Invalid message: {0}")]
    Message(String),
}

impl TransportError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::Message(_))
    }
}

/// Classify by SMTP reply code when there is one.
///
/// Errors without a reply (connection refused, TLS, timeouts) are treated as
/// temporary since the next flush may well reach the server.
impl From<lettre::transport::smtp::Error> for TransportError {
    fn from(error: lettre::transport::smtp::Error) -> Self {
        if error.is_permanent() {
            Self::Permanent(error.to_string())
        } else {
            Self::Temporary(error.to_string())
        }
    }
}

impl From<lettre::error::Error> for TransportError {
    fn from(error: lettre::error::Error) -> Self {
        Self::Message(error.to_string())
    }
}

impl From<lettre::address::AddressError> for TransportError {
    fn from(error: lettre::address::AddressError) -> Self {
        Self::Message(error.to_string())
    }
}

/// Errors raised to callers of the queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(
        "Email limit of {limit} per period exceeded: {current} already queued, {requested} requested"
    )]
    LimitExceeded {
        current: usize,
        requested: usize,
        limit: usize,
    },

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Invalid or missing unsubscribe signature")]
    InvalidSignature,

    /// Unsubscribe links can neither be signed nor checked without a key
    #[error("No signing secret is configured")]
    MissingSigningSecret,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue record not found: {0}")]
    NotFound(QueueRecordId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::Temporary("451".to_string()).is_temporary());
        assert!(!TransportError::Temporary("451".to_string()).is_permanent());
        assert!(TransportError::Permanent("550".to_string()).is_permanent());
        assert!(TransportError::Message("bad address".to_string()).is_permanent());
    }

    #[test]
    fn test_store_not_found_maps_to_queue_not_found() {
        let id = QueueRecordId::generate();
        let err: QueueError = StoreError::NotFound(id.clone()).into();
        assert!(matches!(err, QueueError::NotFound(found) if found == id));

        let err: QueueError = StoreError::Internal("boom".to_string()).into();
        assert!(matches!(err, QueueError::Store(_)));
    }

    #[test]
    fn test_limit_exceeded_display() {
        let err = QueueError::LimitExceeded {
            current: 10,
            requested: 1000,
            limit: 500,
        };
        assert_eq!(
            err.to_string(),
            "Email limit of 500 per period exceeded: 10 already queued, 1000 requested"
        );
    }

    #[test]
    fn test_address_error_is_permanent() {
        let err: TransportError = "not an address"
            .parse::<lettre::Address>()
            .unwrap_err()
            .into();
        assert!(err.is_permanent());
    }
}
