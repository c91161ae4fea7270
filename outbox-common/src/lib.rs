//! Types shared by every outbox crate: queue records, their statuses, and
//! the logging macros.

pub mod id;
pub mod logging;
pub mod record;
pub mod status;

pub use id::QueueRecordId;
pub use record::{QueueRecipient, QueueRecord, Reference, UnsubscribeEntry};
pub use status::{InvalidTransition, QueueStatus, RecipientStatus};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
