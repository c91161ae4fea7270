//! Store implementations:
//! - `memory`: in-process tables, for tests and embedding
//! - `test`: memory store with hooks for driving tests
//! - `file`: one file per record, for the standalone binary

pub mod file;
pub mod memory;

pub use file::{FileQueueStore, FileQueueStoreBuilder};
pub use memory::MemoryQueueStore;
use outbox_common::{QueueRecipient, QueueRecord};
use serde::{Deserialize, Serialize};
pub use test::TestQueueStore;

/// A record together with the recipient rows it owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Unit {
    pub(crate) record: QueueRecord,
    pub(crate) recipients: Vec<QueueRecipient>,
}
