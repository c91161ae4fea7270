pub mod backends;
pub mod config;
pub mod error;
pub mod store;

pub use backends::{FileQueueStore, FileQueueStoreBuilder, MemoryQueueStore, TestQueueStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use store::{QueueStore, RecordFilter};
