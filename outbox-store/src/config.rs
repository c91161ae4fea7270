use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileQueueStore, MemoryQueueStore, QueueStore};

/// Runtime selection of the queue store
///
/// File-backed store in RON config:
/// ```ron
/// Outbox (
///     store: File(path: "/var/lib/outbox"),
/// )
/// ```
///
/// Memory-backed store, optionally bounded:
/// ```ron
/// Outbox (
///     store: Memory(capacity: Some(1000)),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    /// Records survive restarts
    File { path: PathBuf },
    /// Records live as long as the process
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: FileQueueStore::default().path().to_path_buf(),
        }
    }
}

impl StoreConfig {
    /// Filesystem location for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Build and initialise the configured store
    ///
    /// # Errors
    /// If the file store path is invalid or cannot be created
    pub fn into_store(self) -> crate::Result<Arc<dyn QueueStore>> {
        match self {
            Self::File { path } => {
                let store = FileQueueStore::builder().path(path).build()?;
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => Ok(Arc::new(
                capacity.map_or_else(MemoryQueueStore::new, MemoryQueueStore::with_capacity),
            )),
        }
    }
}
