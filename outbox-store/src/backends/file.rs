use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, Reference, UnsubscribeEntry,
    internal,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    sync::{Mutex, MutexGuard},
};

use super::Unit;
use crate::{
    StoreError, ValidationError,
    store::{QueueStore, RecordFilter, check_expected, select, suppresses},
};

const UNSUBSCRIBE_FILE: &str = "unsubscribe.bin";
const LOCK_FILE: &str = "store.lock";

/// Held for the length of one store call
///
/// The file lock is released when the handle closes, before the mutex.
struct StoreGuard<'a> {
    _file: std::fs::File,
    _mutex: MutexGuard<'a, ()>,
}

/// File-based store
///
/// Each record lives in `{id}.bin` together with its recipient rows, encoded
/// with bincode. The id is a ULID, so sorting file names sorts records by
/// creation time. Unsubscribe entries share a single `unsubscribe.bin`.
///
/// # Atomicity
/// Writes go to `.tmp_{name}` and are renamed into place, so a crash never
/// leaves a half-written record behind. Deletes rename to `{name}.deleted`
/// before removing.
///
/// # Locking
/// Every call holds an async mutex, for callers in this process, and an
/// exclusive lock on `store.lock`, for other processes sharing the
/// directory. Together they make `compare_and_set_status` a true
/// compare-and-set, so a cron `flush` can run beside `serve`.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Default for FileQueueStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/outbox"),
            lock: Arc::default(),
        }
    }
}

impl FileQueueStore {
    /// Validate a store path
    ///
    /// # Errors
    /// - If the path contains `..`
    /// - If the path is relative
    /// - If the path points into a system directory
    pub fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDir(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        for prefix in &sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(ValidationError::SystemDirectory {
                    prefix: (*prefix).to_string(),
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileQueueStoreBuilder {
        FileQueueStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the store directory if needed and clear leftovers from a crash
    ///
    /// # Errors
    /// - If the directory cannot be created
    /// - If the path exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising queue store ...");

        if !self.path.try_exists()? {
            internal!("{:#?} does not exist, creating...", self.path);
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup_orphans()
    }

    /// Remove `.tmp_` and `.deleted` files left by interrupted writes
    fn cleanup_orphans(&self) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(".tmp_") || filename.ends_with(".deleted") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from queue store"
            );
        }

        Ok(())
    }

    /// Take both locks, waiting for other processes to finish their call
    async fn exclusive(&self) -> crate::Result<StoreGuard<'_>> {
        let mutex = self.lock.lock().await;

        let path = self.path.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)?;
            file.lock()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("Store lock task failed: {e}")))??;

        Ok(StoreGuard {
            _file: file,
            _mutex: mutex,
        })
    }

    fn record_path(&self, id: &QueueRecordId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    async fn write_file<T: Serialize + Sync>(&self, name: &str, value: &T) -> crate::Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        let temp = self.path.join(format!(".tmp_{name}"));
        fs::write(&temp, &bytes).await?;
        fs::rename(&temp, self.path.join(name)).await?;
        Ok(())
    }

    async fn read_file<T: DeserializeOwned>(&self, path: &Path) -> crate::Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let (value, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_unit(&self, id: &QueueRecordId) -> crate::Result<Unit> {
        self.read_file(&self.record_path(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn write_unit(&self, unit: &Unit) -> crate::Result<()> {
        self.write_file(&format!("{}.bin", unit.record.id), unit)
            .await
    }

    /// Every stored record id, oldest first
    async fn ids(&self) -> crate::Result<Vec<QueueRecordId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if !filename.starts_with(".tmp_")
                && let Some(id) = QueueRecordId::from_filename(&filename)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn units(&self) -> crate::Result<Vec<Unit>> {
        let mut units = Vec::new();
        for id in self.ids().await? {
            // A concurrent process may have deleted it since the scan
            match self.read_unit(&id).await {
                Ok(unit) => units.push(unit),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(units)
    }

    async fn unsubscribes(&self) -> crate::Result<Vec<UnsubscribeEntry>> {
        Ok(self
            .read_file(&self.path.join(UNSUBSCRIBE_FILE))
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    #[tracing::instrument(level = "debug", skip_all, fields(id = %record.id))]
    async fn insert(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
    ) -> crate::Result<()> {
        let _guard = self.exclusive().await?;

        if fs::try_exists(self.record_path(&record.id)).await? {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }

        self.write_unit(&Unit {
            record: record.clone(),
            recipients: recipients.to_vec(),
        })
        .await?;

        internal!(level = DEBUG, "Stored record {} in {}", record.id, self.path.display());
        Ok(())
    }

    async fn get(&self, id: &QueueRecordId) -> crate::Result<QueueRecord> {
        let _guard = self.exclusive().await?;
        Ok(self.read_unit(id).await?.record)
    }

    async fn recipients(&self, id: &QueueRecordId) -> crate::Result<Vec<QueueRecipient>> {
        let _guard = self.exclusive().await?;
        Ok(self.read_unit(id).await?.recipients)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list(&self, filter: &RecordFilter) -> crate::Result<Vec<QueueRecord>> {
        let _guard = self.exclusive().await?;
        let units = self.units().await?;
        Ok(select(filter, units.iter().map(|unit| &unit.record)))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %id, %expected, %next))]
    async fn compare_and_set_status(
        &self,
        id: &QueueRecordId,
        expected: QueueStatus,
        next: QueueStatus,
        at: DateTime<Utc>,
    ) -> crate::Result<bool> {
        let next = expected.transition(next)?;
        let _guard = self.exclusive().await?;

        let mut unit = self.read_unit(id).await?;
        if unit.record.status != expected {
            return Ok(false);
        }

        unit.record.status = next;
        unit.record.modified_at = at;
        self.write_unit(&unit).await?;
        Ok(true)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %record.id))]
    async fn save(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
        expected: QueueStatus,
    ) -> crate::Result<()> {
        if record.status != expected {
            expected.transition(record.status)?;
        }

        let _guard = self.exclusive().await?;
        let current = self.read_unit(&record.id).await?;
        check_expected(&current.record, expected)?;

        self.write_unit(&Unit {
            record: record.clone(),
            recipients: recipients.to_vec(),
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %id))]
    async fn delete(&self, id: &QueueRecordId) -> crate::Result<()> {
        let _guard = self.exclusive().await?;

        let path = self.record_path(id);
        let deleted = self.path.join(format!("{id}.bin.deleted"));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(&deleted).await?;

        internal!(level = DEBUG, "Deleted record {id} from queue store");
        Ok(())
    }

    async fn count_recipients_since(&self, since: DateTime<Utc>) -> crate::Result<usize> {
        let _guard = self.exclusive().await?;
        Ok(self
            .units()
            .await?
            .iter()
            .filter(|unit| {
                unit.record.created_at >= since && unit.record.status != QueueStatus::Expired
            })
            .map(|unit| unit.recipients.len())
            .sum())
    }

    async fn add_unsubscribe(&self, entry: &UnsubscribeEntry) -> crate::Result<bool> {
        let _guard = self.exclusive().await?;

        let mut entries = self.unsubscribes().await?;
        if entries.contains(entry) {
            return Ok(false);
        }

        entries.push(entry.clone());
        self.write_file(UNSUBSCRIBE_FILE, &entries).await?;
        Ok(true)
    }

    async fn is_unsubscribed(
        &self,
        reference: Option<&Reference>,
        email: &str,
    ) -> crate::Result<bool> {
        let _guard = self.exclusive().await?;
        let entries = self.unsubscribes().await?;
        Ok(suppresses(entries.iter(), reference, email))
    }
}

/// Builder for `FileQueueStore`
#[derive(Debug, Default)]
pub struct FileQueueStoreBuilder {
    path: PathBuf,
}

impl FileQueueStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Build the final `FileQueueStore`
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> crate::Result<FileQueueStore> {
        FileQueueStore::validate_path(&self.path)?;
        Ok(FileQueueStore {
            path: self.path,
            lock: Arc::default(),
        })
    }
}
