use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, Reference, UnsubscribeEntry,
};
use parking_lot::RwLock;

use super::Unit;
use crate::{
    StoreError,
    store::{QueueStore, RecordFilter, check_expected, select, suppresses},
};

#[derive(Debug, Default)]
pub(crate) struct Tables {
    /// Keyed by ULID, so iteration is oldest first
    pub(crate) records: BTreeMap<QueueRecordId, Unit>,
    pub(crate) unsubscribes: AHashSet<UnsubscribeEntry>,
}

/// In-memory store
///
/// All tables sit behind a single `RwLock`, which makes every trait method
/// one atomic step. Suitable for tests and for hosts that persist elsewhere.
///
/// # Capacity Management
/// An optional capacity bounds the number of records; inserts beyond it fail
/// instead of growing without limit.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    pub(crate) tables: Arc<RwLock<Tables>>,
    capacity: Option<usize>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that holds at most `capacity` records
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of records currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
    ) -> crate::Result<()> {
        let mut tables = self.tables.write();

        if tables.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }

        if let Some(cap) = self.capacity
            && tables.records.len() >= cap
        {
            return Err(StoreError::Internal(format!(
                "Memory store capacity exceeded: {}/{cap} records",
                tables.records.len()
            )));
        }

        tables.records.insert(
            record.id.clone(),
            Unit {
                record: record.clone(),
                recipients: recipients.to_vec(),
            },
        );

        Ok(())
    }

    async fn get(&self, id: &QueueRecordId) -> crate::Result<QueueRecord> {
        self.tables
            .read()
            .records
            .get(id)
            .map(|unit| unit.record.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn recipients(&self, id: &QueueRecordId) -> crate::Result<Vec<QueueRecipient>> {
        self.tables
            .read()
            .records
            .get(id)
            .map(|unit| unit.recipients.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self, filter: &RecordFilter) -> crate::Result<Vec<QueueRecord>> {
        let tables = self.tables.read();
        Ok(select(filter, tables.records.values().map(|unit| &unit.record)))
    }

    async fn compare_and_set_status(
        &self,
        id: &QueueRecordId,
        expected: QueueStatus,
        next: QueueStatus,
        at: DateTime<Utc>,
    ) -> crate::Result<bool> {
        let next = expected.transition(next)?;
        let mut tables = self.tables.write();
        let unit = tables
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if unit.record.status != expected {
            return Ok(false);
        }

        unit.record.status = next;
        unit.record.modified_at = at;
        Ok(true)
    }

    async fn save(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
        expected: QueueStatus,
    ) -> crate::Result<()> {
        if record.status != expected {
            expected.transition(record.status)?;
        }

        let mut tables = self.tables.write();
        let unit = tables
            .records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

        check_expected(&unit.record, expected)?;

        unit.record = record.clone();
        unit.recipients = recipients.to_vec();
        Ok(())
    }

    async fn delete(&self, id: &QueueRecordId) -> crate::Result<()> {
        self.tables
            .write()
            .records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(())
    }

    async fn count_recipients_since(&self, since: DateTime<Utc>) -> crate::Result<usize> {
        Ok(self
            .tables
            .read()
            .records
            .values()
            .filter(|unit| {
                unit.record.created_at >= since && unit.record.status != QueueStatus::Expired
            })
            .map(|unit| unit.recipients.len())
            .sum())
    }

    async fn add_unsubscribe(&self, entry: &UnsubscribeEntry) -> crate::Result<bool> {
        Ok(self.tables.write().unsubscribes.insert(entry.clone()))
    }

    async fn is_unsubscribed(
        &self,
        reference: Option<&Reference>,
        email: &str,
    ) -> crate::Result<bool> {
        Ok(suppresses(
            self.tables.read().unsubscribes.iter(),
            reference,
            email,
        ))
    }
}
