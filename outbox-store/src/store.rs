use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, Reference, UnsubscribeEntry,
};

/// Persistence for queue records, their recipients and unsubscribe entries
///
/// Every method is atomic with respect to the others on the same store: a
/// record and its recipients are always written and read together.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Persist a new record together with its recipient rows
    async fn insert(&self, record: &QueueRecord, recipients: &[QueueRecipient])
    -> crate::Result<()>;

    async fn get(&self, id: &QueueRecordId) -> crate::Result<QueueRecord>;

    /// Recipient rows owned by `id`, in insertion order
    async fn recipients(&self, id: &QueueRecordId) -> crate::Result<Vec<QueueRecipient>>;

    /// Records matching `filter`, oldest first
    async fn list(&self, filter: &RecordFilter) -> crate::Result<Vec<QueueRecord>>;

    /// Move `id` from `expected` to `next`, stamping `modified_at`
    ///
    /// Returns `false` without writing when the record is no longer in
    /// `expected`. Fails if the transition itself is not allowed.
    async fn compare_and_set_status(
        &self,
        id: &QueueRecordId,
        expected: QueueStatus,
        next: QueueStatus,
        at: DateTime<Utc>,
    ) -> crate::Result<bool>;

    /// Replace a record and its recipients, provided the stored record is
    /// still in `expected`
    async fn save(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
        expected: QueueStatus,
    ) -> crate::Result<()>;

    /// Delete a record and every recipient it owns
    async fn delete(&self, id: &QueueRecordId) -> crate::Result<()>;

    /// Recipient rows of records created at or after `since`, ignoring
    /// records that expired without being sent
    async fn count_recipients_since(&self, since: DateTime<Utc>) -> crate::Result<usize>;

    /// Returns `true` if the entry was not present before
    async fn add_unsubscribe(&self, entry: &UnsubscribeEntry) -> crate::Result<bool>;

    /// Whether `email` opted out of `reference`, or out of everything
    async fn is_unsubscribed(&self, reference: Option<&Reference>, email: &str)
    -> crate::Result<bool>;
}

/// Selection criteria for [`QueueStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub status: Option<QueueStatus>,
    /// Only records whose send-after and retry times have passed
    pub due_at: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn due_at(mut self, now: DateTime<Utc>) -> Self {
        self.due_at = Some(now);
        self
    }

    #[must_use]
    pub fn modified_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.modified_before = Some(cutoff);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn matches(&self, record: &QueueRecord) -> bool {
        self.status.is_none_or(|status| record.status == status)
            && self.due_at.is_none_or(|now| record.is_due(now))
            && self
                .modified_before
                .is_none_or(|cutoff| record.modified_at < cutoff)
    }
}

/// Apply `filter` to records already sorted oldest first
pub(crate) fn select<'a>(
    filter: &RecordFilter,
    records: impl Iterator<Item = &'a QueueRecord>,
) -> Vec<QueueRecord> {
    records
        .filter(|record| filter.matches(record))
        .take(filter.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

/// Shared check behind `compare_and_set_status` and `save`
pub(crate) fn check_expected(
    current: &QueueRecord,
    expected: QueueStatus,
) -> crate::Result<()> {
    if current.status == expected {
        Ok(())
    } else {
        Err(crate::StoreError::Conflict {
            id: current.id.clone(),
            expected,
            actual: current.status,
        })
    }
}

/// Whether an unsubscribe set suppresses `email` for `reference`
pub(crate) fn suppresses<'a>(
    mut entries: impl Iterator<Item = &'a UnsubscribeEntry>,
    reference: Option<&Reference>,
    email: &str,
) -> bool {
    let email = email.trim().to_lowercase();
    entries.any(|entry| {
        entry.email == email && (entry.is_global() || entry.reference.as_ref() == reference)
    })
}
