use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_common::QueueStatus;
use outbox_store::{QueueStore, RecordFilter, StoreError};
use tracing::{info, warn};

use crate::config::QueueConfig;

/// Totals for one [`Expirer::clear_outbox`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub expired: usize,
    pub purged: usize,
}

/// Retires records that have sat in the queue too long
#[derive(Debug, Clone)]
pub struct Expirer {
    store: Arc<dyn QueueStore>,
    config: Arc<QueueConfig>,
}

impl Expirer {
    pub fn new(store: Arc<dyn QueueStore>, config: Arc<QueueConfig>) -> Self {
        Self { store, config }
    }

    /// Mark Not Sent records untouched for the retention period as Expired
    ///
    /// Recipient rows are kept. Nothing expires when the retention period
    /// does not give a usable cutoff.
    ///
    /// # Errors
    /// If the store cannot be read or written
    pub async fn expire(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        let Some(cutoff) = self.config.expiry_cutoff(now) else {
            warn!(
                retention_days = self.config.retention_days,
                "Retention period out of range, not expiring"
            );
            return Ok(0);
        };
        let stale = self
            .store
            .list(
                &RecordFilter::new()
                    .status(QueueStatus::NotSent)
                    .modified_before(cutoff),
            )
            .await?;

        let mut expired = 0;
        for record in stale {
            // A flush may have claimed it since the listing
            if self
                .store
                .compare_and_set_status(&record.id, QueueStatus::NotSent, QueueStatus::Expired, now)
                .await?
            {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(expired, %cutoff, "Expired unsent queue records");
        }

        Ok(expired)
    }

    /// Delete records of any settled status untouched for the purge period,
    /// together with their recipients
    ///
    /// # Errors
    /// If the store cannot be read or written
    pub async fn purge(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        let Some(cutoff) = self.config.purge_cutoff(now) else {
            warn!(
                purge_after_days = self.config.purge_after_days,
                "Purge period out of range, not purging"
            );
            return Ok(0);
        };
        let old = self
            .store
            .list(&RecordFilter::new().modified_before(cutoff))
            .await?;

        let mut purged = 0;
        for record in old.iter().filter(|r| r.status != QueueStatus::Sending) {
            match self.store.delete(&record.id).await {
                Ok(()) => purged += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if purged > 0 {
            info!(purged, %cutoff, "Purged old queue records");
        }

        Ok(purged)
    }

    /// Expire, then purge
    ///
    /// # Errors
    /// If the store cannot be read or written
    pub async fn clear_outbox(&self, now: DateTime<Utc>) -> crate::Result<ClearReport> {
        let expired = self.expire(now).await?;
        let purged = self.purge(now).await?;
        Ok(ClearReport { expired, purged })
    }
}
