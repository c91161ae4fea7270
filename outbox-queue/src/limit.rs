use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_store::QueueStore;
use tracing::warn;

use crate::{config::LimitConfig, error::QueueError};

/// Refuses new sends once the period's ceiling would be crossed
#[derive(Debug, Clone)]
pub struct LimitGuard {
    store: Arc<dyn QueueStore>,
    config: LimitConfig,
}

impl LimitGuard {
    pub fn new(store: Arc<dyn QueueStore>, config: LimitConfig) -> Self {
        Self { store, config }
    }

    /// Recipients queued in the period containing `now`
    ///
    /// # Errors
    /// If the store cannot be read
    pub async fn current(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        let since = self.config.period.window_start(now);
        Ok(self.store.count_recipients_since(since).await?)
    }

    /// Fail if queueing `prospective` more recipients would cross the limit
    ///
    /// # Errors
    /// [`QueueError::LimitExceeded`] when over the limit, or a store error
    pub async fn check_limit(&self, prospective: usize, now: DateTime<Utc>) -> crate::Result<()> {
        let Some(limit) = self.config.max_per_period else {
            return Ok(());
        };

        let current = self.current(now).await?;
        if current.saturating_add(prospective) > limit {
            warn!(
                current,
                requested = prospective,
                limit,
                period = ?self.config.period,
                "Refusing send over the email limit"
            );
            return Err(QueueError::LimitExceeded {
                current,
                requested: prospective,
                limit,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::{Duration, TimeZone};
    use outbox_common::{QueueRecipient, QueueRecord, QueueRecordId, QueueStatus};
    use outbox_store::MemoryQueueStore;

    use super::*;
    use crate::config::LimitPeriod;

    async fn queue(store: &MemoryQueueStore, created_at: DateTime<Utc>, recipients: usize) {
        let id = QueueRecordId::generate();
        let record = QueueRecord {
            id: id.clone(),
            sender: "admin@example.com".to_string(),
            subject: "subject".to_string(),
            message: "body".to_string(),
            reply_to: None,
            status: QueueStatus::NotSent,
            reference: None,
            send_after: None,
            expose_recipients: false,
            attempts: 0,
            next_retry_at: None,
            error: None,
            created_at,
            modified_at: created_at,
        };
        let rows: Vec<_> = (0..recipients)
            .map(|i| QueueRecipient::new(id.clone(), format!("user{i}@example.com"), false))
            .collect();
        store.insert(&record, &rows).await.unwrap();
    }

    fn guard(store: &MemoryQueueStore, max: Option<usize>, period: LimitPeriod) -> LimitGuard {
        LimitGuard::new(
            Arc::new(store.clone()),
            LimitConfig {
                max_per_period: max,
                period,
            },
        )
    }

    #[tokio::test]
    async fn test_within_limit() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        queue(&store, now, 3).await;

        let guard = guard(&store, Some(5), LimitPeriod::Month);
        assert!(guard.check_limit(2, now).await.is_ok());
        assert_eq!(guard.current(now).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_over_limit() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        queue(&store, now, 3).await;

        let err = guard(&store, Some(5), LimitPeriod::Month)
            .check_limit(3, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::LimitExceeded {
                current: 3,
                requested: 3,
                limit: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_previous_period_not_counted() {
        let store = MemoryQueueStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        queue(&store, now - Duration::days(2), 5).await;

        assert!(guard(&store, Some(5), LimitPeriod::Month).check_limit(5, now).await.is_ok());

        let yesterday = now - Duration::days(1);
        queue(&store, yesterday, 5).await;
        assert!(guard(&store, Some(5), LimitPeriod::Day).check_limit(5, now).await.is_ok());
        assert!(guard(&store, Some(5), LimitPeriod::Month).check_limit(1, now).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_limit() {
        let store = MemoryQueueStore::new();
        assert!(
            guard(&store, None, LimitPeriod::Month)
                .check_limit(1_000_000, Utc::now())
                .await
                .is_ok()
        );
    }
}
