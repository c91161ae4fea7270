use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_common::{QueueRecipient, QueueRecord, QueueRecordId, Reference, internal};
use outbox_store::{QueueStore, RecordFilter};

use crate::{
    config::QueueConfig,
    expirer::{ClearReport, Expirer},
    flusher::{FlushOutcome, FlushReport, Flusher},
    limit::LimitGuard,
    transport::MailTransport,
    unsubscribe::{UnsubscribeLink, UnsubscribeRegistry},
    writer::{QueueWriter, SendRequest},
};

/// The outbound email queue
///
/// Ties the writer, flusher, expirer, unsubscribe registry and limit guard
/// to one store and one transport. Time is always passed in, so callers
/// (and tests) decide what "now" is.
#[derive(Debug, Clone)]
pub struct EmailQueue {
    store: Arc<dyn QueueStore>,
    config: Arc<QueueConfig>,
    writer: QueueWriter,
    flusher: Flusher,
    expirer: Expirer,
    registry: UnsubscribeRegistry,
    limit: LimitGuard,
}

impl EmailQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        config: QueueConfig,
    ) -> Self {
        let config = Arc::new(config);
        let registry = UnsubscribeRegistry::new(Arc::clone(&store), Arc::clone(&config));
        let limit = LimitGuard::new(Arc::clone(&store), config.limit.clone());

        Self {
            writer: QueueWriter::new(Arc::clone(&store), limit.clone(), registry.clone()),
            flusher: Flusher::new(
                Arc::clone(&store),
                transport,
                registry.clone(),
                Arc::clone(&config),
            ),
            expirer: Expirer::new(Arc::clone(&store), Arc::clone(&config)),
            registry,
            limit,
            store,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Queue a message, transmitting it straight away when `send_now` is set
    ///
    /// Returns `Ok(None)` when no recipient is left after unsubscribes.
    /// Transport failures during `send_now` are recorded on the record, not
    /// returned.
    ///
    /// # Errors
    /// - [`crate::QueueError::LimitExceeded`]
    /// - [`crate::QueueError::InvalidAddress`]
    /// - Store errors
    pub async fn send(
        &self,
        request: SendRequest,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<QueueRecordId>> {
        let Some(id) = self.writer.enqueue(&request, now).await? else {
            return Ok(None);
        };

        if request.send_now {
            let outcome = self.flusher.flush_one(&id, now).await?;
            internal!(level = DEBUG, "Sent {id} immediately: {outcome:?}");
        }

        Ok(Some(id))
    }

    /// # Errors
    /// If the due records cannot be listed
    pub async fn flush(&self, now: DateTime<Utc>) -> crate::Result<FlushReport> {
        self.flusher.flush(now).await
    }

    /// # Errors
    /// If the record does not exist or the store fails
    pub async fn flush_one(
        &self,
        id: &QueueRecordId,
        now: DateTime<Utc>,
    ) -> crate::Result<FlushOutcome> {
        self.flusher.flush_one(id, now).await
    }

    /// # Errors
    /// If the store cannot be read or written
    pub async fn expire(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        self.expirer.expire(now).await
    }

    /// # Errors
    /// If the store cannot be read or written
    pub async fn purge(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        self.expirer.purge(now).await
    }

    /// # Errors
    /// If the store cannot be read or written
    pub async fn clear_outbox(&self, now: DateTime<Utc>) -> crate::Result<ClearReport> {
        self.expirer.clear_outbox(now).await
    }

    /// Release Sending claims older than the lease, left by an interrupted
    /// process
    ///
    /// # Errors
    /// If the store cannot be read or written
    pub async fn recover(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        self.flusher.recover(now).await
    }

    /// # Errors
    /// If the store cannot be written
    pub async fn unsubscribe(&self, doctype: &str, name: &str, email: &str) -> crate::Result<bool> {
        self.registry.unsubscribe(doctype, name, email).await
    }

    /// # Errors
    /// If the store cannot be written
    pub async fn unsubscribe_globally(&self, email: &str) -> crate::Result<bool> {
        self.registry.unsubscribe_globally(email).await
    }

    /// # Errors
    /// If the store cannot be read
    pub async fn is_unsubscribed(
        &self,
        reference: Option<&Reference>,
        email: &str,
    ) -> crate::Result<bool> {
        self.registry.is_unsubscribed(reference, email).await
    }

    /// # Errors
    /// [`crate::QueueError::InvalidSignature`] or a store error
    pub async fn unsubscribe_from_link(&self, link: &str) -> crate::Result<UnsubscribeLink> {
        self.registry.unsubscribe_from_link(link).await
    }

    /// # Errors
    /// If the link cannot be signed
    pub fn unsubscribe_link(
        &self,
        email: &str,
        reference: Option<&Reference>,
    ) -> crate::Result<String> {
        self.registry.link(email, reference)
    }

    /// Recipients counted against the limit in the period containing `now`
    ///
    /// # Errors
    /// If the store cannot be read
    pub async fn period_count(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        self.limit.current(now).await
    }

    /// # Errors
    /// [`crate::QueueError::NotFound`] or a store error
    pub async fn record(&self, id: &QueueRecordId) -> crate::Result<QueueRecord> {
        Ok(self.store.get(id).await?)
    }

    /// # Errors
    /// [`crate::QueueError::NotFound`] or a store error
    pub async fn recipients(&self, id: &QueueRecordId) -> crate::Result<Vec<QueueRecipient>> {
        Ok(self.store.recipients(id).await?)
    }

    /// # Errors
    /// If the store cannot be read
    pub async fn list(&self, filter: &RecordFilter) -> crate::Result<Vec<QueueRecord>> {
        Ok(self.store.list(filter).await?)
    }
}
