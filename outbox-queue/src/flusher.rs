//! Transmission of due queue records.
//!
//! Every record is claimed with a compare-and-set from Not Sent to Sending
//! before anything is transmitted, so two flushes never send the same record.
//! The outcome is written back in one store call per record. When the store
//! fails after the claim, the record is handed back to Not Sent with its
//! recipient progress, and a claim older than the lease is released by the
//! next flush.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, RecipientStatus, outgoing,
};
use outbox_store::{QueueStore, RecordFilter};
use tracing::{error, info, warn};

use crate::{
    config::QueueConfig,
    error::TransportError,
    render, retry,
    transport::{MailTransport, OutgoingMail},
    unsubscribe::UnsubscribeRegistry,
};

/// What happened to one record during a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every recipient accepted the message
    Sent,
    /// Gave up: a permanent failure or out of attempts
    Failed,
    /// Some recipients failed and the record will be tried again
    Retrying,
    /// Not due yet, or claimed by someone else
    Skipped,
}

/// Totals for one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    pub retrying: usize,
    pub skipped: usize,
}

impl FlushReport {
    const fn add(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Sent => self.sent += 1,
            FlushOutcome::Failed => self.failed += 1,
            FlushOutcome::Retrying => self.retrying += 1,
            FlushOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Records looked at
    #[must_use]
    pub const fn total(&self) -> usize {
        self.sent + self.failed + self.retrying + self.skipped
    }
}

/// Sends due records through a [`MailTransport`]
#[derive(Debug, Clone)]
pub struct Flusher {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    registry: UnsubscribeRegistry,
    config: Arc<QueueConfig>,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        registry: UnsubscribeRegistry,
        config: Arc<QueueConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            config,
        }
    }

    /// Send every due record, oldest first, up to the batch size
    ///
    /// Abandoned claims are released first. A failure on one record is logged
    /// and does not stop the others.
    ///
    /// # Errors
    /// If the due records cannot be listed
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn flush(&self, now: DateTime<Utc>) -> crate::Result<FlushReport> {
        if let Err(e) = self.recover(now).await {
            warn!(error = %e, "Failed to release abandoned claims");
        }

        let due = self
            .store
            .list(
                &RecordFilter::new()
                    .status(QueueStatus::NotSent)
                    .due_at(now)
                    .limit(self.config.batch_size),
            )
            .await?;

        let mut report = FlushReport::default();
        if due.is_empty() {
            return Ok(report);
        }

        info!(count = due.len(), "Flushing email queue");

        for record in due {
            let id = record.id.clone();
            match self.process(record, now).await {
                Ok(outcome) => report.add(outcome),
                Err(e) => {
                    error!(record_id = %id, error = %e, "Failed to flush queue record");
                    report.add(FlushOutcome::Skipped);
                }
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            retrying = report.retrying,
            skipped = report.skipped,
            "Flush complete"
        );

        Ok(report)
    }

    /// Send a single record if it is due
    ///
    /// # Errors
    /// If the record does not exist or the store fails
    pub async fn flush_one(
        &self,
        id: &QueueRecordId,
        now: DateTime<Utc>,
    ) -> crate::Result<FlushOutcome> {
        let record = self.store.get(id).await?;
        self.process(record, now).await
    }

    /// Return records whose Sending claim has outlived the lease to Not Sent
    ///
    /// Claims younger than `claim_lease_secs` belong to a flush that may still
    /// be running, possibly in another process, and are left alone.
    ///
    /// # Errors
    /// If the store cannot be read or written
    pub async fn recover(&self, now: DateTime<Utc>) -> crate::Result<usize> {
        let Some(cutoff) = self.config.claim_cutoff(now) else {
            return Ok(0);
        };
        let stuck = self
            .store
            .list(
                &RecordFilter::new()
                    .status(QueueStatus::Sending)
                    .modified_before(cutoff),
            )
            .await?;

        let mut recovered = 0;
        for record in stuck {
            if self
                .store
                .compare_and_set_status(&record.id, QueueStatus::Sending, QueueStatus::NotSent, now)
                .await?
            {
                warn!(record_id = %record.id, "Released interrupted send");
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn process(
        &self,
        record: QueueRecord,
        now: DateTime<Utc>,
    ) -> crate::Result<FlushOutcome> {
        if !record.is_due(now) {
            return Ok(FlushOutcome::Skipped);
        }

        if !self
            .store
            .compare_and_set_status(&record.id, QueueStatus::NotSent, QueueStatus::Sending, now)
            .await?
        {
            outgoing!(
                level = DEBUG,
                "Record {} was claimed elsewhere, skipping",
                record.id
            );
            return Ok(FlushOutcome::Skipped);
        }

        let mut recipients = match self.store.recipients(&record.id).await {
            Ok(recipients) => recipients,
            Err(e) => {
                self.release(record, None, &e.to_string(), now).await;
                return Err(e.into());
            }
        };

        let (updated, outcome) = self.deliver(record.clone(), &mut recipients, now).await;

        if let Err(e) = self
            .store
            .save(&updated, &recipients, QueueStatus::Sending)
            .await
        {
            self.release(record, Some(recipients.as_slice()), &e.to_string(), now)
                .await;
            return Err(e.into());
        }

        Ok(outcome)
    }

    /// Transmit to every recipient not yet sent and work out the new state
    async fn deliver(
        &self,
        record: QueueRecord,
        recipients: &mut [QueueRecipient],
        now: DateTime<Utc>,
    ) -> (QueueRecord, FlushOutcome) {
        let (to, cc) = split_headers(recipients);

        let mut permanent = false;
        let mut last_error = None;

        for recipient in recipients
            .iter_mut()
            .filter(|r| r.status != RecipientStatus::Sent)
        {
            match self.transmit(&record, &recipient.recipient, &to, &cc).await {
                Ok(()) => {
                    outgoing!(
                        level = DEBUG,
                        "Sent {} to {}",
                        record.id,
                        recipient.recipient
                    );
                    recipient.status = RecipientStatus::Sent;
                    recipient.error = None;
                }
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        recipient = %recipient.recipient,
                        permanent = e.is_permanent(),
                        error = %e,
                        "Transmission failed"
                    );
                    permanent |= e.is_permanent();
                    recipient.status = RecipientStatus::Error;
                    recipient.error = Some(e.to_string());
                    last_error = Some(e.to_string());
                }
            }
        }

        let mut updated = record;
        updated.modified_at = now;

        let outcome = if recipients
            .iter()
            .all(|r| r.status == RecipientStatus::Sent)
        {
            updated.status = QueueStatus::Sent;
            updated.error = None;
            updated.next_retry_at = None;
            FlushOutcome::Sent
        } else {
            updated.attempts = updated.attempts.saturating_add(1);
            updated.error = last_error;

            if permanent || updated.attempts >= self.config.max_attempts {
                error!(
                    record_id = %updated.id,
                    attempts = updated.attempts,
                    error = ?updated.error,
                    "Giving up on queue record"
                );
                updated.status = QueueStatus::Error;
                updated.next_retry_at = None;
                FlushOutcome::Failed
            } else {
                let next = retry::next_retry_at(now, updated.attempts, &self.config.retry);
                info!(
                    record_id = %updated.id,
                    attempt = updated.attempts,
                    next_retry_at = %next,
                    "Will retry queue record"
                );
                updated.status = QueueStatus::NotSent;
                updated.next_retry_at = Some(next);
                FlushOutcome::Retrying
            }
        };

        (updated, outcome)
    }

    /// Hand a claimed record back after the store failed mid-flush
    ///
    /// With the recipient rows in hand the record is rewritten with them, as
    /// Sent when nobody is left or as a retry otherwise, so recipients already
    /// sent are not sent again. Without them only the status is reset.
    /// Failures here are logged and the lease catches what is left.
    async fn release(
        &self,
        record: QueueRecord,
        recipients: Option<&[QueueRecipient]>,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let id = record.id.clone();

        if let Some(recipients) = recipients {
            let mut retry = record;
            retry.modified_at = now;
            if recipients.iter().all(|r| r.status == RecipientStatus::Sent) {
                retry.status = QueueStatus::Sent;
                retry.error = None;
                retry.next_retry_at = None;
            } else {
                retry.attempts = retry.attempts.saturating_add(1);
                retry.error = Some(reason.to_string());
                if retry.attempts >= self.config.max_attempts {
                    retry.status = QueueStatus::Error;
                    retry.next_retry_at = None;
                } else {
                    retry.status = QueueStatus::NotSent;
                    retry.next_retry_at =
                        Some(retry::next_retry_at(now, retry.attempts, &self.config.retry));
                }
            }

            match self
                .store
                .save(&retry, recipients, QueueStatus::Sending)
                .await
            {
                Ok(()) => {
                    warn!(
                        record_id = %id,
                        status = %retry.status,
                        "Released claim after store error"
                    );
                    return;
                }
                Err(e) => {
                    warn!(record_id = %id, error = %e, "Failed to save released claim");
                }
            }
        }

        match self
            .store
            .compare_and_set_status(&id, QueueStatus::Sending, QueueStatus::NotSent, now)
            .await
        {
            Ok(true) => warn!(record_id = %id, "Released claim after store error"),
            Ok(false) => {}
            Err(e) => error!(
                record_id = %id,
                error = %e,
                "Failed to release claim, leaving it to the lease"
            ),
        }
    }

    async fn transmit(
        &self,
        record: &QueueRecord,
        recipient: &str,
        to: &[String],
        cc: &[String],
    ) -> Result<(), TransportError> {
        let link = if render::wants_unsubscribe_link(&record.message) {
            Some(
                self.registry
                    .link(recipient, record.reference.as_ref())
                    .map_err(|e| TransportError::Message(e.to_string()))?,
            )
        } else {
            None
        };

        let body = render::personalise(&record.message, recipient, link.as_deref());
        let mail = OutgoingMail::build(record, recipient, to, cc, body)?;
        self.transport.transmit(&mail).await
    }
}

/// Every To and CC address, for records that expose their recipients
fn split_headers(recipients: &[QueueRecipient]) -> (Vec<String>, Vec<String>) {
    let (cc, to): (Vec<_>, Vec<_>) = recipients.iter().partition(|r| r.is_cc);
    (
        to.into_iter().map(|r| r.recipient.clone()).collect(),
        cc.into_iter().map(|r| r.recipient.clone()).collect(),
    )
}
