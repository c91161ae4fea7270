#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, RecipientStatus, Reference,
    UnsubscribeEntry,
};
use outbox_queue::{
    EmailQueue, FlushOutcome, FlushReport, LimitConfig, QueueConfig, QueueError,
    RecordingTransport, RetryConfig, SendRequest, SimulatedFailure,
};
use outbox_store::{MemoryQueueStore, QueueStore, RecordFilter, StoreError, TestQueueStore};
use pretty_assertions::assert_eq;

struct Harness {
    queue: EmailQueue,
    store: TestQueueStore,
    transport: RecordingTransport,
}

fn harness_with(config: QueueConfig) -> Harness {
    let store = TestQueueStore::new();
    let transport = RecordingTransport::new();
    let queue = EmailQueue::new(
        Arc::new(store.clone()),
        Arc::new(transport.clone()),
        config,
    );
    Harness {
        queue,
        store,
        transport,
    }
}

fn config() -> QueueConfig {
    QueueConfig {
        site_url: "https://example.com".to_string(),
        unsubscribe_path: "/api/method/outbox.unsubscribe".to_string(),
        signing_secret: "test-secret".to_string(),
        retry: RetryConfig {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            jitter_factor: 0.0,
        },
        ..QueueConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn queued_mail() -> SendRequest {
    SendRequest::new("admin@example.com", "Testing Queue", "This mail is queued!")
        .recipients(["test@example.com", "test1@example.com"])
        .reference("User", "Administrator")
        .unsubscribe_message("Unsubscribe")
}

async fn statuses(h: &Harness, status: QueueStatus) -> usize {
    h.queue
        .list(&RecordFilter::new().status(status))
        .await
        .expect("list")
        .len()
}

#[tokio::test]
async fn test_email_queue() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    assert_eq!(statuses(&h, QueueStatus::NotSent).await, 1);

    let record = h.queue.record(&id).await.expect("record");
    assert!(record.message.contains("<!--unsubscribe url-->"));
    assert_eq!(record.reference, Some(Reference::new("User", "Administrator")));

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    let addresses: Vec<_> = recipients.iter().map(|r| r.recipient.as_str()).collect();
    assert_eq!(addresses, vec!["test@example.com", "test1@example.com"]);
    assert!(
        recipients
            .iter()
            .all(|r| r.status == RecipientStatus::NotSent)
    );

    assert!(h.transport.sent().is_empty(), "nothing is sent until a flush");
}

#[tokio::test]
async fn test_send_after() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail().send_after(now + Duration::seconds(1)), now)
        .await
        .expect("send")
        .expect("record");

    let report = h.queue.flush(now).await.expect("flush");
    assert_eq!(report, FlushReport::default());
    assert_eq!(statuses(&h, QueueStatus::Sent).await, 0);
    assert_eq!(
        h.queue.flush_one(&id, now).await.expect("flush one"),
        FlushOutcome::Skipped
    );

    let report = h
        .queue
        .flush(now + Duration::seconds(2))
        .await
        .expect("flush");
    assert_eq!(report.sent, 1);
    assert_eq!(
        h.queue.record(&id).await.expect("record").status,
        QueueStatus::Sent
    );
}

#[tokio::test]
async fn test_flush() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    let report = h.queue.flush(now).await.expect("flush");
    assert_eq!(
        report,
        FlushReport {
            sent: 1,
            ..FlushReport::default()
        }
    );

    assert_eq!(statuses(&h, QueueStatus::Sent).await, 1);
    let recipients = h.queue.recipients(&id).await.expect("recipients");
    assert_eq!(recipients.len(), 2);
    assert!(recipients.iter().all(|r| r.status == RecipientStatus::Sent));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|mail| mail.body.contains("Unsubscribe")));

    // A second flush has nothing to do
    assert_eq!(h.queue.flush(now).await.expect("flush").total(), 0);
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn test_cc() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(
            SendRequest::new("admin@example.com", "Testing Email Queue", "This is mail is queued!")
                .recipients(["test@example.com"])
                .cc(["test1@example.com"])
                .reference("User", "Administrator")
                .unsubscribe_message("Unsubscribe")
                .expose_recipients(true),
            now,
        )
        .await
        .expect("send")
        .expect("record");

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    assert_eq!(recipients.len(), 2);
    assert!(recipients.iter().any(|r| r.recipient == "test1@example.com" && r.is_cc));

    let message = h.queue.record(&id).await.expect("record").message;
    assert!(message.contains("To: test@example.com"));
    assert!(message.contains("CC: test1@example.com"));
}

#[tokio::test]
async fn test_send_now() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(
            SendRequest::new("admin@example.com", "Testing Email Queue", "This is mail is queued!")
                .recipients(["test@example.com"])
                .cc(["test1@example.com"])
                .reference("User", "Administrator")
                .unsubscribe_message("Unsubscribe")
                .send_now(true),
            now,
        )
        .await
        .expect("send")
        .expect("record");

    let record = h.queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::Sent);
    assert!(record.message.contains("<!--recipient-->"));

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    assert!(recipients.iter().all(|r| r.status == RecipientStatus::Sent));

    let last = h.transport.last().expect("a sent mail");
    assert!(!last.body.contains("<!--recipient-->"));
    assert!(last.body.contains(&last.recipient));

    let marker = "/api/method/outbox.unsubscribe?";
    let start = last.body.find(marker).expect("unsubscribe link") + marker.len();
    let query = last.body[start..].lines().next().expect("query line");

    let verified = h
        .queue
        .unsubscribe_from_link(query)
        .await
        .expect("signature verifies");
    assert_eq!(verified.email, last.recipient);
    assert_eq!(
        verified.reference,
        Some(Reference::new("User", "Administrator"))
    );
}

#[tokio::test]
async fn test_expired() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    h.store
        .backdate(&id, now - Duration::days(8))
        .expect("backdate");

    let report = h.queue.clear_outbox(now).await.expect("clear");
    assert_eq!(report.expired, 1);
    assert_eq!(statuses(&h, QueueStatus::Expired).await, 1);

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    let addresses: Vec<_> = recipients.iter().map(|r| r.recipient.as_str()).collect();
    assert_eq!(addresses, vec!["test@example.com", "test1@example.com"]);
    assert!(
        recipients
            .iter()
            .all(|r| r.status == RecipientStatus::NotSent)
    );

    // Expired records are never flushed
    assert_eq!(h.queue.flush(now).await.expect("flush").total(), 0);
}

#[tokio::test]
async fn test_unsubscribe() {
    let h = harness();
    let now = Utc::now();

    assert!(
        h.queue
            .unsubscribe("User", "Administrator", "test@example.com")
            .await
            .expect("unsubscribe")
    );
    assert!(
        h.queue
            .is_unsubscribed(
                Some(&Reference::new("User", "Administrator")),
                "test@example.com"
            )
            .await
            .expect("lookup")
    );

    let before = statuses(&h, QueueStatus::NotSent).await;

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    assert_eq!(statuses(&h, QueueStatus::NotSent).await, before + 1);
    let addresses: Vec<_> = h
        .queue
        .recipients(&id)
        .await
        .expect("recipients")
        .into_iter()
        .map(|r| r.recipient)
        .collect();
    assert_eq!(addresses, vec!["test1@example.com".to_string()]);

    h.queue.flush(now).await.expect("flush");
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("Unsubscribe"));
}

#[tokio::test]
async fn test_everyone_unsubscribed_is_a_no_op() {
    let h = harness();
    let now = Utc::now();

    h.queue
        .unsubscribe_globally("test@example.com")
        .await
        .expect("unsubscribe");
    h.queue
        .unsubscribe("User", "Administrator", "test1@example.com")
        .await
        .expect("unsubscribe");

    let id = h.queue.send(queued_mail(), now).await.expect("send");
    assert_eq!(id, None);
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn test_email_queue_limit() {
    let h = harness();
    let now = Utc::now();

    let request = SendRequest::new(
        "admin@example.com",
        "Testing Email Queue",
        "This email is queued!",
    )
    .recipients(std::iter::repeat_n("test@example.com", 1000))
    .reference("User", "Administrator");

    let err = h.queue.send(request, now).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::LimitExceeded {
            current: 0,
            requested: 1000,
            limit: 500
        }
    ));
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn test_limit_counts_earlier_sends() {
    let h = harness_with(QueueConfig {
        limit: LimitConfig {
            max_per_period: Some(3),
            ..LimitConfig::default()
        },
        ..config()
    });
    let now = Utc::now();

    h.queue.send(queued_mail(), now).await.expect("first send");
    assert_eq!(h.queue.period_count(now).await.expect("count"), 2);

    let err = h.queue.send(queued_mail(), now).await.unwrap_err();
    assert!(matches!(err, QueueError::LimitExceeded { current: 2, .. }));
    assert_eq!(h.store.record_count(), 1);
}

#[tokio::test]
async fn test_duplicate_recipients_collapse() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(
            SendRequest::new("admin@example.com", "Dupes", "Hello")
                .recipients(["test@example.com", "Test <TEST@example.com>"])
                .cc(["test@example.com", "test1@example.com"]),
            now,
        )
        .await
        .expect("send")
        .expect("record");

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    assert_eq!(recipients.len(), 2);
    assert!(!recipients[0].is_cc);
    assert!(recipients[1].is_cc);
}

#[tokio::test]
async fn test_invalid_address_rejected() {
    let h = harness();
    let err = h
        .queue
        .send(
            SendRequest::new("admin@example.com", "Bad", "Hello").recipients(["not-an-address"]),
            Utc::now(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::InvalidAddress(_)));
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn test_temporary_failure_retries_then_gives_up() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    h.transport.fail_all(SimulatedFailure::Temporary);

    let report = h.queue.flush(now).await.expect("flush");
    assert_eq!(report.retrying, 1);

    let record = h.queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::NotSent);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.next_retry_at, Some(now + Duration::seconds(60)));
    assert!(record.error.is_some());
    assert!(
        h.queue
            .recipients(&id)
            .await
            .expect("recipients")
            .iter()
            .all(|r| r.status == RecipientStatus::Error && r.error.is_some())
    );

    // Not due again until the backoff has passed
    assert_eq!(h.queue.flush(now).await.expect("flush").total(), 0);

    let mut at = now;
    for _ in 0..2 {
        at += Duration::hours(2);
        h.queue.flush(at).await.expect("flush");
    }

    let record = h.queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::Error);
    assert_eq!(record.attempts, 3);

    // Never picked up again, even once the transport recovers
    h.transport.succeed();
    assert_eq!(
        h.queue
            .flush(at + Duration::days(1))
            .await
            .expect("flush")
            .total(),
        0
    );
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_retry_only_resends_failed_recipients() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    h.transport
        .fail_recipient("test1@example.com", SimulatedFailure::Temporary);
    assert_eq!(h.queue.flush(now).await.expect("flush").retrying, 1);
    assert_eq!(h.transport.sent().len(), 1);

    h.transport.succeed();
    let later = now + Duration::minutes(5);
    assert_eq!(h.queue.flush(later).await.expect("flush").sent, 1);

    let sent: Vec<_> = h.transport.sent().into_iter().map(|m| m.recipient).collect();
    assert_eq!(
        sent,
        vec!["test@example.com".to_string(), "test1@example.com".to_string()]
    );
    assert_eq!(
        h.queue.record(&id).await.expect("record").status,
        QueueStatus::Sent
    );
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    h.transport
        .fail_recipient("test@example.com", SimulatedFailure::Permanent);

    let report = h.queue.flush(now).await.expect("flush");
    assert_eq!(report.failed, 1);

    let record = h.queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::Error);
    assert_eq!(record.next_retry_at, None);

    let recipients = h.queue.recipients(&id).await.expect("recipients");
    assert_eq!(recipients[0].status, RecipientStatus::Error);
    assert_eq!(recipients[1].status, RecipientStatus::Sent);
}

#[tokio::test]
async fn test_claimed_record_is_skipped() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    // Another flush got there first
    assert!(
        h.store
            .compare_and_set_status(&id, QueueStatus::NotSent, QueueStatus::Sending, now)
            .await
            .expect("claim")
    );

    assert_eq!(
        h.queue.flush_one(&id, now).await.expect("flush one"),
        FlushOutcome::Skipped
    );
    assert!(h.transport.sent().is_empty());

    // A live claim is honoured until its lease runs out
    assert_eq!(h.queue.recover(now).await.expect("recover"), 0);
    assert_eq!(h.queue.flush(now).await.expect("flush").total(), 0);

    let later = now + Duration::seconds(601);
    assert_eq!(h.queue.recover(later).await.expect("recover"), 1);
    assert_eq!(h.queue.flush(later).await.expect("flush").sent, 1);
}

#[tokio::test]
async fn test_abandoned_claim_released_by_flush() {
    let h = harness();
    let now = Utc::now();

    let id = h
        .queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");
    assert!(
        h.store
            .compare_and_set_status(&id, QueueStatus::NotSent, QueueStatus::Sending, now)
            .await
            .expect("claim")
    );

    let report = h
        .queue
        .flush(now + Duration::minutes(11))
        .await
        .expect("flush");
    assert_eq!(report.sent, 1);
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn test_flush_respects_batch_size() {
    let h = harness_with(QueueConfig {
        batch_size: 2,
        ..config()
    });
    let now = Utc::now();

    for _ in 0..3 {
        h.queue.send(queued_mail(), now).await.expect("send");
    }

    assert_eq!(h.queue.flush(now).await.expect("flush").sent, 2);
    assert_eq!(h.queue.flush(now).await.expect("flush").sent, 1);
}

#[tokio::test]
async fn test_flush_one_unknown_record() {
    let h = harness();
    let id = outbox_common::QueueRecordId::generate();

    assert!(matches!(
        h.queue.flush_one(&id, Utc::now()).await,
        Err(QueueError::NotFound(_))
    ));
}

/// Memory store whose next `save` or `recipients` calls can be made to fail
#[derive(Debug)]
struct FlakyStore {
    inner: MemoryQueueStore,
    failing_saves: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryQueueStore::new(),
            failing_saves: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    fn trip(counter: &AtomicUsize) -> outbox_store::Result<()> {
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(StoreError::Internal("disk unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn insert(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
    ) -> outbox_store::Result<()> {
        self.inner.insert(record, recipients).await
    }

    async fn get(&self, id: &QueueRecordId) -> outbox_store::Result<QueueRecord> {
        self.inner.get(id).await
    }

    async fn recipients(&self, id: &QueueRecordId) -> outbox_store::Result<Vec<QueueRecipient>> {
        Self::trip(&self.failing_reads)?;
        self.inner.recipients(id).await
    }

    async fn list(&self, filter: &RecordFilter) -> outbox_store::Result<Vec<QueueRecord>> {
        self.inner.list(filter).await
    }

    async fn compare_and_set_status(
        &self,
        id: &QueueRecordId,
        expected: QueueStatus,
        next: QueueStatus,
        at: DateTime<Utc>,
    ) -> outbox_store::Result<bool> {
        self.inner
            .compare_and_set_status(id, expected, next, at)
            .await
    }

    async fn save(
        &self,
        record: &QueueRecord,
        recipients: &[QueueRecipient],
        expected: QueueStatus,
    ) -> outbox_store::Result<()> {
        Self::trip(&self.failing_saves)?;
        self.inner.save(record, recipients, expected).await
    }

    async fn delete(&self, id: &QueueRecordId) -> outbox_store::Result<()> {
        self.inner.delete(id).await
    }

    async fn count_recipients_since(&self, since: DateTime<Utc>) -> outbox_store::Result<usize> {
        self.inner.count_recipients_since(since).await
    }

    async fn add_unsubscribe(&self, entry: &UnsubscribeEntry) -> outbox_store::Result<bool> {
        self.inner.add_unsubscribe(entry).await
    }

    async fn is_unsubscribed(
        &self,
        reference: Option<&Reference>,
        email: &str,
    ) -> outbox_store::Result<bool> {
        self.inner.is_unsubscribed(reference, email).await
    }
}

fn flaky_queue() -> (EmailQueue, Arc<FlakyStore>, RecordingTransport) {
    let store = Arc::new(FlakyStore::new());
    let transport = RecordingTransport::new();
    let queue = EmailQueue::new(store.clone(), Arc::new(transport.clone()), config());
    (queue, store, transport)
}

#[tokio::test]
async fn test_failed_save_keeps_sent_recipients() {
    let (queue, store, transport) = flaky_queue();
    let now = Utc::now();

    let id = queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    store.failing_saves.store(1, Ordering::SeqCst);
    let report = queue.flush(now).await.expect("flush");
    assert_eq!(report.skipped, 1);
    assert_eq!(transport.sent().len(), 2);

    // Both recipients were reached, so the record settles as Sent
    let record = queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::Sent);
    assert!(
        queue
            .recipients(&id)
            .await
            .expect("recipients")
            .iter()
            .all(|r| r.status == RecipientStatus::Sent)
    );

    assert_eq!(
        queue
            .flush(now + Duration::hours(1))
            .await
            .expect("flush")
            .total(),
        0
    );
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn test_failed_save_after_partial_send_retries_the_rest() {
    let (queue, store, transport) = flaky_queue();
    let now = Utc::now();

    let id = queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    transport.fail_recipient("test@example.com", SimulatedFailure::Temporary);
    store.failing_saves.store(1, Ordering::SeqCst);
    assert_eq!(queue.flush(now).await.expect("flush").skipped, 1);

    let record = queue.record(&id).await.expect("record");
    assert_eq!(record.status, QueueStatus::NotSent);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.error.as_deref(), Some("Internal error: disk unavailable"));

    transport.succeed();
    let report = queue
        .flush(now + Duration::hours(2))
        .await
        .expect("flush");
    assert_eq!(report.sent, 1);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].recipient, "test1@example.com");
    assert_eq!(sent[1].recipient, "test@example.com");
}

#[tokio::test]
async fn test_failed_recipient_read_releases_claim() {
    let (queue, store, transport) = flaky_queue();
    let now = Utc::now();

    let id = queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    store.failing_reads.store(1, Ordering::SeqCst);
    assert_eq!(queue.flush(now).await.expect("flush").skipped, 1);
    assert!(transport.sent().is_empty());
    assert_eq!(
        queue.record(&id).await.expect("record").status,
        QueueStatus::NotSent
    );

    assert_eq!(queue.flush(now).await.expect("flush").sent, 1);
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test]
async fn test_record_never_left_sending_when_saves_keep_failing() {
    let (queue, store, transport) = flaky_queue();
    let now = Utc::now();

    let id = queue
        .send(queued_mail(), now)
        .await
        .expect("send")
        .expect("record");

    // The outcome and the release both fail to save; the status reset wins
    store.failing_saves.store(2, Ordering::SeqCst);
    assert_eq!(queue.flush(now).await.expect("flush").skipped, 1);
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(
        queue.record(&id).await.expect("record").status,
        QueueStatus::NotSent
    );

    assert_eq!(queue.flush(now).await.expect("flush").sent, 1);
    assert_eq!(
        queue.record(&id).await.expect("record").status,
        QueueStatus::Sent
    );
}
