use std::time::Duration;

use chrono::Utc;
use outbox_common::{Signal, internal};
use outbox_queue::EmailQueue;
use serde::Deserialize;
use tracing::{debug, error, info};

const fn default_flush_interval() -> u64 {
    60
}

const fn default_expire_interval() -> u64 {
    3600
}

/// Periodic triggers for flushing and clearing the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Scheduler {
    /// How often due records are flushed (in seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// How often stale records are expired and purged (in seconds)
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            expire_interval_secs: default_expire_interval(),
        }
    }
}

impl Scheduler {
    /// Tick the flusher and expirer until told to stop
    ///
    /// A failed run is logged and the next tick tries again. A run already in
    /// progress finishes before shutdown is acknowledged.
    ///
    /// # Errors
    /// Currently never; the signature matches the other controllers
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        queue: &EmailQueue,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        internal!(
            "Scheduler starting: flush every {}s, expire every {}s",
            self.flush_interval_secs,
            self.expire_interval_secs
        );

        let mut flush_timer =
            tokio::time::interval(Duration::from_secs(self.flush_interval_secs.max(1)));
        let mut expire_timer =
            tokio::time::interval(Duration::from_secs(self.expire_interval_secs.max(1)));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        expire_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    match queue.flush(Utc::now()).await {
                        Ok(report) if report.total() > 0 => {
                            debug!(?report, "Flushed email queue");
                        }
                        Ok(_) => {}
                        Err(e) => error!("Error flushing email queue: {e}"),
                    }
                }
                _ = expire_timer.tick() => {
                    match queue.clear_outbox(Utc::now()).await {
                        Ok(report) => {
                            if report.expired + report.purged > 0 {
                                info!(
                                    expired = report.expired,
                                    purged = report.purged,
                                    "Cleared outbox"
                                );
                            }
                        }
                        Err(e) => error!("Error clearing outbox: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Received Shutdown signal, shutting down");
                        }
                        Err(e) => error!("Scheduler shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use outbox_queue::{RecordingTransport, SendRequest};
    use outbox_store::TestQueueStore;

    use super::*;

    #[tokio::test]
    async fn test_serve_flushes_until_shutdown() {
        let store = TestQueueStore::new();
        let transport = RecordingTransport::new();
        let queue = EmailQueue::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            outbox_queue::QueueConfig::default(),
        );

        queue
            .send(
                SendRequest::new("admin@example.com", "Scheduled", "Hello")
                    .recipients(["test@example.com"]),
                Utc::now(),
            )
            .await
            .unwrap();

        let (sender, receiver) = tokio::sync::broadcast::channel(4);
        let scheduler = Scheduler {
            flush_interval_secs: 1,
            expire_interval_secs: 3600,
        };

        let serve = scheduler.serve(&queue, receiver);
        let stop = async {
            // The first tick fires immediately
            for _ in 0..50 {
                if !transport.sent().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            sender.send(Signal::Shutdown).unwrap();
        };

        let (served, ()) = tokio::join!(serve, stop);
        assert!(served.is_ok());
        assert_eq!(transport.sent().len(), 1);
    }
}
