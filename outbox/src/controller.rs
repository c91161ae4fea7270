use std::sync::{Arc, LazyLock};

use chrono::Utc;
use outbox_common::{Signal, internal, logging};
use outbox_queue::{
    EmailQueue, MailTransport, QueueConfig, RecordingTransport, SmtpConfig, SmtpTransport,
};
use outbox_store::StoreConfig;
use ron::extensions::Extensions;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::scheduler::Scheduler;

/// Where flushed mail goes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum TransportConfig {
    /// Hand mail to an SMTP relay
    Smtp(SmtpConfig),
    /// Keep mail in memory and log it, for dry runs
    Recording,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Smtp(SmtpConfig::default())
    }
}

impl TransportConfig {
    /// # Errors
    /// If the SMTP transport cannot be configured
    pub fn build(&self) -> anyhow::Result<Arc<dyn MailTransport>> {
        Ok(match self {
            Self::Smtp(config) => Arc::new(SmtpTransport::new(config)?),
            Self::Recording => Arc::new(RecordingTransport::new()),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Outbox {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(alias = "scheduler", default)]
    pub schedule: Scheduler,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Outbox {
    /// Parse a RON configuration
    ///
    /// Newtype variants may be written without their inner parentheses, so
    /// `transport: Smtp(host: "localhost")` is accepted.
    ///
    /// # Errors
    /// If the configuration is not valid RON or does not describe an outbox
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        Ok(ron::Options::default()
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES)
            .from_str(config)?)
    }

    /// Build the queue this configuration describes
    ///
    /// # Errors
    /// If the queue settings are invalid, or the store or the transport
    /// cannot be set up
    pub fn queue(&self) -> anyhow::Result<EmailQueue> {
        self.queue.validate()?;

        let store = self.store.clone().into_store()?;
        let transport = self.transport.build()?;

        Ok(EmailQueue::new(store, transport, self.queue.clone()))
    }

    /// Run the scheduler until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// If the store or transport cannot be set up, or stuck records cannot be
    /// released.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let queue = self.queue()?;

        let recovered = queue.recover(Utc::now()).await?;
        if recovered > 0 {
            internal!(level = WARN, "Released {recovered} interrupted sends");
        }

        internal!("Controller running");

        let ret = tokio::select! {
            r = self.schedule.serve(&queue, SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
