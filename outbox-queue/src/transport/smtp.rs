use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use outbox_common::outgoing;
use serde::Deserialize;

use super::{MailTransport, OutgoingMail};
use crate::error::TransportError;

const fn default_port() -> u16 {
    25
}

const fn default_timeout_secs() -> u64 {
    30
}

/// How the connection to the relay is secured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SmtpTls {
    /// Plain text, for a local relay
    #[default]
    Plain,
    /// Upgrade with STARTTLS, failing if the server does not offer it
    StartTls,
    /// Implicit TLS from the first byte (usually port 465)
    Wrapper,
}

/// Relay the queue hands mail to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: SmtpTls,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Per-command timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            tls: SmtpTls::default(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// [`MailTransport`] over a pooled lettre SMTP connection
#[derive(Clone)]
pub struct SmtpTransport {
    host: String,
    port: u16,
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Build a transport from configuration; no connection is made yet
    ///
    /// # Errors
    /// If the TLS parameters for `host` cannot be built
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let tls = match config.tls {
            SmtpTls::Plain => Tls::None,
            SmtpTls::StartTls => Tls::Required(TlsParameters::new(config.host.clone())?),
            SmtpTls::Wrapper => Tls::Wrapper(TlsParameters::new(config.host.clone())?),
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(tls)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            inner: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn transmit(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let response = self.inner.send_raw(&mail.envelope, &mail.formatted).await?;

        outgoing!(
            level = DEBUG,
            "{}:{} accepted {} for {}: {}",
            self.host,
            self.port,
            mail.record_id,
            mail.recipient,
            response.code()
        );

        Ok(())
    }
}
