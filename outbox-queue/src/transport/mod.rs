pub mod recording;
pub mod smtp;

use async_trait::async_trait;
use lettre::{
    Message,
    address::Envelope,
    message::{Mailbox, header::ContentType},
};
use outbox_common::{QueueRecord, QueueRecordId};

use crate::error::TransportError;

/// Hands a fully built message to a mail server
#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Deliver one message
    ///
    /// # Errors
    /// A [`TransportError`] saying whether a later attempt may succeed
    async fn transmit(&self, mail: &OutgoingMail) -> Result<(), TransportError>;
}

/// One message for one recipient, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub record_id: QueueRecordId,
    /// The envelope recipient this copy is for
    pub recipient: String,
    pub envelope: Envelope,
    /// The personalised body
    pub body: String,
    /// Headers and body as sent over SMTP
    pub formatted: Vec<u8>,
}

impl OutgoingMail {
    /// Build the copy of `record` addressed to `recipient`
    ///
    /// When the record exposes its recipients, the `To`/`Cc` headers list
    /// everyone; otherwise the header shows `recipient` alone. The envelope
    /// always targets `recipient` only.
    ///
    /// # Errors
    /// [`TransportError::Message`] if an address or header is invalid
    pub fn build(
        record: &QueueRecord,
        recipient: &str,
        to: &[String],
        cc: &[String],
        body: String,
    ) -> Result<Self, TransportError> {
        let from: Mailbox = record.sender.parse()?;
        let rcpt: Mailbox = recipient.parse()?;

        let mut builder = Message::builder()
            .from(from.clone())
            .subject(record.subject.clone())
            .header(ContentType::TEXT_HTML);

        if record.expose_recipients {
            for address in to {
                builder = builder.to(address.parse()?);
            }
            for address in cc {
                builder = builder.cc(address.parse()?);
            }
        } else {
            builder = builder.to(rcpt.clone());
        }

        if let Some(reply_to) = &record.reply_to {
            builder = builder.reply_to(reply_to.parse()?);
        }

        let message = builder.body(body.clone())?;
        let envelope = Envelope::new(Some(from.email), vec![rcpt.email])?;

        Ok(Self {
            record_id: record.id.clone(),
            recipient: recipient.to_string(),
            envelope,
            body,
            formatted: message.formatted(),
        })
    }
}
