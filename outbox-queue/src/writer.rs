use std::sync::Arc;

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use mailparse::{MailAddr, addrparse};
use outbox_common::{
    QueueRecipient, QueueRecord, QueueRecordId, QueueStatus, Reference, internal,
};
use outbox_store::QueueStore;
use tracing::{debug, info};

use crate::{
    error::QueueError, limit::LimitGuard, render, unsubscribe::UnsubscribeRegistry,
};

/// A request to queue one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub sender: String,
    pub subject: String,
    pub message: String,
    /// The entity this mail is about, which scopes unsubscribes
    pub reference: Option<Reference>,
    pub send_after: Option<DateTime<Utc>>,
    /// List every To and CC address in the body and headers
    pub expose_recipients: bool,
    /// Footer text placed beside the unsubscribe link
    pub unsubscribe_message: Option<String>,
    pub reply_to: Option<String>,
    /// Transmit before returning instead of waiting for the next flush
    pub send_now: bool,
}

impl SendRequest {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients.extend(recipients.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cc<I, S>(mut self, cc: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cc.extend(cc.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn reference(mut self, doctype: impl Into<String>, name: impl Into<String>) -> Self {
        self.reference = Some(Reference::new(doctype, name));
        self
    }

    #[must_use]
    pub const fn send_after(mut self, at: DateTime<Utc>) -> Self {
        self.send_after = Some(at);
        self
    }

    #[must_use]
    pub const fn expose_recipients(mut self, expose: bool) -> Self {
        self.expose_recipients = expose;
        self
    }

    #[must_use]
    pub fn unsubscribe_message(mut self, text: impl Into<String>) -> Self {
        self.unsubscribe_message = Some(text.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub const fn send_now(mut self, now: bool) -> Self {
        self.send_now = now;
        self
    }

    /// Recipients and CCs as supplied, duplicates included
    #[must_use]
    pub fn requested_count(&self) -> usize {
        self.recipients.len() + self.cc.len()
    }
}

/// Parse a single address such as `Name <a@example.com>` down to its
/// address part
///
/// # Errors
/// [`QueueError::InvalidAddress`] unless the input holds exactly one address
pub fn normalise_address(input: &str) -> crate::Result<String> {
    let invalid = || QueueError::InvalidAddress(input.to_string());

    let parsed = addrparse(input).map_err(|_| invalid())?;
    let mut addresses = parsed.iter().flat_map(|addr| match addr {
        MailAddr::Single(info) => vec![info.addr.trim().to_string()],
        MailAddr::Group(group) => group
            .addrs
            .iter()
            .map(|info| info.addr.trim().to_string())
            .collect(),
    });

    match (addresses.next(), addresses.next()) {
        (Some(address), None) if is_plausible(&address) => Ok(address),
        _ => Err(invalid()),
    }
}

fn is_plausible(address: &str) -> bool {
    address
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
        && !address.contains(char::is_whitespace)
}

/// Normalise `to` and `cc` and drop repeats, comparing case-insensitively
///
/// An address listed in both keeps its place in `to`.
fn dedupe(to: &[String], cc: &[String]) -> crate::Result<(Vec<String>, Vec<String>)> {
    let mut seen = AHashSet::new();
    let mut keep = |list: &[String]| -> crate::Result<Vec<String>> {
        let mut kept = Vec::with_capacity(list.len());
        for raw in list {
            let address = normalise_address(raw)?;
            if seen.insert(address.to_lowercase()) {
                kept.push(address);
            }
        }
        Ok(kept)
    };

    let to = keep(to)?;
    let cc = keep(cc)?;
    Ok((to, cc))
}

/// Turns send requests into stored queue records
#[derive(Debug, Clone)]
pub struct QueueWriter {
    store: Arc<dyn QueueStore>,
    limit: LimitGuard,
    registry: UnsubscribeRegistry,
}

impl QueueWriter {
    pub fn new(
        store: Arc<dyn QueueStore>,
        limit: LimitGuard,
        registry: UnsubscribeRegistry,
    ) -> Self {
        Self {
            store,
            limit,
            registry,
        }
    }

    async fn without_unsubscribed(
        &self,
        reference: Option<&Reference>,
        addresses: Vec<String>,
    ) -> crate::Result<Vec<String>> {
        let mut kept = Vec::with_capacity(addresses.len());
        for address in addresses {
            if self.registry.is_unsubscribed(reference, &address).await? {
                debug!(%address, "Dropping unsubscribed recipient");
            } else {
                kept.push(address);
            }
        }
        Ok(kept)
    }

    /// Queue `request`, returning the new record's id
    ///
    /// Returns `Ok(None)` without writing anything when every recipient has
    /// unsubscribed. `send_now` is not acted on here.
    ///
    /// # Errors
    /// - [`QueueError::LimitExceeded`] before anything is written
    /// - [`QueueError::InvalidAddress`] for a malformed sender or recipient
    /// - Store errors
    #[tracing::instrument(level = "debug", skip_all, fields(subject = %request.subject))]
    pub async fn enqueue(
        &self,
        request: &SendRequest,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<QueueRecordId>> {
        self.limit.check_limit(request.requested_count(), now).await?;

        normalise_address(&request.sender)?;
        if let Some(reply_to) = &request.reply_to {
            normalise_address(reply_to)?;
        }

        let (to, cc) = dedupe(&request.recipients, &request.cc)?;
        let reference = request.reference.as_ref();
        let to = self.without_unsubscribed(reference, to).await?;
        let cc = self.without_unsubscribed(reference, cc).await?;

        if to.is_empty() && cc.is_empty() {
            internal!(
                level = DEBUG,
                "Nothing queued for '{}': no recipients left",
                request.subject
            );
            return Ok(None);
        }

        let id = QueueRecordId::generate();
        let record = QueueRecord {
            id: id.clone(),
            sender: request.sender.clone(),
            subject: request.subject.clone(),
            message: render::render_body(
                &request.message,
                &to,
                &cc,
                request.expose_recipients,
                request.unsubscribe_message.as_deref(),
            ),
            reply_to: request.reply_to.clone(),
            status: QueueStatus::NotSent,
            reference: request.reference.clone(),
            send_after: request.send_after,
            expose_recipients: request.expose_recipients,
            attempts: 0,
            next_retry_at: None,
            error: None,
            created_at: now,
            modified_at: now,
        };

        let recipients: Vec<_> = to
            .into_iter()
            .map(|address| QueueRecipient::new(id.clone(), address, false))
            .chain(
                cc.into_iter()
                    .map(|address| QueueRecipient::new(id.clone(), address, true)),
            )
            .collect();

        self.store.insert(&record, &recipients).await?;

        info!(
            record_id = %id,
            recipients = recipients.len(),
            send_after = ?record.send_after,
            "Queued email"
        );

        Ok(Some(id))
    }
}
