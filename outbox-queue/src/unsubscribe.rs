use std::sync::Arc;

use outbox_common::{Reference, UnsubscribeEntry, internal};
use outbox_store::QueueStore;
use tracing::info;

use crate::{config::QueueConfig, error::QueueError, signing};

/// Parameters carried by a verified unsubscribe link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeLink {
    pub email: String,
    /// `None` for a link that opts out of all mail
    pub reference: Option<Reference>,
}

/// Durable opt-outs, consulted before anything is queued
#[derive(Debug, Clone)]
pub struct UnsubscribeRegistry {
    store: Arc<dyn QueueStore>,
    config: Arc<QueueConfig>,
}

impl UnsubscribeRegistry {
    pub fn new(store: Arc<dyn QueueStore>, config: Arc<QueueConfig>) -> Self {
        Self { store, config }
    }

    /// Stop mail about `doctype`/`name` reaching `email`
    ///
    /// Returns `true` if the entry is new.
    ///
    /// # Errors
    /// If the store cannot be written
    pub async fn unsubscribe(&self, doctype: &str, name: &str, email: &str) -> crate::Result<bool> {
        self.add(UnsubscribeEntry::new(
            Some(Reference::new(doctype, name)),
            email,
        ))
        .await
    }

    /// Stop all mail reaching `email`
    ///
    /// # Errors
    /// If the store cannot be written
    pub async fn unsubscribe_globally(&self, email: &str) -> crate::Result<bool> {
        self.add(UnsubscribeEntry::new(None, email)).await
    }

    async fn add(&self, entry: UnsubscribeEntry) -> crate::Result<bool> {
        let created = self.store.add_unsubscribe(&entry).await?;

        if created {
            info!(
                email = %entry.email,
                reference = ?entry.reference.as_ref().map(ToString::to_string),
                "Registered unsubscribe"
            );
        } else {
            internal!(level = DEBUG, "{} was already unsubscribed", entry.email);
        }

        Ok(created)
    }

    /// # Errors
    /// If the store cannot be read
    pub async fn is_unsubscribed(
        &self,
        reference: Option<&Reference>,
        email: &str,
    ) -> crate::Result<bool> {
        Ok(self.store.is_unsubscribed(reference, email).await?)
    }

    /// Signed link that unsubscribes `email` from `reference`
    ///
    /// # Errors
    /// If the query cannot be signed
    pub fn link(&self, email: &str, reference: Option<&Reference>) -> crate::Result<String> {
        let query = match reference {
            Some(reference) => signing::signed_query(
                &self.config.signing_secret,
                &[
                    ("email", email),
                    ("doctype", reference.doctype.as_str()),
                    ("name", reference.name.as_str()),
                ],
            )?,
            None => signing::signed_query(&self.config.signing_secret, &[("email", email)])?,
        };

        Ok(format!("{}?{query}", self.config.unsubscribe_endpoint()))
    }

    /// Verify a link's query string and decode what it asks for
    ///
    /// # Errors
    /// [`QueueError::InvalidSignature`] for a bad signature or a link
    /// without an email
    pub fn verify(&self, query: &str) -> crate::Result<UnsubscribeLink> {
        let params = signing::verify_query(&self.config.signing_secret, query)?;
        let param = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, value)| value.clone())
        };

        let email = param("email").ok_or(QueueError::InvalidSignature)?;
        let reference = match (param("doctype"), param("name")) {
            (Some(doctype), Some(name)) => Some(Reference::new(doctype, name)),
            _ => None,
        };

        Ok(UnsubscribeLink { email, reference })
    }

    /// Handle a click on an unsubscribe link
    ///
    /// Accepts either the full URL or just its query string.
    ///
    /// # Errors
    /// [`QueueError::InvalidSignature`] if the link was not issued by us, or
    /// a store error
    pub async fn unsubscribe_from_link(&self, link: &str) -> crate::Result<UnsubscribeLink> {
        let query = link.split_once('?').map_or(link, |(_, query)| query);
        let verified = self.verify(query)?;

        match &verified.reference {
            Some(reference) => {
                self.unsubscribe(&reference.doctype, &reference.name, &verified.email)
                    .await?;
            }
            None => {
                self.unsubscribe_globally(&verified.email).await?;
            }
        }

        Ok(verified)
    }
}
