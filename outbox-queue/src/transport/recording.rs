use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MailTransport, OutgoingMail};
use crate::error::TransportError;

/// Failure a [`RecordingTransport`] reports instead of accepting mail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFailure {
    Temporary,
    Permanent,
}

impl SimulatedFailure {
    fn error(self, recipient: &str) -> TransportError {
        match self {
            Self::Temporary => {
                TransportError::Temporary(format!("451 Try again later: {recipient}"))
            }
            Self::Permanent => TransportError::Permanent(format!("550 No such user: {recipient}")),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    sent: Vec<OutgoingMail>,
    attempts: usize,
    fail_all: Option<SimulatedFailure>,
    fail_recipients: AHashMap<String, SimulatedFailure>,
}

/// Transport that keeps every accepted message in memory
///
/// Used by tests and by the binary's dry-run mode. Failures can be switched
/// on for every recipient or for specific ones.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<State>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every transmission until [`Self::succeed`] is called
    pub fn fail_all(&self, failure: SimulatedFailure) {
        self.state.lock().fail_all = Some(failure);
    }

    /// Fail transmissions to `recipient` only
    pub fn fail_recipient(&self, recipient: &str, failure: SimulatedFailure) {
        self.state
            .lock()
            .fail_recipients
            .insert(recipient.to_lowercase(), failure);
    }

    /// Stop simulating failures
    pub fn succeed(&self) {
        let mut state = self.state.lock();
        state.fail_all = None;
        state.fail_recipients.clear();
    }

    /// Every accepted message, in order
    #[must_use]
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.state.lock().sent.clone()
    }

    /// The most recently accepted message
    #[must_use]
    pub fn last(&self) -> Option<OutgoingMail> {
        self.state.lock().sent.last().cloned()
    }

    /// Transmissions tried, accepted or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.attempts = 0;
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn transmit(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.attempts += 1;

        let failure = state.fail_all.or_else(|| {
            state
                .fail_recipients
                .get(&mail.recipient.to_lowercase())
                .copied()
        });

        if let Some(failure) = failure {
            return Err(failure.error(&mail.recipient));
        }

        state.sent.push(mail.clone());
        Ok(())
    }
}
