pub mod config;
pub mod error;
pub mod expirer;
pub mod flusher;
pub mod limit;
pub mod queue;
pub mod render;
pub mod retry;
pub mod signing;
pub mod transport;
pub mod unsubscribe;
pub mod writer;

pub use config::{LimitConfig, LimitPeriod, QueueConfig, RetryConfig};
pub use error::{QueueError, Result, TransportError};
pub use expirer::{ClearReport, Expirer};
pub use flusher::{FlushOutcome, FlushReport, Flusher};
pub use limit::LimitGuard;
pub use queue::EmailQueue;
pub use transport::{
    MailTransport, OutgoingMail,
    recording::{RecordingTransport, SimulatedFailure},
    smtp::{SmtpConfig, SmtpTls, SmtpTransport},
};
pub use unsubscribe::{UnsubscribeLink, UnsubscribeRegistry};
pub use writer::{QueueWriter, SendRequest};
