pub mod cli;
pub mod controller;
pub mod scheduler;

pub use controller::{Outbox, TransportConfig};
pub use scheduler::Scheduler;
