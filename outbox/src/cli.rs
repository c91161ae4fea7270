//! Command-line interface to the queue
//!
//! Every command except `serve` works on the configured store once and
//! exits, so it can be driven from cron or by hand.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use outbox_common::{QueueRecordId, QueueStatus, logging};
use outbox_queue::{EmailQueue, SendRequest};
use outbox_store::RecordFilter;

use crate::controller::Outbox;

/// An outbound email queue
#[derive(Parser, Debug)]
#[command(name = "outbox")]
#[command(about = "Queue, send and expire outbound email", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file, overriding `OUTBOX_CONFIG` and the default paths
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Flush and expire on a schedule until interrupted
    Serve,
    /// Queue a message
    Send {
        /// Envelope sender
        #[arg(long)]
        from: String,

        #[arg(long)]
        subject: String,

        /// HTML body
        #[arg(long)]
        message: String,

        /// Recipient, may be repeated
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        /// CC recipient, may be repeated
        #[arg(long)]
        cc: Vec<String>,

        /// Document type the mail is about, scoping unsubscribes
        #[arg(long, requires = "name")]
        doctype: Option<String>,

        /// Document name the mail is about
        #[arg(long, requires = "doctype")]
        name: Option<String>,

        /// Footer text shown beside the unsubscribe link
        #[arg(long)]
        unsubscribe_message: Option<String>,

        #[arg(long)]
        reply_to: Option<String>,

        /// Earliest send time (RFC 3339)
        #[arg(long)]
        send_after: Option<DateTime<Utc>>,

        /// List every recipient in the headers and body
        #[arg(long)]
        expose_recipients: bool,

        /// Transmit before returning
        #[arg(long)]
        now: bool,
    },
    /// Send every due record
    Flush,
    /// Expire stale records and purge old ones
    Expire,
    /// Stop sending mail to an address
    Unsubscribe {
        email: String,

        /// Only for mail about this document type
        #[arg(long, requires = "name")]
        doctype: Option<String>,

        /// Only for mail about this document
        #[arg(long, requires = "doctype")]
        name: Option<String>,
    },
    /// Check a signed unsubscribe link and apply it
    VerifyUnsubscribe {
        /// The full link or just its query string
        link: String,
    },
    /// Show queue totals and the current period's count
    Status,
    /// List queue records
    List {
        /// Only records with this status
        #[arg(long)]
        status: Option<QueueStatus>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one record and its recipients
    View { id: QueueRecordId },
}

const STATUSES: [QueueStatus; 5] = [
    QueueStatus::NotSent,
    QueueStatus::Sending,
    QueueStatus::Sent,
    QueueStatus::Expired,
    QueueStatus::Error,
];

impl Cli {
    /// Run the parsed command against `outbox`
    ///
    /// # Errors
    /// If the queue cannot be built or the command fails
    pub async fn execute(self, outbox: Outbox) -> anyhow::Result<()> {
        match self.command {
            Command::Serve => outbox.run().await,
            command => {
                logging::init();
                let queue = outbox.queue()?;
                run_command(command, &queue, Utc::now()).await
            }
        }
    }
}

async fn run_command(
    command: Command,
    queue: &EmailQueue,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    match command {
        Command::Serve => anyhow::bail!("serve runs until interrupted, use Cli::execute"),
        Command::Send {
            from,
            subject,
            message,
            to,
            cc,
            doctype,
            name,
            unsubscribe_message,
            reply_to,
            send_after,
            expose_recipients,
            now: send_now,
        } => {
            let mut request = SendRequest::new(from, subject, message)
                .recipients(to)
                .cc(cc)
                .expose_recipients(expose_recipients)
                .send_now(send_now);
            if let (Some(doctype), Some(name)) = (doctype, name) {
                request = request.reference(doctype, name);
            }
            if let Some(text) = unsubscribe_message {
                request = request.unsubscribe_message(text);
            }
            if let Some(address) = reply_to {
                request = request.reply_to(address);
            }
            if let Some(at) = send_after {
                request = request.send_after(at);
            }

            match queue.send(request, now).await? {
                Some(id) => {
                    let status = queue.record(&id).await?.status;
                    println!("{id} {status}");
                }
                None => println!("Nothing queued: every recipient has unsubscribed"),
            }
        }
        Command::Flush => {
            let report = queue.flush(now).await?;
            println!(
                "Sent: {}, Failed: {}, Retrying: {}, Skipped: {}",
                report.sent, report.failed, report.retrying, report.skipped
            );
        }
        Command::Expire => {
            let report = queue.clear_outbox(now).await?;
            println!("Expired: {}, Purged: {}", report.expired, report.purged);
        }
        Command::Unsubscribe {
            email,
            doctype,
            name,
        } => {
            let added = match (doctype, name) {
                (Some(doctype), Some(name)) => queue.unsubscribe(&doctype, &name, &email).await?,
                _ => queue.unsubscribe_globally(&email).await?,
            };
            if added {
                println!("Unsubscribed {email}");
            } else {
                println!("{email} was already unsubscribed");
            }
        }
        Command::VerifyUnsubscribe { link } => {
            let verified = queue
                .unsubscribe_from_link(&link)
                .await
                .context("Unsubscribe link rejected")?;
            match verified.reference {
                Some(reference) => println!("Unsubscribed {} from {reference}", verified.email),
                None => println!("Unsubscribed {} from all mail", verified.email),
            }
        }
        Command::Status => {
            for status in STATUSES {
                let count = queue.list(&RecordFilter::new().status(status)).await?.len();
                println!("{:<10} {count}", status.as_str());
            }

            let current = queue.period_count(now).await?;
            let limit = &queue.config().limit;
            match limit.max_per_period {
                Some(max) => println!("\nThis {:?}: {current} of {max}", limit.period),
                None => println!("\nThis {:?}: {current} (no limit)", limit.period),
            }
        }
        Command::List { status, limit } => {
            let mut filter = RecordFilter::new().limit(limit);
            if let Some(status) = status {
                filter = filter.status(status);
            }
            let records = queue.list(&filter).await?;

            println!("{:<28} {:<10} {:<20} SUBJECT", "RECORD ID", "STATUS", "MODIFIED");
            println!("{}", "-".repeat(80));
            for record in &records {
                println!(
                    "{:<28} {:<10} {:<20} {}",
                    record.id.to_string(),
                    record.status.as_str(),
                    record.modified_at.format("%Y-%m-%d %H:%M:%S"),
                    record.subject
                );
            }
            println!("\nTotal: {} record(s)", records.len());
        }
        Command::View { id } => {
            let record = queue.record(&id).await?;
            let recipients = queue.recipients(&id).await?;

            println!("Record ID: {}", record.id);
            println!("Status: {}", record.status);
            println!("From: {}", record.sender);
            println!("Subject: {}", record.subject);
            if let Some(reference) = &record.reference {
                println!("Reference: {reference}");
            }
            if let Some(at) = record.send_after {
                println!("Send after: {at}");
            }
            println!("Attempts: {}", record.attempts);
            if let Some(at) = record.next_retry_at {
                println!("Next retry: {at}");
            }
            if let Some(error) = &record.error {
                println!("Error: {error}");
            }
            println!("\nRecipients:");
            for recipient in recipients {
                let kind = if recipient.is_cc { "cc" } else { "to" };
                println!("  {kind} {} ({})", recipient.recipient, recipient.status);
            }
        }
    }

    Ok(())
}
