use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

use crate::error::QueueError;

/// Longest retention or purge period accepted, about a century
pub const MAX_DAYS: i64 = 36_500;

fn default_site_url() -> String {
    "http://localhost".to_string()
}

fn default_unsubscribe_path() -> String {
    "/unsubscribe".to_string()
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_batch_size() -> usize {
    500
}

const fn default_retention_days() -> i64 {
    7
}

const fn default_purge_after_days() -> i64 {
    31
}

const fn default_claim_lease() -> u64 {
    600 // 10 minutes
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_per_period() -> Option<usize> {
    Some(500)
}

const fn default_base_retry_delay() -> u64 {
    60 // 1 minute
}

const fn default_max_retry_delay() -> u64 {
    3600 // 1 hour
}

const fn default_retry_jitter_factor() -> f64 {
    0.2 // ±20%
}

/// Behaviour of the queue
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    /// Base of generated unsubscribe links, without a trailing slash
    #[serde(default = "default_site_url")]
    pub site_url: String,

    #[serde(default = "default_unsubscribe_path")]
    pub unsubscribe_path: String,

    /// Key for unsubscribe link signatures, required
    #[serde(default)]
    pub signing_secret: String,

    /// Transmission attempts before a record is marked Error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Records handled per flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Days a record may stay Not Sent before it expires
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Days after which records of any status are deleted
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: i64,

    /// Seconds a Sending claim is honoured before the record is released
    /// back to Not Sent
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,

    #[serde(default)]
    pub limit: LimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            site_url: default_site_url(),
            unsubscribe_path: default_unsubscribe_path(),
            signing_secret: String::new(),
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            purge_after_days: default_purge_after_days(),
            claim_lease_secs: default_claim_lease(),
            limit: LimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Absolute URL unsubscribe links point at
    #[must_use]
    pub fn unsubscribe_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.site_url.trim_end_matches('/'),
            self.unsubscribe_path
        )
    }

    /// Reject settings the queue cannot run with
    ///
    /// # Errors
    /// [`QueueError::InvalidConfig`] when the signing secret is empty, or a
    /// retention, purge or lease period is out of range
    pub fn validate(&self) -> crate::Result<()> {
        if self.signing_secret.trim().is_empty() {
            return Err(QueueError::InvalidConfig(
                "signing_secret must be set".to_string(),
            ));
        }

        for (name, days) in [
            ("retention_days", self.retention_days),
            ("purge_after_days", self.purge_after_days),
        ] {
            if !(1..=MAX_DAYS).contains(&days) {
                return Err(QueueError::InvalidConfig(format!(
                    "{name} must be between 1 and {MAX_DAYS}, got {days}"
                )));
            }
        }

        if self.claim_lease_secs == 0 {
            return Err(QueueError::InvalidConfig(
                "claim_lease_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Not Sent records last touched before this expire
    #[must_use]
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        days_before(now, self.retention_days)
    }

    /// Records last touched before this are purged
    #[must_use]
    pub fn purge_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        days_before(now, self.purge_after_days)
    }

    /// Sending claims taken before this are considered abandoned
    #[must_use]
    pub fn claim_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        i64::try_from(self.claim_lease_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lease| now.checked_sub_signed(lease))
    }
}

/// `None` for a non-positive count or one that leaves the calendar
fn days_before(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    if days <= 0 {
        return None;
    }
    Duration::try_days(days).and_then(|period| now.checked_sub_signed(period))
}

/// Sending ceiling per calendar period
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LimitConfig {
    /// `None` disables the limit
    #[serde(default = "default_max_per_period")]
    pub max_per_period: Option<usize>,

    #[serde(default)]
    pub period: LimitPeriod,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_per_period: default_max_per_period(),
            period: LimitPeriod::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LimitPeriod {
    Day,
    #[default]
    Month,
}

impl LimitPeriod {
    /// Start of the UTC calendar window containing `now`
    #[must_use]
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = match self {
            Self::Day => now.date_naive(),
            Self::Month => NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .unwrap_or_else(|| now.date_naive()),
        };
        date.and_time(NaiveTime::MIN).and_utc()
    }
}

/// Exponential backoff between transmission attempts
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// First retry delay; doubled for each further attempt
    #[serde(default = "default_base_retry_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_retry_delay")]
    pub max_delay_secs: u64,

    /// 0.2 means ±20%
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_retry_delay(),
            max_delay_secs: default_max_retry_delay(),
            jitter_factor: default_retry_jitter_factor(),
        }
    }
}
