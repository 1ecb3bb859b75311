//! Reception awareness: per-message retry state for sends, deliveries and
//! notifications, persisted through the repository so a restart resumes it.

use crate::clock::to_chrono;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Exponential schedule: `min(max_interval, min_interval * factor^retries)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub fn interval_for(&self, retries: u32) -> Duration {
        backoff_interval(self.min_interval, self.max_interval, self.factor, retries)
    }
}

pub(crate) fn backoff_interval(min: Duration, max: Duration, factor: f64, exponent: u32) -> Duration {
    let max = max.max(min);
    let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let seconds = min.as_secs_f64() * factor.powi(exponent);
    if !seconds.is_finite() || seconds >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(seconds)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryType {
    Send,
    Delivery,
    Notification,
}

impl RetryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryType::Send => "send",
            RetryType::Delivery => "delivery",
            RetryType::Notification => "notification",
        }
    }
}

impl Display for RetryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "send" => Ok(RetryType::Send),
            "delivery" => Ok(RetryType::Delivery),
            "notification" => Ok(RetryType::Notification),
            other => Err(format!("unknown retry type `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityState {
    Pending,
    Sent,
    Ack,
    RetryScheduled,
    Exhausted,
}

impl ReliabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityState::Pending => "pending",
            ReliabilityState::Sent => "sent",
            ReliabilityState::Ack => "ack",
            ReliabilityState::RetryScheduled => "retry_scheduled",
            ReliabilityState::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReliabilityState::Ack | ReliabilityState::Exhausted)
    }
}

impl FromStr for ReliabilityState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ReliabilityState::Pending),
            "sent" => Ok(ReliabilityState::Sent),
            "ack" => Ok(ReliabilityState::Ack),
            "retry_scheduled" => Ok(ReliabilityState::RetryScheduled),
            "exhausted" => Ok(ReliabilityState::Exhausted),
            other => Err(format!("unknown reliability state `{other}`")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("retry record `{key}` cannot {action} while {state}")]
pub struct ReliabilityError {
    pub key: String,
    pub action: &'static str,
    pub state: &'static str,
}

/// Result of registering a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { due: DateTime<Utc>, interval: Duration },
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Ebms message id (send/delivery) or exception id (notification).
    pub subject: String,
    pub retry_type: RetryType,
    pub pmode_id: Option<String>,
    pub state: ReliabilityState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub current_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub next_due: DateTime<Utc>,
    pub last_error: Option<String>,
    pub modification_time: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(
        subject: impl Into<String>,
        retry_type: RetryType,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            retry_type,
            pmode_id: None,
            state: ReliabilityState::Pending,
            retry_count: 0,
            max_retries: policy.max_retries,
            current_interval: policy.min_interval,
            min_interval: policy.min_interval,
            max_interval: policy.max_interval.max(policy.min_interval),
            factor: policy.factor,
            next_due: now,
            last_error: None,
            modification_time: now,
        }
    }

    pub fn with_pmode(mut self, pmode_id: impl Into<String>) -> Self {
        self.pmode_id = Some(pmode_id.into());
        self
    }

    pub fn key(&self) -> String {
        record_key(self.retry_type, &self.subject)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_interval: self.min_interval,
            max_interval: self.max_interval,
            factor: self.factor,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            ReliabilityState::Sent | ReliabilityState::RetryScheduled
        ) && self.next_due <= now
    }

    /// An attempt went out; the acknowledgement is awaited for the current interval.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Result<(), ReliabilityError> {
        match self.state {
            ReliabilityState::Pending | ReliabilityState::Sent => {
                self.current_interval = self.policy().interval_for(self.retry_count);
                self.next_due = now + to_chrono(self.current_interval);
                self.state = ReliabilityState::Sent;
                self.modification_time = now;
                Ok(())
            }
            _ => Err(self.invalid("mark sent")),
        }
    }

    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> Result<(), ReliabilityError> {
        match self.state {
            ReliabilityState::Ack => Ok(()),
            ReliabilityState::Exhausted => Err(self.invalid("acknowledge")),
            _ => {
                self.state = ReliabilityState::Ack;
                self.last_error = None;
                self.modification_time = now;
                Ok(())
            }
        }
    }

    /// Counts a failed or unacknowledged attempt. Every failure grows the wait
    /// before the next attempt by the factor.
    pub fn register_failure(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<RetryDecision, ReliabilityError> {
        if !matches!(
            self.state,
            ReliabilityState::Pending | ReliabilityState::Sent
        ) {
            return Err(self.invalid("register a failure"));
        }

        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(reason.into());
        self.modification_time = now;

        if self.retry_count >= self.max_retries {
            self.state = ReliabilityState::Exhausted;
            return Ok(RetryDecision::Exhausted);
        }

        self.current_interval = self.policy().interval_for(self.retry_count);
        self.next_due = now + to_chrono(self.current_interval);
        self.state = ReliabilityState::RetryScheduled;
        Ok(RetryDecision::Scheduled {
            due: self.next_due,
            interval: self.current_interval,
        })
    }

    /// A scheduled retry became due and is handed back to its agent.
    pub fn reinject(&mut self, now: DateTime<Utc>) -> Result<(), ReliabilityError> {
        match self.state {
            ReliabilityState::RetryScheduled => {
                self.state = ReliabilityState::Pending;
                self.next_due = now;
                self.modification_time = now;
                Ok(())
            }
            _ => Err(self.invalid("be reinjected")),
        }
    }

    fn invalid(&self, action: &'static str) -> ReliabilityError {
        ReliabilityError {
            key: self.key(),
            action,
            state: self.state.as_str(),
        }
    }
}

pub fn record_key(retry_type: RetryType, subject: &str) -> String {
    format!("{retry_type}:{subject}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            factor: 1.75,
        }
    }

    #[test]
    fn interval_grows_geometrically_and_caps() {
        let policy = policy();
        let millis: Vec<u128> = (0..7)
            .map(|retries| policy.interval_for(retries).as_millis())
            .collect();
        assert_eq!(millis, vec![1000, 1750, 3062, 5359, 9378, 10000, 10000]);
    }

    #[test]
    fn failures_schedule_until_exhausted() {
        let now = Utc::now();
        let mut record = RetryRecord::new("m-1", RetryType::Send, &policy(), now);
        record.mark_sent(now).unwrap();

        let first = record.register_failure(now, "timeout").unwrap();
        assert_eq!(
            first,
            RetryDecision::Scheduled {
                due: now + chrono::Duration::milliseconds(1750),
                interval: Duration::from_millis(1750),
            }
        );

        record.reinject(now).unwrap();
        record.mark_sent(now).unwrap();
        assert!(matches!(
            record.register_failure(now, "timeout").unwrap(),
            RetryDecision::Scheduled { interval, .. } if interval == Duration::from_millis(3062)
        ));

        record.reinject(now).unwrap();
        record.mark_sent(now).unwrap();
        assert_eq!(
            record.register_failure(now, "timeout").unwrap(),
            RetryDecision::Exhausted
        );
        assert!(record.state.is_terminal());
        assert!(record.acknowledge(now).is_err());
    }

    #[test]
    fn acknowledgement_is_terminal() {
        let now = Utc::now();
        let mut record = RetryRecord::new("m-2", RetryType::Send, &policy(), now);
        record.mark_sent(now).unwrap();
        record.acknowledge(now).unwrap();
        assert_eq!(record.state, ReliabilityState::Ack);
        assert!(record.register_failure(now, "late").is_err());
        assert!(!record.is_due(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn sent_record_is_due_after_the_receipt_timeout() {
        let now = Utc::now();
        let mut record = RetryRecord::new("m-3", RetryType::Send, &policy(), now);
        record.mark_sent(now).unwrap();
        assert!(!record.is_due(now));
        assert!(record.is_due(now + chrono::Duration::seconds(1)));
    }

    proptest! {
        #[test]
        fn interval_never_decreases_and_never_exceeds_max(
            min_ms in 1u64..5_000,
            extra_ms in 0u64..120_000,
            factor in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy {
                max_retries: 50,
                min_interval: Duration::from_millis(min_ms),
                max_interval: Duration::from_millis(min_ms + extra_ms),
                factor,
            };
            let mut previous = Duration::ZERO;
            for retries in 0..40 {
                let interval = policy.interval_for(retries);
                prop_assert!(interval >= previous);
                prop_assert!(interval <= policy.max_interval);
                previous = interval;
            }
        }
    }
}
