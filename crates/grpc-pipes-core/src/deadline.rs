//! Absolute call deadlines.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// An optional absolute point in time after which a call has failed.
///
/// Deadlines are kept at microsecond precision, which is what the wire
/// carries, so a deadline survives an encode/decode unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<DateTime<Utc>>);

impl Deadline {
    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        Self(at.map(truncate_to_micros))
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self::new(Some(at))
    }

    /// A deadline `timeout` from now. Timeouts too large to represent never expire.
    pub fn after(timeout: Duration) -> Self {
        let at = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta));
        Self::new(at)
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.0, Some(at) if at <= Utc::now())
    }

    /// Time left before expiry; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Resolves once the deadline has passed. Never resolves without a deadline.
    pub async fn expired(&self) {
        match self.remaining() {
            Some(remaining) => tokio::time::sleep(remaining).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Microseconds since the Unix epoch, as carried on the wire.
    pub(crate) fn to_wire(self) -> Option<i64> {
        self.0.map(|at| at.timestamp_micros())
    }

    pub(crate) fn from_wire(micros: i64) -> Option<Self> {
        DateTime::from_timestamp_micros(micros).map(|at| Self(Some(at)))
    }
}

fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_past_deadline_is_expired() {
        let deadline = Deadline::at(Utc::now() - TimeDelta::seconds(1));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_future_deadline_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn test_huge_timeout_means_no_deadline() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_set());
    }

    #[test]
    fn test_wire_roundtrip_keeps_microseconds() {
        let deadline = Deadline::after(Duration::from_millis(1500));
        let micros = deadline.to_wire().unwrap();
        assert_eq!(Deadline::from_wire(micros), Some(deadline));
    }

    #[tokio::test]
    async fn test_expired_future_resolves() {
        let deadline = Deadline::after(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), deadline.expired())
            .await
            .expect("deadline should fire");
        assert!(deadline.is_expired());
    }
}
