use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::TransferStatus;

/// Live state of one upload or download.
///
/// Only the engine driving the transfer advances it; anyone holding the
/// `Arc` may poll it. Never persisted.
#[derive(Debug)]
pub struct TransferSession {
    resource: String,
    total_bytes: u64,
    transferred: AtomicU64,
    started: Instant,
}

impl TransferSession {
    pub fn new(resource: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            resource: resource.into(),
            total_bytes,
            transferred: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Move the counter forward to `bytes`, capped at the total. Returns
    /// whether the counter changed; it never moves backwards.
    pub fn advance_to(&self, bytes: u64) -> bool {
        let bytes = bytes.min(self.total_bytes);
        self.transferred.fetch_max(bytes, Ordering::AcqRel) < bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn percentage(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_transferred() as u128 * 100) / self.total_bytes as u128) as u8
    }

    /// Bytes per second, unknown until time has passed and bytes have moved.
    pub fn speed(&self) -> Option<f64> {
        speed(self.bytes_transferred(), self.elapsed())
    }

    pub fn eta(&self) -> Option<Duration> {
        eta(self.total_bytes, self.bytes_transferred(), self.elapsed())
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus::InProgress {
            total_bytes: self.total_bytes,
            bytes_transferred: self.bytes_transferred(),
            percentage: self.percentage(),
            bytes_per_sec: self.speed(),
            eta_seconds: self.eta().map(|d| d.as_secs()),
        }
    }
}

pub(crate) fn speed(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 / secs)
}

pub(crate) fn eta(total: u64, bytes: u64, elapsed: Duration) -> Option<Duration> {
    let speed = speed(bytes, elapsed)?;
    let remaining = total.saturating_sub(bytes) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_and_eta_unknown_without_data() {
        assert_eq!(speed(0, Duration::from_secs(3)), None);
        assert_eq!(speed(100, Duration::ZERO), None);
        assert_eq!(eta(1000, 0, Duration::from_secs(3)), None);
    }

    #[test]
    fn test_speed_and_eta_values() {
        assert_eq!(speed(500, Duration::from_secs(2)), Some(250.0));
        assert_eq!(
            eta(1000, 500, Duration::from_secs(2)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(eta(1000, 1000, Duration::from_secs(2)), Some(Duration::ZERO));
    }

    #[test]
    fn test_advance_is_monotonic_and_capped() {
        let session = TransferSession::new("archive.7z", 100);

        assert!(session.advance_to(40));
        assert!(!session.advance_to(20));
        assert_eq!(session.bytes_transferred(), 40);

        assert!(session.advance_to(500));
        assert_eq!(session.bytes_transferred(), 100);
        assert!(!session.advance_to(100));
        assert_eq!(session.percentage(), 100);
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        let session = TransferSession::new("empty", 0);
        assert_eq!(session.percentage(), 100);
        assert!(!session.advance_to(0));
    }
}
