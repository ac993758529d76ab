//! Transfer Progress
//!
//! Emission cadence and network-speed smoothing shared by all workers.
//! An update goes out when progress advanced more than 2% and 500 ms have
//! passed, or on any advance once 2 s have passed.

use std::time::Instant;

use crate::task::status::TIME_REMAINING_UNKNOWN;

/// Minimum progress delta for the fast emission path.
const MIN_PROGRESS_DELTA: f64 = 0.02;

/// Minimum interval for the fast emission path.
const MIN_EMIT_INTERVAL_MS: u128 = 500;

/// Interval after which any advance is emitted.
const FORCED_EMIT_INTERVAL_MS: u128 = 2_000;

/// Decides when a progress value is worth emitting.
#[derive(Debug)]
pub struct ProgressCadence {
    last_progress: f64,
    last_emit: Option<Instant>,
}

impl ProgressCadence {
    pub fn new() -> Self {
        Self {
            last_progress: 0.0,
            last_emit: None,
        }
    }

    /// True when `progress` should be emitted at `now`; records the emission.
    pub fn should_emit(&mut self, progress: f64, now: Instant) -> bool {
        let advanced = progress > self.last_progress;
        if !advanced {
            return false;
        }
        let elapsed_ms = match self.last_emit {
            Some(at) => now.duration_since(at).as_millis(),
            // first advance always emits
            None => u128::MAX,
        };
        let emit = (progress - self.last_progress > MIN_PROGRESS_DELTA
            && elapsed_ms > MIN_EMIT_INTERVAL_MS)
            || elapsed_ms > FORCED_EMIT_INTERVAL_MS;
        if emit {
            self.last_progress = progress;
            self.last_emit = Some(now);
        }
        emit
    }
}

impl Default for ProgressCadence {
    fn default() -> Self {
        Self::new()
    }
}

/// One emitted progress sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// 0.0 ..< 1.0
    pub progress: f64,
    /// Smoothed speed in MB/s, negative while unknown
    pub network_speed_mbps: f64,
    /// Estimated remaining time in ms, [`TIME_REMAINING_UNKNOWN`] while unknown
    pub time_remaining_ms: i64,
}

/// Byte counter with cadence and smoothed speed for a single transfer.
#[derive(Debug)]
pub struct ProgressTracker {
    /// Expected total bytes; 0 when the server did not say
    total_bytes: u64,
    /// Bytes already on disk when a resumed transfer started
    start_offset: u64,
    transferred: u64,
    cadence: ProgressCadence,
    sample_at: Instant,
    bytes_at_sample: u64,
    /// Exponentially weighted bytes/second; 0 while unknown
    speed_bps: f64,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, start_offset: u64) -> Self {
        Self {
            total_bytes,
            start_offset,
            transferred: start_offset,
            cadence: ProgressCadence::new(),
            sample_at: Instant::now(),
            bytes_at_sample: start_offset,
            speed_bps: 0.0,
        }
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.transferred += n;
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes still to transfer, 0 when the total is unknown.
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.transferred)
    }

    /// Current fractional progress, capped just under 1.0 while running.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.total_bytes as f64).min(0.999)
    }

    /// Sample the tracker; returns a snapshot when the cadence says emit.
    pub fn poll(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if self.total_bytes == 0 {
            return None;
        }
        let progress = self.progress();
        if !self.cadence.should_emit(progress, now) {
            return None;
        }
        let elapsed = now.duration_since(self.sample_at).as_secs_f64();
        if elapsed > 0.0 {
            let current = (self.transferred - self.bytes_at_sample) as f64 / elapsed;
            self.speed_bps = if self.speed_bps == 0.0 {
                current
            } else {
                (self.speed_bps * 3.0 + current) / 4.0
            };
            self.sample_at = now;
            self.bytes_at_sample = self.transferred;
        }
        let (speed_mbps, time_remaining_ms) = if self.speed_bps > 0.0 {
            let remaining = self.remaining_bytes() as f64;
            (
                self.speed_bps / 1_000_000.0,
                (remaining / self.speed_bps * 1000.0) as i64,
            )
        } else {
            (-1.0, TIME_REMAINING_UNKNOWN)
        };
        Some(ProgressSnapshot {
            progress,
            network_speed_mbps: speed_mbps,
            time_remaining_ms,
        })
    }

    /// Offset the transfer started at (for resumed downloads).
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_advance_emits() {
        let mut cadence = ProgressCadence::new();
        assert!(cadence.should_emit(0.05, Instant::now()));
    }

    #[test]
    fn test_small_delta_waits() {
        let mut cadence = ProgressCadence::new();
        let start = Instant::now();
        assert!(cadence.should_emit(0.05, start));
        // 1% more after 600 ms: below the 2% threshold, within 2 s
        assert!(!cadence.should_emit(0.06, start + Duration::from_millis(600)));
        // same 1% after 2.1 s: forced path
        assert!(cadence.should_emit(0.06, start + Duration::from_millis(2_100)));
    }

    #[test]
    fn test_fast_path_needs_500ms() {
        let mut cadence = ProgressCadence::new();
        let start = Instant::now();
        assert!(cadence.should_emit(0.05, start));
        assert!(!cadence.should_emit(0.10, start + Duration::from_millis(100)));
        assert!(cadence.should_emit(0.10, start + Duration::from_millis(600)));
    }

    #[test]
    fn test_no_emit_without_advance() {
        let mut cadence = ProgressCadence::new();
        let start = Instant::now();
        assert!(cadence.should_emit(0.5, start));
        assert!(!cadence.should_emit(0.5, start + Duration::from_secs(10)));
        assert!(!cadence.should_emit(0.4, start + Duration::from_secs(10)));
    }

    #[test]
    fn test_tracker_progress_capped() {
        let mut tracker = ProgressTracker::new(100, 0);
        tracker.add_bytes(100);
        assert!(tracker.progress() < 1.0);
        assert_eq!(tracker.remaining_bytes(), 0);
    }

    #[test]
    fn test_tracker_resume_offset() {
        let tracker = ProgressTracker::new(1000, 500);
        assert_eq!(tracker.transferred(), 500);
        assert!((tracker.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_total_never_emits() {
        let mut tracker = ProgressTracker::new(0, 0);
        tracker.add_bytes(4096);
        assert!(tracker.poll(Instant::now()).is_none());
    }

    #[test]
    fn test_speed_ewma() {
        let mut tracker = ProgressTracker::new(10_000_000, 0);
        let start = tracker.sample_at;
        tracker.add_bytes(1_000_000);
        let snap = tracker.poll(start + Duration::from_secs(1)).unwrap();
        // first sample: raw speed ~1 MB/s
        assert!((snap.network_speed_mbps - 1.0).abs() < 0.1);
        tracker.add_bytes(3_000_000);
        let snap = tracker.poll(start + Duration::from_secs(2)).unwrap();
        // (1.0 * 3 + 3.0) / 4 = 1.5 MB/s
        assert!((snap.network_speed_mbps - 1.5).abs() < 0.1);
        assert!(snap.time_remaining_ms > 0);
    }
}
