//! Throughput, loss and frame-rate accounting.
//!
//! [`BandwidthEstimator`] keeps a rolling byte window; [`PerfCounter`]
//! adds block and frame counters and turns an interval into a
//! [`PerfReport`] for the control plane.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ── BandwidthEstimator ───────────────────────────────────────────

/// Rolling-window throughput in bytes/second.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let elapsed = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / elapsed.as_secs_f64()) as u64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total_bytes = self.total_bytes.saturating_sub(bytes);
        }
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── PerfReport ───────────────────────────────────────────────────

/// One reporting interval as seen by a sender or receiver.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerfReport {
    /// Megabits per second.
    pub bandwidth_mbps: f64,
    /// Fraction of expected blocks that never arrived, 0.0 to 1.0.
    pub loss_rate: f64,
    pub frame_rate: f64,
    /// Frames completed during the interval.
    pub frames: u64,
    pub interval_ms: u64,
}

// ── PerfCounter ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PerfCounter {
    interval_start: Instant,
    bytes: u64,
    expected_blocks: u64,
    received_blocks: u64,
    frames: u64,
    bandwidth: BandwidthEstimator,
}

impl PerfCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            interval_start: now,
            bytes: 0,
            expected_blocks: 0,
            received_blocks: 0,
            frames: 0,
            bandwidth: BandwidthEstimator::new(),
        }
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.bandwidth.record(bytes);
    }

    /// Account for one finished frame.
    pub fn add_frame(&mut self, expected_blocks: u64, received_blocks: u64) {
        self.frames += 1;
        self.expected_blocks += expected_blocks;
        self.received_blocks += received_blocks.min(expected_blocks);
    }

    /// Current rolling throughput in bytes/second.
    pub fn current_bps(&self) -> u64 {
        self.bandwidth.estimate_bps()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    /// Close the interval ending at `now` and start a new one.
    pub fn report_at(&mut self, now: Instant) -> PerfReport {
        let elapsed = now
            .duration_since(self.interval_start)
            .max(Duration::from_millis(1));
        let secs = elapsed.as_secs_f64();
        let loss_rate = if self.expected_blocks == 0 {
            0.0
        } else {
            1.0 - self.received_blocks as f64 / self.expected_blocks as f64
        };
        let report = PerfReport {
            bandwidth_mbps: self.bytes as f64 * 8.0 / secs / 1_000_000.0,
            loss_rate,
            frame_rate: self.frames as f64 / secs,
            frames: self.frames,
            interval_ms: elapsed.as_millis() as u64,
        };
        self.interval_start = now;
        self.bytes = 0;
        self.expected_blocks = 0;
        self.received_blocks = 0;
        self.frames = 0;
        report
    }

    pub fn report(&mut self) -> PerfReport {
        self.report_at(Instant::now())
    }
}

impl Default for PerfCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_returns_zero() {
        assert_eq!(BandwidthEstimator::new().estimate_bps(), 0);
    }

    #[test]
    fn two_samples_one_second_apart() {
        let mut est = BandwidthEstimator::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        est.record_at(t0, 1_000_000);
        est.record_at(t0 + Duration::from_secs(1), 1_000_000);
        let bps = est.estimate_bps();
        assert!((1_900_000..=2_100_000).contains(&bps), "bps = {bps}");
    }

    #[test]
    fn evicts_old_samples() {
        let mut est = BandwidthEstimator::with_window(Duration::from_millis(500));
        let t0 = Instant::now();
        est.record_at(t0, 1000);
        est.record_at(t0 + Duration::from_secs(1), 500);
        assert_eq!(est.sample_count(), 1);
    }

    #[test]
    fn report_covers_one_interval() {
        let t0 = Instant::now();
        let mut c = PerfCounter::starting_at(t0);
        c.add_bytes(1_000_000);
        c.add_frame(40, 40);
        c.add_frame(40, 30);

        let r = c.report_at(t0 + Duration::from_secs(2));
        assert_eq!(r.frames, 2);
        assert_eq!(r.interval_ms, 2000);
        assert!((r.frame_rate - 1.0).abs() < 1e-9);
        assert!((r.loss_rate - 0.125).abs() < 1e-9);
        assert!((r.bandwidth_mbps - 4.0).abs() < 1e-9);

        let next = c.report_at(t0 + Duration::from_secs(3));
        assert_eq!(next.frames, 0);
        assert_eq!(next.loss_rate, 0.0);
    }
}
