//! Throughput and latency arithmetic shared by providers and LAN sessions.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Convert a byte count over an elapsed wall-clock time to megabits per second.
///
/// Returns `0.0` for a zero or negative elapsed time instead of dividing by zero.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

/// Median of a sample set. `None` for an empty set.
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Mean absolute difference between consecutive samples (RFC 3550 style jitter,
/// without smoothing). `None` with fewer than two samples.
pub fn jitter(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(total / (samples.len() - 1) as f64)
}

/// Tracks bytes moved during a transfer phase.
///
/// Reports both the cumulative average and an instantaneous rate computed over
/// a short trailing window, so progress displays follow recent throughput.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    started: Instant,
    window: Duration,
    total: u64,
    // (timestamp, cumulative bytes at that timestamp)
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(Instant::now(), window)
    }

    pub fn starting_at(started: Instant, window: Duration) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((started, 0));
        Self {
            started,
            window,
            total: 0,
            samples,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((now, self.total));

        // Keep one sample at or before the window start as the baseline.
        while self.samples.len() > 2 {
            let second = self.samples[1].0;
            if now.duration_since(second) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.started)
    }

    pub fn average_mbps(&self) -> f64 {
        mbps(self.total, self.elapsed())
    }

    pub fn average_mbps_at(&self, now: Instant) -> f64 {
        mbps(self.total, now.duration_since(self.started))
    }

    /// Rate over the trailing window ending at `now`.
    pub fn current_mbps_at(&self, now: Instant) -> f64 {
        let Some(&(base_at, base_bytes)) = self.samples.front() else {
            return 0.0;
        };
        let span = now.duration_since(base_at);
        mbps(self.total - base_bytes, span)
    }

    pub fn current_mbps(&self) -> f64 {
        self.current_mbps_at(Instant::now())
    }
}
