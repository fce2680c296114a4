//! Iteration timing statistics
//!
//! Tracks how long each pipeline iteration takes and how many run per second.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Iteration timing statistics
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    /// Average iteration time in milliseconds
    pub avg_ms: f64,
    /// Minimum iteration time in milliseconds
    pub min_ms: f64,
    /// Maximum iteration time in milliseconds
    pub max_ms: f64,
    /// 50th percentile (median) iteration time
    pub p50_ms: f64,
    /// 95th percentile iteration time
    pub p95_ms: f64,
    /// 99th percentile iteration time
    pub p99_ms: f64,
    /// Number of samples in the statistics
    pub sample_count: usize,
}

/// Rolling profiler for worker iterations
pub struct FrameProfiler {
    /// Iteration durations
    frame_times: VecDeque<Duration>,
    /// Maximum samples to keep (10 seconds at 30fps)
    max_samples: usize,
    /// Iteration start times for FPS calculation
    frame_starts: VecDeque<Instant>,
}

impl Default for FrameProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProfiler {
    pub fn new() -> Self {
        Self::with_capacity(300)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        let max_samples = max_samples.max(2);
        Self {
            frame_times: VecDeque::with_capacity(max_samples),
            max_samples,
            frame_starts: VecDeque::with_capacity(max_samples),
        }
    }

    /// Record one iteration that started at `start` and took `duration`.
    pub fn record(&mut self, start: Instant, duration: Duration) {
        self.frame_times.push_back(duration);
        if self.frame_times.len() > self.max_samples {
            self.frame_times.pop_front();
        }
        self.frame_starts.push_back(start);
        if self.frame_starts.len() > self.max_samples {
            self.frame_starts.pop_front();
        }
    }

    /// Get iteration timing statistics
    pub fn stats(&self) -> FrameStats {
        if self.frame_times.is_empty() {
            return FrameStats::default();
        }

        let mut times: Vec<f64> = self
            .frame_times
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = times.iter().sum();
        let count = times.len() as f64;

        FrameStats {
            avg_ms: sum / count,
            min_ms: times.first().copied().unwrap_or(0.0),
            max_ms: times.last().copied().unwrap_or(0.0),
            p50_ms: percentile(&times, 0.50),
            p95_ms: percentile(&times, 0.95),
            p99_ms: percentile(&times, 0.99),
            sample_count: times.len(),
        }
    }

    /// Iterations per second over the retained window
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.frame_starts.front(), self.frame_starts.back()) else {
            return 0.0;
        };
        let duration = last.duration_since(*first).as_secs_f64();
        if self.frame_starts.len() >= 2 && duration > 0.0 {
            (self.frame_starts.len() - 1) as f64 / duration
        } else {
            0.0
        }
    }

    /// Get the last iteration time in milliseconds
    pub fn last_frame_time_ms(&self) -> f64 {
        self.frame_times
            .back()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Calculate percentile from sorted array
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}
