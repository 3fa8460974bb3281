//! Load shedding: timer-lag measurement and the lag-to-capacity curve.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window of timer-lag samples.
///
/// A periodic timer that fires late is a cheap proxy for CPU pressure on
/// a single-threaded event loop: the lag is how much later than scheduled
/// the timer ran.
#[derive(Debug)]
pub struct IntervalLagTracker {
    window: Duration,
    samples: VecDeque<(Instant, Duration)>,
}

impl IntervalLagTracker {
    /// Create a tracker keeping samples for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record that a timer scheduled for `expected` took `actual`.
    pub fn record(&mut self, expected: Duration, actual: Duration) {
        self.record_at(Instant::now(), actual.saturating_sub(expected));
    }

    /// Record a lag sample observed at `now`.
    pub fn record_at(&mut self, now: Instant, lag: Duration) {
        self.samples.push_back((now, lag));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean lag over the window ending at `now`.
    pub fn average_at(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().map(|(_, lag)| *lag).sum();
        total / self.samples.len() as u32
    }

    /// Mean lag over the window ending now.
    pub fn average(&mut self) -> Duration {
        self.average_at(Instant::now())
    }

    /// Number of samples in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Maps measured lag to a new capacity factor.
///
/// Implementations must return a factor in `[0, declared]`.
pub trait CapacityStrategy: Send + Sync {
    /// Next factor given the current one, the declared maximum and the
    /// measured lag.
    fn next_factor(&self, current: f64, declared: f64, lag: Duration) -> f64;
}

/// Multiplicative shrink under lag, bounded additive growth back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagBackoff {
    /// Lag above which capacity shrinks.
    pub threshold: Duration,
    /// Multiplier applied when shrinking, in `(0, 1)`.
    pub shrink: f64,
    /// Largest increase per step when recovering.
    pub grow_step: f64,
    /// Capacity never drops below this (or the declared factor, if lower).
    pub floor: f64,
}

impl Default for LagBackoff {
    fn default() -> Self {
        Self {
            threshold: Duration::from_millis(50),
            shrink: 0.75,
            grow_step: 0.05,
            floor: 0.1,
        }
    }
}

impl CapacityStrategy for LagBackoff {
    fn next_factor(&self, current: f64, declared: f64, lag: Duration) -> f64 {
        let declared = declared.clamp(0.0, 1.0);
        let floor = self.floor.clamp(0.0, declared);
        let current = current.clamp(floor, declared);

        let next = if lag > self.threshold {
            current * self.shrink.clamp(0.0, 1.0)
        } else {
            current + self.grow_step.max(0.0)
        };
        next.clamp(floor, declared)
    }
}
