//! Per-second rates from consecutive counter readings.

use hostdeck_core::MetricValue;
use std::collections::HashMap;
use tokio::time::Instant;

/// Keeps exactly one prior reading per counter key.
#[derive(Debug, Default)]
pub struct RateTracker {
    previous: HashMap<String, (u64, Instant)>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `key` at `now` and derive the rate since the
    /// previous reading.
    ///
    /// The first reading of a key has no rate. A counter that went backwards
    /// (interface reset, wrap) restarts from the new value.
    pub fn observe(&mut self, key: &str, value: u64, now: Instant) -> MetricValue {
        let previous = self.previous.insert(key.to_string(), (value, now));
        let Some((prev_value, prev_at)) = previous else {
            return MetricValue::Unavailable("no prior sample".into());
        };
        if value < prev_value {
            return MetricValue::Unavailable("counter reset".into());
        }
        let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return MetricValue::Unavailable("no time elapsed since prior sample".into());
        }
        MetricValue::Rate((value - prev_value) as f64 / elapsed)
    }

    /// Forget keys that were not reported this tick.
    pub fn retain(&mut self, seen: &[&str]) {
        self.previous.retain(|key, _| seen.contains(&key.as_str()));
    }

    /// Forget every prior reading.
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}
