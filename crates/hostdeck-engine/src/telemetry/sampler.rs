//! Periodic telemetry sampling.
//!
//! One task owns the adapters and the prior-reading cache. Each tick runs
//! every adapter on the blocking pool, turns counters into rates, and
//! pushes a `TelemetryUpdate`. Ticks never overlap: a slow tick delays the
//! next one instead of stacking.

use super::adapter::{MetricSource, Reading};
use super::rate::RateTracker;
use crate::bridge::OutboundSender;
use chrono::Utc;
use hostdeck_core::{DeckError, MetricValue, Outbound, TelemetrySnapshot};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Shortest accepted sampling period.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits for an in-flight tick.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// A tick longer than `interval * stall_factor` is reported as stalled.
    pub stall_factor: u32,
}

impl SamplerConfig {
    /// Config with the interval clamped to [`MIN_INTERVAL`].
    pub fn new(interval: Duration, stall_factor: u32) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            stall_factor: stall_factor.max(1),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), 4)
    }
}

/// An adapter plus the keys it produced last time, so a failure can mark
/// exactly those keys unavailable.
struct Slot {
    source: Box<dyn MetricSource>,
    last_keys: Vec<String>,
}

/// Output of running every adapter once.
struct Collected {
    values: BTreeMap<String, MetricValue>,
    counters: Vec<(String, u64)>,
}

fn collect(slots: &mut [Slot]) -> Collected {
    let mut values = BTreeMap::new();
    let mut counters = Vec::new();

    for slot in slots.iter_mut() {
        let name = slot.source.name();
        let outcome = catch_unwind(AssertUnwindSafe(|| slot.source.sample()));
        let failure = match outcome {
            Ok(Ok(readings)) => {
                slot.last_keys = readings.iter().map(|(k, _)| k.clone()).collect();
                for (key, reading) in readings {
                    match reading {
                        Reading::Value(value) => {
                            values.insert(key, value);
                        }
                        Reading::Counter(raw) => counters.push((key, raw)),
                    }
                }
                continue;
            }
            Ok(Err(DeckError::MetricUnavailable { reason, .. })) => reason,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "adapter panicked".to_string(),
        };

        warn!(adapter = name, reason = %failure, "metric adapter failed");
        if slot.last_keys.is_empty() {
            values.insert(name.to_string(), MetricValue::Unavailable(failure));
        } else {
            for key in &slot.last_keys {
                values.insert(key.clone(), MetricValue::Unavailable(failure.clone()));
            }
        }
    }

    Collected { values, counters }
}

enum Control {
    SetInterval(Duration),
    Stop,
}

/// Owns the adapters until spawned.
pub struct TelemetrySampler {
    slots: Vec<Slot>,
    config: SamplerConfig,
}

impl TelemetrySampler {
    pub fn new(adapters: Vec<Box<dyn MetricSource>>, config: SamplerConfig) -> Self {
        Self {
            slots: adapters
                .into_iter()
                .map(|source| Slot {
                    source,
                    last_keys: Vec::new(),
                })
                .collect(),
            config,
        }
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.source.name()).collect()
    }

    /// Start ticking into `sink`. The first tick runs immediately.
    pub fn spawn(self, sink: OutboundSender) -> SamplerHandle {
        let (control_tx, control_rx) = mpsc::channel(8);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            adapters = ?self.adapter_names(),
            "telemetry sampler started"
        );
        let task = tokio::spawn(run(self.slots, self.config, sink, control_rx));
        SamplerHandle {
            control: control_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }
}

async fn run(
    slots: Vec<Slot>,
    config: SamplerConfig,
    sink: OutboundSender,
    mut control: mpsc::Receiver<Control>,
) {
    let slots = Arc::new(Mutex::new(slots));
    let mut rates = RateTracker::new();
    let mut interval = config.interval;
    let mut sequence: u64 = 0;

    'ticks: loop {
        let started = Instant::now();

        let tick_slots = slots.clone();
        let collected = match tokio::task::spawn_blocking(move || {
            let mut slots = tick_slots.lock().unwrap_or_else(PoisonError::into_inner);
            collect(&mut slots)
        })
        .await
        {
            Ok(collected) => collected,
            Err(e) => {
                warn!(error = %e, "sampling tick failed");
                Collected {
                    values: BTreeMap::new(),
                    counters: Vec::new(),
                }
            }
        };

        let sampled_at = Instant::now();
        let mut metrics = collected.values;
        let counter_keys: Vec<&str> = collected.counters.iter().map(|(k, _)| k.as_str()).collect();
        rates.retain(&counter_keys);
        for (key, raw) in &collected.counters {
            let rate = rates.observe(key, *raw, sampled_at);
            metrics.insert(key.clone(), rate);
        }

        sequence += 1;
        let snapshot = TelemetrySnapshot {
            sequence,
            timestamp: Utc::now(),
            metrics,
        };
        debug!(sequence, metrics = snapshot.metrics.len(), "telemetry tick");
        if sink
            .push_telemetry(Outbound::TelemetryUpdate {
                snapshot,
                dropped_before: 0,
            })
            .is_err()
        {
            debug!("bridge closed, sampler exiting");
            break;
        }

        let elapsed = started.elapsed();
        if elapsed > interval * config.stall_factor {
            let stalled = DeckError::SamplingStalled {
                elapsed_ms: elapsed.as_millis() as u64,
                interval_ms: interval.as_millis() as u64,
            };
            warn!(sequence, "{stalled}");
            let event = Outbound::SamplingStalled {
                sequence,
                elapsed_ms: elapsed.as_millis() as u64,
                interval_ms: interval.as_millis() as u64,
            };
            if sink.send(event).await.is_err() {
                break;
            }
        }

        // Wait out the rest of the period; commands may shorten or end it.
        loop {
            let deadline = started + interval;
            tokio::select! {
                _ = sleep_until(deadline) => break,
                command = control.recv() => match command {
                    Some(Control::SetInterval(next)) => {
                        info!(
                            from_ms = interval.as_millis() as u64,
                            to_ms = next.as_millis() as u64,
                            "sampling interval changed"
                        );
                        interval = next;
                    }
                    Some(Control::Stop) | None => break 'ticks,
                },
            }
        }
    }

    info!(ticks = sequence, "telemetry sampler stopped");
}

/// Control handle for a running sampler.
pub struct SamplerHandle {
    control: mpsc::Sender<Control>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SamplerHandle {
    /// Change the period, clamped to [`MIN_INTERVAL`]. Applies from the
    /// current cycle on.
    pub async fn set_interval(&self, interval: Duration) -> Duration {
        let interval = interval.max(MIN_INTERVAL);
        if self.control.send(Control::SetInterval(interval)).await.is_err() {
            debug!("sampler already stopped");
        }
        interval
    }

    /// Stop ticking. No telemetry is produced once this returns.
    pub async fn stop(&self) {
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        if self.control.send(Control::Stop).await.is_err() {
            debug!("sampler task already finished");
        }
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("sampler did not stop in time, aborting");
            task.abort();
            if let Err(e) = task.await {
                debug!(error = %e, "sampler task ended");
            }
        }
    }
}
