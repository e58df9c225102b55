//! Telemetry snapshot model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of the process table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// A single metric reading inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    /// Instantaneous reading (percent, bytes, seconds...).
    Gauge(f64),
    /// Derived per-second rate of a counter.
    Rate(f64),
    /// Plain count.
    Count(u64),
    Text(String),
    Processes(Vec<ProcessEntry>),
    /// The metric could not be read this tick; carries the reason.
    Unavailable(String),
}

impl MetricValue {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MetricValue::Unavailable(_))
    }

    /// Numeric view of gauges, rates and counts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Gauge(v) | MetricValue::Rate(v) => Some(*v),
            MetricValue::Count(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One timestamped, sequence-numbered collection of metric readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl TelemetrySnapshot {
    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    /// Keys whose reading is unavailable this tick.
    pub fn unavailable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.metrics.iter().filter_map(|(k, v)| match v {
            MetricValue::Unavailable(reason) => Some((k.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

/// Well-known metric keys.
pub mod keys {
    pub const CPU_LOAD: &str = "cpu.load";
    pub const CPU_CORES: &str = "cpu.cores";
    pub const LOAD_AVG_1: &str = "cpu.load_avg.1";
    pub const LOAD_AVG_5: &str = "cpu.load_avg.5";
    pub const LOAD_AVG_15: &str = "cpu.load_avg.15";
    pub const MEM_TOTAL: &str = "mem.total";
    pub const MEM_USED: &str = "mem.used";
    pub const MEM_AVAILABLE: &str = "mem.available";
    pub const SWAP_TOTAL: &str = "swap.total";
    pub const SWAP_USED: &str = "swap.used";
    pub const DISK_READ_BYTES: &str = "disk.io.read_bytes";
    pub const DISK_WRITE_BYTES: &str = "disk.io.write_bytes";
    pub const PROC_COUNT: &str = "proc.count";
    pub const PROC_TOP: &str = "proc.top";
    pub const HOST_NAME: &str = "host.name";
    pub const HOST_UPTIME: &str = "host.uptime";

    pub fn cpu_core(index: usize) -> String {
        format!("cpu.{index}.load")
    }

    pub fn net_rx(iface: &str) -> String {
        format!("net.{iface}.rx_bytes")
    }

    pub fn net_tx(iface: &str) -> String {
        format!("net.{iface}.tx_bytes")
    }

    pub fn disk_used(mount: &str) -> String {
        format!("disk.{mount}.used")
    }

    pub fn disk_total(mount: &str) -> String {
        format!("disk.{mount}.total")
    }
}
