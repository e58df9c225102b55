//! Metric source capability and the static adapter registry.

use super::sysinfo_sources::{
    CpuSource, DiskSource, HostSource, MemorySource, NetworkSource, ProcessSource,
};
use hostdeck_core::{DeckError, DeckResult, MetricValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What an adapter reports for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Reported as-is.
    Value(MetricValue),
    /// Monotonic counter; the sampler turns it into a per-second rate.
    Counter(u64),
}

impl From<MetricValue> for Reading {
    fn from(value: MetricValue) -> Self {
        Reading::Value(value)
    }
}

/// One polling source of host metrics.
///
/// `sample` is called once per tick, never concurrently. An `Err` degrades
/// every key of this source to unavailable for that tick.
pub trait MetricSource: Send {
    fn name(&self) -> &'static str;

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>>;
}

/// The built-in adapters, selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Processes,
    Host,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 6] = [
        AdapterKind::Cpu,
        AdapterKind::Memory,
        AdapterKind::Disk,
        AdapterKind::Network,
        AdapterKind::Processes,
        AdapterKind::Host,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterKind::Cpu => "cpu",
            AdapterKind::Memory => "memory",
            AdapterKind::Disk => "disk",
            AdapterKind::Network => "network",
            AdapterKind::Processes => "processes",
            AdapterKind::Host => "host",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = DeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AdapterKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DeckError::Config(format!("unknown metric adapter: {s}")))
    }
}

/// Instantiate the enabled adapters, in the order given, skipping repeats.
pub fn build_adapters(kinds: &[AdapterKind], process_limit: usize) -> Vec<Box<dyn MetricSource>> {
    let mut seen = Vec::new();
    let mut adapters: Vec<Box<dyn MetricSource>> = Vec::new();
    for kind in kinds {
        if seen.contains(kind) {
            continue;
        }
        seen.push(*kind);
        adapters.push(match kind {
            AdapterKind::Cpu => Box::new(CpuSource::new()),
            AdapterKind::Memory => Box::new(MemorySource::new()),
            AdapterKind::Disk => Box::new(DiskSource::new()),
            AdapterKind::Network => Box::new(NetworkSource::new()),
            AdapterKind::Processes => Box::new(ProcessSource::new(process_limit)),
            AdapterKind::Host => Box::new(HostSource),
        });
    }
    adapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adapter_names() {
        assert_eq!("cpu".parse::<AdapterKind>().unwrap(), AdapterKind::Cpu);
        assert_eq!(" Network ".parse::<AdapterKind>().unwrap(), AdapterKind::Network);
        assert!(matches!(
            "gpu".parse::<AdapterKind>(),
            Err(DeckError::Config(_))
        ));
    }

    #[test]
    fn build_skips_duplicates() {
        let adapters = build_adapters(
            &[AdapterKind::Host, AdapterKind::Memory, AdapterKind::Host],
            5,
        );
        let names: Vec<_> = adapters.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["host", "memory"]);
    }
}
