//! Host metric adapters backed by `sysinfo`.

use super::adapter::{MetricSource, Reading};
use hostdeck_core::telemetry::keys;
use hostdeck_core::{DeckError, DeckResult, MetricValue, ProcessEntry};
use std::collections::HashSet;
use sysinfo::{DiskUsage, Disks, Networks, ProcessesToUpdate, System};
use tracing::trace;

fn ensure_supported(source: &str) -> DeckResult<()> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Ok(())
    } else {
        Err(DeckError::MetricUnavailable {
            key: source.to_string(),
            reason: "platform unsupported".into(),
        })
    }
}

fn gauge(key: impl Into<String>, value: f64) -> (String, Reading) {
    (key.into(), Reading::Value(MetricValue::Gauge(value)))
}

/// Metric-key segment for a mount point or interface name.
fn key_segment(raw: &str) -> String {
    let trimmed = raw.trim_matches(|c| c == '/' || c == '\\');
    if trimmed.is_empty() {
        return "root".to_string();
    }
    trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' | ' ' | ':' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_end_matches('_')
        .to_string()
}

/// Global and per-core CPU load plus load averages.
pub struct CpuSource {
    sys: System,
    warmed_up: bool,
}

impl CpuSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        Self {
            sys,
            warmed_up: false,
        }
    }
}

impl Default for CpuSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for CpuSource {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        ensure_supported(self.name())?;
        self.sys.refresh_cpu_usage();

        let cpus = self.sys.cpus();
        let mut readings = Vec::with_capacity(cpus.len() + 5);
        readings.push((
            keys::CPU_CORES.to_string(),
            Reading::Value(MetricValue::Count(cpus.len() as u64)),
        ));

        // Usage is measured between two refreshes; the first one has no baseline.
        if self.warmed_up {
            readings.push(gauge(keys::CPU_LOAD, f64::from(self.sys.global_cpu_usage())));
            for (i, cpu) in cpus.iter().enumerate() {
                readings.push(gauge(keys::cpu_core(i), f64::from(cpu.cpu_usage())));
            }
        } else {
            let warming = || Reading::Value(MetricValue::Unavailable("warming up".into()));
            readings.push((keys::CPU_LOAD.to_string(), warming()));
            for i in 0..cpus.len() {
                readings.push((keys::cpu_core(i), warming()));
            }
            self.warmed_up = true;
        }

        let load = System::load_average();
        readings.push(gauge(keys::LOAD_AVG_1, load.one));
        readings.push(gauge(keys::LOAD_AVG_5, load.five));
        readings.push(gauge(keys::LOAD_AVG_15, load.fifteen));
        Ok(readings)
    }
}

/// Physical memory and swap, in bytes.
pub struct MemorySource {
    sys: System,
}

impl MemorySource {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        ensure_supported(self.name())?;
        self.sys.refresh_memory();
        let count = |key: &str, v: u64| (key.to_string(), Reading::Value(MetricValue::Count(v)));
        Ok(vec![
            count(keys::MEM_TOTAL, self.sys.total_memory()),
            count(keys::MEM_USED, self.sys.used_memory()),
            count(keys::MEM_AVAILABLE, self.sys.available_memory()),
            count(keys::SWAP_TOTAL, self.sys.total_swap()),
            count(keys::SWAP_USED, self.sys.used_swap()),
        ])
    }
}

/// Running disk I/O totals built from per-refresh device deltas.
///
/// Summing each device's bytes-since-last-refresh keeps the totals
/// monotonic when devices come and go. A device's first refresh only sets
/// its baseline; a device listed under several mount points counts once.
#[derive(Debug, Default)]
struct IoTotals {
    known: HashSet<String>,
    read: u64,
    written: u64,
}

impl IoTotals {
    fn absorb(&mut self, devices: impl IntoIterator<Item = (String, DiskUsage)>) {
        let mut current = HashSet::new();
        for (device, usage) in devices {
            if !current.insert(device.clone()) {
                continue;
            }
            if self.known.contains(&device) {
                self.read = self.read.saturating_add(usage.read_bytes);
                self.written = self.written.saturating_add(usage.written_bytes);
            }
        }
        self.known = current;
    }
}

/// Per-mount space usage and aggregate disk I/O counters.
pub struct DiskSource {
    disks: Disks,
    io: IoTotals,
}

impl DiskSource {
    pub fn new() -> Self {
        let disks = Disks::new_with_refreshed_list();
        let mut io = IoTotals::default();
        io.absorb(device_usage(&disks));
        Self { disks, io }
    }
}

impl Default for DiskSource {
    fn default() -> Self {
        Self::new()
    }
}

fn device_usage(disks: &Disks) -> impl Iterator<Item = (String, DiskUsage)> + '_ {
    disks
        .list()
        .iter()
        .map(|disk| (disk.name().to_string_lossy().into_owned(), disk.usage()))
}

impl MetricSource for DiskSource {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        ensure_supported(self.name())?;
        self.disks.refresh(true);

        let mut readings = Vec::new();
        for disk in self.disks.list() {
            let mount = key_segment(&disk.mount_point().to_string_lossy());
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            readings.push((keys::disk_used(&mount), Reading::Value(MetricValue::Count(used))));
            readings.push((keys::disk_total(&mount), Reading::Value(MetricValue::Count(total))));
        }

        self.io.absorb(device_usage(&self.disks));
        let (read, written) = (self.io.read, self.io.written);
        readings.push((keys::DISK_READ_BYTES.to_string(), Reading::Counter(read)));
        readings.push((keys::DISK_WRITE_BYTES.to_string(), Reading::Counter(written)));
        trace!(mounts = self.disks.list().len(), read, written, "disk sampled");
        Ok(readings)
    }
}

/// Per-interface received/transmitted byte counters.
pub struct NetworkSource;

impl NetworkSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for NetworkSource {
    fn name(&self) -> &'static str {
        "network"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        ensure_supported(self.name())?;
        let networks = Networks::new_with_refreshed_list();
        let mut readings = Vec::with_capacity(networks.list().len() * 2);
        for (name, data) in networks.list() {
            let iface = key_segment(name);
            readings.push((keys::net_rx(&iface), Reading::Counter(data.total_received())));
            readings.push((keys::net_tx(&iface), Reading::Counter(data.total_transmitted())));
        }
        Ok(readings)
    }
}

/// Process count and the busiest processes by CPU.
pub struct ProcessSource {
    sys: System,
    limit: usize,
}

impl ProcessSource {
    pub fn new(limit: usize) -> Self {
        Self {
            sys: System::new(),
            limit,
        }
    }
}

impl MetricSource for ProcessSource {
    fn name(&self) -> &'static str {
        "processes"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        ensure_supported(self.name())?;
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut table: Vec<ProcessEntry> = self
            .sys
            .processes()
            .values()
            .map(|p| ProcessEntry {
                pid: p.pid().as_u32(),
                name: p.name().to_string_lossy().to_string(),
                cpu_percent: p.cpu_usage(),
                memory_bytes: p.memory(),
            })
            .collect();
        let count = table.len() as u64;

        table.sort_by(|a, b| {
            b.cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.memory_bytes.cmp(&a.memory_bytes))
        });
        table.truncate(self.limit);

        Ok(vec![
            (
                keys::PROC_COUNT.to_string(),
                Reading::Value(MetricValue::Count(count)),
            ),
            (
                keys::PROC_TOP.to_string(),
                Reading::Value(MetricValue::Processes(table)),
            ),
        ])
    }
}

/// Host name and uptime.
pub struct HostSource;

impl MetricSource for HostSource {
    fn name(&self) -> &'static str {
        "host"
    }

    fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
        let name = match System::host_name() {
            Some(name) => MetricValue::Text(name),
            None => MetricValue::Unavailable("host name not reported".into()),
        };
        Ok(vec![
            (keys::HOST_NAME.to_string(), Reading::Value(name)),
            (
                keys::HOST_UPTIME.to_string(),
                Reading::Value(MetricValue::Count(System::uptime())),
            ),
        ])
    }
}
