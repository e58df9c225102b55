//! Host telemetry: metric adapters, rate derivation and the sampler.

pub mod adapter;
pub mod rate;
pub mod sampler;
pub mod sysinfo_sources;

pub use adapter::{build_adapters, AdapterKind, MetricSource, Reading};
pub use rate::RateTracker;
pub use sampler::{SamplerConfig, SamplerHandle, TelemetrySampler, MIN_INTERVAL};
