//! hostdeck-engine: the session-and-telemetry engine behind hostdeck.
//!
//! Spawns and multiplexes pty-backed shell sessions, samples host metrics
//! on a fixed cadence, and carries both event streams to the presentation
//! layer over a bounded, ordered bridge.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use bridge::{event_bridge, BridgeConfig, EngineSide, PresentationSide};
pub use config::EngineConfig;
pub use engine::Engine;
