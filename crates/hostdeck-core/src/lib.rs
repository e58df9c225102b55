//! hostdeck-core: shared types for the hostdeck engine.
//!
//! Provides the event vocabulary exchanged with the presentation layer,
//! the telemetry snapshot model, the error taxonomy, and the stdio wire codec.

pub mod codec;
pub mod error;
pub mod events;
pub mod telemetry;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, FrameDecoder, WireFormat};
pub use error::{DeckError, DeckResult};
pub use events::{ExitStatus, Inbound, Outbound, SessionId, SessionInfo, SessionState};
pub use telemetry::{MetricValue, ProcessEntry, TelemetrySnapshot};
