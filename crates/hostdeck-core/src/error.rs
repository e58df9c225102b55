use crate::events::SessionId;
use thiserror::Error;

/// Errors produced by the hostdeck engine.
///
/// None of these are fatal to the engine as a whole: each one maps onto an
/// outbound event so the presentation layer can observe it.
#[derive(Debug, Error)]
pub enum DeckError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("metric {key} unavailable: {reason}")]
    MetricUnavailable { key: String, reason: String },

    #[error("sampling stalled: tick took {elapsed_ms}ms (interval {interval_ms}ms)")]
    SamplingStalled { elapsed_ms: u64, interval_ms: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("event bridge closed")]
    BridgeClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for DeckError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        DeckError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for DeckError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        DeckError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for DeckError {
    fn from(e: serde_json::Error) -> Self {
        DeckError::Codec(e.to_string())
    }
}

pub type DeckResult<T> = Result<T, DeckError>;
