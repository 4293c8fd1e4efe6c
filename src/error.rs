use thiserror::Error;

/// Engine-wide error type.
///
/// Per-request failures (encode/decode) are surfaced as events and never
/// bubble up through the engine state machine; everything else propagates
/// as `EngineError`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encode failed: {0}")]
    EncodeFailure(String),

    #[error("decode failed: {0}")]
    DecodeFailure(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("radio transport error: {0}")]
    RadioTransport(String),

    #[error("radio disconnected during transmit: {0}")]
    RadioDisconnectedDuringTransmit(String),

    #[error("missed transmit window for operator {operator_id}: skip {skip_ms} ms >= duration {duration_ms} ms")]
    MissedTransmitWindow {
        operator_id: String,
        skip_ms: i64,
        duration_ms: i64,
    },

    #[error("encode timed out after {0} ms")]
    EncodeTimeout(u64),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("resource '{name}' failed to start: {message}")]
    ResourceStartFailure { name: String, message: String },

    #[error("engine stop timed out after {0} ms")]
    StopTimeout(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue closed: {0}")]
    QueueClosed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
