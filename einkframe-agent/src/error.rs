//! Error types shared across the agent
//!
//! One enum per seam. The binary edge (`main`, `runtime`) wraps these in
//! `anyhow` with context; everything below it returns typed errors.

use std::fmt;
use thiserror::Error;

/// Configuration problems. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("device id could not be discovered: {0}")]
    DeviceId(String),
}

/// Broker transport failures (connect, subscribe, publish).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection closed")]
    Closed,
}

/// Failures surfaced by the session handle to publishers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to serialize status report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("broker unreachable at startup: {0}")]
    Unreachable(#[source] TransportError),

    #[error("status worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("session is shutting down")]
    ShuttingDown,
}

/// Panel cycle stage, used to tell where a render failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Prepare,
    Display,
    Sleep,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderStage::Prepare => "prepare",
            RenderStage::Display => "display",
            RenderStage::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("panel {stage} failed: {reason}")]
    Hardware { stage: RenderStage, reason: String },

    #[error("render worker failed: {0}")]
    Worker(String),

    #[error("panel initialisation failed: {0}")]
    Init(String),

    #[error("render gate closed")]
    Closed,
}

impl RenderError {
    pub fn hardware(stage: RenderStage, reason: impl Into<String>) -> Self {
        RenderError::Hardware {
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,

    #[error("unexpected frame size: {actual} bytes (expected {expected_grey} or {expected_packed})")]
    UnexpectedLength {
        actual: usize,
        expected_grey: usize,
        expected_packed: usize,
    },
}

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("power monitor unavailable: {0}")]
    Unavailable(String),

    #[error("power monitor bus error: {0}")]
    Bus(String),

    #[error("power monitor checksum mismatch")]
    Checksum,
}

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("indicator unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a failed display message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Render(#[from] RenderError),
}
