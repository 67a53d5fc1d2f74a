//! einkframe device agent
//!
//! Connects an e-ink picture frame to an MQTT broker: display messages are
//! deduplicated, decoded and rendered one at a time, and the frame reports
//! its status (online/offline, power) on a retained topic.

pub mod config;
pub mod decode;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod indicator;
pub mod pipeline;
pub mod power;
pub mod render;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod status;

pub use config::AgentConfig;
pub use runtime::{Collaborators, Runtime};
pub use session::{SessionExit, SessionHandle, SessionState, ShutdownReason};
