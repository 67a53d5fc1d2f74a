//! Status reports published on the device status topic
//!
//! Every publish (connect, heartbeat, shutdown, last will) gets a freshly
//! built [`StatusReport`]. Reports are never mutated after construction.

use crate::discovery;
use crate::power::{PowerMonitor, PowerSnapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::{self, JoinError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Online => f.write_str("online"),
            Status::Offline => f.write_str("offline"),
        }
    }
}

/// Wire format of the status payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub hostname: String,
    pub ip_address: String,
    #[serde(rename = "mac")]
    pub device_id: String,
    pub status: Status,
    pub wired: bool,
    pub battery: Option<u8>,
    /// Unix seconds
    pub timestamp: i64,
}

impl StatusReport {
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Produces status reports for this device
pub struct StatusReporter {
    device_id: String,
    hostname: String,
    power: Arc<dyn PowerMonitor>,
}

impl StatusReporter {
    pub fn new(device_id: impl Into<String>, power: Arc<dyn PowerMonitor>) -> Self {
        Self {
            device_id: device_id.into(),
            hostname: discovery::hostname(),
            power,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Build a report reading the power monitor now
    pub fn report(&self, status: Status) -> StatusReport {
        let snapshot = PowerSnapshot::read(self.power.as_ref());
        self.compose(status, snapshot)
    }

    /// Build a report from an existing power snapshot
    pub fn compose(&self, status: Status, power: PowerSnapshot) -> StatusReport {
        StatusReport {
            hostname: self.hostname.clone(),
            ip_address: discovery::local_ip(),
            device_id: self.device_id.clone(),
            status,
            wired: power.reported_wired(),
            battery: power.battery,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// [`report`](Self::report) on the blocking pool, for async callers
    pub async fn capture(self: &Arc<Self>, status: Status) -> Result<StatusReport, JoinError> {
        let reporter = Arc::clone(self);
        task::spawn_blocking(move || reporter.report(status)).await
    }

    /// [`compose`](Self::compose) on the blocking pool
    pub async fn capture_with(
        self: &Arc<Self>,
        status: Status,
        power: PowerSnapshot,
    ) -> Result<StatusReport, JoinError> {
        let reporter = Arc::clone(self);
        task::spawn_blocking(move || reporter.compose(status, power)).await
    }
}
