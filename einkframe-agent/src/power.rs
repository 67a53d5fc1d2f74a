//! Power monitor collaborator
//!
//! The frame may run from mains or from a battery HAT. Boards without a
//! battery chip use [`NoBattery`]; the PiJuice HAT is read over I2C when the
//! `pijuice` feature is enabled. Read failures never propagate past
//! [`PowerSnapshot::read`]: unknown values are reported as such.

use crate::error::PowerError;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, warn};

pub trait PowerMonitor: Send + Sync {
    /// True while external power is present
    fn wired(&self) -> Result<bool, PowerError>;

    /// Charge in percent, `None` when the board has no battery gauge
    fn charge_level(&self) -> Result<Option<u8>, PowerError>;

    /// Arm the board for power-off once the OS has halted
    fn prepare_shutdown(&self) -> Result<(), PowerError>;
}

/// One reading of the power monitor, with failures mapped to unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerSnapshot {
    pub wired: Option<bool>,
    pub battery: Option<u8>,
}

impl PowerSnapshot {
    pub fn read(monitor: &dyn PowerMonitor) -> Self {
        let wired = match monitor.wired() {
            Ok(wired) => Some(wired),
            Err(e) => {
                warn!(error = %e, "Error reading power input status");
                None
            }
        };
        let battery = match monitor.charge_level() {
            Ok(level) => level,
            Err(e) => {
                warn!(error = %e, "Error reading charge level");
                None
            }
        };
        debug!(?wired, ?battery, "Power snapshot");
        Self { wired, battery }
    }

    /// [`read`](Self::read) on the blocking pool; bus transfers can stall
    pub async fn capture(monitor: Arc<dyn PowerMonitor>) -> Self {
        match task::spawn_blocking(move || Self::read(monitor.as_ref())).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Power read worker failed");
                Self::default()
            }
        }
    }

    /// Value for the `wired` report field; unknown counts as not wired
    pub fn reported_wired(&self) -> bool {
        self.wired.unwrap_or(false)
    }

    /// Only a positive "not wired" reading means we are on battery
    pub fn on_battery(&self) -> bool {
        self.wired == Some(false)
    }
}

/// Mains-only board: always wired, no charge gauge
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBattery;

impl PowerMonitor for NoBattery {
    fn wired(&self) -> Result<bool, PowerError> {
        Ok(true)
    }

    fn charge_level(&self) -> Result<Option<u8>, PowerError> {
        Ok(None)
    }

    fn prepare_shutdown(&self) -> Result<(), PowerError> {
        debug!("No power board present, nothing to prepare");
        Ok(())
    }
}

#[cfg(feature = "pijuice")]
pub use pijuice::PiJuice;

#[cfg(feature = "pijuice")]
mod pijuice {
    use super::PowerMonitor;
    use crate::error::PowerError;
    use parking_lot::Mutex;
    use rppal::i2c::I2c;
    use tracing::info;

    const BUS: u8 = 1;
    const ADDRESS: u16 = 0x14;

    const CMD_STATUS: u8 = 0x40;
    const CMD_CHARGE_LEVEL: u8 = 0x41;
    const CMD_POWER_OFF: u8 = 0x62;
    const CMD_SYSTEM_POWER_SWITCH: u8 = 0x63;

    /// Seconds between the OS halt and the HAT cutting power
    const POWER_OFF_DELAY_SECS: u8 = 5;

    /// powerInput field of the status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PowerInput {
        NotPresent,
        Bad,
        Weak,
        Present,
    }

    pub struct PiJuice {
        bus: Mutex<I2c>,
    }

    impl PiJuice {
        pub fn open() -> Result<Self, PowerError> {
            let mut bus = I2c::with_bus(BUS).map_err(|e| PowerError::Unavailable(e.to_string()))?;
            bus.set_slave_address(ADDRESS)
                .map_err(|e| PowerError::Unavailable(e.to_string()))?;
            info!("PiJuice opened on i2c-{} at {:#04x}", BUS, ADDRESS);
            Ok(Self {
                bus: Mutex::new(bus),
            })
        }

        fn read(&self, command: u8, len: usize) -> Result<Vec<u8>, PowerError> {
            let mut buf = vec![0u8; len + 1];
            self.bus
                .lock()
                .block_read(command, &mut buf)
                .map_err(|e| PowerError::Bus(e.to_string()))?;
            let checksum = buf.pop().unwrap_or_default();
            if super::checksum(&buf) != checksum {
                return Err(PowerError::Checksum);
            }
            Ok(buf)
        }

        fn write(&self, command: u8, data: &[u8]) -> Result<(), PowerError> {
            let mut frame = data.to_vec();
            frame.push(super::checksum(data));
            self.bus
                .lock()
                .block_write(command, &frame)
                .map_err(|e| PowerError::Bus(e.to_string()))
        }

        fn power_input(&self) -> Result<PowerInput, PowerError> {
            let status = self.read(CMD_STATUS, 1)?;
            Ok(match (status[0] >> 4) & 0x03 {
                0 => PowerInput::NotPresent,
                1 => PowerInput::Bad,
                2 => PowerInput::Weak,
                _ => PowerInput::Present,
            })
        }
    }

    impl PowerMonitor for PiJuice {
        fn wired(&self) -> Result<bool, PowerError> {
            Ok(self.power_input()? == PowerInput::Present)
        }

        fn charge_level(&self) -> Result<Option<u8>, PowerError> {
            let level = self.read(CMD_CHARGE_LEVEL, 1)?;
            Ok(Some(level[0].min(100)))
        }

        fn prepare_shutdown(&self) -> Result<(), PowerError> {
            self.write(CMD_SYSTEM_POWER_SWITCH, &[0])?;
            self.write(CMD_POWER_OFF, &[POWER_OFF_DELAY_SECS])?;
            info!("PiJuice armed to cut power in {}s", POWER_OFF_DELAY_SECS);
            Ok(())
        }
    }
}

/// PiJuice frame checksum: XOR of all bytes, inverted
#[cfg_attr(not(feature = "pijuice"), allow(dead_code))]
fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl PowerMonitor for Broken {
        fn wired(&self) -> Result<bool, PowerError> {
            Err(PowerError::Bus("nack".into()))
        }
        fn charge_level(&self) -> Result<Option<u8>, PowerError> {
            Err(PowerError::Checksum)
        }
        fn prepare_shutdown(&self) -> Result<(), PowerError> {
            Ok(())
        }
    }

    #[test]
    fn test_no_battery_reads_as_wired() {
        let snapshot = PowerSnapshot::read(&NoBattery);
        assert_eq!(snapshot.wired, Some(true));
        assert_eq!(snapshot.battery, None);
        assert!(!snapshot.on_battery());
    }

    #[test]
    fn test_read_errors_become_unknown() {
        let snapshot = PowerSnapshot::read(&Broken);
        assert_eq!(snapshot, PowerSnapshot::default());
        assert!(!snapshot.reported_wired());
        assert!(!snapshot.on_battery());
    }

    #[tokio::test]
    async fn test_capture_maps_errors_to_unknown() {
        assert_eq!(PowerSnapshot::capture(Arc::new(Broken)).await, PowerSnapshot::default());
        assert_eq!(
            PowerSnapshot::capture(Arc::new(NoBattery)).await.wired,
            Some(true)
        );
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[]), 0xFF);
        assert_eq!(checksum(&[0x0F]), 0xF0);
        assert_eq!(checksum(&[0x12, 0x34]), 0xFF ^ 0x12 ^ 0x34);
    }
}
