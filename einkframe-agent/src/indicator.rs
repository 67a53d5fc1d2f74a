//! Activity LED

use std::time::Duration;
use tracing::debug;

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const BLINKS: u32 = 2;
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const BLINK_HALF_PERIOD: Duration = Duration::from_millis(500);

/// Blocking indicator; callers run it on the blocking pool
pub trait Indicator: Send + Sync {
    fn blink(&self);
}

/// Board without an LED wired up
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn blink(&self) {
        debug!("No indicator configured, skipping blink");
    }
}

#[cfg(feature = "gpio")]
pub use gpio::GpioIndicator;

#[cfg(feature = "gpio")]
mod gpio {
    use super::{Indicator, BLINKS, BLINK_HALF_PERIOD};
    use crate::error::IndicatorError;
    use parking_lot::Mutex;
    use rppal::gpio::{Gpio, OutputPin};
    use tracing::info;

    pub struct GpioIndicator {
        pin: Mutex<OutputPin>,
    }

    impl GpioIndicator {
        pub fn open(bcm_pin: u8) -> Result<Self, IndicatorError> {
            let pin = Gpio::new()
                .and_then(|gpio| gpio.get(bcm_pin))
                .map_err(|e| IndicatorError::Unavailable(e.to_string()))?
                .into_output_low();
            info!("Status LED on GPIO {}", bcm_pin);
            Ok(Self {
                pin: Mutex::new(pin),
            })
        }
    }

    impl Indicator for GpioIndicator {
        fn blink(&self) {
            let mut pin = self.pin.lock();
            for _ in 0..BLINKS {
                pin.set_high();
                std::thread::sleep(BLINK_HALF_PERIOD);
                pin.set_low();
                std::thread::sleep(BLINK_HALF_PERIOD);
            }
        }
    }
}
