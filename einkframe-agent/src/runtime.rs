//! Agent wiring and lifecycle
//!
//! Builds the hardware collaborators from configuration, assembles the
//! session and scheduler around a broker transport, and runs the power-off
//! sequence once the session has closed for an on-battery shutdown.

use crate::config::{AgentConfig, PanelDriver, Topics};
use crate::decode::{ImageDecoder, RawFrameDecoder};
use crate::dedup::MessageDeduplicator;
use crate::execution;
use crate::indicator::{Indicator, NoIndicator};
use crate::pipeline::DisplayPipeline;
use crate::power::{NoBattery, PowerMonitor};
use crate::render::{EinkPanel, FilePanel, LoggingPanel, RenderGate};
use crate::scheduler::{ShutdownPolicy, StatusScheduler};
use crate::session::{
    will_payload, BrokerClient, EventSource, SessionExit, SessionHandle, SessionManager,
    SessionTiming, ShutdownReason,
};
use crate::status::StatusReporter;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task;
use tracing::{error, info, warn};

/// Hardware-facing collaborators, chosen once at startup
pub struct Collaborators {
    pub panel: Box<dyn EinkPanel>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub power: Arc<dyn PowerMonitor>,
    pub indicator: Arc<dyn Indicator>,
}

impl Collaborators {
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let screen = &config.screen;

        let panel: Box<dyn EinkPanel> = match screen.driver {
            PanelDriver::Log => Box::new(LoggingPanel::default()),
            PanelDriver::File => {
                let path = screen
                    .output_path
                    .as_ref()
                    .context("screen.output_path is required for the file driver")?;
                Box::new(FilePanel::open(path).context("Failed to open file panel")?)
            }
        };
        info!(driver = ?screen.driver, width = screen.width, height = screen.height, "Panel ready");

        Ok(Self {
            panel,
            decoder: Arc::new(RawFrameDecoder::new(screen.width, screen.height)),
            power: power_monitor(),
            indicator: indicator(config.device.led_pin),
        })
    }
}

#[cfg(feature = "pijuice")]
fn power_monitor() -> Arc<dyn PowerMonitor> {
    match crate::power::PiJuice::open() {
        Ok(pijuice) => Arc::new(pijuice),
        Err(e) => {
            warn!(error = %e, "PiJuice not available, assuming mains power");
            Arc::new(NoBattery)
        }
    }
}

#[cfg(not(feature = "pijuice"))]
fn power_monitor() -> Arc<dyn PowerMonitor> {
    Arc::new(NoBattery)
}

fn indicator(led_pin: Option<u8>) -> Arc<dyn Indicator> {
    let Some(pin) = led_pin else {
        return Arc::new(NoIndicator);
    };

    #[cfg(feature = "gpio")]
    {
        match crate::indicator::GpioIndicator::open(pin) {
            Ok(led) => return Arc::new(led),
            Err(e) => warn!(pin, error = %e, "Status LED not available"),
        }
    }
    #[cfg(not(feature = "gpio"))]
    warn!(pin, "led_pin is set but the gpio feature is not enabled");

    Arc::new(NoIndicator)
}

pub struct Runtime<C, E> {
    session: SessionManager<C, E>,
    scheduler: StatusScheduler<C>,
    power: Arc<dyn PowerMonitor>,
    halt_host: bool,
}

impl<C: BrokerClient, E: EventSource> Runtime<C, E> {
    /// Assemble the agent. `connect` receives the resolved topics and the
    /// last-will payload and returns the transport halves.
    pub fn new<F>(
        config: &AgentConfig,
        device_id: String,
        parts: Collaborators,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Topics, Vec<u8>) -> (C, E),
    {
        let topics = Topics::resolve(&config.mqtt, &device_id);
        let reporter = Arc::new(StatusReporter::new(device_id, parts.power.clone()));
        let will = will_payload(&reporter).context("Failed to serialize last will")?;
        let (client, events) = connect(&topics, will);

        let timing = &config.timing;
        let gate = RenderGate::new(parts.panel, timing.render_settle())
            .with_indicator(parts.indicator);
        let pipeline = DisplayPipeline::new(parts.decoder, Arc::new(gate));

        let session = SessionManager::new(
            client,
            events,
            topics,
            reporter,
            MessageDeduplicator::new(timing.dedup_ttl()),
            pipeline,
            SessionTiming {
                reconnect_delay: timing.reconnect_delay(),
                shutdown_grace: timing.shutdown_grace(),
            },
        );
        let scheduler = StatusScheduler::new(
            session.handle(),
            parts.power.clone(),
            ShutdownPolicy {
                shutdown_on_battery: config.device.should_shutdown_on_battery,
            },
            timing.heartbeat(),
        );

        Ok(Self {
            session,
            scheduler,
            power: parts.power,
            halt_host: config.device.halt_host_on_shutdown,
        })
    }

    pub fn handle(&self) -> SessionHandle<C> {
        self.session.handle()
    }

    /// Run until shutdown. On-battery exits arm the power board and, if
    /// configured, halt the host. An unreachable broker at startup is an
    /// error.
    pub async fn run(self) -> Result<SessionExit> {
        let scheduler = tokio::spawn(self.scheduler.run());
        let exit = match self.session.run().await {
            Ok(exit) => exit,
            Err(e) => {
                scheduler.abort();
                return Err(e).context("Broker session failed to start");
            }
        };

        if let Err(e) = scheduler.await {
            error!(error = %e, "Status scheduler task failed");
        }
        info!(reason = ?exit.reason, "Session closed");

        if exit.reason == ShutdownReason::OnBattery {
            let power = self.power.clone();
            match task::spawn_blocking(move || power.prepare_shutdown()).await {
                Ok(Ok(())) => info!("Power board armed for shutdown"),
                Ok(Err(e)) => error!(error = %e, "Failed to arm power board for shutdown"),
                Err(e) => error!(error = %e, "Power board worker failed"),
            }
            if self.halt_host {
                execution::halt_host()
                    .await
                    .context("Failed to halt host")?;
            }
        }

        Ok(exit)
    }
}
