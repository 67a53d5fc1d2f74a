//! Periodic status heartbeat and shutdown-on-battery policy

use crate::power::{PowerMonitor, PowerSnapshot};
use crate::session::{BrokerClient, SessionHandle, SessionState, ShutdownReason};
use crate::status::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownPolicy {
    pub shutdown_on_battery: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    PublishOnline,
    Shutdown,
}

/// Shut down only on a positive "not wired" reading with the policy enabled.
/// An unknown power state keeps the device running.
pub fn decide(policy: ShutdownPolicy, snapshot: &PowerSnapshot) -> TickAction {
    if policy.shutdown_on_battery && snapshot.on_battery() {
        TickAction::Shutdown
    } else {
        TickAction::PublishOnline
    }
}

pub struct StatusScheduler<C> {
    session: SessionHandle<C>,
    power: Arc<dyn PowerMonitor>,
    policy: ShutdownPolicy,
    period: Duration,
}

impl<C: BrokerClient> StatusScheduler<C> {
    pub fn new(
        session: SessionHandle<C>,
        power: Arc<dyn PowerMonitor>,
        policy: ShutdownPolicy,
        period: Duration,
    ) -> Self {
        Self {
            session,
            power,
            policy,
            period,
        }
    }

    /// One heartbeat. Returns the action that was taken.
    pub async fn tick(&self) -> TickAction {
        let snapshot = PowerSnapshot::capture(self.power.clone()).await;

        match decide(self.policy, &snapshot) {
            TickAction::Shutdown => {
                warn!(battery = ?snapshot.battery, "Running on battery, shutting down");
                self.session.request_shutdown(ShutdownReason::OnBattery);
                TickAction::Shutdown
            }
            TickAction::PublishOnline => {
                let state = self.session.state();
                if state != SessionState::Connected {
                    debug!(%state, "Skipping heartbeat while not connected");
                    return TickAction::PublishOnline;
                }
                let report = match self
                    .session
                    .reporter()
                    .capture_with(Status::Online, snapshot)
                    .await
                {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "Failed to build heartbeat");
                        return TickAction::PublishOnline;
                    }
                };
                if let Err(e) = self.session.publish_report(&report).await {
                    error!(error = %e, "Failed to publish heartbeat");
                }
                TickAction::PublishOnline
            }
        }
    }

    /// Tick every period until shutdown. The first tick is one period out.
    pub async fn run(self) {
        info!(period_secs = self.period.as_secs(), "Status scheduler started");

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.session.shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                _ = ticker.tick() => {
                    if self.tick().await == TickAction::Shutdown {
                        break;
                    }
                }
            }
        }

        debug!("Status scheduler stopped");
    }
}
