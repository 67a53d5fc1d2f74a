/*!
Test harness for the einkframe agent

Builds the real runtime (session, dedup, render gate, scheduler) around the
mock broker and mock hardware. Timings are the production defaults; run the
tests with `#[tokio::test(start_paused = true)]` so they complete instantly.
*/

use crate::hardware_stub::{MockIndicator, MockPanel, MockPowerMonitor};
use crate::mqtt_stub::{MockBroker, MockMqttClient};
use anyhow::{Context, Result};
use einkframe_agent::config::{AgentConfig, Topics};
use einkframe_agent::decode::RawFrameDecoder;
use einkframe_agent::runtime::{Collaborators, Runtime};
use einkframe_agent::session::{SessionExit, SessionHandle, ShutdownReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub const DEVICE_ID: &str = "b8:27:eb:00:00:01";
pub const FRAME_WIDTH: u32 = 8;
pub const FRAME_HEIGHT: u32 = 4;

const CONFIG: &str = r#"
mqtt:
  broker: localhost
  port: 1883
  client_id: einkframe-test
  topic_device_status: "frames/{device_id}/status"
  topic_image_display: "frames/{device_id}/display"
device:
  should_shutdown_on_battery: false
  halt_host_on_shutdown: false
screen:
  width: 8
  height: 4
  driver: log
"#;

pub struct TestHarness {
    pub broker: MockBroker,
    pub panel: MockPanel,
    pub power: MockPowerMonitor,
    pub indicator: MockIndicator,
    pub config: AgentConfig,
    pub topics: Topics,
}

impl TestHarness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn,einkframe_agent=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let config = match AgentConfig::from_yaml(CONFIG) {
            Ok(config) => config,
            Err(e) => panic!("harness config is invalid: {e}"),
        };
        let topics = Topics::resolve(&config.mqtt, DEVICE_ID);

        Self {
            broker: MockBroker::new(),
            panel: MockPanel::new(),
            power: MockPowerMonitor::new(true, Some(87)),
            indicator: MockIndicator::default(),
            config,
            topics,
        }
    }

    pub fn with_shutdown_on_battery(mut self) -> Self {
        self.config.device.should_shutdown_on_battery = true;
        self
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            panel: Box::new(self.panel.clone()),
            decoder: Arc::new(RawFrameDecoder::new(FRAME_WIDTH, FRAME_HEIGHT)),
            power: Arc::new(self.power.clone()),
            indicator: Arc::new(self.indicator.clone()),
        }
    }

    /// Spawn the agent against the mock broker
    pub fn start(&self) -> Result<RunningAgent> {
        let broker = self.broker.clone();
        let runtime = Runtime::new(
            &self.config,
            DEVICE_ID.to_string(),
            self.collaborators(),
            move |topics, will| broker.transport(topics, will),
        )
        .context("Failed to assemble runtime")?;

        let handle = runtime.handle();
        let task = tokio::spawn(runtime.run());
        info!("Test agent started");
        Ok(RunningAgent { handle, task })
    }

    /// A full frame in 8-bit grey
    pub fn frame(&self, shade: u8) -> Vec<u8> {
        vec![shade; (FRAME_WIDTH * FRAME_HEIGHT) as usize]
    }

    /// Wait until the agent is subscribed and has announced itself `count` times
    pub async fn wait_online(&self, count: usize) -> bool {
        wait_until(Duration::from_secs(30), || {
            !self.broker.subscriptions().is_empty() && self.online_reports() >= count
        })
        .await
    }

    pub fn online_reports(&self) -> usize {
        self.status_reports("online")
    }

    pub fn offline_reports(&self) -> usize {
        self.status_reports("offline")
    }

    fn status_reports(&self, status: &str) -> usize {
        self.broker
            .statuses_on(&self.topics.status)
            .iter()
            .filter(|s| s.as_str() == status)
            .count()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunningAgent {
    pub handle: SessionHandle<MockMqttClient>,
    task: JoinHandle<Result<SessionExit>>,
}

impl RunningAgent {
    /// Request a shutdown and wait for the runtime to finish
    pub async fn shutdown(self, reason: ShutdownReason) -> Result<SessionExit> {
        self.handle.request_shutdown(reason);
        self.join().await
    }

    pub async fn join(self) -> Result<SessionExit> {
        self.task.await.context("Agent task panicked")?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
