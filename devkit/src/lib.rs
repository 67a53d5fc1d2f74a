/*!
# einkframe DevKit

Test doubles for running the agent without a broker or frame hardware:
- Mock broker (client + event source) recording everything on a timeline
- Mock panel, power monitor and indicator
- A harness that assembles the real runtime around the mocks
*/

pub mod hardware_stub;
pub mod mqtt_stub;
pub mod test_utils;

pub use hardware_stub::{MockIndicator, MockPanel, MockPowerMonitor, RenderSpan};
pub use mqtt_stub::{BrokerAction, MockBroker, MockEventSource, MockMessage, MockMqttClient};
pub use test_utils::{wait_until, RunningAgent, TestHarness};
