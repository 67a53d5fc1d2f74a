//! End-to-end scenarios: the real agent runtime against the mock broker and
//! mock frame hardware, on a paused clock.

use einkframe_agent::session::{SessionState, ShutdownReason};
use einkframe_devkit::mqtt_stub::BrokerAction;
use einkframe_devkit::test_utils::{wait_until, TestHarness, DEVICE_ID};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn test_boot_registers_will_subscribes_and_announces_online() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    let will = harness.broker.will().expect("last will registered");
    assert_eq!(will.topic, harness.topics.status);
    assert!(will.retain);
    let will = will.json().unwrap();
    assert_eq!(will["status"], "offline");
    assert_eq!(will["mac"], DEVICE_ID);

    assert_eq!(harness.broker.subscriptions(), vec![harness.topics.display.clone()]);

    let online = harness.broker.retained(&harness.topics.status).unwrap();
    let online = online.json().unwrap();
    assert_eq!(online["status"], "online");
    assert_eq!(online["wired"], true);
    assert_eq!(online["battery"], 87);
    assert!(online["hostname"].is_string());
    assert!(online["ip_address"].is_string());
    assert!(online["timestamp"].is_i64());

    assert_eq!(agent.handle.state(), SessionState::Connected);
    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_renders_once() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    let frame = harness.frame(0x80);
    harness.broker.deliver(&harness.topics.display, 1, frame.clone());
    harness.broker.deliver(&harness.topics.display, 1, frame);

    assert!(wait_until(Duration::from_secs(10), || harness.panel.frames() == 1).await);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.panel.frames(), 1);
    assert_eq!(harness.panel.sleeps(), 1);
    assert_eq!(harness.indicator.blinks(), 1);

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_qos0_deliveries_are_never_deduplicated() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.broker.deliver_qos0(&harness.topics.display, harness.frame(1));
    harness.broker.deliver_qos0(&harness.topics.display, harness.frame(1));

    assert!(wait_until(Duration::from_secs(30), || harness.panel.frames() == 2).await);
    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renders_never_overlap_and_settle_between_frames() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    for pkid in 1..=3u16 {
        harness
            .broker
            .deliver(&harness.topics.display, pkid, harness.frame(pkid as u8));
    }

    assert!(wait_until(Duration::from_secs(60), || harness.panel.frames() == 3).await);
    assert_eq!(harness.panel.max_concurrent(), 1);

    let spans = harness.panel.spans();
    for pair in spans.windows(2) {
        assert!(pair[1].started >= pair[0].finished + SETTLE);
    }

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_render_releases_the_panel() {
    let harness = TestHarness::new();
    harness.panel.fail_displays(1);
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.broker.deliver(&harness.topics.display, 1, harness.frame(1));
    assert!(wait_until(Duration::from_secs(10), || harness.panel.sleeps() == 1).await);

    assert_eq!(harness.indicator.blinks(), 0);

    harness.broker.deliver(&harness.topics.display, 2, harness.frame(2));
    assert!(wait_until(Duration::from_secs(20), || harness.indicator.blinks() == 1).await);

    assert_eq!(harness.panel.frames(), 1);
    assert_eq!(harness.panel.sleeps(), 2);
    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connection_drop_reports_offline_once_and_reconnects() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    let dropped_at = tokio::time::Instant::now();
    harness.broker.drop_connection();

    assert!(
        wait_until(Duration::from_secs(5), || {
            agent.handle.state() == SessionState::Reconnecting
        })
        .await
    );
    assert_eq!(harness.offline_reports(), 1);
    assert_eq!(
        harness.broker.retained(&harness.topics.status).unwrap().json().unwrap()["status"],
        "offline"
    );

    assert!(harness.wait_online(2).await);
    assert!(tokio::time::Instant::now() >= dropped_at + Duration::from_secs(5));
    assert_eq!(harness.offline_reports(), 1);
    assert_eq!(harness.broker.subscriptions(), vec![harness.topics.display.clone()]);
    assert_eq!(
        harness.broker.retained(&harness.topics.status).unwrap().json().unwrap()["status"],
        "online"
    );

    let timeline = harness.broker.timeline();
    let drop = timeline
        .iter()
        .position(|a| *a == BrokerAction::ConnectionDropped)
        .unwrap();
    assert!(matches!(timeline[drop + 1], BrokerAction::WillFired(_)));
    assert_eq!(timeline[drop + 2], BrokerAction::ConnectAttempt);

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
    assert_eq!(harness.offline_reports(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_is_fatal_at_startup() {
    let harness = TestHarness::new();
    harness.broker.refuse_connects(usize::MAX);
    let agent = harness.start().unwrap();
    let handle = agent.handle.clone();

    let exit = tokio::time::timeout(Duration::from_secs(30), agent.join())
        .await
        .expect("agent gives up on an unreachable broker");

    assert!(exit.is_err());
    assert_eq!(
        harness.broker.count(|a| *a == BrokerAction::ConnectRefused),
        1
    );
    assert_eq!(harness.online_reports(), 0);
    assert_eq!(handle.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_refused_reconnects_are_retried() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.broker.refuse_connects(2);
    harness.broker.drop_connection();

    assert!(harness.wait_online(2).await);
    assert_eq!(
        harness.broker.count(|a| *a == BrokerAction::ConnectRefused),
        2
    );
    assert_eq!(harness.offline_reports(), 1);

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_on_battery_policy_shuts_down() {
    let harness = TestHarness::new().with_shutdown_on_battery();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.power.set_wired(Some(false));
    let exit = agent.join().await.unwrap();

    assert_eq!(exit.reason, ShutdownReason::OnBattery);
    assert_eq!(harness.power.shutdowns_prepared(), 1);
    assert_eq!(
        harness.broker.statuses_on(&harness.topics.status),
        vec!["online", "offline"]
    );
    assert_eq!(
        harness.broker.count(|a| matches!(a, BrokerAction::WillFired(_))),
        0
    );
    assert_eq!(
        harness.broker.timeline().last(),
        Some(&BrokerAction::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_without_policy_keeps_reporting() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.power.set_wired(Some(false));
    harness.power.set_battery(Some(42));
    assert!(wait_until(Duration::from_secs(90), || harness.online_reports() >= 2).await);

    let report = harness.broker.last_json(&harness.topics.status).unwrap();
    assert_eq!(report["status"], "online");
    assert_eq!(report["wired"], false);
    assert_eq!(report["battery"], 42);
    assert!(!agent.is_finished());

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
    assert_eq!(harness.power.shutdowns_prepared(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_power_state_never_shuts_down() {
    let harness = TestHarness::new().with_shutdown_on_battery();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.power.set_wired(None);
    assert!(wait_until(Duration::from_secs(90), || harness.online_reports() >= 2).await);

    let report = harness.broker.last_json(&harness.topics.status).unwrap();
    assert_eq!(report["wired"], false);
    assert!(!agent.is_finished());

    let exit = agent.shutdown(ShutdownReason::Signal).await.unwrap();
    assert_eq!(exit.reason, ShutdownReason::Signal);
    assert_eq!(harness.power.shutdowns_prepared(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_publishes_offline_once() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    let handle = agent.handle.clone();
    let exit = agent.shutdown(ShutdownReason::Signal).await.unwrap();

    assert_eq!(exit.reason, ShutdownReason::Signal);
    assert_eq!(handle.state(), SessionState::Disconnected);
    assert_eq!(harness.offline_reports(), 1);
    assert_eq!(
        harness.broker.count(|a| matches!(a, BrokerAction::WillFired(_))),
        0
    );
    assert_eq!(
        harness.broker.retained(&harness.topics.status).unwrap().json().unwrap()["status"],
        "offline"
    );
    assert!(handle.publish_status(einkframe_agent::status::Status::Online).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_reconnecting_relies_on_will() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.broker.drop_connection();
    assert!(
        wait_until(Duration::from_secs(5), || {
            agent.handle.state() == SessionState::Reconnecting
        })
        .await
    );

    agent.shutdown(ShutdownReason::Signal).await.unwrap();
    assert_eq!(harness.offline_reports(), 1);
    assert_eq!(harness.broker.count(|a| *a == BrokerAction::Disconnected), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_inflight_render() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    harness.broker.deliver(&harness.topics.display, 9, harness.frame(9));
    assert!(wait_until(Duration::from_secs(5), || harness.panel.frames() == 1).await);

    agent.shutdown(ShutdownReason::Signal).await.unwrap();

    let finished = harness.panel.spans()[0].finished;
    assert!(tokio::time::Instant::now() >= finished + SETTLE);
    assert_eq!(harness.offline_reports(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_discards_queued_frames() {
    let harness = TestHarness::new();
    let agent = harness.start().unwrap();
    assert!(harness.wait_online(1).await);

    for pkid in 1..=4u16 {
        harness
            .broker
            .deliver(&harness.topics.display, pkid, harness.frame(pkid as u8));
    }
    assert!(wait_until(Duration::from_secs(5), || harness.panel.frames() == 1).await);

    let requested = tokio::time::Instant::now();
    agent.shutdown(ShutdownReason::Signal).await.unwrap();

    assert!(tokio::time::Instant::now() < requested + SETTLE * 2);
    assert_eq!(harness.panel.frames(), 1);
    assert_eq!(harness.panel.sleeps(), 1);
    assert_eq!(harness.indicator.blinks(), 1);
    assert_eq!(harness.offline_reports(), 1);
}
