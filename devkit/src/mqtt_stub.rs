/*!
Mock broker for running the agent without a real MQTT server

One `MockBroker` stands in for both the server and rumqttc: it hands out a
client and an event source wired to shared state, records every action on a
timeline, fires the registered last will when the connection drops, and lets
tests script deliveries, drops and refused connects.
*/

use chrono::Utc;
use einkframe_agent::config::Topics;
use einkframe_agent::dedup::MessageId;
use einkframe_agent::error::TransportError;
use einkframe_agent::session::{BrokerClient, EventSource, InboundMessage, SessionEvent};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl MockMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Everything the broker saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    ConnectAttempt,
    ConnectRefused,
    Connected,
    Subscribed(String),
    Published(MockMessage),
    /// Last will delivered after an unclean drop
    WillFired(MockMessage),
    /// Clean DISCONNECT from the client
    Disconnected,
    ConnectionDropped,
}

enum Injected {
    Deliver {
        topic: String,
        qos: QoS,
        pkid: u16,
        payload: Vec<u8>,
    },
    Drop,
}

#[derive(Default)]
struct BrokerState {
    timeline: Vec<BrokerAction>,
    will: Option<MockMessage>,
    subscriptions: BTreeSet<String>,
    retained: HashMap<String, MockMessage>,
    /// Requests issued while offline, flushed on the next connect
    queued: Vec<MockMessage>,
    connected: bool,
    disconnect_requested: bool,
    closed: bool,
    refuse_connects: usize,
    inject: Option<mpsc::UnboundedSender<Injected>>,
}

impl BrokerState {
    fn publish(&mut self, message: MockMessage) {
        if message.retain {
            self.retained.insert(message.topic.clone(), message.clone());
        }
        self.timeline.push(BrokerAction::Published(message));
    }
}

/// Control and inspection side of the mock broker
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    wake: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the client/event-source pair, registering `will` as last will
    pub fn transport(&self, topics: &Topics, will: Vec<u8>) -> (MockMqttClient, MockEventSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.will = Some(MockMessage {
                topic: topics.status.clone(),
                payload: will,
                retain: true,
            });
            state.inject = Some(tx);
        }
        let client = MockMqttClient {
            state: self.state.clone(),
            wake: self.wake.clone(),
        };
        let events = MockEventSource {
            state: self.state.clone(),
            wake: self.wake.clone(),
            inject: rx,
        };
        (client, events)
    }

    /// QoS 1 delivery from the broker
    pub fn deliver(&self, topic: &str, pkid: u16, payload: impl Into<Vec<u8>>) {
        self.inject(Injected::Deliver {
            topic: topic.to_string(),
            qos: QoS::AtLeastOnce,
            pkid,
            payload: payload.into(),
        });
    }

    pub fn deliver_qos0(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.inject(Injected::Deliver {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            pkid: 0,
            payload: payload.into(),
        });
    }

    /// Sever the connection as a network failure would
    pub fn drop_connection(&self) {
        self.inject(Injected::Drop);
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    fn inject(&self, message: Injected) {
        if let Some(tx) = &self.state.lock().inject {
            let _ = tx.send(message);
        }
    }

    pub fn timeline(&self) -> Vec<BrokerAction> {
        self.state.lock().timeline.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    pub fn will(&self) -> Option<MockMessage> {
        self.state.lock().will.clone()
    }

    pub fn retained(&self, topic: &str) -> Option<MockMessage> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Messages published on a topic, last will deliveries included
    pub fn published_on(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .lock()
            .timeline
            .iter()
            .filter_map(|action| match action {
                BrokerAction::Published(m) | BrokerAction::WillFired(m) if m.topic == topic => {
                    Some(m.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn last_json(&self, topic: &str) -> Option<Value> {
        self.published_on(topic).last().and_then(MockMessage::json)
    }

    /// `status` field of every report seen on the topic, in order
    pub fn statuses_on(&self, topic: &str) -> Vec<String> {
        self.published_on(topic)
            .iter()
            .filter_map(MockMessage::json)
            .filter_map(|json| json["status"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&BrokerAction) -> bool) -> usize {
        self.state.lock().timeline.iter().filter(|a| matches(a)).count()
    }
}

/// Client half handed to the agent
#[derive(Clone)]
pub struct MockMqttClient {
    state: Arc<Mutex<BrokerState>>,
    wake: Arc<Notify>,
}

impl BrokerClient for MockMqttClient {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::Closed);
        }
        state.subscriptions.insert(topic.to_string());
        state.timeline.push(BrokerAction::Subscribed(topic.to_string()));
        info!("[MOCK] Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let message = MockMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };
        let mut state = self.state.lock();
        if state.connected {
            info!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
            state.publish(message);
        } else {
            state.queued.push(message);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.lock().disconnect_requested = true;
        self.wake.notify_one();
        Ok(())
    }
}

/// Event half handed to the agent; mirrors rumqttc's poll semantics
pub struct MockEventSource {
    state: Arc<Mutex<BrokerState>>,
    wake: Arc<Notify>,
    inject: mpsc::UnboundedReceiver<Injected>,
}

impl MockEventSource {
    /// Connect attempt or clean close, when one is due
    fn step(&mut self) -> Option<SessionEvent> {
        let mut state = self.state.lock();

        if state.disconnect_requested && state.connected {
            state.connected = false;
            state.closed = true;
            state.timeline.push(BrokerAction::Disconnected);
            return Some(SessionEvent::Closed);
        }

        if !state.connected && !state.closed {
            state.timeline.push(BrokerAction::ConnectAttempt);
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                state.timeline.push(BrokerAction::ConnectRefused);
                return Some(SessionEvent::Disconnected(TransportError::Refused(
                    "scripted refusal".to_string(),
                )));
            }
            state.connected = true;
            state.subscriptions.clear();
            state.timeline.push(BrokerAction::Connected);
            for message in std::mem::take(&mut state.queued) {
                state.publish(message);
            }
            return Some(SessionEvent::Connected);
        }

        None
    }

    fn receive(&mut self, injected: Injected) -> Option<SessionEvent> {
        let mut state = self.state.lock();
        match injected {
            Injected::Deliver {
                topic,
                qos,
                pkid,
                payload,
            } => {
                if !state.connected || !state.subscriptions.contains(&topic) {
                    return None;
                }
                let id = match qos {
                    QoS::AtMostOnce => MessageId::ephemeral(),
                    _ => MessageId::from_packet(pkid, &payload),
                };
                Some(SessionEvent::Message(InboundMessage {
                    id,
                    received_at: Utc::now(),
                    payload,
                }))
            }
            Injected::Drop => {
                if !state.connected {
                    return None;
                }
                state.connected = false;
                state.timeline.push(BrokerAction::ConnectionDropped);
                if let Some(will) = state.will.clone() {
                    state.retained.insert(will.topic.clone(), will.clone());
                    state.timeline.push(BrokerAction::WillFired(will));
                }
                Some(SessionEvent::Disconnected(TransportError::Closed))
            }
        }
    }
}

impl EventSource for MockEventSource {
    async fn next_event(&mut self) -> SessionEvent {
        loop {
            if let Some(event) = self.step() {
                return event;
            }
            let closed = self.state.lock().closed;
            if closed {
                std::future::pending::<()>().await;
            }

            tokio::select! {
                injected = self.inject.recv() => match injected {
                    Some(injected) => {
                        if let Some(event) = self.receive(injected) {
                            return event;
                        }
                    }
                    None => std::future::pending::<()>().await,
                },
                _ = self.wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics {
            status: "frames/f1/status".to_string(),
            display: "frames/f1/display".to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_subscribe_publish() {
        let broker = MockBroker::new();
        let (client, mut events) = broker.transport(&topics(), b"offline".to_vec());

        assert!(matches!(events.next_event().await, SessionEvent::Connected));
        client.subscribe("frames/f1/display").await.unwrap();
        client
            .publish("frames/f1/status", b"{\"status\":\"online\"}".to_vec(), true)
            .await
            .unwrap();

        assert_eq!(broker.subscriptions(), vec!["frames/f1/display"]);
        assert_eq!(broker.statuses_on("frames/f1/status"), vec!["online"]);
        assert!(broker.retained("frames/f1/status").is_some());
    }

    #[tokio::test]
    async fn test_drop_fires_will_and_reconnects() {
        let broker = MockBroker::new();
        let (_client, mut events) = broker.transport(&topics(), b"offline".to_vec());
        events.next_event().await;

        broker.drop_connection();
        assert!(matches!(
            events.next_event().await,
            SessionEvent::Disconnected(_)
        ));
        assert_eq!(broker.retained("frames/f1/status").unwrap().payload, b"offline");

        assert!(matches!(events.next_event().await, SessionEvent::Connected));
        assert_eq!(broker.count(|a| *a == BrokerAction::ConnectAttempt), 2);
    }

    #[tokio::test]
    async fn test_clean_disconnect_suppresses_will() {
        let broker = MockBroker::new();
        let (client, mut events) = broker.transport(&topics(), b"offline".to_vec());
        events.next_event().await;

        client.disconnect().await.unwrap();
        assert!(matches!(events.next_event().await, SessionEvent::Closed));
        assert_eq!(broker.count(|a| matches!(a, BrokerAction::WillFired(_))), 0);
    }

    #[tokio::test]
    async fn test_refused_connect_then_success() {
        let broker = MockBroker::new();
        broker.refuse_connects(1);
        let (_client, mut events) = broker.transport(&topics(), Vec::new());

        assert!(matches!(
            events.next_event().await,
            SessionEvent::Disconnected(TransportError::Refused(_))
        ));
        assert!(matches!(events.next_event().await, SessionEvent::Connected));
    }

    #[tokio::test]
    async fn test_publish_while_offline_is_queued() {
        let broker = MockBroker::new();
        let (client, mut events) = broker.transport(&topics(), Vec::new());

        client.publish("frames/f1/status", b"x".to_vec(), false).await.unwrap();
        assert!(broker.published_on("frames/f1/status").is_empty());

        events.next_event().await;
        assert_eq!(broker.published_on("frames/f1/status").len(), 1);
    }
}
