//! rumqttc transport

use super::{BrokerClient, EventSource, InboundMessage, SessionEvent};
use crate::config::{MqttConfig, Topics};
use crate::dedup::MessageId;
use crate::error::TransportError;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS, Transport,
};
use std::time::Duration;
use tracing::{debug, trace};

/// Outstanding client requests before publish/subscribe calls wait
const REQUEST_CAPACITY: usize = 32;

/// Build the client and its network loop. Nothing touches the network until
/// the event source is polled.
pub fn connect(
    config: &MqttConfig,
    client_id: &str,
    topics: &Topics,
    will: Vec<u8>,
) -> (AsyncClient, MqttEventSource) {
    let mut options = MqttOptions::new(client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(&topics.status, will, QoS::AtLeastOnce, true));

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    if config.use_tls() {
        options.set_transport(Transport::tls_with_default_config());
    }

    debug!(
        broker = %config.broker,
        port = config.port,
        client_id,
        tls = config.use_tls(),
        "MQTT options prepared"
    );

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let events = MqttEventSource {
        eventloop,
        display_topic: topics.display.clone(),
    };
    (client, events)
}

impl BrokerClient for AsyncClient {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        AsyncClient::disconnect(self).await?;
        Ok(())
    }
}

pub struct MqttEventSource {
    eventloop: EventLoop,
    display_topic: String,
}

impl EventSource for MqttEventSource {
    async fn next_event(&mut self) -> SessionEvent {
        loop {
            match self.eventloop.poll().await {
                Ok(event) => {
                    if let Some(event) = map_event(&self.display_topic, event) {
                        return event;
                    }
                }
                Err(e) => return SessionEvent::Disconnected(e.into()),
            }
        }
    }
}

/// Translate one rumqttc event. `None` for events the session ignores.
fn map_event(display_topic: &str, event: Event) -> Option<SessionEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                Some(SessionEvent::Connected)
            } else {
                Some(SessionEvent::Disconnected(TransportError::Refused(format!(
                    "{:?}",
                    ack.code
                ))))
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            if publish.topic != display_topic {
                debug!(topic = %publish.topic, "Ignoring message on unexpected topic");
                return None;
            }
            let id = match publish.qos {
                QoS::AtMostOnce => MessageId::ephemeral(),
                _ => MessageId::from_packet(publish.pkid, &publish.payload),
            };
            Some(SessionEvent::Message(InboundMessage {
                id,
                received_at: Utc::now(),
                payload: publish.payload.to_vec(),
            }))
        }
        Event::Incoming(Packet::Disconnect) => {
            Some(SessionEvent::Disconnected(TransportError::Closed))
        }
        Event::Outgoing(Outgoing::Disconnect) => Some(SessionEvent::Closed),
        event => {
            trace!(?event, "MQTT event");
            None
        }
    }
}
