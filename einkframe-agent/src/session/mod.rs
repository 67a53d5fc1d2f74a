//! Broker session
//!
//! `SessionManager` is the single owner of the broker connection. It consumes
//! [`SessionEvent`]s from an [`EventSource`], dispatches admitted display
//! messages to the pipeline, announces the device on every (re)connect and
//! runs the graceful close. Everything else talks to it through a cloneable
//! [`SessionHandle`].
//!
//! The first connection attempt must succeed: a broker that cannot be reached
//! at startup ends the session with [`SessionError::Unreachable`]. Losses
//! after that are retried forever at a fixed delay.
//!
//! Offline reporting: an unclean connection loss is covered by the last will
//! registered with the broker; a graceful close publishes the offline report
//! and then disconnects cleanly, which suppresses the will. Either way one
//! offline report is published per disconnect.

pub mod mqtt;

use crate::config::Topics;
use crate::dedup::{Admission, MessageDeduplicator, MessageId};
use crate::error::{PipelineError, RenderError, SessionError, TransportError};
use crate::pipeline::DisplayPipeline;
use crate::status::{Status, StatusReport, StatusReporter};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM
    Signal,
    /// External power lost with shutdown-on-battery enabled
    OnBattery,
}

/// Returned by [`SessionManager::run`] once the session is fully closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    pub reason: ShutdownReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub received_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected,
    /// Message on the display topic
    Message(InboundMessage),
    /// Connection lost; the next poll reconnects
    Disconnected(TransportError),
    /// Our own DISCONNECT has been flushed
    Closed,
}

/// Outbound half of the broker connection
pub trait BrokerClient: Clone + Send + Sync + 'static {
    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Inbound half of the broker connection. Polling drives the network loop,
/// including reconnects.
pub trait EventSource: Send + 'static {
    fn next_event(&mut self) -> impl Future<Output = SessionEvent> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub reconnect_delay: Duration,
    pub shutdown_grace: Duration,
}

/// Offline report registered as the last will at connect time
pub fn will_payload(reporter: &StatusReporter) -> Result<Vec<u8>, serde_json::Error> {
    reporter.report(Status::Offline).to_payload()
}

/// Cloneable access to a running session
#[derive(Clone)]
pub struct SessionHandle<C> {
    client: C,
    status_topic: Arc<str>,
    reporter: Arc<StatusReporter>,
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl<C: BrokerClient> SessionHandle<C> {
    /// Publish a prepared report on the status topic, retained
    pub async fn publish_report(&self, report: &StatusReport) -> Result<(), SessionError> {
        if self.shutdown_requested().is_some() {
            return Err(SessionError::ShuttingDown);
        }
        let payload = report.to_payload()?;
        self.client.publish(&self.status_topic, payload, true).await?;
        debug!(status = %report.status, topic = %self.status_topic, "Status published");
        Ok(())
    }

    /// Build a fresh report and publish it
    pub async fn publish_status(&self, status: Status) -> Result<(), SessionError> {
        let report = self.reporter.capture(status).await?;
        self.publish_report(&report).await
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn wait_for(&self, state: SessionState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::ShuttingDown)
    }

    /// Ask the session to close. The first reason wins.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let accepted = self.shutdown.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if accepted {
            info!(?reason, "Shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> Option<ShutdownReason> {
        *self.shutdown.borrow()
    }

    /// Resolves once a shutdown has been requested
    pub async fn shutdown_signal(&self) -> ShutdownReason {
        wait_for_shutdown(self.shutdown.subscribe()).await
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<Option<ShutdownReason>>) -> ShutdownReason {
    let requested = match rx.wait_for(Option::is_some).await {
        Ok(reason) => *reason,
        Err(_) => None,
    };
    match requested {
        Some(reason) => reason,
        // Sender lives as long as any handle or the manager
        None => std::future::pending().await,
    }
}

pub struct SessionManager<C, E> {
    client: C,
    events: E,
    topics: Topics,
    reporter: Arc<StatusReporter>,
    dedup: MessageDeduplicator,
    pipeline: DisplayPipeline,
    timing: SessionTiming,
    state: watch::Sender<SessionState>,
    shutdown: Arc<watch::Sender<Option<ShutdownReason>>>,
    renders: JoinSet<()>,
}

impl<C: BrokerClient, E: EventSource> SessionManager<C, E> {
    pub fn new(
        client: C,
        events: E,
        topics: Topics,
        reporter: Arc<StatusReporter>,
        dedup: MessageDeduplicator,
        pipeline: DisplayPipeline,
        timing: SessionTiming,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(None);
        Self {
            client,
            events,
            topics,
            reporter,
            dedup,
            pipeline,
            timing,
            state,
            shutdown: Arc::new(shutdown),
            renders: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle<C> {
        SessionHandle {
            client: self.client.clone(),
            status_topic: Arc::from(self.topics.status.as_str()),
            reporter: self.reporter.clone(),
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
    }

    /// Drive the session until a shutdown is requested and the close
    /// completes. Fails only if the first connection attempt does.
    pub async fn run(mut self) -> Result<SessionExit, SessionError> {
        info!(
            status = %self.topics.status,
            display = %self.topics.display,
            "Starting broker session"
        );
        self.set_state(SessionState::Connecting);

        let shutdown = wait_for_shutdown(self.shutdown.subscribe());
        tokio::pin!(shutdown);
        let mut established = false;

        let reason = loop {
            tokio::select! {
                biased;

                reason = &mut shutdown => break reason,

                Some(finished) = self.renders.join_next(), if !self.renders.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Display task panicked");
                        }
                    }
                }

                event = self.events.next_event() => match event {
                    SessionEvent::Connected => {
                        established = true;
                        self.on_connected().await;
                    }
                    SessionEvent::Message(message) => self.dispatch(message),
                    SessionEvent::Disconnected(e) if !established => {
                        error!(error = %e, "Broker unreachable at startup");
                        self.set_state(SessionState::Disconnected);
                        return Err(SessionError::Unreachable(e));
                    }
                    SessionEvent::Disconnected(e) => {
                        warn!(error = %e, delay_secs = self.timing.reconnect_delay.as_secs(), "Connection lost, reconnecting");
                        self.set_state(SessionState::Reconnecting);
                        tokio::select! {
                            reason = &mut shutdown => break reason,
                            _ = tokio::time::sleep(self.timing.reconnect_delay) => {}
                        }
                        debug!("Attempting reconnect");
                    }
                    SessionEvent::Closed => {
                        warn!("Connection closed without a shutdown request");
                        self.set_state(SessionState::Reconnecting);
                    }
                },
            }
        };

        self.close(reason).await;
        Ok(SessionExit { reason })
    }

    async fn on_connected(&mut self) {
        info!("Connected to broker");
        self.set_state(SessionState::Connected);

        match self.client.subscribe(&self.topics.display).await {
            Ok(()) => info!(topic = %self.topics.display, "Subscribed to display topic"),
            Err(e) => error!(topic = %self.topics.display, error = %e, "Subscribe failed"),
        }

        if let Err(e) = self.announce(Status::Online).await {
            error!(error = %e, "Failed to announce online status");
        }
    }

    async fn announce(&self, status: Status) -> Result<(), SessionError> {
        let report = self.reporter.capture(status).await?;
        self.client
            .publish(&self.topics.status, report.to_payload()?, true)
            .await?;
        Ok(())
    }

    fn dispatch(&mut self, message: InboundMessage) {
        match self.dedup.admit_at(&message.id, message.received_at, Utc::now()) {
            Admission::Admitted => {
                debug!(id = %message.id, bytes = message.payload.len(), "Display message admitted");
                let pipeline = self.pipeline.clone();
                self.renders.spawn(async move {
                    let id = message.id.clone();
                    match pipeline.process(message).await {
                        Ok(()) => {}
                        Err(PipelineError::Render(RenderError::Closed)) => {
                            debug!(id = %id, "Display message discarded at shutdown");
                        }
                        Err(e) => error!(id = %id, error = %e, "Display message failed"),
                    }
                });
            }
            rejected => {
                debug!(id = %message.id, reason = ?rejected, "Display message dropped");
            }
        }
    }

    async fn close(&mut self, reason: ShutdownReason) {
        info!(?reason, "Closing broker session");

        // Only the in-flight render finishes; queued frames are refused
        self.pipeline.close().await;
        self.renders.abort_all();

        let connected = *self.state.borrow() == SessionState::Connected;
        if connected {
            let client = &self.client;
            let events = &mut self.events;
            let status_topic = self.topics.status.as_str();
            let reporter = &self.reporter;

            let farewell = async move {
                let report = reporter.capture(Status::Offline).await?;
                client.publish(status_topic, report.to_payload()?, true).await?;
                client.disconnect().await?;
                loop {
                    match events.next_event().await {
                        SessionEvent::Closed => break,
                        SessionEvent::Disconnected(e) => return Err(SessionError::from(e)),
                        _ => continue,
                    }
                }
                Ok::<(), SessionError>(())
            };

            match tokio::time::timeout(self.timing.shutdown_grace, farewell).await {
                Ok(Ok(())) => info!("Offline status published, disconnected from broker"),
                Ok(Err(e)) => warn!(error = %e, "Disconnect did not complete cleanly"),
                Err(_) => warn!(
                    grace_secs = self.timing.shutdown_grace.as_secs(),
                    "Grace period elapsed before disconnect completed"
                ),
            }
        } else {
            debug!("Not connected, last will covers the offline report");
        }

        self.set_state(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(SessionState::Connected.to_string(), "connected");
    }
}
