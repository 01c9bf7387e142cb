//! Transport abstraction for the registry engine.
//!
//! The engine needs very little from the message bus:
//! - `connect()` establishes the first session
//! - `publish()` that completes on the broker's acknowledgement, and
//!   `subscribe()`
//! - a pair of link signals raised on "up" and "down" edges
//! - a stream of inbound messages
//!
//! Reconnection after the first session is the transport's job; the engine
//! only observes the link edges.

mod acks;
mod mock;
mod mqtt;

pub use mock::MockTransport;
pub use mqtt::{MqttTransport, MqttTransportConfig};
pub use rumqttc::QoS;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Whether the broker replayed a retained message
    pub retained: bool,
}

impl InboundMessage {
    /// Create a live (non-retained) message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }
}

/// Link edge signals.
///
/// Each signal stays raised until a waiter observes it, and observing it
/// clears it.
#[derive(Debug, Default)]
pub struct LinkSignals {
    up: Notify,
    down: Notify,
}

impl LinkSignals {
    /// Create cleared signals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the "up" signal.
    pub fn raise_up(&self) {
        self.up.notify_one();
    }

    /// Raise the "down" signal.
    pub fn raise_down(&self) {
        self.down.notify_one();
    }

    /// Wait for the "up" signal and clear it.
    pub async fn wait_up(&self) {
        self.up.notified().await;
    }

    /// Wait for the "down" signal and clear it.
    pub async fn wait_down(&self) {
        self.down.notified().await;
    }
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection attempt failed; worth retrying.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Link failure that retrying cannot fix.
    #[error("fatal link error: {0}")]
    FatalLink(String),

    /// Publish failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscription failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Invalid MQTT broker URL.
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// Message bus used by the registry engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the first session with the broker.
    ///
    /// Calling it again once connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish a payload on a topic (never retained).
    ///
    /// Returns once delivery at `qos` is complete, so callers can bound the
    /// number of publishes in flight.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    /// Subscribe to a topic. Repeating a subscription must be harmless.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Link edge signals.
    fn link(&self) -> Arc<LinkSignals>;

    /// Take the inbound message stream. Returns `None` after the first call.
    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>>;
}
