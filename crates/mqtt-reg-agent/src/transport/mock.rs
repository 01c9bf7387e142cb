//! Mock transport for testing.
//!
//! Records subscriptions and publishes, lets tests inject inbound messages
//! and link edges, and can script connect and publish failures.

use super::{InboundMessage, LinkSignals, Transport, TransportError};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// Capacity of the injected inbound queue.
const INBOUND_CAPACITY: usize = 64;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the registry
/// owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    link: Arc<LinkSignals>,
    hold: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connect_attempts: usize,
    connect_failures: VecDeque<TransportError>,
    publish_attempts: usize,
    published: Vec<(String, Vec<u8>)>,
    fail_next_publish: Option<String>,
    subscriptions: Vec<String>,
    inbound_tx: Option<mpsc::Sender<InboundMessage>>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport.
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let inner = MockTransportInner {
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            ..MockTransportInner::default()
        };
        let (hold, _) = watch::channel(false);

        Self {
            inner: Arc::new(Mutex::new(inner)),
            link: Arc::new(LinkSignals::new()),
            hold: Arc::new(hold),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `connect()` fail with the given error.
    ///
    /// Calls queue up: each scripted failure is used once, in order.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failures.push_back(error);
    }

    /// Number of `connect()` calls so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Make the next `publish()` fail with the given reason.
    pub fn fail_next_publish(&self, reason: &str) {
        self.lock().fail_next_publish = Some(reason.to_string());
    }

    /// Number of `publish()` calls so far, including failed and held ones.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.lock().publish_attempts
    }

    /// Successfully published `(topic, payload)` pairs, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Payloads successfully published on one topic.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Forget everything published so far.
    pub fn clear_published(&self) {
        let mut inner = self.lock();
        inner.published.clear();
        inner.publish_attempts = 0;
    }

    /// Topics subscribed so far, in order, including repeats.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Park every publish until [`MockTransport::release_publishes`].
    pub fn hold_publishes(&self) {
        self.hold.send_replace(true);
    }

    /// Let parked and future publishes complete.
    pub fn release_publishes(&self) {
        self.hold.send_replace(false);
    }

    /// Deliver an inbound message.
    ///
    /// # Panics
    ///
    /// Panics if the inbound stream was closed or the queue is full.
    pub fn inject(&self, message: InboundMessage) {
        let inner = self.lock();
        inner
            .inbound_tx
            .as_ref()
            .expect("inbound stream closed")
            .try_send(message)
            .expect("inbound queue full");
    }

    /// Close the inbound stream, ending the registry's dispatch loop.
    pub fn close_inbound(&self) {
        self.lock().inbound_tx = None;
    }

    /// Raise the "up" link edge.
    pub fn link_up(&self) {
        self.link.raise_up();
    }

    /// Raise the "down" link edge.
    pub fn link_down(&self) {
        self.link.raise_down();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.lock();
            inner.connect_attempts += 1;

            if let Some(error) = inner.connect_failures.pop_front() {
                return Err(error);
            }

            if inner.connected {
                return Ok(());
            }
            inner.connected = true;
        }

        self.link.raise_up();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), TransportError> {
        self.lock().publish_attempts += 1;

        let mut hold = self.hold.subscribe();
        while *hold.borrow_and_update() {
            if hold.changed().await.is_err() {
                break;
            }
        }

        let mut inner = self.lock();
        if let Some(reason) = inner.fail_next_publish.take() {
            return Err(TransportError::Publish(reason));
        }
        inner.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn link(&self) -> Arc<LinkSignals> {
        Arc::clone(&self.link)
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.lock().inbound_rx.take()
    }
}
