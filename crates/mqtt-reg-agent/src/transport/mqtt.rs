//! `rumqttc`-backed transport.

use super::acks::PendingAcks;
use super::{InboundMessage, LinkSignals, Transport, TransportError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Capacity of the outgoing request queue between client and event loop.
const REQUEST_CAPACITY: usize = 100;

/// Delay before the event loop retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the MQTT transport.
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub broker: String,
    /// Client ID for the MQTT session
    pub client_id: String,
    /// Broker username
    pub username: Option<String>,
    /// Broker password
    pub password: Option<String>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Inbound messages buffered before the event loop waits for the engine
    pub inbound_capacity: usize,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            client_id: "mqtt-reg".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            inbound_capacity: 32,
        }
    }
}

/// MQTT transport driving a `rumqttc` event loop.
///
/// A publish completes when the broker acknowledges it, or fails when the
/// link is down or drops before the acknowledgement arrives.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: tokio::sync::Mutex<Option<EventLoop>>,
    link: Arc<LinkSignals>,
    acks: Arc<Mutex<PendingAcks>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl MqttTransport {
    /// Create a transport. No network traffic happens until `connect`.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: &MqttTransportConfig) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(&config.broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);
        if let Some(username) = &config.username {
            mqtt_options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        Ok(Self {
            client,
            eventloop: tokio::sync::Mutex::new(Some(eventloop)),
            link: Arc::new(LinkSignals::new()),
            acks: Arc::default(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.eventloop.lock().await;
        let Some(mut eventloop) = slot.take() else {
            return Ok(());
        };

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(session_present = ack.session_present, "Connected to MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    *slot = Some(eventloop);
                    return Err(classify(err));
                }
            }
        }

        lock(&self.acks).link_up();
        self.link.raise_up();
        tokio::spawn(drive(
            eventloop,
            Arc::clone(&self.link),
            Arc::clone(&self.acks),
            self.inbound_tx.clone(),
        ));

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        tracing::trace!(topic, payload_len = payload.len(), "Publishing");

        let (done_tx, done_rx) = oneshot::channel();
        {
            // Queue and park under one lock so waiters keep request order.
            let mut acks = lock(&self.acks);
            if !acks.is_linked() {
                return Err(TransportError::Publish("link is down".to_string()));
            }
            self.client
                .try_publish(topic, qos, false, payload)
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            acks.queued(done_tx);
        }

        done_rx
            .await
            .unwrap_or_else(|_| Err(TransportError::Publish("event loop stopped".to_string())))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        tracing::debug!(topic, "Subscribing");

        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn link(&self) -> Arc<LinkSignals> {
        Arc::clone(&self.link)
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn lock(acks: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll the event loop for the rest of the process, turning connection
/// changes into link edges, publishes into inbound messages, and
/// acknowledgements into publish completions.
async fn drive(
    mut eventloop: EventLoop,
    link: Arc<LinkSignals>,
    acks: Arc<Mutex<PendingAcks>>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    let mut linked = true;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    retained = publish.retain,
                    "Received MQTT message"
                );

                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                };

                if inbound.send(message).await.is_err() {
                    tracing::warn!("Inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !linked {
                    tracing::info!("Reconnected to MQTT broker");
                    linked = true;
                    lock(&acks).link_up();
                    link.raise_up();
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&acks).sent(pkid),
            Ok(Event::Outgoing(Outgoing::AwaitAck(pkid))) => lock(&acks).collided(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => lock(&acks).acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => lock(&acks).acked(comp.pkid),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                lock(&acks).link_down(&e.to_string());
                if linked {
                    linked = false;
                    link.raise_down();
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    lock(&acks).link_down("event loop stopped");
}

/// Refused credentials cannot be fixed by retrying.
fn classify(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::FatalLink(format!("connection refused: {code:?}")),
        other => TransportError::Connection(other.to_string()),
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}
