//! Registry engine.
//!
//! The engine owns the register collections and the transport, and runs:
//! - the connect loop and the link "up"/"down" watchers
//! - the inbound dispatch loop
//! - bounded publishing of server register values
//! - advertise broadcasts
//! - liveness polling of client registers

use crate::inflight::{InFlight, InFlightGuard};
use crate::liveness::{self, LivenessTasks, LIVENESS_TIMEOUT};
use crate::transport::{InboundMessage, QoS, Transport, TransportError};
use mqtt_reg_core::{
    ChangeHook, ClientRegister, ClientRegisters, Register, RegisterError, ServerRegister,
    ServerRegisters,
};
use mqtt_reg_proto::{payload, PayloadError, Topic, TopicScheme};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delay between failed connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Length of the online indicator blink at startup.
const STARTUP_BLINK: Duration = Duration::from_millis(200);

/// Every protocol message is sent at least once.
const QOS: QoS = QoS::AtLeastOnce;

/// Callback told whether the device is online.
pub type OnlineCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Hook invoked to restart the device after a fatal link error.
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Host callbacks used by the registry.
#[derive(Clone)]
pub struct Hooks {
    online: OnlineCallback,
    restart: RestartHook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            online: Arc::new(|_online: bool| {}),
            restart: Arc::new(|| {
                tracing::error!("Restart requested but no restart hook is installed");
            }),
        }
    }
}

impl Hooks {
    /// Set the online-state callback.
    #[must_use]
    pub fn on_online(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.online = Arc::new(callback);
        self
    }

    /// Set the device restart hook.
    #[must_use]
    pub fn on_restart(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.restart = Arc::new(hook);
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

/// Errors for registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Register lookup or mutation failed
    #[error(transparent)]
    Register(#[from] RegisterError),
    /// Inbound payload could not be decoded
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Transport operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Topic is not part of the register scheme
    #[error("unroutable topic: {0}")]
    UnroutableTopic(String),
    /// `run` was called twice on the same registry
    #[error("registry is already running")]
    AlreadyRunning,
    /// Dedicated runtime could not be built
    #[error("runtime error: {0}")]
    Runtime(String),
}

struct Inner {
    transport: Arc<dyn Transport>,
    topics: TopicScheme,
    server: ServerRegisters,
    client: ClientRegisters,
    hooks: Hooks,
    in_flight: InFlight,
    advertising: AtomicBool,
    liveness: LivenessTasks,
    local_changes: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// The register synchronization engine.
///
/// Cloning is cheap; clones drive the same engine. Every method that
/// starts background work must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a registry using the default `register/...` topics.
    ///
    /// # Errors
    ///
    /// Returns error if two registers of the same role share a name.
    pub fn new(
        transport: Arc<dyn Transport>,
        server: Vec<ServerRegister>,
        client: Vec<ClientRegister>,
        hooks: Hooks,
    ) -> Result<Self, RegistryError> {
        Self::with_topics(transport, TopicScheme::default(), server, client, hooks)
    }

    /// Create a registry with a custom topic scheme.
    ///
    /// # Errors
    ///
    /// Returns error if two registers of the same role share a name.
    pub fn with_topics(
        transport: Arc<dyn Transport>,
        topics: TopicScheme,
        server: Vec<ServerRegister>,
        client: Vec<ClientRegister>,
        hooks: Hooks,
    ) -> Result<Self, RegistryError> {
        let server = ServerRegisters::new(server)?;
        let client = ClientRegisters::new(client)?;

        // Local changes are queued and published from the dispatch loop.
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        for register in server.iter() {
            let changes_tx = changes_tx.clone();
            let hook: ChangeHook = Arc::new(move |name: &str| {
                let _ = changes_tx.send(name.to_string());
            });
            if !register.on_local_change(hook) {
                tracing::warn!(register = register.name(), "Register already has a change hook");
            }
        }

        (hooks.online)(false);

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                topics,
                server,
                client,
                hooks,
                in_flight: InFlight::default(),
                advertising: AtomicBool::new(false),
                liveness: LivenessTasks::default(),
                local_changes: Mutex::new(Some(changes_rx)),
            }),
        })
    }

    /// Shared handle to a server register, e.g. for [`ServerRegister::set_local`].
    ///
    /// # Errors
    ///
    /// Returns error if no server register has this name.
    pub fn server(&self, name: &str) -> Result<Arc<ServerRegister>, RegistryError> {
        Ok(Arc::clone(self.inner.server.get(name)?))
    }

    /// Shared handle to a client register.
    ///
    /// # Errors
    ///
    /// Returns error if no client register has this name.
    pub fn client(&self, name: &str) -> Result<Arc<ClientRegister>, RegistryError> {
        Ok(Arc::clone(self.inner.client.get(name)?))
    }

    /// Publishes currently in flight for a server register.
    #[must_use]
    pub fn in_flight(&self, name: &str) -> u8 {
        self.inner.in_flight.count(name)
    }

    /// Whether an advertise broadcast is running.
    #[must_use]
    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.load(Ordering::Acquire)
    }

    /// Whether a liveness task is running for a client register.
    #[must_use]
    pub fn has_liveness_task(&self, name: &str) -> bool {
        self.inner.liveness.is_active(name)
    }

    /// Number of running liveness tasks.
    #[must_use]
    pub fn liveness_task_count(&self) -> usize {
        self.inner.liveness.active_count()
    }

    /// Publish a server register's current value on its `is` topic.
    ///
    /// At most [`crate::MAX_IN_FLIGHT`] publishes per register run at once;
    /// further requests are dropped and `Ok(None)` is returned.
    ///
    /// # Errors
    ///
    /// Returns error if no server register has this name.
    pub fn publish_register_value(
        &self,
        name: &str,
    ) -> Result<Option<JoinHandle<()>>, RegistryError> {
        let register = self.server(name)?;

        let Some(slot) = self.inner.in_flight.try_acquire(name) else {
            tracing::debug!(register = name, "Publish in progress, skipping");
            return Ok(None);
        };

        let registry = self.clone();
        Ok(Some(tokio::spawn(async move {
            registry.publish_value(&register, slot).await;
        })))
    }

    async fn publish_value(&self, register: &ServerRegister, _slot: InFlightGuard) {
        let name = register.name();
        let value = match register.value() {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(register = name, error = %err, "Failed to read register value");
                return;
            }
        };

        tracing::debug!(register = name, %value, "Publishing register value");

        let topic = self.inner.topics.is(name);
        match self
            .inner
            .transport
            .publish(&topic, payload::encode(&value), QOS)
            .await
        {
            Ok(()) => tracing::trace!(register = name, "Published register value"),
            Err(err) => {
                tracing::warn!(register = name, error = %err, "Failed to publish register value");
            }
        }
    }

    /// Publish every server register's descriptor, in declaration order.
    ///
    /// Returns `None` if a broadcast is already running.
    pub fn advertise_registers(&self) -> Option<JoinHandle<()>> {
        if self
            .inner
            .advertising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Advertise in progress, skipping");
            return None;
        }

        let guard = AdvertiseGuard(self.clone());
        Some(tokio::spawn(async move {
            let registry = &guard.0;
            tracing::debug!(count = registry.inner.server.len(), "Advertising registers");

            for register in registry.inner.server.iter() {
                let topic = registry.inner.topics.advertise(register.name());
                if let Err(err) = registry
                    .inner
                    .transport
                    .publish(&topic, payload::encode(register.meta()), QOS)
                    .await
                {
                    tracing::warn!(register = register.name(), error = %err, "Advertise failed");
                    break;
                }
            }
        }))
    }

    /// Restart the liveness chain of a client register.
    ///
    /// The previous task for `name` is cancelled first. With `first`, the
    /// initial poll is sent immediately instead of after a randomized wait.
    ///
    /// # Errors
    ///
    /// Returns error if no client register has this name.
    pub fn reset_liveness(&self, name: &str, first: bool) -> Result<(), RegistryError> {
        let register = self.client(name)?;
        let registry = self.clone();

        self.inner.liveness.replace(name, move |generation| {
            tokio::spawn(async move {
                registry.watch_liveness(&register, generation, first).await;
            })
        });

        Ok(())
    }

    async fn watch_liveness(&self, register: &ClientRegister, generation: u64, mut first: bool) {
        let name = register.name();
        let poll_topic = self.inner.topics.get(name);

        loop {
            if !first {
                tokio::time::sleep(liveness::poll_jitter()).await;
            }
            first = false;

            tracing::debug!(register = name, "Polling client register");
            if let Err(err) = self.inner.transport.publish(&poll_topic, Vec::new(), QOS).await {
                tracing::warn!(register = name, error = %err, "Failed to poll client register");
                continue;
            }

            tokio::time::sleep(LIVENESS_TIMEOUT).await;

            let cleared = self
                .inner
                .liveness
                .if_current(name, generation, || register.set_value(Value::Null));
            match cleared {
                None => return,
                Some(Ok(())) => tracing::debug!(register = name, "Client register timed out"),
                Some(Err(err)) => {
                    tracing::warn!(register = name, error = %err, "Failed to clear client register");
                }
            }
        }
    }

    /// Route one inbound message.
    ///
    /// Retained messages are ignored. The caller decides what to do with
    /// errors; the dispatch loop logs and drops them.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is outside the scheme, the payload is not
    /// JSON, the register is unknown, or the register rejects the value.
    pub fn handle_message(&self, message: &InboundMessage) -> Result<(), RegistryError> {
        if message.retained {
            tracing::trace!(topic = %message.topic, "Ignoring retained message");
            return Ok(());
        }

        let topic = self
            .inner
            .topics
            .parse(&message.topic)
            .ok_or_else(|| RegistryError::UnroutableTopic(message.topic.clone()))?;

        match topic {
            Topic::AdvertiseRequest => {
                self.advertise_registers();
            }
            Topic::Get(name) => {
                tracing::debug!(register = %name, "Get");
                self.publish_register_value(&name)?;
            }
            Topic::Set(name) => {
                let value = payload::decode(&message.payload)?;
                tracing::debug!(register = %name, %value, "Set");
                self.inner.server.set_value(&name, value)?;
                self.publish_register_value(&name)?;
            }
            Topic::Is(name) => {
                let value = payload::decode(&message.payload)?;
                tracing::debug!(register = %name, %value, "Is");
                self.reset_liveness(&name, false)?;
                self.inner.client.set_value(&name, value)?;
            }
            Topic::Advertise(name) => {
                tracing::trace!(register = %name, "Ignoring peer advertisement");
            }
        }

        Ok(())
    }

    /// Run the engine until the transport's inbound stream ends.
    ///
    /// Connection failures are retried every [`CONNECT_RETRY_DELAY`]. A fatal
    /// link error invokes the restart hook and is returned.
    ///
    /// # Errors
    ///
    /// Returns error on a fatal link error or if the registry is already
    /// running.
    pub async fn run(self) -> Result<(), RegistryError> {
        let mut inbound = self
            .inner
            .transport
            .take_inbound()
            .ok_or(RegistryError::AlreadyRunning)?;
        let mut local_changes = self
            .inner
            .local_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RegistryError::AlreadyRunning)?;

        self.blink().await;
        self.connect().await?;

        let watchers = self.spawn_link_watchers();

        tracing::info!(
            server = self.inner.server.len(),
            client = self.inner.client.len(),
            "Registry running"
        );

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        tracing::info!("Inbound stream closed");
                        break;
                    };
                    if let Err(err) = self.handle_message(&message) {
                        tracing::warn!(topic = %message.topic, error = %err, "Dropping message");
                    }
                }
                Some(name) = local_changes.recv() => {
                    if let Err(err) = self.publish_register_value(&name) {
                        tracing::warn!(register = %name, error = %err, "Failed to publish local change");
                    }
                }
            }
        }

        for watcher in watchers {
            watcher.abort();
        }
        self.inner.liveness.cancel_all();

        tracing::info!("Registry stopped");
        Ok(())
    }

    /// Run the engine on its own thread with a single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn spawn_dedicated(self) -> std::io::Result<thread::JoinHandle<Result<(), RegistryError>>> {
        thread::Builder::new()
            .name("registry".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| RegistryError::Runtime(e.to_string()))?;
                runtime.block_on(self.run())
            })
    }

    async fn blink(&self) {
        (self.inner.hooks.online)(true);
        tokio::time::sleep(STARTUP_BLINK).await;
        (self.inner.hooks.online)(false);
    }

    async fn connect(&self) -> Result<(), RegistryError> {
        loop {
            match self.inner.transport.connect().await {
                Ok(()) => return Ok(()),
                Err(TransportError::FatalLink(reason)) => {
                    tracing::error!(%reason, "Fatal link error, restarting device");
                    (self.inner.hooks.restart)();
                    return Err(TransportError::FatalLink(reason).into());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to connect to broker, retrying");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn spawn_link_watchers(&self) -> [JoinHandle<()>; 2] {
        let link = self.inner.transport.link();

        let up = {
            let registry = self.clone();
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                loop {
                    link.wait_up().await;
                    if let Err(err) = registry.on_link_up().await {
                        tracing::warn!(error = %err, "Error handling link up");
                    }
                }
            })
        };

        let down = {
            let registry = self.clone();
            tokio::spawn(async move {
                loop {
                    link.wait_down().await;
                    tracing::info!("Link down");
                    (registry.inner.hooks.online)(false);
                }
            })
        };

        [up, down]
    }

    async fn on_link_up(&self) -> Result<(), RegistryError> {
        tracing::info!("Link up");
        (self.inner.hooks.online)(true);

        if !self.inner.server.is_empty() {
            self.subscribe(&self.inner.topics.advertise_request()).await?;
        }

        for register in self.inner.server.iter() {
            self.subscribe(&self.inner.topics.get(register.name())).await?;
            self.subscribe(&self.inner.topics.set(register.name())).await?;
        }

        for register in self.inner.client.iter() {
            self.subscribe(&self.inner.topics.is(register.name())).await?;
            self.reset_liveness(register.name(), true)?;
        }

        self.advertise_registers();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RegistryError> {
        tracing::debug!(topic, "Subscribing");
        self.inner.transport.subscribe(topic, QOS).await?;
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("server", &self.inner.server.names())
            .field("client", &self.inner.client.names())
            .field("topics", &self.inner.topics)
            .finish_non_exhaustive()
    }
}

/// Clears the advertise flag when the broadcast ends or is dropped.
struct AdvertiseGuard(Registry);

impl Drop for AdvertiseGuard {
    fn drop(&mut self) {
        self.0.inner.advertising.store(false, Ordering::Release);
    }
}
