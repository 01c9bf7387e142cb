//! # mqtt-reg Agent
//!
//! Register synchronization engine over MQTT.
//!
//! ## Architecture
//!
//! The engine runs four kinds of concurrent work:
//! 1. **Link**: connects to the broker and (re)subscribes on every "up" edge
//! 2. **Dispatch**: routes inbound `get`/`set`/`is`/`advertise!` messages
//! 3. **Publish**: sends server register values, at most two per register at once
//! 4. **Liveness**: polls each client register's peer and clears stale values

pub mod config;
pub mod persistence;
pub mod registry;
pub mod transport;

mod inflight;
mod liveness;

pub use config::AgentConfig;
pub use inflight::MAX_IN_FLIGHT;
pub use liveness::{LIVENESS_TIMEOUT, POLL_JITTER_MS};
pub use registry::{Hooks, Registry, RegistryError, CONNECT_RETRY_DELAY};
pub use transport::{
    InboundMessage, LinkSignals, MockTransport, MqttTransport, MqttTransportConfig, Transport,
    TransportError,
};
