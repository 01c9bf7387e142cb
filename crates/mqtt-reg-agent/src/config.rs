//! Agent configuration.

use crate::persistence;
use crate::transport::MqttTransportConfig;
use anyhow::{Context, Result};
use mqtt_reg_core::{
    ClientRegister, Codec, KvStore, RegisterError, ServerRegister, StoreError,
};
use mqtt_reg_proto::topics::DEFAULT_PREFIX;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Inbound messages buffered between the MQTT event loop and the engine.
pub const INBOUND_QUEUE_LEN: usize = 32;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker connection
    pub broker: BrokerConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Topic prefix
    pub topic_prefix: String,

    /// Registers served by this agent
    pub server_registers: Vec<ServerRegisterConfig>,

    /// Names of remote registers to shadow
    pub client_registers: Vec<String>,
}

/// Broker connection configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT broker URL
    pub url: String,

    /// MQTT client identifier
    pub client_id: String,

    /// Broker username
    pub username: Option<String>,

    /// Broker password
    pub password: Option<String>,

    /// Keep-alive interval
    pub keep_alive: Duration,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Path of the shared register database
    pub db_path: PathBuf,
}

/// Declared server register.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRegisterConfig {
    /// Register name
    pub name: String,

    /// Advertised descriptor
    #[serde(default)]
    pub meta: Value,

    /// Register variant
    #[serde(default)]
    pub kind: RegisterKind,

    /// Initial value, or the default for persistent kinds
    #[serde(default, alias = "default")]
    pub value: Value,
}

/// Server register variants available from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// In-memory, writable
    #[default]
    Writable,
    /// In-memory, rejects writes
    ReadOnly,
    /// Persistent boolean
    Bool,
    /// Persistent single-precision float
    Float,
    /// Persistent JSON value
    Json,
}

impl ServerRegisterConfig {
    /// Build the register. `store` is only consulted for persistent kinds.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or the default value
    /// cannot be stored.
    pub fn build(
        &self,
        store: impl FnOnce() -> Result<Arc<dyn KvStore>, StoreError>,
    ) -> Result<ServerRegister, RegisterError> {
        let codec = match self.kind {
            RegisterKind::Writable => {
                return Ok(ServerRegister::writable(
                    &self.name,
                    self.meta.clone(),
                    self.value.clone(),
                ));
            }
            RegisterKind::ReadOnly => {
                return Ok(ServerRegister::read_only(
                    &self.name,
                    self.meta.clone(),
                    self.value.clone(),
                ));
            }
            RegisterKind::Bool => Codec::Bool,
            RegisterKind::Float => Codec::Float,
            RegisterKind::Json => Codec::Json,
        };

        ServerRegister::persistent(&self.name, self.meta.clone(), codec, &self.value, store()?)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                url: "tcp://localhost:1883".to_string(),
                client_id: format!("mqtt-reg-{}", Uuid::new_v4()),
                username: None,
                password: None,
                keep_alive: Duration::from_secs(30),
            },
            persistence: PersistenceConfig {
                db_path: PathBuf::from(persistence::DEFAULT_DB_PATH),
            },
            topic_prefix: DEFAULT_PREFIX.to_string(),
            server_registers: Vec::new(),
            client_registers: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REGISTRY_MQTT_BROKER`: MQTT broker URL
    /// - `REGISTRY_CLIENT_ID`: MQTT client identifier
    /// - `REGISTRY_MQTT_USERNAME` / `REGISTRY_MQTT_PASSWORD`: broker credentials
    /// - `REGISTRY_KEEP_ALIVE_SECS`: keep-alive interval
    /// - `REGISTRY_DB_PATH`: shared register database path
    /// - `REGISTRY_TOPIC_PREFIX`: topic prefix
    /// - `REGISTRY_SERVER_REGISTERS`: JSON list of server register declarations
    /// - `REGISTRY_CLIENT_REGISTERS`: JSON list of client register names
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("REGISTRY_MQTT_BROKER") {
            config.broker.url = url;
        }

        if let Some(client_id) = lookup("REGISTRY_CLIENT_ID") {
            config.broker.client_id = client_id;
        }

        config.broker.username = lookup("REGISTRY_MQTT_USERNAME");
        config.broker.password = lookup("REGISTRY_MQTT_PASSWORD");

        if let Some(secs) = lookup("REGISTRY_KEEP_ALIVE_SECS") {
            let secs: u64 = secs.parse().context("Invalid REGISTRY_KEEP_ALIVE_SECS")?;
            config.broker.keep_alive = Duration::from_secs(secs);
        }

        if let Some(db_path) = lookup("REGISTRY_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(prefix) = lookup("REGISTRY_TOPIC_PREFIX") {
            config.topic_prefix = prefix;
        }

        if let Some(json) = lookup("REGISTRY_SERVER_REGISTERS") {
            config.server_registers =
                serde_json::from_str(&json).context("Invalid REGISTRY_SERVER_REGISTERS JSON")?;
        }

        if let Some(json) = lookup("REGISTRY_CLIENT_REGISTERS") {
            config.client_registers =
                serde_json::from_str(&json).context("Invalid REGISTRY_CLIENT_REGISTERS JSON")?;
        }

        Ok(config)
    }

    /// Transport settings derived from the broker configuration.
    #[must_use]
    pub fn transport(&self) -> MqttTransportConfig {
        MqttTransportConfig {
            broker: self.broker.url.clone(),
            client_id: self.broker.client_id.clone(),
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            keep_alive: self.broker.keep_alive,
            inbound_capacity: INBOUND_QUEUE_LEN,
        }
    }

    /// Build the declared registers.
    ///
    /// Persistent registers use the shared default store, opened at
    /// `persistence.db_path` the first time one is built.
    ///
    /// # Errors
    ///
    /// Returns error if a register cannot be built.
    pub fn build_registers(&self) -> Result<(Vec<ServerRegister>, Vec<ClientRegister>)> {
        persistence::configure_default_store(&self.persistence.db_path);

        let server = self
            .server_registers
            .iter()
            .map(|declared| {
                declared
                    .build(persistence::default_store)
                    .with_context(|| format!("Failed to build register '{}'", declared.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = self
            .client_registers
            .iter()
            .map(ClientRegister::new)
            .collect();

        Ok((server, client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_reg_core::{MemoryStore, Register};
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = AgentConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config.broker.url, "tcp://localhost:1883");
        assert!(config.broker.client_id.starts_with("mqtt-reg-"));
        assert_eq!(config.topic_prefix, "register");
        assert!(config.server_registers.is_empty());
        assert_eq!(config.transport().inbound_capacity, INBOUND_QUEUE_LEN);
    }

    #[test]
    fn variables_override_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("REGISTRY_MQTT_BROKER", "tcp://broker:1884"),
            ("REGISTRY_CLIENT_ID", "lamp-1"),
            ("REGISTRY_MQTT_USERNAME", "device"),
            ("REGISTRY_KEEP_ALIVE_SECS", "10"),
            (
                "REGISTRY_SERVER_REGISTERS",
                r#"[
                    {"name": "lamp", "meta": {"type": "bool"}, "value": false},
                    {"name": "brightness", "kind": "float", "default": 0.5}
                ]"#,
            ),
            ("REGISTRY_CLIENT_REGISTERS", r#"["hallway"]"#),
        ]))
        .unwrap();

        assert_eq!(config.broker.url, "tcp://broker:1884");
        assert_eq!(config.broker.client_id, "lamp-1");
        assert_eq!(config.broker.username.as_deref(), Some("device"));
        assert_eq!(config.broker.password, None);
        assert_eq!(config.broker.keep_alive, Duration::from_secs(10));

        assert_eq!(config.server_registers.len(), 2);
        assert_eq!(config.server_registers[0].kind, RegisterKind::Writable);
        assert_eq!(config.server_registers[1].kind, RegisterKind::Float);
        assert_eq!(config.server_registers[1].value, json!(0.5));
        assert_eq!(config.client_registers, vec!["hallway"]);
    }

    #[test]
    fn malformed_variables_are_rejected() {
        assert!(AgentConfig::from_lookup(lookup(&[("REGISTRY_KEEP_ALIVE_SECS", "soon")])).is_err());
        assert!(
            AgentConfig::from_lookup(lookup(&[("REGISTRY_SERVER_REGISTERS", "{")])).is_err()
        );
        assert!(AgentConfig::from_lookup(lookup(&[(
            "REGISTRY_SERVER_REGISTERS",
            r#"[{"name": "x", "kind": "teapot"}]"#
        )]))
        .is_err());
    }

    #[test]
    fn declared_registers_build_their_variant() {
        let store = MemoryStore::new();
        let shared = || Ok(Arc::new(store.clone()) as Arc<dyn KvStore>);

        let declared: Vec<ServerRegisterConfig> = serde_json::from_value(json!([
            {"name": "firmware", "kind": "read_only", "value": "1.2.0"},
            {"name": "relay", "kind": "bool", "default": true},
            {"name": "scene", "kind": "json", "default": {"preset": "evening"}}
        ]))
        .unwrap();

        let firmware = declared[0].build(shared).unwrap();
        assert!(firmware.is_read_only());
        assert_eq!(firmware.value().unwrap(), json!("1.2.0"));

        let relay = declared[1].build(shared).unwrap();
        assert_eq!(relay.value().unwrap(), json!(true));
        assert_eq!(store.get(b"relay").unwrap(), Some(vec![1]));

        let scene = declared[2].build(shared).unwrap();
        assert_eq!(scene.value().unwrap(), json!({"preset": "evening"}));
    }

    #[test]
    fn in_memory_kinds_never_open_the_store() {
        let declared = ServerRegisterConfig {
            name: "lamp".to_string(),
            meta: Value::Null,
            kind: RegisterKind::Writable,
            value: json!(false),
        };

        let register = declared
            .build(|| Err(StoreError::Backend("must not be opened".into())))
            .unwrap();
        assert_eq!(register.value().unwrap(), json!(false));
    }
}
