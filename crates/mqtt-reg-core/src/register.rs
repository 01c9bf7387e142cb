//! Register variants.
//!
//! A register is a named JSON value shared between peers. Server registers
//! hold the authoritative value; client registers are passive shadows of a
//! remote server register with the same name.

use crate::codec::Codec;
use crate::error::RegisterError;
use crate::store::KvStore;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Callback invoked with a register name after a local value change.
pub type ChangeHook = Arc<dyn Fn(&str) + Send + Sync>;

static NO_META: Value = Value::Null;

/// Capabilities shared by every register variant.
pub trait Register: Send + Sync {
    /// Register name, also its topic path segment.
    fn name(&self) -> &str;

    /// Descriptor sent when the register is advertised.
    fn meta(&self) -> &Value;

    /// Current value; `Value::Null` means unknown.
    ///
    /// # Errors
    ///
    /// Returns error if a persisted value cannot be read or decoded.
    fn value(&self) -> Result<Value, RegisterError>;

    /// Replace the value on behalf of a remote peer.
    ///
    /// # Errors
    ///
    /// Returns error if the register is read-only or the value cannot be
    /// persisted.
    fn set_value(&self, value: Value) -> Result<(), RegisterError>;
}

enum Backing {
    Memory(Mutex<Value>),
    ReadOnly(Value),
    Persistent {
        codec: Codec,
        store: Arc<dyn KvStore>,
    },
}

/// A register whose authoritative value lives on this device.
pub struct ServerRegister {
    name: String,
    meta: Value,
    backing: Backing,
    on_change: OnceLock<ChangeHook>,
}

impl ServerRegister {
    /// Create a writable register holding its value in memory.
    #[must_use]
    pub fn writable(name: impl Into<String>, meta: Value, value: Value) -> Self {
        Self::with_backing(name.into(), meta, Backing::Memory(Mutex::new(value)))
    }

    /// Create a register that rejects every mutation.
    #[must_use]
    pub fn read_only(name: impl Into<String>, meta: Value, value: Value) -> Self {
        Self::with_backing(name.into(), meta, Backing::ReadOnly(value))
    }

    /// Create a register backed by a durable store.
    ///
    /// If the store has no entry for `name`, `default` is written first.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be queried or the default cannot
    /// be encoded and written.
    pub fn persistent(
        name: impl Into<String>,
        meta: Value,
        codec: Codec,
        default: &Value,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, RegisterError> {
        let register = Self::with_backing(name.into(), meta, Backing::Persistent { codec, store });

        if let Backing::Persistent { store, .. } = &register.backing {
            if !store.contains(register.name.as_bytes())? {
                tracing::debug!(register = %register.name, %default, "Initializing persistent register");
                register.write(default.clone())?;
            }
        }

        Ok(register)
    }

    /// Create a persistent boolean register.
    ///
    /// # Errors
    ///
    /// See [`ServerRegister::persistent`].
    pub fn persistent_bool(
        name: impl Into<String>,
        meta: Value,
        default: bool,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, RegisterError> {
        Self::persistent(name, meta, Codec::Bool, &Value::Bool(default), store)
    }

    /// Create a persistent single-precision float register.
    ///
    /// # Errors
    ///
    /// See [`ServerRegister::persistent`].
    pub fn persistent_float(
        name: impl Into<String>,
        meta: Value,
        default: f32,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, RegisterError> {
        Self::persistent(name, meta, Codec::Float, &Value::from(default), store)
    }

    fn with_backing(name: String, meta: Value, backing: Backing) -> Self {
        Self {
            name,
            meta,
            backing,
            on_change: OnceLock::new(),
        }
    }

    /// Whether remote and local mutation are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::ReadOnly(_))
    }

    /// Install the hook notified by [`ServerRegister::set_local`].
    ///
    /// Only the first hook is kept; returns `false` if one was already set.
    pub fn on_local_change(&self, hook: ChangeHook) -> bool {
        self.on_change.set(hook).is_ok()
    }

    /// Change the value from local code.
    ///
    /// The change hook fires only when the new value differs from the
    /// current one. Returns whether the value changed.
    ///
    /// # Errors
    ///
    /// Returns error if the register is read-only or persistence fails.
    pub fn set_local(&self, value: Value) -> Result<bool, RegisterError> {
        let changed = match &self.backing {
            Backing::ReadOnly(_) => return Err(self.read_only_violation()),
            Backing::Memory(cell) => {
                let mut current = lock(cell);
                if *current == value {
                    false
                } else {
                    *current = value;
                    true
                }
            }
            Backing::Persistent { .. } => {
                if self.value()? == value {
                    false
                } else {
                    self.write(value)?;
                    true
                }
            }
        };

        if changed {
            if let Some(hook) = self.on_change.get() {
                hook(&self.name);
            }
        }

        Ok(changed)
    }

    fn write(&self, value: Value) -> Result<(), RegisterError> {
        match &self.backing {
            Backing::ReadOnly(_) => Err(self.read_only_violation()),
            Backing::Memory(cell) => {
                *lock(cell) = value;
                Ok(())
            }
            Backing::Persistent { codec, store } => {
                let bytes = codec.encode(&value).map_err(|source| RegisterError::Codec {
                    name: self.name.clone(),
                    source,
                })?;
                store.set(self.name.as_bytes(), &bytes)?;
                store.flush()?;
                Ok(())
            }
        }
    }

    fn read_only_violation(&self) -> RegisterError {
        RegisterError::ReadOnly {
            name: self.name.clone(),
        }
    }
}

impl Register for ServerRegister {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &Value {
        &self.meta
    }

    fn value(&self) -> Result<Value, RegisterError> {
        match &self.backing {
            Backing::Memory(cell) => Ok(lock(cell).clone()),
            Backing::ReadOnly(value) => Ok(value.clone()),
            Backing::Persistent { codec, store } => match store.get(self.name.as_bytes())? {
                Some(bytes) => codec.decode(&bytes).map_err(|source| RegisterError::Codec {
                    name: self.name.clone(),
                    source,
                }),
                None => Ok(Value::Null),
            },
        }
    }

    fn set_value(&self, value: Value) -> Result<(), RegisterError> {
        self.write(value)
    }
}

impl fmt::Debug for ServerRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.backing {
            Backing::Memory(_) => "writable",
            Backing::ReadOnly(_) => "read_only",
            Backing::Persistent { codec, .. } => match codec {
                Codec::Bool => "persistent_bool",
                Codec::Float => "persistent_float",
                Codec::Json => "persistent_json",
            },
        };
        f.debug_struct("ServerRegister")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Passive shadow of a register owned by a remote peer.
#[derive(Debug)]
pub struct ClientRegister {
    name: String,
    value: Mutex<Value>,
}

impl ClientRegister {
    /// Create a shadow with an unknown value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(Value::Null),
        }
    }
}

impl Register for ClientRegister {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &Value {
        &NO_META
    }

    fn value(&self) -> Result<Value, RegisterError> {
        Ok(lock(&self.value).clone())
    }

    fn set_value(&self, value: Value) -> Result<(), RegisterError> {
        *lock(&self.value) = value;
        Ok(())
    }
}

fn lock(cell: &Mutex<Value>) -> MutexGuard<'_, Value> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook() -> (ChangeHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let hook: ChangeHook = Arc::new(move |_name: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    #[test]
    fn writable_local_set_notifies_only_on_change() {
        let register = ServerRegister::writable("lamp", json!({"type": "bool"}), json!(false));
        let (hook, count) = counting_hook();
        assert!(register.on_local_change(hook));

        assert!(!register.set_local(json!(false)).unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(register.set_local(json!(true)).unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(register.value().unwrap(), json!(true));
    }

    #[test]
    fn remote_set_does_not_notify() {
        let register = ServerRegister::writable("lamp", Value::Null, Value::Null);
        let (hook, count) = counting_hook();
        register.on_local_change(hook);

        register.set_value(json!(3)).unwrap();
        assert_eq!(register.value().unwrap(), json!(3));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_hook_is_refused() {
        let register = ServerRegister::writable("lamp", Value::Null, Value::Null);
        let (first, _) = counting_hook();
        let (second, _) = counting_hook();
        assert!(register.on_local_change(first));
        assert!(!register.on_local_change(second));
    }

    #[test]
    fn read_only_rejects_every_mutation() {
        let register = ServerRegister::read_only("firmware", Value::Null, json!("1.4.2"));

        let err = register.set_value(json!("2.0")).unwrap_err();
        assert!(matches!(err, RegisterError::ReadOnly { ref name } if name == "firmware"));

        let err = register.set_local(json!("2.0")).unwrap_err();
        assert!(matches!(err, RegisterError::ReadOnly { .. }));

        assert_eq!(register.value().unwrap(), json!("1.4.2"));
        assert!(register.is_read_only());
    }

    #[test]
    fn persistent_writes_default_once() {
        let store = MemoryStore::new();
        let register =
            ServerRegister::persistent_bool("relay", Value::Null, true, Arc::new(store.clone()))
                .unwrap();
        assert_eq!(store.get(b"relay").unwrap(), Some(vec![1]));
        assert_eq!(register.value().unwrap(), json!(true));

        register.set_value(json!(false)).unwrap();

        // A second construction must not overwrite the stored value.
        let reopened =
            ServerRegister::persistent_bool("relay", Value::Null, true, Arc::new(store.clone()))
                .unwrap();
        assert_eq!(reopened.value().unwrap(), json!(false));
    }

    #[test]
    fn persistent_reads_through_the_store() {
        let store = MemoryStore::new();
        let register = ServerRegister::persistent_float(
            "brightness",
            Value::Null,
            0.5,
            Arc::new(store.clone()),
        )
        .unwrap();

        register.set_value(json!(0.75)).unwrap();
        assert_eq!(store.get(b"brightness").unwrap(), Some(0.75_f32.to_ne_bytes().to_vec()));

        // Out-of-band writes are visible; nothing is cached.
        store.set(b"brightness", &0.25_f32.to_ne_bytes()).unwrap();
        assert_eq!(register.value().unwrap(), json!(0.25));
    }

    #[test]
    fn persistent_codec_failure_leaves_value_unchanged() {
        let store = MemoryStore::new();
        let register = ServerRegister::persistent_float(
            "brightness",
            Value::Null,
            0.5,
            Arc::new(store),
        )
        .unwrap();

        let err = register.set_value(json!("max")).unwrap_err();
        assert!(matches!(err, RegisterError::Codec { .. }));
        assert_eq!(register.value().unwrap(), json!(0.5));
    }

    #[test]
    fn persistent_local_set_compares_stored_value() {
        let store = MemoryStore::new();
        let register =
            ServerRegister::persistent_bool("relay", Value::Null, false, Arc::new(store)).unwrap();
        let (hook, count) = counting_hook();
        register.on_local_change(hook);

        assert!(!register.set_local(json!(false)).unwrap());
        assert!(register.set_local(json!(true)).unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_register_starts_unknown() {
        let register = ClientRegister::new("lamp");
        assert_eq!(register.value().unwrap(), Value::Null);
        assert_eq!(register.meta(), &Value::Null);

        register.set_value(json!(true)).unwrap();
        assert_eq!(register.value().unwrap(), json!(true));
    }
}
