//! Name-indexed register collections.

use crate::error::RegisterError;
use crate::register::{ClientRegister, Register, ServerRegister};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Registers served by this device.
pub type ServerRegisters = RegisterSet<ServerRegister>;

/// Shadows of registers served by peers.
pub type ClientRegisters = RegisterSet<ClientRegister>;

/// An immutable set of registers, looked up by name.
///
/// Iteration follows declaration order.
#[derive(Debug)]
pub struct RegisterSet<R> {
    registers: Vec<Arc<R>>,
    index: HashMap<String, usize>,
}

impl<R> Default for RegisterSet<R> {
    fn default() -> Self {
        Self {
            registers: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<R: Register> RegisterSet<R> {
    /// Build a collection from declared registers.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Duplicate`] if two registers share a name.
    pub fn new(registers: impl IntoIterator<Item = R>) -> Result<Self, RegisterError> {
        let mut set = Self::default();
        for register in registers {
            let name = register.name().to_string();
            if set.index.contains_key(&name) {
                return Err(RegisterError::Duplicate { name });
            }
            set.index.insert(name, set.registers.len());
            set.registers.push(Arc::new(register));
        }
        Ok(set)
    }

    /// Register names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.registers
            .iter()
            .map(|register| register.name().to_string())
            .collect()
    }

    /// Iterate over registers in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<R>> {
        self.registers.iter()
    }

    /// Number of registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Whether `name` was declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Shared handle to a register.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Unknown`] for undeclared names.
    pub fn get(&self, name: &str) -> Result<&Arc<R>, RegisterError> {
        self.index
            .get(name)
            .map(|&position| &self.registers[position])
            .ok_or_else(|| RegisterError::Unknown {
                name: name.to_string(),
            })
    }

    /// Current value of a register.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the value cannot be read.
    pub fn value(&self, name: &str) -> Result<Value, RegisterError> {
        self.get(name)?.value()
    }

    /// Remote-path mutation of a register.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the register rejects the value.
    pub fn set_value(&self, name: &str, value: Value) -> Result<(), RegisterError> {
        self.get(name)?.set_value(value)
    }
}

impl RegisterSet<ServerRegister> {
    /// Advertised descriptor of a register.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Unknown`] for undeclared names.
    pub fn meta(&self, name: &str) -> Result<&Value, RegisterError> {
        Ok(self.get(name)?.meta())
    }
}
