//! # mqtt-reg Core
//!
//! Register model for the mqtt-reg synchronization protocol.
//!
//! This crate provides:
//! - Server registers (writable, read-only, persistent) and client shadows
//! - Name-indexed register collections
//! - Byte codecs for persisted values
//! - The durable key-value store contract and an in-memory store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod collection;
pub mod error;
pub mod register;
pub mod store;

pub use codec::Codec;
pub use collection::{ClientRegisters, RegisterSet, ServerRegisters};
pub use error::{CodecError, RegisterError, StoreError};
pub use register::{ChangeHook, ClientRegister, Register, ServerRegister};
pub use store::{KvStore, MemoryStore};
