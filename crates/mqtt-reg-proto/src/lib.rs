//! # mqtt-reg Protocol
//!
//! MQTT topic scheme and payload encoding for register synchronization.
//!
//! ## MQTT Topics
//!
//! | Topic | Payload | Purpose |
//! |---|---|---|
//! | `register/advertise!` | empty | ask every server to advertise |
//! | `register/{name}/advertise` | metadata | register descriptor |
//! | `register/{name}/get` | empty | ask for the current value |
//! | `register/{name}/set` | value | ask for a change |
//! | `register/{name}/is` | value | authoritative value |
//!
//! Values are JSON; an empty payload means `null`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod payload;
pub mod topics;

pub use payload::PayloadError;
pub use topics::{Topic, TopicScheme};
