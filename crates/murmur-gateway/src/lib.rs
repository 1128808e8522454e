//! Real-time side of murmur: who is connected where, who is typing, and the
//! engine that routes channel events and fans results out to recipients.

pub mod channels;
pub mod connection;
pub mod engine;
pub mod error;
mod handlers;
pub mod registry;
pub mod tasks;
pub mod typing;

pub use engine::{Engine, EngineConfig};
pub use error::{ProtocolError, ProtocolResult};
