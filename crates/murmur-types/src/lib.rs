//! Shared types for the murmur chat backend: domain models, the channel
//! protocol, and the HTTP request/response bodies.

pub mod api;
pub mod events;
pub mod models;
