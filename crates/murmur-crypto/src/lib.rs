//! Murmur credential helpers.
//!
//! - `password`: salted Argon2id hashing for stored credentials
//! - `token`: HS256 session tokens handed out by the HTTP login wrappers

pub mod password;
pub mod token;
