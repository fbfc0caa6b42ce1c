//! Remote console (RCON) client
//!
//! - **codec**: length-prefixed packet framing over TCP
//! - **client**: session handling behind the `RemoteConsole` trait
//! - **error**: failure kinds surfaced to callers

pub mod client;
pub mod codec;
pub mod error;

pub use client::{RconClient, RemoteConsole};
pub use error::RconError;

#[cfg(test)]
pub use client::MockRemoteConsole;
