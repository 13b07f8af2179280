//! cfgsrv library: WebSocket transport and process glue for the config server.
//!
//! The binary in `main.rs` is a thin wrapper; integration tests drive the
//! server and client through these exports.

pub mod client;
pub mod config;
pub mod connection;
pub mod server;

pub use client::{ClientError, ConfigClient, JoinResponse};
pub use config::{ConfigError, Options};
pub use connection::{ConnectionEvent, WsConn, MAX_MESSAGE_SIZE};
pub use server::ConfigServer;
