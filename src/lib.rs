//! # Backup Protocol
//!
//! Client/server protocol for authenticated, encrypted file backup over TCP.
//!
//! A client registers or signs in, trades its RSA public key for a
//! server-generated AES session key, uploads a file under that key and
//! confirms it through a checksum round-trip with bounded retries.
//!
//! ## Layers
//! - `core`: wire format and stream framing
//! - [`protocol`]: typed messages, key exchange, session state machine
//! - [`storage`]: client registry and file store
//! - [`transport`]: TCP accept loop
//! - [`service`]: reference client
//! - [`utils`]: checksum, logging, metrics, time
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use backup_protocol::config::ServerConfig;
//! use backup_protocol::storage::MemoryStore;
//! use backup_protocol::transport::Server;
//!
//! # async fn run() -> backup_protocol::error::Result<()> {
//! let server = Server::new(ServerConfig::default(), Arc::new(MemoryStore::new()));
//! let listener = server.bind().await?;
//! server.run(listener).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod storage;
pub mod transport;
pub mod utils;

pub use crate::core::packet::ClientId;
pub use error::{ProtocolError, Result};
pub use protocol::message::{Request, Response};
