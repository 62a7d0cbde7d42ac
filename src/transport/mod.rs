//! # Transport Layer
//!
//! TCP accept loop and per-connection framing.
//!
//! ## Components
//! - **Server**: accepts connections, runs one task per connection, stops on
//!   request or on a fatal storage error

pub mod server;

pub use server::Server;
