//! # Service Layer
//!
//! Client-side API over the transport.

pub mod client;

pub use client::{BackupClient, BackupOutcome};
