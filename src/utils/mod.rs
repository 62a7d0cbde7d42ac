//! # Utility Modules
//!
//! Supporting utilities shared by the server and the client.
//!
//! ## Components
//! - **Checksum**: the 32-bit `cksum`-style file checksum
//! - **Logging**: tracing subscriber setup
//! - **Metrics**: atomic server counters
//! - **Time**: wall-clock timestamps for `last_seen`

pub mod checksum;
pub mod logging;
pub mod metrics;
pub mod time;

pub use checksum::checksum;
pub use metrics::{MetricsSnapshot, ServerMetrics};
