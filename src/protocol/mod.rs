//! # Protocol Layer
//!
//! Typed messages, the key exchange and the per-connection state machine.
//!
//! ## Components
//! - **Message**: one `Request` variant per request code, `Response` variants
//! - **Handshake**: RSA-OAEP key wrap and per-block AES decryption
//! - **Session**: per-connection state and mode transitions
//! - **Dispatcher**: applies a request to a session and produces the reply
//!
//! ## Upload Flow
//! ```text
//! SIGN_UP -> SEND_PUBLIC_KEY        (or SIGN_IN)       control -> transfer
//! SEND_FILE                         -> CRC_VALID        transfer -> control
//! CRC_VALID                         -> MESSAGE_RECEIVED
//! CRC_INVALID                       (no reply)          -> transfer, resend
//! CRC_INVALID_4TH_TIME              -> MESSAGE_RECEIVED, close
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod session;
