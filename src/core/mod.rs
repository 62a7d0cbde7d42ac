//! # Core Protocol Components
//!
//! Wire format and stream framing.
//!
//! ## Components
//! - **Packet**: request header, raw frames, fixed field sizes, name fields
//! - **Codec**: Tokio codecs for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! request:  [ClientId(16)] [Version(1)] [Code(2)] [Length(4)] [Payload(N)]
//! response: [Version(1)] [Status(2)] [Length(4)] [Payload(N)]
//! ```
//! All integers are little-endian.
//!
//! ## Security
//! - Declared lengths above the configured maximum close the connection
//! - Lengths are checked before the payload is buffered

pub mod codec;
pub mod packet;
