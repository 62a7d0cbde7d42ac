//! Request framing and fixed-size wire fields.
//!
//! ```text
//! [ClientId(16)] [Version(1)] [Code(2)] [PayloadLength(4)] [Payload(N)]
//! ```
//!
//! All integers are little-endian. A buffer handed to [`WireMessage::decode`]
//! must contain exactly one frame.

use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Size of a client identity in bytes
pub const CLIENT_ID_LEN: usize = 16;
/// Size of the null-padded username and filename fields
pub const NAME_FIELD_LEN: usize = 255;
/// Size of an encoded 1024-bit RSA public key
pub const PUBLIC_KEY_LEN: usize = 160;
/// Size of an RSA-OAEP wrapped session key
pub const WRAPPED_KEY_LEN: usize = 128;
/// Size of the AES-128 session key
pub const SESSION_KEY_LEN: usize = 16;
/// Size of the little-endian content size prefix in file messages
pub const CONTENT_SIZE_LEN: usize = 4;
/// Request header: identity + version + code + payload length
pub const REQUEST_HEADER_LEN: usize = CLIENT_ID_LEN + 1 + 2 + 4;

// ── ClientId ─────────────────────────────────────────────────────

/// Opaque 16-byte identity assigned at registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct ClientId(pub [u8; CLIENT_ID_LEN]);

impl ClientId {
    /// All-zero identity, used by clients that are not registered yet.
    pub const UNSET: ClientId = ClientId([0u8; CLIENT_ID_LEN]);

    /// Draw a fresh identity from the operating system RNG.
    pub fn generate() -> Result<Self> {
        let mut id = [0u8; CLIENT_ID_LEN];
        getrandom::fill(&mut id)
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self(id))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; CLIENT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, used in logs and storage paths.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

/// Lowercase hex encoding of `bytes`.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

// ── RequestCode ──────────────────────────────────────────────────

/// The seven request codes a client may send.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    SignUp = 1025,
    SendPublicKey = 1026,
    SignIn = 1027,
    SendFile = 1028,
    CrcValid = 1029,
    CrcInvalid = 1030,
    CrcInvalid4thTime = 1031,
}

impl TryFrom<u16> for RequestCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1025 => Ok(RequestCode::SignUp),
            1026 => Ok(RequestCode::SendPublicKey),
            1027 => Ok(RequestCode::SignIn),
            1028 => Ok(RequestCode::SendFile),
            1029 => Ok(RequestCode::CrcValid),
            1030 => Ok(RequestCode::CrcInvalid),
            1031 => Ok(RequestCode::CrcInvalid4thTime),
            other => Err(ProtocolError::UnknownMessageCode(other)),
        }
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestCode::SignUp => "SIGN_UP",
            RequestCode::SendPublicKey => "SEND_PUBLIC_KEY",
            RequestCode::SignIn => "SIGN_IN",
            RequestCode::SendFile => "SEND_FILE",
            RequestCode::CrcValid => "CRC_VALID",
            RequestCode::CrcInvalid => "CRC_INVALID",
            RequestCode::CrcInvalid4thTime => "CRC_INVALID_4TH_TIME",
        };
        f.write_str(name)
    }
}

// ── Header ───────────────────────────────────────────────────────

/// The fixed 23-byte request header, with the code still in raw form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: ClientId,
    pub version: u8,
    pub code: u16,
    pub payload_length: u32,
}

impl RequestHeader {
    /// Parse the header from the first 23 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::MalformedHeader);
        }
        let mut id = [0u8; CLIENT_ID_LEN];
        id.copy_from_slice(&bytes[..CLIENT_ID_LEN]);
        let version = bytes[CLIENT_ID_LEN];
        let code = u16::from_le_bytes([bytes[17], bytes[18]]);
        let payload_length = u32::from_le_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]);

        Ok(Self {
            client_id: ClientId(id),
            version,
            code,
            payload_length,
        })
    }

    /// Total frame size (header plus declared payload).
    pub fn frame_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.payload_length as usize
    }
}

// ── WireMessage ──────────────────────────────────────────────────

/// One inbound request frame with a recognised code and a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub client_id: ClientId,
    pub version: u8,
    pub code: RequestCode,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(client_id: ClientId, version: u8, code: RequestCode, payload: Vec<u8>) -> Self {
        Self {
            client_id,
            version,
            code,
            payload,
        }
    }

    /// Decode a buffer holding exactly one request frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = RequestHeader::parse(bytes)?;
        let actual = bytes.len() - REQUEST_HEADER_LEN;
        let declared = header.payload_length as usize;
        if actual != declared {
            return Err(ProtocolError::PayloadLengthMismatch { declared, actual });
        }
        let code = RequestCode::try_from(header.code)?;

        Ok(Self {
            client_id: header.client_id,
            version: header.version,
            code,
            payload: bytes[REQUEST_HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(REQUEST_HEADER_LEN + self.payload.len());
        dst.put_slice(self.client_id.as_bytes());
        dst.put_u8(self.version);
        dst.put_u16_le(self.code as u16);
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }
}

// ── Name fields ──────────────────────────────────────────────────

/// Read a null-padded username or filename field.
///
/// The value ends at the first NUL. It must be non-empty UTF-8 with no
/// control characters and no path traversal sequences (`..`, `/`, `\`).
pub fn read_name_field(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = std::str::from_utf8(&field[..end])
        .map_err(|_| ProtocolError::from(constants::ERR_NAME_NOT_UTF8))?;
    validate_name(name)?;
    Ok(name.to_string())
}

/// Encode `name` into a 255-byte null-padded field.
pub fn write_name_field(name: &str) -> Result<[u8; NAME_FIELD_LEN]> {
    if name.len() > NAME_FIELD_LEN {
        return Err(constants::ERR_NAME_TOO_LONG.into());
    }
    let mut field = [0u8; NAME_FIELD_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

/// Check the character rules shared by usernames and filenames.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(constants::ERR_EMPTY_NAME.into());
    }
    if name.len() > NAME_FIELD_LEN {
        return Err(constants::ERR_NAME_TOO_LONG.into());
    }
    if name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(char::is_control)
    {
        return Err(constants::ERR_NAME_FORBIDDEN.into());
    }
    Ok(())
}
