//! Typed requests and responses.
//!
//! A [`WireMessage`] carries a raw payload. [`Request::parse`] turns it into one
//! variant per request code with a statically shaped payload, so the dispatcher
//! can match exhaustively instead of slicing bytes.
//!
//! Responses go the other way:
//!
//! ```text
//! [Version(1)] [Status(2)] [PayloadLength(4)] [Payload(N)]
//! ```

use crate::config::PROTOCOL_VERSION;
use crate::core::packet::{
    read_name_field, write_name_field, ClientId, RequestCode, WireMessage, CLIENT_ID_LEN,
    CONTENT_SIZE_LEN, NAME_FIELD_LEN, PUBLIC_KEY_LEN, WRAPPED_KEY_LEN,
};
use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Response header: version + status + payload length
pub const RESPONSE_HEADER_LEN: usize = 1 + 2 + 4;

/// Payload size of a server `CRC_VALID` response
pub const CRC_RESPONSE_PAYLOAD_LEN: usize = CLIENT_ID_LEN + CONTENT_SIZE_LEN + NAME_FIELD_LEN + 4;

// ── Request ──────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    SignUp {
        client_id: ClientId,
        username: String,
    },
    SendPublicKey {
        client_id: ClientId,
        username: String,
        public_key: Vec<u8>,
    },
    SignIn {
        client_id: ClientId,
        username: String,
    },
    SendFile {
        client_id: ClientId,
        content_size: u32,
        filename: String,
        ciphertext: Vec<u8>,
    },
    CrcValid {
        client_id: ClientId,
        filename: String,
    },
    CrcInvalid {
        client_id: ClientId,
        filename: String,
    },
    CrcInvalid4thTime {
        client_id: ClientId,
        filename: String,
    },
}

fn expect_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{}: expected {expected}, got {}",
            constants::ERR_PAYLOAD_SIZE,
            payload.len()
        )));
    }
    Ok(())
}

impl Request {
    /// Shape-check the payload of a decoded frame.
    ///
    /// Size and name errors are protocol violations, not codec errors: the
    /// frame itself was well formed.
    pub fn parse(msg: WireMessage) -> Result<Self> {
        let client_id = msg.client_id;
        let payload = msg.payload;

        let request = match msg.code {
            RequestCode::SignUp => {
                expect_len(&payload, NAME_FIELD_LEN)?;
                Request::SignUp {
                    client_id,
                    username: read_name_field(&payload)?,
                }
            }
            RequestCode::SendPublicKey => {
                expect_len(&payload, NAME_FIELD_LEN + PUBLIC_KEY_LEN)?;
                Request::SendPublicKey {
                    client_id,
                    username: read_name_field(&payload[..NAME_FIELD_LEN])?,
                    public_key: payload[NAME_FIELD_LEN..].to_vec(),
                }
            }
            RequestCode::SignIn => {
                expect_len(&payload, NAME_FIELD_LEN)?;
                Request::SignIn {
                    client_id,
                    username: read_name_field(&payload)?,
                }
            }
            RequestCode::SendFile => {
                let prefix = CONTENT_SIZE_LEN + NAME_FIELD_LEN;
                if payload.len() < prefix {
                    return Err(ProtocolError::ProtocolViolation(format!(
                        "{}: expected at least {prefix}, got {}",
                        constants::ERR_PAYLOAD_SIZE,
                        payload.len()
                    )));
                }
                let content_size =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Request::SendFile {
                    client_id,
                    content_size,
                    filename: read_name_field(&payload[CONTENT_SIZE_LEN..prefix])?,
                    ciphertext: payload[prefix..].to_vec(),
                }
            }
            RequestCode::CrcValid => {
                expect_len(&payload, NAME_FIELD_LEN)?;
                Request::CrcValid {
                    client_id,
                    filename: read_name_field(&payload)?,
                }
            }
            RequestCode::CrcInvalid => {
                expect_len(&payload, NAME_FIELD_LEN)?;
                Request::CrcInvalid {
                    client_id,
                    filename: read_name_field(&payload)?,
                }
            }
            RequestCode::CrcInvalid4thTime => {
                expect_len(&payload, NAME_FIELD_LEN)?;
                Request::CrcInvalid4thTime {
                    client_id,
                    filename: read_name_field(&payload)?,
                }
            }
        };
        Ok(request)
    }

    /// Build the wire frame for this request (client side).
    pub fn into_wire(self, version: u8) -> Result<WireMessage> {
        let code = self.code();
        let client_id = self.client_id();
        let payload = match self {
            Request::SignUp { username, .. } | Request::SignIn { username, .. } => {
                write_name_field(&username)?.to_vec()
            }
            Request::SendPublicKey {
                username,
                public_key,
                ..
            } => {
                if public_key.len() != PUBLIC_KEY_LEN {
                    return Err(ProtocolError::KeyImportError(format!(
                        "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                        public_key.len()
                    )));
                }
                let mut payload = write_name_field(&username)?.to_vec();
                payload.extend_from_slice(&public_key);
                payload
            }
            Request::SendFile {
                content_size,
                filename,
                ciphertext,
                ..
            } => {
                let mut payload =
                    Vec::with_capacity(CONTENT_SIZE_LEN + NAME_FIELD_LEN + ciphertext.len());
                payload.extend_from_slice(&content_size.to_le_bytes());
                payload.extend_from_slice(&write_name_field(&filename)?);
                payload.extend_from_slice(&ciphertext);
                payload
            }
            Request::CrcValid { filename, .. }
            | Request::CrcInvalid { filename, .. }
            | Request::CrcInvalid4thTime { filename, .. } => write_name_field(&filename)?.to_vec(),
        };
        Ok(WireMessage::new(client_id, version, code, payload))
    }

    pub fn code(&self) -> RequestCode {
        match self {
            Request::SignUp { .. } => RequestCode::SignUp,
            Request::SendPublicKey { .. } => RequestCode::SendPublicKey,
            Request::SignIn { .. } => RequestCode::SignIn,
            Request::SendFile { .. } => RequestCode::SendFile,
            Request::CrcValid { .. } => RequestCode::CrcValid,
            Request::CrcInvalid { .. } => RequestCode::CrcInvalid,
            Request::CrcInvalid4thTime { .. } => RequestCode::CrcInvalid4thTime,
        }
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            Request::SignUp { client_id, .. }
            | Request::SendPublicKey { client_id, .. }
            | Request::SignIn { client_id, .. }
            | Request::SendFile { client_id, .. }
            | Request::CrcValid { client_id, .. }
            | Request::CrcInvalid { client_id, .. }
            | Request::CrcInvalid4thTime { client_id, .. } => *client_id,
        }
    }
}

// Key material and file bodies stay out of logs.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::SendFile {
                client_id,
                content_size,
                filename,
                ciphertext,
            } => f
                .debug_struct("SendFile")
                .field("client_id", client_id)
                .field("content_size", content_size)
                .field("filename", filename)
                .field("ciphertext_len", &ciphertext.len())
                .finish(),
            Request::SendPublicKey {
                client_id,
                username,
                ..
            } => f
                .debug_struct("SendPublicKey")
                .field("client_id", client_id)
                .field("username", username)
                .finish_non_exhaustive(),
            other => f
                .debug_struct("Request")
                .field("code", &other.code())
                .field("client_id", &other.client_id())
                .finish_non_exhaustive(),
        }
    }
}

// ── ResponseCode ─────────────────────────────────────────────────

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    SignUpSucceeded = 1600,
    SignUpFailed = 1601,
    PublicKeyReceived = 1602,
    CrcValid = 1603,
    MessageReceived = 1604,
    SignInAllowed = 1605,
    SignInRejected = 1606,
    GeneralError = 1607,
}

impl TryFrom<u16> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1600 => Ok(ResponseCode::SignUpSucceeded),
            1601 => Ok(ResponseCode::SignUpFailed),
            1602 => Ok(ResponseCode::PublicKeyReceived),
            1603 => Ok(ResponseCode::CrcValid),
            1604 => Ok(ResponseCode::MessageReceived),
            1605 => Ok(ResponseCode::SignInAllowed),
            1606 => Ok(ResponseCode::SignInRejected),
            1607 => Ok(ResponseCode::GeneralError),
            other => Err(ProtocolError::UnknownMessageCode(other)),
        }
    }
}

// ── Response ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    SignUpSucceeded {
        client_id: ClientId,
    },
    SignUpFailed,
    PublicKeyReceived {
        client_id: ClientId,
        wrapped_key: [u8; WRAPPED_KEY_LEN],
    },
    CrcValid {
        client_id: ClientId,
        content_size: u32,
        filename: String,
        checksum: u32,
    },
    MessageReceived {
        client_id: ClientId,
    },
    SignInAllowed {
        client_id: ClientId,
        wrapped_key: [u8; WRAPPED_KEY_LEN],
    },
    SignInRejected {
        client_id: ClientId,
    },
    GeneralError,
}

impl Response {
    pub fn code(&self) -> ResponseCode {
        match self {
            Response::SignUpSucceeded { .. } => ResponseCode::SignUpSucceeded,
            Response::SignUpFailed => ResponseCode::SignUpFailed,
            Response::PublicKeyReceived { .. } => ResponseCode::PublicKeyReceived,
            Response::CrcValid { .. } => ResponseCode::CrcValid,
            Response::MessageReceived { .. } => ResponseCode::MessageReceived,
            Response::SignInAllowed { .. } => ResponseCode::SignInAllowed,
            Response::SignInRejected { .. } => ResponseCode::SignInRejected,
            Response::GeneralError => ResponseCode::GeneralError,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Response::SignUpFailed | Response::GeneralError => 0,
            Response::SignUpSucceeded { .. }
            | Response::MessageReceived { .. }
            | Response::SignInRejected { .. } => CLIENT_ID_LEN,
            Response::PublicKeyReceived { .. } | Response::SignInAllowed { .. } => {
                CLIENT_ID_LEN + WRAPPED_KEY_LEN
            }
            Response::CrcValid { .. } => CRC_RESPONSE_PAYLOAD_LEN,
        }
    }

    /// Encode with the server's protocol version.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + self.payload_len());
        self.encode_into(PROTOCOL_VERSION, &mut buf);
        buf.to_vec()
    }

    /// Append the framed response to `dst`.
    ///
    /// Infallible: every field was validated when the response was built.
    /// A filename longer than the field is cut at 255 bytes.
    pub fn encode_into(&self, version: u8, dst: &mut BytesMut) {
        dst.reserve(RESPONSE_HEADER_LEN + self.payload_len());
        dst.put_u8(version);
        dst.put_u16_le(self.code() as u16);
        dst.put_u32_le(self.payload_len() as u32);

        match self {
            Response::SignUpFailed | Response::GeneralError => {}
            Response::SignUpSucceeded { client_id }
            | Response::MessageReceived { client_id }
            | Response::SignInRejected { client_id } => dst.put_slice(client_id.as_bytes()),
            Response::PublicKeyReceived {
                client_id,
                wrapped_key,
            }
            | Response::SignInAllowed {
                client_id,
                wrapped_key,
            } => {
                dst.put_slice(client_id.as_bytes());
                dst.put_slice(wrapped_key);
            }
            Response::CrcValid {
                client_id,
                content_size,
                filename,
                checksum,
            } => {
                dst.put_slice(client_id.as_bytes());
                dst.put_u32_le(*content_size);
                let name = filename.as_bytes();
                let used = name.len().min(NAME_FIELD_LEN);
                dst.put_slice(&name[..used]);
                dst.put_bytes(0, NAME_FIELD_LEN - used);
                dst.put_u32_le(*checksum);
            }
        }
    }
}

/// A response together with the version byte it travelled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub version: u8,
    pub response: Response,
}

impl WireResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + self.response.payload_len());
        self.response.encode_into(self.version, &mut buf);
        buf.to_vec()
    }

    /// Decode a buffer holding exactly one response frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::MalformedHeader);
        }
        let version = bytes[0];
        let raw_code = u16::from_le_bytes([bytes[1], bytes[2]]);
        let declared = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        let payload = &bytes[RESPONSE_HEADER_LEN..];
        if payload.len() != declared {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        let code = ResponseCode::try_from(raw_code)?;

        let id = |p: &[u8]| {
            ClientId::from_slice(&p[..CLIENT_ID_LEN])
                .ok_or_else(|| ProtocolError::from(constants::ERR_PAYLOAD_SIZE))
        };
        let key = |p: &[u8]| -> Result<[u8; WRAPPED_KEY_LEN]> {
            p[CLIENT_ID_LEN..]
                .try_into()
                .map_err(|_| ProtocolError::from(constants::ERR_PAYLOAD_SIZE))
        };

        let response = match code {
            ResponseCode::SignUpFailed => {
                expect_len(payload, 0)?;
                Response::SignUpFailed
            }
            ResponseCode::GeneralError => {
                expect_len(payload, 0)?;
                Response::GeneralError
            }
            ResponseCode::SignUpSucceeded => {
                expect_len(payload, CLIENT_ID_LEN)?;
                Response::SignUpSucceeded {
                    client_id: id(payload)?,
                }
            }
            ResponseCode::MessageReceived => {
                expect_len(payload, CLIENT_ID_LEN)?;
                Response::MessageReceived {
                    client_id: id(payload)?,
                }
            }
            ResponseCode::SignInRejected => {
                expect_len(payload, CLIENT_ID_LEN)?;
                Response::SignInRejected {
                    client_id: id(payload)?,
                }
            }
            ResponseCode::PublicKeyReceived => {
                expect_len(payload, CLIENT_ID_LEN + WRAPPED_KEY_LEN)?;
                Response::PublicKeyReceived {
                    client_id: id(payload)?,
                    wrapped_key: key(payload)?,
                }
            }
            ResponseCode::SignInAllowed => {
                expect_len(payload, CLIENT_ID_LEN + WRAPPED_KEY_LEN)?;
                Response::SignInAllowed {
                    client_id: id(payload)?,
                    wrapped_key: key(payload)?,
                }
            }
            ResponseCode::CrcValid => {
                expect_len(payload, CRC_RESPONSE_PAYLOAD_LEN)?;
                let size_at = CLIENT_ID_LEN;
                let name_at = size_at + CONTENT_SIZE_LEN;
                let crc_at = name_at + NAME_FIELD_LEN;
                Response::CrcValid {
                    client_id: id(payload)?,
                    content_size: u32::from_le_bytes([
                        payload[size_at],
                        payload[size_at + 1],
                        payload[size_at + 2],
                        payload[size_at + 3],
                    ]),
                    filename: read_name_field(&payload[name_at..crc_at])?,
                    checksum: u32::from_le_bytes([
                        payload[crc_at],
                        payload[crc_at + 1],
                        payload[crc_at + 2],
                        payload[crc_at + 3],
                    ]),
                }
            }
        };

        Ok(Self { version, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(code: RequestCode, payload: Vec<u8>) -> WireMessage {
        WireMessage::new(ClientId([7; 16]), 3, code, payload)
    }

    #[test]
    fn parse_send_file() {
        let mut payload = 5u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&write_name_field("notes.txt").unwrap());
        payload.extend_from_slice(&[0xCC; 16]);

        match Request::parse(wire(RequestCode::SendFile, payload)).unwrap() {
            Request::SendFile {
                content_size,
                filename,
                ciphertext,
                ..
            } => {
                assert_eq!(content_size, 5);
                assert_eq!(filename, "notes.txt");
                assert_eq!(ciphertext.len(), 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_payload_size_is_violation() {
        let err = Request::parse(wire(RequestCode::SignUp, vec![b'a'; 254])).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));

        let err = Request::parse(wire(RequestCode::SendPublicKey, vec![b'a'; 255])).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));

        let err = Request::parse(wire(RequestCode::SendFile, vec![0; 258])).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn request_into_wire_and_back() {
        let req = Request::CrcInvalid {
            client_id: ClientId([9; 16]),
            filename: "a.bin".into(),
        };
        let msg = req.clone().into_wire(3).unwrap();
        assert_eq!(msg.code, RequestCode::CrcInvalid);
        assert_eq!(Request::parse(msg).unwrap(), req);
    }

    #[test]
    fn response_sizes() {
        let id = ClientId([1; 16]);
        assert_eq!(Response::GeneralError.encode().len(), 7);
        assert_eq!(Response::SignUpSucceeded { client_id: id }.encode().len(), 23);
        assert_eq!(
            Response::SignInAllowed {
                client_id: id,
                wrapped_key: [2; WRAPPED_KEY_LEN]
            }
            .encode()
            .len(),
            7 + 144
        );
        assert_eq!(
            Response::CrcValid {
                client_id: id,
                content_size: 5,
                filename: "notes.txt".into(),
                checksum: 1
            }
            .encode()
            .len(),
            7 + 279
        );
    }

    #[test]
    fn response_header_layout() {
        let bytes = Response::MessageReceived {
            client_id: ClientId([4; 16]),
        }
        .encode();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 1604);
        assert_eq!(u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]), 16);
        assert_eq!(&bytes[7..], &[4; 16]);
    }

    #[test]
    fn crc_response_decodes() {
        let resp = Response::CrcValid {
            client_id: ClientId([3; 16]),
            content_size: 5,
            filename: "notes.txt".into(),
            checksum: 3_287_646_509,
        };
        let decoded = WireResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.response, resp);
    }

    #[test]
    fn response_decode_rejects_bad_sizes() {
        let mut bytes = Response::GeneralError.encode();
        bytes[3] = 1;
        bytes.push(0);
        assert!(matches!(
            WireResponse::decode(&bytes),
            Err(ProtocolError::ProtocolViolation(_))
        ));
        assert!(matches!(
            WireResponse::decode(&[3, 0x40, 0x06]),
            Err(ProtocolError::MalformedHeader)
        ));
    }
}
