//! Stream framing for `tokio_util::codec::Framed`.
//!
//! [`RequestCodec`] is the server side: it reassembles request frames from
//! partial reads and encodes responses. [`ResponseCodec`] is the mirror used
//! by the client.
//!
//! A frame that is complete but undecodable (unknown code, bad payload shape)
//! is yielded as [`Inbound::Rejected`] so the connection can answer
//! `GENERAL_ERROR` and keep reading. Only a declared length above the
//! configured maximum is a stream error, since the rest of the stream can no
//! longer be trusted.

use crate::config::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::core::packet::{RequestHeader, WireMessage, REQUEST_HEADER_LEN};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Request, Response, WireResponse, RESPONSE_HEADER_LEN};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// One decoded frame from a client.
#[derive(Debug)]
pub enum Inbound {
    Request(Request),
    /// The frame was consumed but could not be turned into a request.
    /// `code` is the raw header code, known or not.
    Rejected { code: u16, error: ProtocolError },
}

#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_payload_size: usize,
}

impl RequestCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for RequestCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        if src.len() < REQUEST_HEADER_LEN {
            src.reserve(REQUEST_HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = RequestHeader::parse(&src[..REQUEST_HEADER_LEN])?;
        let declared = header.payload_length as usize;
        if declared > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(declared));
        }

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            trace!(have = src.len(), need = frame_len, "Partial frame buffered");
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let inbound = match WireMessage::decode(&frame).and_then(Request::parse) {
            Ok(request) => {
                trace!(version = header.version, ?request, "Frame decoded");
                Inbound::Request(request)
            }
            Err(error) => Inbound::Rejected {
                code: header.code,
                error,
            },
        };
        Ok(Some(inbound))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Peer closed mid-frame, discarding");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Response> for RequestCodec {
    type Error = ProtocolError;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<()> {
        response.encode_into(PROTOCOL_VERSION, dst);
        Ok(())
    }
}

/// Client-side framing: requests out, responses in.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    max_payload_size: usize,
}

impl ResponseCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for ResponseCodec {
    type Item = WireResponse;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireResponse>> {
        if src.len() < RESPONSE_HEADER_LEN {
            src.reserve(RESPONSE_HEADER_LEN - src.len());
            return Ok(None);
        }

        let declared = u32::from_le_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if declared > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(declared));
        }

        let frame_len = RESPONSE_HEADER_LEN + declared;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        WireResponse::decode(&frame).map(Some)
    }
}

impl Encoder<WireMessage> for ResponseCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: WireMessage, dst: &mut BytesMut) -> Result<()> {
        msg.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{write_name_field, ClientId, RequestCode};

    fn sign_up_bytes() -> Vec<u8> {
        WireMessage::new(
            ClientId::UNSET,
            3,
            RequestCode::SignUp,
            write_name_field("alice").unwrap().to_vec(),
        )
        .encode()
    }

    #[test]
    fn reassembles_byte_by_byte() {
        let mut codec = RequestCodec::default();
        let mut buf = BytesMut::new();
        let bytes = sign_up_bytes();

        for (i, b) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let item = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(item.is_none());
            } else {
                assert!(matches!(
                    item,
                    Some(Inbound::Request(Request::SignUp { ref username, .. })) if username == "alice"
                ));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = RequestCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&sign_up_bytes());
        buf.extend_from_slice(&sign_up_bytes());

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_code_is_rejected_not_fatal() {
        let mut codec = RequestCodec::default();
        let mut bytes = sign_up_bytes();
        bytes[17..19].copy_from_slice(&999u16.to_le_bytes());
        let mut buf = BytesMut::from(&bytes[..]);

        let item = codec.decode(&mut buf).unwrap();
        assert!(matches!(
            item,
            Some(Inbound::Rejected {
                code: 999,
                error: ProtocolError::UnknownMessageCode(999)
            })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejected_frame_keeps_its_code() {
        let mut codec = RequestCodec::default();
        let msg = WireMessage::new(
            ClientId::UNSET,
            3,
            RequestCode::CrcInvalid4thTime,
            vec![0u8; 10],
        );
        let mut buf = BytesMut::from(&msg.encode()[..]);

        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Rejected { code, error }) => {
                assert_eq!(code, RequestCode::CrcInvalid4thTime as u16);
                assert!(matches!(error, ProtocolError::ProtocolViolation(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_declaration_is_an_error() {
        let mut codec = RequestCodec::new(1024);
        let mut header = vec![0u8; 16];
        header.push(3);
        header.extend_from_slice(&1028u16.to_le_bytes());
        header.extend_from_slice(&2048u32.to_le_bytes());
        let mut buf = BytesMut::from(&header[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(2048))
        ));
    }

    #[test]
    fn eof_mid_frame_is_quiet() {
        let mut codec = RequestCodec::default();
        let bytes = sign_up_bytes();
        let mut buf = BytesMut::from(&bytes[..40]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn response_codec_reads_what_server_writes() {
        let mut server = RequestCodec::default();
        let mut client = ResponseCodec::default();
        let mut buf = BytesMut::new();

        let response = Response::MessageReceived {
            client_id: ClientId([9; 16]),
        };
        server.encode(response.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), RESPONSE_HEADER_LEN + 16);

        let decoded = client.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.response, response);
    }
}
