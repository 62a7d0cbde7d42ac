//! Reference client.
//!
//! Speaks the same protocol as the server over one TCP connection. Each
//! request code has a method; [`BackupClient::backup_file`] runs the whole
//! upload with the checksum retry policy.

use crate::config::PROTOCOL_VERSION;
use crate::core::codec::ResponseCodec;
use crate::core::packet::{ClientId, WireMessage};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{encrypt_blocks, ClientKeyPair, SessionKey};
use crate::protocol::message::{Request, Response};
use crate::utils::checksum::checksum;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

/// Uploads attempted before the client gives up on a file.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// How [`BackupClient::backup_file`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Checksums matched on the given attempt
    Validated { attempts: u32 },
    /// Every attempt mismatched; the server has closed the connection
    GaveUp,
}

pub struct BackupClient {
    framed: Framed<TcpStream, ResponseCodec>,
    keys: ClientKeyPair,
    client_id: ClientId,
    username: Option<String>,
    session_key: Option<SessionKey>,
}

impl BackupClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A, keys: ClientKeyPair) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, ResponseCodec::default()),
            keys,
            client_id: ClientId::UNSET,
            username: None,
            session_key: None,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Override the negotiated key, e.g. to exercise the mismatch path.
    pub fn set_session_key(&mut self, key: SessionKey) {
        self.session_key = Some(key);
    }

    /// Write one raw frame.
    pub async fn send_wire(&mut self, msg: WireMessage) -> Result<()> {
        self.framed.send(msg).await
    }

    /// Read the next response.
    pub async fn recv(&mut self) -> Result<Response> {
        match self.framed.next().await {
            Some(frame) => Ok(frame?.response),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.send(request).await?;
        self.recv().await
    }

    async fn send(&mut self, request: Request) -> Result<()> {
        debug!(?request, "Sending request");
        let wire = request.into_wire(PROTOCOL_VERSION)?;
        self.send_wire(wire).await
    }

    fn username(&self) -> Result<String> {
        self.username
            .clone()
            .ok_or_else(|| ProtocolError::from(constants::ERR_USERNAME_MISMATCH))
    }

    /// Register; on success the returned identity is kept for later requests.
    #[instrument(skip(self))]
    pub async fn sign_up(&mut self, username: &str) -> Result<Response> {
        let response = self
            .call(Request::SignUp {
                client_id: ClientId::UNSET,
                username: username.to_string(),
            })
            .await?;
        if let Response::SignUpSucceeded { client_id } = response {
            info!(%client_id, "Registered");
            self.client_id = client_id;
            self.username = Some(username.to_string());
        }
        Ok(response)
    }

    /// Send the public key; on success the session key is unwrapped and kept.
    pub async fn send_public_key(&mut self) -> Result<Response> {
        let public_key = self.keys.public_key_der()?;
        let username = self.username()?;
        let response = self
            .call(Request::SendPublicKey {
                client_id: self.client_id,
                username,
                public_key,
            })
            .await?;
        if let Response::PublicKeyReceived { wrapped_key, .. } = &response {
            self.session_key = Some(self.keys.unwrap_session_key(wrapped_key)?);
        }
        Ok(response)
    }

    /// Sign in with an identity from an earlier registration.
    #[instrument(skip(self))]
    pub async fn sign_in(&mut self, client_id: ClientId, username: &str) -> Result<Response> {
        self.client_id = client_id;
        self.username = Some(username.to_string());
        let response = self
            .call(Request::SignIn {
                client_id,
                username: username.to_string(),
            })
            .await?;
        if let Response::SignInAllowed { wrapped_key, .. } = &response {
            self.session_key = Some(self.keys.unwrap_session_key(wrapped_key)?);
        }
        Ok(response)
    }

    /// Encrypt and upload `data` under `filename`.
    pub async fn send_file(&mut self, filename: &str, data: &[u8]) -> Result<Response> {
        let key = self
            .session_key
            .as_ref()
            .ok_or_else(|| ProtocolError::from(constants::ERR_NO_SESSION_KEY))?;
        let content_size = u32::try_from(data.len())
            .map_err(|_| ProtocolError::OversizedPacket(data.len()))?;
        let ciphertext = encrypt_blocks(key, data)?;

        self.call(Request::SendFile {
            client_id: self.client_id,
            content_size,
            filename: filename.to_string(),
            ciphertext,
        })
        .await
    }

    pub async fn crc_valid(&mut self, filename: &str) -> Result<Response> {
        self.call(Request::CrcValid {
            client_id: self.client_id,
            filename: filename.to_string(),
        })
        .await
    }

    /// Report a mismatch. The server does not answer.
    pub async fn crc_invalid(&mut self, filename: &str) -> Result<()> {
        self.send(Request::CrcInvalid {
            client_id: self.client_id,
            filename: filename.to_string(),
        })
        .await
    }

    pub async fn crc_invalid_4th_time(&mut self, filename: &str) -> Result<Response> {
        self.call(Request::CrcInvalid4thTime {
            client_id: self.client_id,
            filename: filename.to_string(),
        })
        .await
    }

    /// Upload `data` and confirm its checksum.
    ///
    /// A mismatch is reported with `CRC_INVALID` and the file sent again, up
    /// to [`MAX_SEND_ATTEMPTS`] uploads. After the last mismatch the client
    /// sends `CRC_INVALID_4TH_TIME`, its fourth invalid report, and the
    /// server hangs up.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn backup_file(&mut self, filename: &str, data: &[u8]) -> Result<BackupOutcome> {
        let expected = checksum(data);

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.send_file(filename, data).await? {
                Response::CrcValid { checksum, .. } if checksum == expected => {
                    match self.crc_valid(filename).await? {
                        Response::MessageReceived { .. } => {
                            info!(attempt, "Backup confirmed");
                            return Ok(BackupOutcome::Validated { attempts: attempt });
                        }
                        other => return Err(unexpected(&other)),
                    }
                }
                Response::CrcValid { checksum, .. } => {
                    warn!(attempt, expected, got = checksum, "Checksum mismatch");
                    self.crc_invalid(filename).await?;
                }
                other => return Err(unexpected(&other)),
            }
        }

        match self.crc_invalid_4th_time(filename).await? {
            Response::MessageReceived { .. } => Ok(BackupOutcome::GaveUp),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> ProtocolError {
    ProtocolError::ProtocolViolation(format!("unexpected response {:?}", response.code()))
}
