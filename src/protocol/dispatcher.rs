//! Session state machine.
//!
//! [`Dispatcher::handle`] takes one parsed [`Request`] and the connection's
//! [`Session`], checks the request against the session, performs the action
//! and returns the [`Outcome`] to write back.
//!
//! | Request | Mode | Effect | Reply |
//! |---|---|---|---|
//! | `SIGN_UP` | control | register, bind | `SIGN_UP_SUCCEEDED` / `SIGN_UP_FAILED` |
//! | `SEND_PUBLIC_KEY` | control | store key, issue session key, to transfer | `PUBLIC_KEY_RECEIVED` |
//! | `SIGN_IN` | control | bind, issue session key, to transfer | `SIGN_IN_ALLOWED` / `SIGN_IN_REJECTED` |
//! | `SEND_FILE` | transfer | decrypt, checksum, store unvalidated, to control | `CRC_VALID` |
//! | `CRC_VALID` | any | mark validated | `MESSAGE_RECEIVED` |
//! | `CRC_INVALID` | any | to transfer | none |
//! | `CRC_INVALID_4TH_TIME` | transfer | close | `MESSAGE_RECEIVED` |
//!
//! Every check runs before the first side effect, and the session is changed
//! only once the store has accepted the request. A failed request is answered
//! with `GENERAL_ERROR` and leaves the session as it was. Fatal storage errors
//! are returned to the caller instead.

use crate::core::packet::{ClientId, RequestCode};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{decrypt_blocks, wrap_session_key, BLOCK_LEN};
use crate::protocol::message::{Request, Response};
use crate::protocol::session::{Mode, Session};
use crate::storage::Store;
use crate::utils::checksum::checksum;
use crate::utils::metrics::{ServerMetrics, Timer};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What to send back, and whether to hang up afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub response: Option<Response>,
    pub close: bool,
}

impl Outcome {
    pub fn reply(response: Response) -> Self {
        Self {
            response: Some(response),
            close: false,
        }
    }

    pub fn silent() -> Self {
        Self {
            response: None,
            close: false,
        }
    }

    pub fn reply_and_close(response: Response) -> Self {
        Self {
            response: Some(response),
            close: true,
        }
    }

    pub fn general_error() -> Self {
        Self::reply(Response::GeneralError)
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    metrics: Arc<ServerMetrics>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<ServerMetrics>) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Answer for a frame the codec could not turn into a request.
    ///
    /// A malformed `CRC_INVALID_4TH_TIME` still ends the connection.
    pub fn reject_frame(&self, code: u16, error: &ProtocolError) -> Outcome {
        warn!(code, error = %error, "Frame rejected before dispatch");
        self.metrics.codec_error();
        if code == RequestCode::CrcInvalid4thTime as u16 {
            return Outcome::reply_and_close(Response::GeneralError);
        }
        Outcome::general_error()
    }

    /// Run one request against the session.
    ///
    /// # Errors
    /// Only errors for which [`ProtocolError::is_fatal`] holds. Everything
    /// else becomes a `GENERAL_ERROR` outcome.
    #[instrument(
        level = "debug",
        skip_all,
        fields(code = %request.code(), client_id = %request.client_id())
    )]
    pub async fn handle(&self, session: &mut Session, request: Request) -> Result<Outcome> {
        self.metrics.request();
        let gives_up = matches!(request, Request::CrcInvalid4thTime { .. });

        match self.apply(session, request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, mode = %session.mode(), "Request rejected");
                self.metrics.protocol_error();
                if gives_up {
                    // The final give-up signal ends the connection whatever happens.
                    session.close();
                    return Ok(Outcome::reply_and_close(Response::GeneralError));
                }
                Ok(Outcome::general_error())
            }
        }
    }

    async fn apply(&self, session: &mut Session, request: Request) -> Result<Outcome> {
        session.require_alive()?;

        match request {
            Request::SignUp {
                client_id: _,
                username,
            } => self.sign_up(session, username).await,
            Request::SendPublicKey {
                client_id,
                username,
                public_key,
            } => {
                self.send_public_key(session, client_id, username, public_key)
                    .await
            }
            Request::SignIn {
                client_id,
                username,
            } => self.sign_in(session, client_id, username).await,
            Request::SendFile {
                client_id,
                content_size,
                filename,
                ciphertext,
            } => {
                self.send_file(session, client_id, content_size, filename, ciphertext)
                    .await
            }
            Request::CrcValid {
                client_id,
                filename,
            } => self.crc_valid(session, client_id, filename).await,
            Request::CrcInvalid {
                client_id,
                filename,
            } => {
                session.require_identity(&client_id)?;
                session.require_pending(&filename)?;
                session.expect_resend();
                info!(filename = %filename, "Client reported checksum mismatch, awaiting resend");
                Ok(Outcome::silent())
            }
            Request::CrcInvalid4thTime {
                client_id,
                filename,
            } => {
                session.require_mode(Mode::Transfer)?;
                session.require_identity(&client_id)?;
                session.require_pending(&filename)?;
                session.close();
                warn!(filename = %filename, "Client gave up after repeated checksum mismatches");
                Ok(Outcome::reply_and_close(Response::MessageReceived {
                    client_id,
                }))
            }
        }
    }

    async fn sign_up(&self, session: &mut Session, username: String) -> Result<Outcome> {
        session.require_mode(Mode::Control)?;

        match self.store.create_client(&username).await {
            Ok(client_id) => {
                info!(%client_id, username = %username, "Client registered");
                self.metrics.registration();
                session.bind(client_id, username);
                Ok(Outcome::reply(Response::SignUpSucceeded { client_id }))
            }
            Err(ProtocolError::DuplicateUsername) => {
                debug!(username = %username, "Sign-up refused, name taken");
                Ok(Outcome::reply(Response::SignUpFailed))
            }
            Err(e) => Err(e),
        }
    }

    async fn send_public_key(
        &self,
        session: &mut Session,
        client_id: ClientId,
        username: String,
        public_key: Vec<u8>,
    ) -> Result<Outcome> {
        session.require_mode(Mode::Control)?;
        session.require_identity(&client_id)?;
        session.require_username(&username)?;

        // A bad key fails here, before anything is persisted.
        let _timer = Timer::start("key_exchange");
        let (session_key, wrapped_key) = wrap_session_key(&public_key)?;

        self.store.set_public_key(&client_id, &public_key).await?;
        self.store.set_session_key(&client_id, &session_key).await?;

        self.metrics.key_issued();
        session.start_transfer(session_key);
        info!(%client_id, "Public key stored, session key issued");
        Ok(Outcome::reply(Response::PublicKeyReceived {
            client_id,
            wrapped_key,
        }))
    }

    async fn sign_in(
        &self,
        session: &mut Session,
        client_id: ClientId,
        username: String,
    ) -> Result<Outcome> {
        session.require_mode(Mode::Control)?;

        let record = self.store.find_by_identity(&client_id).await?;
        let Some((registered_name, public_key)) =
            record.and_then(|r| r.public_key.map(|key| (r.username, key)))
        else {
            info!(%client_id, "Sign-in rejected, client must register again");
            return Ok(Outcome::reply(Response::SignInRejected { client_id }));
        };
        if registered_name != username {
            return Err(constants::ERR_USERNAME_MISMATCH.into());
        }

        let (session_key, wrapped_key) = wrap_session_key(&public_key)?;
        self.store.set_session_key(&client_id, &session_key).await?;

        self.metrics.key_issued();
        session.bind(client_id, username);
        session.start_transfer(session_key);
        info!(%client_id, "Client signed in");
        Ok(Outcome::reply(Response::SignInAllowed {
            client_id,
            wrapped_key,
        }))
    }

    async fn send_file(
        &self,
        session: &mut Session,
        client_id: ClientId,
        content_size: u32,
        filename: String,
        ciphertext: Vec<u8>,
    ) -> Result<Outcome> {
        session.require_mode(Mode::Transfer)?;
        session.require_identity(&client_id)?;
        let key = session.require_key()?;
        let _timer = Timer::start("send_file");

        let content_len = content_size as usize;
        let needed = content_len.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if ciphertext.len() < needed {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{}: need {needed}, got {}",
                constants::ERR_CIPHERTEXT_TOO_SHORT,
                ciphertext.len()
            )));
        }

        // Bytes past the padded content are ignored.
        let mut plaintext = decrypt_blocks(key, &ciphertext[..needed])?;
        plaintext.truncate(content_len);
        let crc = checksum(&plaintext);

        let location = self
            .store
            .store_unvalidated_file(&client_id, &filename, &plaintext)
            .await?;

        self.metrics.file_received(plaintext.len() as u64);
        debug!(filename = %filename, location = %location, checksum = crc, "File stored, awaiting verdict");
        session.await_verdict(filename.clone());
        Ok(Outcome::reply(Response::CrcValid {
            client_id,
            content_size,
            filename,
            checksum: crc,
        }))
    }

    async fn crc_valid(
        &self,
        session: &mut Session,
        client_id: ClientId,
        filename: String,
    ) -> Result<Outcome> {
        session.require_identity(&client_id)?;
        session.require_pending(&filename)?;

        self.store.mark_validated(&client_id, &filename).await?;

        self.metrics.file_validated();
        session.finish_file();
        info!(%client_id, filename = %filename, "File validated");
        Ok(Outcome::reply(Response::MessageReceived { client_id }))
    }
}
