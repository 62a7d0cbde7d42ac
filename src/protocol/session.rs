//! Per-connection session state.
//!
//! A [`Session`] is created when a connection is accepted and is owned by
//! that connection's task alone. The dispatcher reads it through the check
//! methods below and mutates it only after a request has fully succeeded.

use crate::core::packet::ClientId;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::SessionKey;
use std::fmt;

/// What the session expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Authentication requests or a checksum verdict
    #[default]
    Control,
    /// File content, or the final give-up signal
    Transfer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Control => f.write_str("CONTROL"),
            Mode::Transfer => f.write_str("TRANSFER"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Session {
    client_id: Option<ClientId>,
    username: Option<String>,
    session_key: Option<SessionKey>,
    pending_filename: Option<String>,
    mode: Mode,
    closed: bool,
}

impl Session {
    /// Fresh session: control mode, nothing bound.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    pub fn pending_filename(&self) -> Option<&str> {
        self.pending_filename.as_deref()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_alive(&self) -> bool {
        !self.closed
    }

    // ── Checks (no mutation) ─────────────────────────────────────

    pub fn require_alive(&self) -> Result<()> {
        if self.closed {
            return Err(constants::ERR_SESSION_CLOSED.into());
        }
        Ok(())
    }

    pub fn require_mode(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            return Ok(());
        }
        Err(match expected {
            Mode::Control => constants::ERR_NOT_CONTROL_MODE.into(),
            Mode::Transfer => constants::ERR_NOT_TRANSFER_MODE.into(),
        })
    }

    /// The request must carry the identity bound to this session.
    /// An unbound session matches nothing.
    pub fn require_identity(&self, client_id: &ClientId) -> Result<()> {
        match self.client_id {
            Some(bound) if bound == *client_id => Ok(()),
            _ => Err(constants::ERR_IDENTITY_MISMATCH.into()),
        }
    }

    pub fn require_username(&self, username: &str) -> Result<()> {
        match self.username.as_deref() {
            Some(bound) if bound == username => Ok(()),
            _ => Err(constants::ERR_USERNAME_MISMATCH.into()),
        }
    }

    pub fn require_pending(&self, filename: &str) -> Result<()> {
        match self.pending_filename.as_deref() {
            Some(pending) if pending == filename => Ok(()),
            _ => Err(constants::ERR_FILENAME_MISMATCH.into()),
        }
    }

    pub fn require_key(&self) -> Result<&SessionKey> {
        self.session_key
            .as_ref()
            .ok_or_else(|| ProtocolError::from(constants::ERR_NO_SESSION_KEY))
    }

    // ── Transitions ──────────────────────────────────────────────

    pub(crate) fn bind(&mut self, client_id: ClientId, username: String) {
        self.client_id = Some(client_id);
        self.username = Some(username);
    }

    /// Key issued: move to transfer mode.
    pub(crate) fn start_transfer(&mut self, key: SessionKey) {
        self.session_key = Some(key);
        self.mode = Mode::Transfer;
    }

    /// File stored, verdict pending.
    pub(crate) fn await_verdict(&mut self, filename: String) {
        self.pending_filename = Some(filename);
        self.mode = Mode::Control;
    }

    /// Client reported a bad checksum and will resend.
    pub(crate) fn expect_resend(&mut self) {
        self.mode = Mode::Transfer;
    }

    pub(crate) fn finish_file(&mut self) {
        self.pending_filename = None;
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_unbound_control() {
        let s = Session::new();
        assert_eq!(s.mode(), Mode::Control);
        assert!(s.is_alive());
        assert!(s.client_id().is_none());
        assert!(s.require_identity(&ClientId::UNSET).is_err());
        assert!(s.require_pending("a").is_err());
        assert!(s.require_key().is_err());
    }

    #[test]
    fn transitions_follow_the_upload_cycle() {
        let id = ClientId([3; 16]);
        let mut s = Session::new();
        s.bind(id, "alice".into());
        assert!(s.require_identity(&id).is_ok());
        assert!(s.require_username("alice").is_ok());
        assert!(s.require_username("bob").is_err());

        s.start_transfer(SessionKey::from_bytes([1; 16]));
        assert!(s.require_mode(Mode::Transfer).is_ok());
        assert!(s.require_mode(Mode::Control).is_err());

        s.await_verdict("notes.txt".into());
        assert_eq!(s.mode(), Mode::Control);
        assert!(s.require_pending("notes.txt").is_ok());

        s.expect_resend();
        assert_eq!(s.mode(), Mode::Transfer);
        assert_eq!(s.pending_filename(), Some("notes.txt"));

        s.close();
        assert!(s.require_alive().is_err());
    }
}
