//! # Persistence Boundary
//!
//! Client registry and file store consumed by the dispatcher.
//!
//! The [`Store`] trait is the only state shared between connections. Every
//! implementation serialises its mutations behind one async mutex, which
//! makes the username uniqueness check and the insert a single step: of two
//! racing sign-ups for the same name exactly one succeeds.
//!
//! ## Implementations
//! - [`MemoryStore`]: everything in process memory
//! - [`FileStore`]: bincode registry snapshot plus one file per upload
//!
//! Errors other than `DuplicateUsername` and `UnknownClient` are reported as
//! `StorageUnavailable`, which stops the server.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::core::packet::{ClientId, SESSION_KEY_LEN};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::SessionKey;
use crate::utils::time::current_timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub identity: ClientId,
    pub username: String,
    /// Absent until the first key exchange
    pub public_key: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch
    pub last_seen: u64,
    pub session_key: Option<[u8; SESSION_KEY_LEN]>,
}

impl fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRecord")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("has_public_key", &self.public_key.is_some())
            .field("last_seen", &self.last_seen)
            .field("has_session_key", &self.session_key.is_some())
            .finish()
    }
}

/// An uploaded file, keyed by (identity, filename).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub identity: ClientId,
    pub filename: String,
    pub location: String,
    /// False until the client confirms the checksum
    pub validated: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Register `username` under a fresh identity.
    ///
    /// # Errors
    /// `DuplicateUsername` if the name is taken; the existing record is untouched.
    async fn create_client(&self, username: &str) -> Result<ClientId>;

    async fn find_by_name(&self, username: &str) -> Result<Option<ClientRecord>>;

    async fn find_by_identity(&self, identity: &ClientId) -> Result<Option<ClientRecord>>;

    async fn set_public_key(&self, identity: &ClientId, public_key: &[u8]) -> Result<()>;

    async fn set_session_key(&self, identity: &ClientId, key: &SessionKey) -> Result<()>;

    /// Persist decrypted content as unvalidated and return its location.
    /// Replaces any earlier upload of the same name by the same client.
    async fn store_unvalidated_file(
        &self,
        identity: &ClientId,
        filename: &str,
        contents: &[u8],
    ) -> Result<String>;

    async fn mark_validated(&self, identity: &ClientId, filename: &str) -> Result<()>;

    async fn find_file(&self, identity: &ClientId, filename: &str) -> Result<Option<FileRecord>>;
}

/// Build the store selected by the configuration.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::File => {
            info!(root = %config.root.display(), "Using file store");
            let store = FileStore::open(&config.root, &config.registry_file).await?;
            Ok(Arc::new(store))
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────

/// Record bookkeeping shared by both stores. Callers hold the store lock.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Registry {
    clients: HashMap<ClientId, ClientRecord>,
    files: HashMap<(ClientId, String), FileRecord>,
}

impl Registry {
    pub(crate) fn create_client(&mut self, username: &str) -> Result<ClientId> {
        if self.clients.values().any(|c| c.username == username) {
            debug!(username, "Username already registered");
            return Err(ProtocolError::DuplicateUsername);
        }

        let identity = loop {
            let candidate = ClientId::generate()?;
            if candidate != ClientId::UNSET && !self.clients.contains_key(&candidate) {
                break candidate;
            }
        };

        self.clients.insert(
            identity,
            ClientRecord {
                identity,
                username: username.to_string(),
                public_key: None,
                last_seen: current_timestamp(),
                session_key: None,
            },
        );
        Ok(identity)
    }

    pub(crate) fn find_by_name(&self, username: &str) -> Option<ClientRecord> {
        self.clients
            .values()
            .find(|c| c.username == username)
            .cloned()
    }

    pub(crate) fn find_by_identity(&self, identity: &ClientId) -> Option<ClientRecord> {
        self.clients.get(identity).cloned()
    }

    fn client_mut(&mut self, identity: &ClientId) -> Result<&mut ClientRecord> {
        let record = self
            .clients
            .get_mut(identity)
            .ok_or(ProtocolError::UnknownClient)?;
        record.last_seen = current_timestamp();
        Ok(record)
    }

    pub(crate) fn set_public_key(&mut self, identity: &ClientId, public_key: &[u8]) -> Result<()> {
        self.client_mut(identity)?.public_key = Some(public_key.to_vec());
        Ok(())
    }

    pub(crate) fn set_session_key(&mut self, identity: &ClientId, key: &SessionKey) -> Result<()> {
        self.client_mut(identity)?.session_key = Some(*key.as_bytes());
        Ok(())
    }

    /// Insert or replace the file record; the caller has already written the
    /// contents to `location`.
    pub(crate) fn put_file(&mut self, identity: &ClientId, filename: &str, location: String) -> Result<()> {
        self.client_mut(identity)?;
        self.files.insert(
            (*identity, filename.to_string()),
            FileRecord {
                identity: *identity,
                filename: filename.to_string(),
                location,
                validated: false,
            },
        );
        Ok(())
    }

    pub(crate) fn mark_validated(&mut self, identity: &ClientId, filename: &str) -> Result<()> {
        self.client_mut(identity)?;
        let record = self
            .files
            .get_mut(&(*identity, filename.to_string()))
            .ok_or_else(|| {
                ProtocolError::ProtocolViolation(format!("no upload named {filename:?}"))
            })?;
        record.validated = true;
        Ok(())
    }

    pub(crate) fn find_file(&self, identity: &ClientId, filename: &str) -> Option<FileRecord> {
        self.files.get(&(*identity, filename.to_string())).cloned()
    }
}
