//! Directory-backed store.
//!
//! ```text
//! <root>/<registry_file>                          bincode registry snapshot
//! <root>/<hex(identity)><hex(sha256(name))>.tmp   decrypted upload
//! ```
//!
//! The snapshot is rewritten after every mutation through a temporary file
//! and a rename, so a crash leaves either the old or the new registry.

use super::{ClientRecord, FileRecord, Registry, Store};
use crate::core::packet::{to_hex, ClientId};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::SessionKey;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub struct FileStore {
    root: PathBuf,
    registry_path: PathBuf,
    registry: Mutex<Registry>,
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> ProtocolError {
    error!(context, error = %e, "Storage failure");
    ProtocolError::StorageUnavailable(format!("{context}: {e}"))
}

impl FileStore {
    /// Open `root`, creating it if needed, and load the registry snapshot if
    /// one exists.
    pub async fn open(root: impl AsRef<Path>, registry_file: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable("create storage root", e))?;

        let registry_path = root.join(registry_file);
        let registry = match fs::read(&registry_path).await {
            Ok(bytes) => bincode::deserialize::<Registry>(&bytes)
                .map_err(|e| unavailable("decode registry", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Registry::default(),
            Err(e) => return Err(unavailable("read registry", e)),
        };
        info!(path = %registry_path.display(), "Registry loaded");

        Ok(Self {
            root,
            registry_path,
            registry: Mutex::new(registry),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an upload of `filename` by `identity` is written to.
    pub fn file_path(&self, identity: &ClientId, filename: &str) -> PathBuf {
        let digest = Sha256::digest(filename.as_bytes());
        self.root
            .join(format!("{}{}.tmp", identity.to_hex(), to_hex(&digest)))
    }

    async fn persist(&self, registry: &Registry) -> Result<()> {
        let bytes = bincode::serialize(registry).map_err(|e| unavailable("encode registry", e))?;
        let staging = self.registry_path.with_extension("swap");
        fs::write(&staging, &bytes)
            .await
            .map_err(|e| unavailable("write registry", e))?;
        fs::rename(&staging, &self.registry_path)
            .await
            .map_err(|e| unavailable("replace registry", e))?;
        debug!(bytes = bytes.len(), "Registry persisted");
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_client(&self, username: &str) -> Result<ClientId> {
        let mut registry = self.registry.lock().await;
        let id = registry.create_client(username)?;
        self.persist(&registry).await?;
        Ok(id)
    }

    async fn find_by_name(&self, username: &str) -> Result<Option<ClientRecord>> {
        Ok(self.registry.lock().await.find_by_name(username))
    }

    async fn find_by_identity(&self, identity: &ClientId) -> Result<Option<ClientRecord>> {
        Ok(self.registry.lock().await.find_by_identity(identity))
    }

    async fn set_public_key(&self, identity: &ClientId, public_key: &[u8]) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.set_public_key(identity, public_key)?;
        self.persist(&registry).await
    }

    async fn set_session_key(&self, identity: &ClientId, key: &SessionKey) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.set_session_key(identity, key)?;
        self.persist(&registry).await
    }

    async fn store_unvalidated_file(
        &self,
        identity: &ClientId,
        filename: &str,
        contents: &[u8],
    ) -> Result<String> {
        let mut registry = self.registry.lock().await;
        if registry.find_by_identity(identity).is_none() {
            return Err(ProtocolError::UnknownClient);
        }

        let path = self.file_path(identity, filename);
        fs::write(&path, contents)
            .await
            .map_err(|e| unavailable("write upload", e))?;

        let location = path.display().to_string();
        registry.put_file(identity, filename, location.clone())?;
        self.persist(&registry).await?;
        Ok(location)
    }

    async fn mark_validated(&self, identity: &ClientId, filename: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.mark_validated(identity, filename)?;
        self.persist(&registry).await
    }

    async fn find_file(&self, identity: &ClientId, filename: &str) -> Result<Option<FileRecord>> {
        Ok(self.registry.lock().await.find_file(identity, filename))
    }
}
