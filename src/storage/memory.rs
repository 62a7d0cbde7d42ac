//! In-memory store.

use super::{ClientRecord, FileRecord, Registry, Store};
use crate::core::packet::ClientId;
use crate::error::Result;
use crate::protocol::handshake::SessionKey;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Default)]
struct Inner {
    registry: Registry,
    contents: HashMap<(ClientId, String), Vec<u8>>,
}

/// Registry and file contents kept in process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored contents of an upload, validated or not.
    pub async fn contents(&self, identity: &ClientId, filename: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .contents
            .get(&(*identity, filename.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_client(&self, username: &str) -> Result<ClientId> {
        let mut inner = self.inner.lock().await;
        let id = inner.registry.create_client(username)?;
        trace!(client_id = %id, username, "Client registered");
        Ok(id)
    }

    async fn find_by_name(&self, username: &str) -> Result<Option<ClientRecord>> {
        Ok(self.inner.lock().await.registry.find_by_name(username))
    }

    async fn find_by_identity(&self, identity: &ClientId) -> Result<Option<ClientRecord>> {
        Ok(self.inner.lock().await.registry.find_by_identity(identity))
    }

    async fn set_public_key(&self, identity: &ClientId, public_key: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .await
            .registry
            .set_public_key(identity, public_key)
    }

    async fn set_session_key(&self, identity: &ClientId, key: &SessionKey) -> Result<()> {
        self.inner.lock().await.registry.set_session_key(identity, key)
    }

    async fn store_unvalidated_file(
        &self,
        identity: &ClientId,
        filename: &str,
        contents: &[u8],
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let location = format!("memory://{}/{}", identity.to_hex(), filename);
        inner
            .registry
            .put_file(identity, filename, location.clone())?;
        inner
            .contents
            .insert((*identity, filename.to_string()), contents.to_vec());
        trace!(client_id = %identity, filename, len = contents.len(), "File stored");
        Ok(location)
    }

    async fn mark_validated(&self, identity: &ClientId, filename: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .registry
            .mark_validated(identity, filename)
    }

    async fn find_file(&self, identity: &ClientId, filename: &str) -> Result<Option<FileRecord>> {
        Ok(self.inner.lock().await.registry.find_file(identity, filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::Arc;

    #[tokio::test]
    async fn racing_signups_register_once() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.create_client("alice").await },
            ));
        }

        let mut ok = 0;
        let mut dup = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(ProtocolError::DuplicateUsername) => dup += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((ok, dup), (1, 7));
    }

    #[tokio::test]
    async fn file_lifecycle() {
        let store = MemoryStore::new();
        let id = store.create_client("dave").await.unwrap();
        let location = store
            .store_unvalidated_file(&id, "notes.txt", b"hello")
            .await
            .unwrap();
        assert!(location.starts_with("memory://"));
        assert_eq!(store.contents(&id, "notes.txt").await.unwrap(), b"hello");

        let record = store.find_file(&id, "notes.txt").await.unwrap().unwrap();
        assert!(!record.validated);

        store.mark_validated(&id, "notes.txt").await.unwrap();
        assert!(store.find_file(&id, "notes.txt").await.unwrap().unwrap().validated);
    }
}
