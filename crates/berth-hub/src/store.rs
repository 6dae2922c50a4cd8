//! Durable storage for the connection list and the pending-request list.
//!
//! The hub reads both records once at startup and rewrites them at the end
//! of every pass; the store only has to be a dumb, durable key/value shelf.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::queue::RequestSet;
use crate::session::ConnectionSet;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn load_connections(&self) -> Result<ConnectionSet, StoreError>;
    async fn save_connections(&self, set: &ConnectionSet) -> Result<(), StoreError>;
    async fn load_requests(&self) -> Result<RequestSet, StoreError>;
    async fn save_requests(&self, set: &RequestSet) -> Result<(), StoreError>;
}

/// In-memory adapter for tests and ephemeral wiring.
#[derive(Default)]
pub struct MemoryStore {
    connections: Mutex<ConnectionSet>,
    requests: Mutex<RequestSet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn load_connections(&self) -> Result<ConnectionSet, StoreError> {
        Ok(self.connections.lock().await.clone())
    }

    async fn save_connections(&self, set: &ConnectionSet) -> Result<(), StoreError> {
        *self.connections.lock().await = set.clone();
        Ok(())
    }

    async fn load_requests(&self) -> Result<RequestSet, StoreError> {
        Ok(self.requests.lock().await.clone())
    }

    async fn save_requests(&self, set: &RequestSet) -> Result<(), StoreError> {
        *self.requests.lock().await = set.clone();
        Ok(())
    }
}

const CONNECTIONS_FILE: &str = "connections.json";
const REQUESTS_FILE: &str = "requests.json";

/// One JSON file per record under a state directory. A missing file reads as
/// the empty record; a corrupt file is an error the caller decides about.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_or_default<T>(&self, file: &str) -> Result<T, StoreError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = self.dir.join(file);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(self.dir.join(file), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl WalletStore for JsonFileStore {
    async fn load_connections(&self) -> Result<ConnectionSet, StoreError> {
        self.read_or_default(CONNECTIONS_FILE).await
    }

    async fn save_connections(&self, set: &ConnectionSet) -> Result<(), StoreError> {
        self.write(CONNECTIONS_FILE, set).await
    }

    async fn load_requests(&self) -> Result<RequestSet, StoreError> {
        self.read_or_default(REQUESTS_FILE).await
    }

    async fn save_requests(&self, set: &RequestSet) -> Result<(), StoreError> {
        self.write(REQUESTS_FILE, set).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{CallMethod, PendingRequest};
    use crate::session::{ConnectionRecord, PeerMeta, PeerSession, PeerUri};
    use serde_json::json;

    fn sample_connections() -> ConnectionSet {
        ConnectionSet::new(vec![
            ConnectionRecord {
                uri: PeerUri::parse("wc:a@1").unwrap(),
                session: PeerSession::new(PeerMeta::named("alpha"), "0xabc", 1),
            },
            ConnectionRecord {
                uri: PeerUri::parse("wc:b@1").unwrap(),
                session: PeerSession::new(PeerMeta::named("beta"), "0xabc", 137),
            },
        ])
    }

    fn sample_requests() -> RequestSet {
        RequestSet::new(vec![PendingRequest {
            uri: PeerUri::parse("wc:a@1").unwrap(),
            id: 4,
            method: CallMethod::PersonalSign,
            account: "0xabc".into(),
            chain_id: 1,
            params: json!(["0xdeadbeef", "0xabc"]),
        }])
    }

    #[tokio::test]
    async fn memory_store_round_trips_both_records() {
        let store = MemoryStore::new();
        store.save_connections(&sample_connections()).await.unwrap();
        store.save_requests(&sample_requests()).await.unwrap();
        assert_eq!(store.load_connections().await.unwrap(), sample_connections());
        assert_eq!(store.load_requests().await.unwrap(), sample_requests());
    }

    #[tokio::test]
    async fn file_store_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save_connections(&sample_connections()).await.unwrap();
        store.save_requests(&sample_requests()).await.unwrap();

        let reopened = JsonFileStore::new(dir.path());
        assert_eq!(
            reopened.load_connections().await.unwrap(),
            sample_connections()
        );
        assert_eq!(reopened.load_requests().await.unwrap(), sample_requests());
    }

    #[tokio::test]
    async fn missing_files_read_as_empty_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("never-written"));
        assert_eq!(store.load_connections().await.unwrap(), ConnectionSet::default());
        assert_eq!(store.load_requests().await.unwrap(), RequestSet::default());
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(CONNECTIONS_FILE), b"{not json")
            .await
            .unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load_connections().await,
            Err(StoreError::Serde(_))
        ));
    }
}
