// ABOUTME: Snapshot archives of a session's outputs/ tree and the object store they live in
// ABOUTME: gzip'd tar built off the async runtime; storage failures propagate unchanged

use crate::directory::OUTPUTS_DIR;
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Durable blob storage for snapshot bytes. Retries are the implementation's concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, returning the path used to fetch them later
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;
}

/// Object store backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(SandboxError::ObjectStore {
                key: key.to_string(),
                reason: "key must be a relative path without '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(key.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| SandboxError::ObjectStore {
            key: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Key layout: `sandbox-snapshots/{tenant_id}/{session_id}/{snapshot_id}.tar.gz`
pub fn snapshot_key(tenant_id: &str, session_id: &str, snapshot_id: &str) -> String {
    format!(
        "sandbox-snapshots/{}/{}/{}.tar.gz",
        tenant_id, session_id, snapshot_id
    )
}

pub struct SnapshotManager {
    store: Arc<dyn ObjectStore>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Archive `<session_path>/outputs` and upload it.
    ///
    /// Returns `(snapshot_id, storage_path, size_bytes)`.
    pub async fn create_snapshot(
        &self,
        session_path: &Path,
        session_id: &str,
        tenant_id: &str,
    ) -> Result<(String, String, u64)> {
        let outputs = session_path.join(OUTPUTS_DIR);
        if !outputs.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "outputs directory {}",
                outputs.display()
            )));
        }

        let archive = tokio::task::spawn_blocking(move || pack_outputs(&outputs))
            .await
            .map_err(std::io::Error::other)??;
        let size_bytes = archive.len() as u64;

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let key = snapshot_key(tenant_id, session_id, &snapshot_id);
        let storage_path = self.store.put(archive, &key).await?;

        info!(
            "Created snapshot {} for session {} ({} bytes)",
            snapshot_id, session_id, size_bytes
        );
        Ok((snapshot_id, storage_path, size_bytes))
    }

    /// Download a snapshot and unpack it into `destination`, overwriting
    /// files that already exist there.
    pub async fn restore_snapshot(&self, storage_path: &str, destination: &Path) -> Result<()> {
        let bytes = self.store.get(storage_path).await?;
        let destination = destination.to_path_buf();

        debug!(
            "Restoring snapshot {} into {}",
            storage_path,
            destination.display()
        );
        tokio::task::spawn_blocking(move || unpack_archive(&bytes, &destination))
            .await
            .map_err(std::io::Error::other)??;

        info!("Restored snapshot {}", storage_path);
        Ok(())
    }
}

fn pack_outputs(outputs: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(OUTPUTS_DIR, outputs)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn unpack_archive(bytes: &[u8], destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.unpack(destination)?;
    Ok(())
}
