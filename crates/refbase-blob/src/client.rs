// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob storage clients.

use crate::model::BlobFile;
use async_trait::async_trait;
use refbase_error::{RepoError, RepoResult};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Async client over one blob storage backend.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Upload (or replace) a file.
    async fn upload(&self, file: &BlobFile, content: Vec<u8>) -> RepoResult<()>;

    /// Read a whole file.
    async fn read(&self, file: &BlobFile) -> RepoResult<Vec<u8>>;

    /// Read a newline-delimited file as lines. Trailing empty lines are
    /// dropped; interior empty lines are preserved (they carry ordinals).
    async fn read_lines(&self, file: &BlobFile) -> RepoResult<Vec<String>> {
        let bytes = self.read(file).await?;
        let text = String::from_utf8(bytes).map_err(|e| RepoError::Blob {
            detail: format!("artifact is not valid UTF-8: {e}"),
        })?;
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        Ok(lines)
    }

    /// Append JSONL lines into one artifact and upload it.
    async fn upload_lines(&self, file: &BlobFile, lines: &[String]) -> RepoResult<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        self.upload(file, content.into_bytes()).await
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobClient
// ---------------------------------------------------------------------------

/// In-memory client for tests and embedded use.
#[derive(Default)]
pub struct MemoryBlobClient {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobClient {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobClient for MemoryBlobClient {
    async fn upload(&self, file: &BlobFile, content: Vec<u8>) -> RepoResult<()> {
        self.files.write().await.insert(file.uri(), content);
        Ok(())
    }

    async fn read(&self, file: &BlobFile) -> RepoResult<Vec<u8>> {
        self.files
            .read()
            .await
            .get(&file.uri())
            .cloned()
            .ok_or_else(|| RepoError::not_found("blob", file.uri()))
    }
}

// ---------------------------------------------------------------------------
// FsBlobClient
// ---------------------------------------------------------------------------

/// Filesystem-rooted client: `<root>/<container>/<path>/<filename>`.
pub struct FsBlobClient {
    root: PathBuf,
}

impl FsBlobClient {
    /// Create a client rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn fs_path(&self, file: &BlobFile) -> PathBuf {
        self.root.join(&file.container).join(file.key())
    }
}

#[async_trait]
impl BlobClient for FsBlobClient {
    async fn upload(&self, file: &BlobFile, content: Vec<u8>) -> RepoResult<()> {
        let path = self.fs_path(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RepoError::Blob {
                    detail: format!("create {}: {e}", parent.display()),
                })?;
        }
        let mut handle = tokio::fs::File::create(&path)
            .await
            .map_err(|e| RepoError::Blob {
                detail: format!("create {}: {e}", path.display()),
            })?;
        handle.write_all(&content).await.map_err(|e| RepoError::Blob {
            detail: format!("write {}: {e}", path.display()),
        })?;
        handle.flush().await.map_err(|e| RepoError::Blob {
            detail: format!("flush {}: {e}", path.display()),
        })?;
        debug!(target: "refbase.blob.fs", uri = %file.uri(), bytes = content.len(), "uploaded");
        Ok(())
    }

    async fn read(&self, file: &BlobFile) -> RepoResult<Vec<u8>> {
        let path = self.fs_path(file);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepoError::not_found("blob", file.uri())
            } else {
                RepoError::Blob {
                    detail: format!("read {}: {e}", path.display()),
                }
            }
        })
    }
}
