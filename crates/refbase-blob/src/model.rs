// SPDX-License-Identifier: MIT OR Apache-2.0
//! The blob file naming model.

use refbase_error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A file in blob storage, addressed as `blob://<container>/<path>/<filename>`.
///
/// Container and filename reject path separators; `path` may be nested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobFile {
    /// The container the file lives in.
    pub container: String,
    /// Directory-like path inside the container.
    pub path: String,
    /// The file name.
    pub filename: String,
}

impl BlobFile {
    /// Build a blob file reference, validating the naming rules.
    pub fn new(
        container: impl Into<String>,
        path: impl Into<String>,
        filename: impl Into<String>,
    ) -> RepoResult<Self> {
        let file = Self {
            container: container.into(),
            path: path.into(),
            filename: filename.into(),
        };
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> RepoResult<()> {
        if self.container.is_empty() || self.container.contains('/') {
            return Err(RepoError::Blob {
                detail: format!("invalid container name: {:?}", self.container),
            });
        }
        if self.filename.is_empty() || self.filename.contains('/') {
            return Err(RepoError::Blob {
                detail: format!("invalid filename: {:?}", self.filename),
            });
        }
        if self.path.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(RepoError::Blob {
                detail: format!("invalid path: {:?}", self.path),
            });
        }
        Ok(())
    }

    /// The canonical URI of this file.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("blob://{}/{}/{}", self.container, self.path, self.filename)
    }

    /// Parse a canonical URI back into a file reference.
    pub fn parse_uri(uri: &str) -> RepoResult<Self> {
        let rest = uri.strip_prefix("blob://").ok_or_else(|| RepoError::Blob {
            detail: format!("invalid blob uri: {uri:?}"),
        })?;
        let mut parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            return Err(RepoError::Blob {
                detail: format!("invalid blob uri: {uri:?}"),
            });
        }
        let filename = parts.pop().unwrap_or_default().to_string();
        let container = parts.remove(0).to_string();
        Self::new(container, parts.join("/"), filename)
    }

    /// Content type derived from the file extension.
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self.filename.rsplit('.').next() {
            Some("jsonl") => "application/jsonl",
            Some("json") => "application/json",
            Some("csv") => "text/csv",
            Some("txt") => "text/plain",
            _ => "application/octet-stream",
        }
    }

    /// The storage key relative to the container root.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.path, self.filename)
    }
}

impl fmt::Display for BlobFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let file = BlobFile::new("refbase", "robot-batches/ref-data", "b1.jsonl").unwrap();
        let parsed = BlobFile::parse_uri(&file.uri()).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(file.content_type(), "application/jsonl");
    }

    #[test]
    fn rejects_slashes_in_container_and_filename() {
        assert!(BlobFile::new("a/b", "p", "f.jsonl").is_err());
        assert!(BlobFile::new("a", "p", "f/g.jsonl").is_err());
    }

    #[test]
    fn rejects_traversal_in_path() {
        assert!(BlobFile::new("a", "p/../q", "f.jsonl").is_err());
    }

    #[test]
    fn unknown_extension_defaults_to_octet_stream() {
        let file = BlobFile::new("a", "p", "f.bin").unwrap();
        assert_eq!(file.content_type(), "application/octet-stream");
    }
}
