// SPDX-License-Identifier: MIT OR Apache-2.0
//! Time-scoped signed URLs.

use crate::model::BlobFile;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use refbase_error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// What a signed URL permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignedUrlOp {
    /// Read the file.
    Download,
    /// Write the file.
    Upload,
}

impl SignedUrlOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

/// A time-scoped, HMAC-signed grant on one blob file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    /// The file the grant covers.
    pub uri: String,
    /// Permitted operation.
    pub op: SignedUrlOp,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Hex HMAC-SHA256 over `<op>:<uri>:<expires_at unix>`.
    pub signature: String,
}

impl SignedUrl {
    /// Render the grant as a URL with query parameters.
    #[must_use]
    pub fn to_url(&self) -> String {
        format!(
            "{}?op={}&expires={}&sig={}",
            self.uri,
            self.op.as_str(),
            self.expires_at.timestamp(),
            self.signature
        )
    }
}

/// Issues and verifies [`SignedUrl`]s with a shared signing key.
#[derive(Clone)]
pub struct UrlSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl UrlSigner {
    /// Create a signer with the gateway signing key and default TTL.
    #[must_use]
    pub fn new(key: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            key: key.as_ref().to_vec(),
            ttl,
        }
    }

    fn message(uri: &str, op: SignedUrlOp, expires_at: DateTime<Utc>) -> String {
        format!("{}:{}:{}", op.as_str(), uri, expires_at.timestamp())
    }

    fn mac(&self, message: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).unwrap_or_else(|_| unreachable!("any key size"));
        mac.update(message.as_bytes());
        let bytes = mac.finalize().into_bytes();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Sign a grant on `file` valid for the configured TTL from `now`.
    #[must_use]
    pub fn sign(&self, file: &BlobFile, op: SignedUrlOp, now: DateTime<Utc>) -> SignedUrl {
        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let uri = file.uri();
        let signature = self.mac(&Self::message(&uri, op, expires_at));
        SignedUrl {
            uri,
            op,
            expires_at,
            signature,
        }
    }

    /// Verify a grant: signature must match and the expiry must be in the
    /// future at `now`.
    pub fn verify(&self, url: &SignedUrl, now: DateTime<Utc>) -> RepoResult<()> {
        if url.expires_at <= now {
            return Err(RepoError::Blob {
                detail: "signed url has expired".into(),
            });
        }
        let expected = self.mac(&Self::message(&url.uri, url.op, url.expires_at));
        // Constant-time comparison of the hex digests.
        let matches = expected.len() == url.signature.len()
            && expected
                .bytes()
                .zip(url.signature.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if !matches {
            return Err(RepoError::Blob {
                detail: "signed url signature mismatch".into(),
            });
        }
        Ok(())
    }
}
