//! Object store client.
//!
//! `ObjectStore` is the seam for blob storage (screenshots, exports, uploads).
//! `LocalObjectStore` keeps objects under a filesystem root and issues
//! HMAC-signed, time-limited URLs that the HTTP layer verifies before serving
//! or accepting bytes.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Signed URL expired")]
    Expired,

    #[error("Signature mismatch")]
    BadSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Put,
}

impl SignedMethod {
    fn as_str(&self) -> &'static str {
        match self {
            SignedMethod::Get => "GET",
            SignedMethod::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectMeta, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// `None` when the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn presign(&self, method: SignedMethod, key: &str, ttl: Duration) -> Result<SignedUrl, StorageError>;

    /// Check a signature produced by [`ObjectStore::presign`].
    fn verify(
        &self,
        method: SignedMethod,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<(), StorageError>;

    fn bucket(&self) -> &str;
}

// ============================================================================
// Keys
// ============================================================================

/// Replace anything outside `[A-Za-z0-9.-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// `{prefix}/{YYYY-MM-DD}/{uuid}_{filename}`
pub fn generate_key(prefix: &str, filename: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}_{}",
        prefix.trim_matches('/'),
        now.format("%Y-%m-%d"),
        Uuid::new_v4(),
        sanitize_filename(filename)
    )
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let ok = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

// ============================================================================
// LocalObjectStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
    public_base_url: String,
    secret: Vec<u8>,
}

impl LocalObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let root = shellexpand::tilde(&config.root).into_owned();
        Self::with_root(PathBuf::from(root), config)
    }

    pub fn with_root(root: PathBuf, config: &StorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            secret: config.signing_secret.as_bytes().to_vec(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn sign(&self, method: SignedMethod, key: &str, expires: i64) -> String {
        // HMAC accepts keys of any length, so new_from_slice cannot fail here.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(m) => m,
            Err(_) => return String::new(),
        };
        mac.update(format!("{}\n{}\n{}", method.as_str(), key, expires).as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectMeta, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(key = %key, size = bytes.len(), "Object stored");

        Ok(ObjectMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            content_type: content_type_for(key),
            last_modified: Some(Utc::now()),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
                content_type: content_type_for(key),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn presign(&self, method: SignedMethod, key: &str, ttl: Duration) -> Result<SignedUrl, StorageError> {
        validate_key(key)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        let expires = expires_at.timestamp();
        let signature = self.sign(method, key, expires);
        Ok(SignedUrl {
            url: format!(
                "{}/upload/objects/{}?expires={}&signature={}",
                self.public_base_url, key, expires, signature
            ),
            expires_at,
            expires_in: ttl.as_secs(),
        })
    }

    fn verify(
        &self,
        method: SignedMethod,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        if Utc::now().timestamp() > expires {
            return Err(StorageError::Expired);
        }

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StorageError::BadSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| StorageError::BadSignature)?;
        mac.update(format!("{}\n{}\n{}", method.as_str(), key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::BadSignature)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
