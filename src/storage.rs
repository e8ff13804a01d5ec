use async_trait::async_trait;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("invalid key")]
    InvalidKey,
    #[error("other: {0}")]
    Other(String),
}

/// Binary object storage for report photos (`uploadBlob`).
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ImageStoreError>;
}

/// Content-addressed key: lowercase hex SHA-256 of the bytes.
pub fn content_key(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// URL clients use to fetch a stored image through `GET /images/{key}`.
pub fn public_url(base: &str, key: &str) -> String {
    format!("{}/images/{}", base.trim_end_matches('/'), key)
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

fn check_key(key: &str) -> Result<(), ImageStoreError> {
    if key.len() < 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ImageStoreError::InvalidKey);
    }
    Ok(())
}

// ---------------- Filesystem implementation (local development / tests) ----------------
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    /// Rooted at `$ECOREPORT_DATA_DIR/images` (default `data/images`).
    pub fn new() -> Self {
        let mut root = std::env::var("ECOREPORT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        root.push("images");
        Self { root }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(&key[0..2]).join(key)
    }
}

impl Default for FsImageStore {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save(&self, key: &str, _mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        check_key(key)?;
        let path = self.path_for(key);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Err(ImageStoreError::Duplicate);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| ImageStoreError::Other(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            error!("write failed key={key} path={}: {e}", path.display());
            ImageStoreError::Other(e.to_string())
        })
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        check_key(key)?;
        let bytes = tokio::fs::read(self.path_for(key)).await.map_err(|_| ImageStoreError::NotFound)?;
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), ImageStoreError> {
        check_key(key)?;
        // missing file counts as deleted
        let _ = tokio::fs::remove_file(self.path_for(key)).await;
        Ok(())
    }
}

// ---------------- S3 implementation (MinIO compatible) ----------------
pub struct S3ImageStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3ImageStore {
    pub async fn new(endpoint: String) -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "post-images".into());
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // path-style addressing: MinIO / local endpoints lack wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf).force_path_style(true).build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3 client for bucket '{bucket}'");

        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) if attempt >= max_attempts => {
                        error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                        return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                    }
                    Err(e2) => {
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64)).await;
                    }
                }
            }
        }

        Ok(Self { bucket, client, prefix: "images".into() })
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}/{}/{}", self.prefix, &key[0..2], key)
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        check_key(key)?;
        let object_key = self.key_for(key);
        if self.client.head_object().bucket(&self.bucket).key(&object_key).send().await.is_ok() {
            return Err(ImageStoreError::Duplicate);
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!("put_object failed key={object_key} bucket={} err={:?}", self.bucket, e);
            return Err(ImageStoreError::Other(e.to_string()));
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        check_key(key)?;
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(key))
            .send()
            .await
            .map_err(|_| ImageStoreError::NotFound)?;
        let data = obj.body.collect().await.map_err(|e| ImageStoreError::Other(e.to_string()))?;
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), ImageStoreError> {
        check_key(key)?;
        let _ = self.client.delete_object().bucket(&self.bucket).key(self.key_for(key)).send().await;
        Ok(())
    }
}

/// S3 when `S3_ENDPOINT` is set, the local filesystem otherwise.
pub async fn build_image_store() -> anyhow::Result<Arc<dyn ImageStore>> {
    match std::env::var("S3_ENDPOINT") {
        Ok(endpoint) => Ok(Arc::new(S3ImageStore::new(endpoint).await?)),
        Err(_) => {
            info!("S3_ENDPOINT not set; storing images on the local filesystem");
            Ok(Arc::new(FsImageStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_is_idempotent_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::at(dir.path());
        let bytes = b"not really an image".to_vec();
        let key = content_key(&bytes);
        assert_eq!(key.len(), 64);

        store.save(&key, "text/plain", &bytes).await.unwrap();
        assert!(matches!(store.save(&key, "text/plain", &bytes).await, Err(ImageStoreError::Duplicate)));
        let (loaded, mime) = store.load(&key).await.unwrap();
        assert_eq!(loaded, bytes);
        assert_eq!(mime, "application/octet-stream");

        store.delete(&key).await.unwrap();
        assert!(matches!(store.load(&key).await, Err(ImageStoreError::NotFound)));
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::at(dir.path());
        assert!(matches!(store.load("../etc/passwd").await, Err(ImageStoreError::InvalidKey)));
    }

    #[test]
    fn public_url_joins_cleanly() {
        assert_eq!(public_url("http://h:8080/", "ab12"), "http://h:8080/images/ab12");
    }
}
