use std::{env, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    parse_url,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

mod s3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobStorageConfig {
    /// Root url, e.g. `file:///var/lib/command-feed/blobs` or
    /// `s3://bucket/exports`.
    pub path: String,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let root = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("command_feed_storage/blobs");
        let path = format!("file://{}", root.display());
        info!("using blob store path: {}", path);
        BlobStorageConfig { path }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Clone, Debug)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        Self::from_url(&config.path)
    }

    /// Opens the store behind `url`. Export destinations are opened this way,
    /// one per container.
    pub fn from_url(url: &str) -> Result<Self> {
        let (object_store, path) = Self::build_object_store(url)?;
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
        })
    }

    pub fn build_object_store(url_str: &str) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = url_str
            .parse::<Url>()
            .map_err(|e| anyhow!("invalid blob store url {:?}: {}", url_str, e))?;
        let (scheme, _) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => s3::build_s3_store(&url),
            _ => Ok(parse_url(&url)?),
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    /// `key` is relative to the store root; `/` separates path segments.
    pub fn object_path(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.path.clone(), |path, part| path.child(part))
    }

    pub async fn put(
        &self,
        key: &str,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult> {
        let mut appender = self.start_append(key).await?;
        let mut data = data;
        while let Some(chunk) = data.next().await {
            match chunk {
                Ok(chunk) => appender.append(&chunk).await?,
                Err(err) => {
                    appender.abort().await?;
                    return Err(err);
                }
            }
        }
        appender.finish().await
    }

    pub async fn put_bytes(&self, key: &str, data: Bytes) -> Result<PutResult> {
        let path = self.object_path(key);
        let sha256_hash = format!("{:x}", Sha256::digest(&data));
        let size_bytes = data.len() as u64;
        self.object_store
            .put(&path, PutPayload::from_bytes(data))
            .await?;
        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
            sha256_hash,
        })
    }

    /// Starts a multipart upload that the caller appends to and finishes.
    pub async fn start_append(&self, key: &str) -> Result<BlobAppender> {
        let path = self.object_path(key);
        let upload = self.object_store.put_multipart(&path).await?;
        debug!(path = %path, "started multipart upload");
        Ok(BlobAppender {
            writer: WriteMultipart::new(upload),
            hasher: Sha256::new(),
            size_bytes: 0,
            path,
        })
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = self.object_path(key);
        let get_result = self
            .object_store
            .get(&path)
            .await
            .map_err(|e| anyhow!("can't get blob {:?}: {:?}", key, e))?;
        let key = key.to_string();
        Ok(get_result
            .into_stream()
            .map_err(move |e| anyhow!("error reading blob {:?}: {:?}", key, e))
            .boxed())
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.object_store.head(&self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys under `prefix`, relative to the store root, in no particular
    /// order.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.path.clone();
        let objects: Vec<_> = self
            .object_store
            .list(Some(&self.object_path(prefix)))
            .try_collect()
            .await?;
        Ok(objects
            .into_iter()
            .filter_map(|meta| {
                meta.location
                    .prefix_match(&root)
                    .map(|parts| parts.map(|p| p.as_ref().to_string()).collect::<Vec<_>>())
                    .map(|parts| parts.join("/"))
            })
            .collect())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.object_path(key)).await?;
        Ok(())
    }
}

/// An in-progress multipart upload. Dropping it without `finish` leaves
/// nothing visible in the store.
pub struct BlobAppender {
    writer: WriteMultipart,
    hasher: Sha256,
    size_bytes: u64,
    path: Path,
}

impl BlobAppender {
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.wait_for_capacity(1).await?;
        self.hasher.update(data);
        self.size_bytes += data.len() as u64;
        self.writer.write(data);
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub async fn finish(self) -> Result<PutResult> {
        self.writer.finish().await?;
        Ok(PutResult {
            url: self.path.to_string(),
            size_bytes: self.size_bytes,
            sha256_hash: format!("{:x}", self.hasher.finalize()),
        })
    }

    pub async fn abort(self) -> Result<()> {
        self.writer.abort().await?;
        Ok(())
    }
}
