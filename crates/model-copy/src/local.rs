//! Local content-addressed blob store (`<models>/blobs/sha256-<hex>`).
//!
//! Blobs are written to a `-partial` sibling first and renamed into place only
//! after the stream completed and (optionally) the sha256 matched, so a blob
//! path never names incomplete content.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest as _, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::location::Location;
use crate::store::BlobStore;
use crate::stream::BlobStream;

/// Blob directory of a local models tree.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    models_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.models_dir.join("blobs")
    }

    /// Final, addressable path of a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.to_filename())
    }

    /// Staging path used while a blob is being written.
    pub fn partial_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir()
            .join(format!("{}-partial", digest.to_filename()))
    }

    /// Open a blob for streaming, returning the stream and its size.
    pub async fn open(&self, digest: &Digest, chunk_size: usize) -> Result<(BlobStream, u64)> {
        let path = self.blob_path(digest);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            CopyError::transfer(
                digest.to_string(),
                format!("cannot open local blob {}: {}", path.display(), e),
            )
        })?;
        let size = file.metadata().await?.len();
        let stream = ReaderStream::with_capacity(file, chunk_size.max(1)).boxed();
        Ok((stream, size))
    }

    /// Read a small text blob (template, system prompt, params).
    pub async fn read_text(&self, digest: &Digest) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.blob_path(digest)).await?)
    }

    /// Stream `body` into the store under `digest`.
    ///
    /// On any failure (stream error, cancellation, hash mismatch) the partial
    /// file is removed and nothing is left at the blob path.
    pub async fn write_blob<S>(
        &self,
        digest: &Digest,
        body: S,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        tokio::fs::create_dir_all(self.blobs_dir()).await?;
        let partial = self.partial_path(digest);

        let written = match self.stream_to_file(&partial, digest, body, verify, cancel).await {
            Ok(written) => written,
            Err(e) => {
                self.discard_partial(&partial).await;
                return Err(e);
            }
        };

        let target = self.blob_path(digest);
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            self.discard_partial(&partial).await;
            return Err(e.into());
        }
        debug!("{}: stored {} bytes at {}", digest, written, target.display());
        Ok(written)
    }

    async fn stream_to_file<S>(
        &self,
        partial: &Path,
        digest: &Digest,
        mut body: S,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(CopyError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| CopyError::from_transfer_io(&digest.to_string(), e))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if verify && digest.algorithm() == "sha256" {
            let actual = hex::encode(hasher.finalize());
            if actual != digest.hex() {
                return Err(CopyError::DigestMismatch {
                    digest: digest.to_string(),
                    message: format!("downloaded content hashes to sha256:{}", actual),
                });
            }
        }

        Ok(written)
    }

    async fn discard_partial(&self, partial: &Path) {
        match tokio::fs::remove_file(partial).await {
            Ok(()) => debug!("removed partial blob {}", partial.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove partial blob {}: {}", partial.display(), e),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> Location {
        Location::Local(self.models_dir.clone())
    }
}
