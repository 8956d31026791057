//! Blob endpoint (`/api/blobs/{digest}`): presence check, download, upload.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, StatusCode, Url};
use std::io;
use tracing::debug;

use super::RemoteServer;
use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::location::Location;
use crate::store::BlobStore;
use crate::stream::BlobStream;

/// Blob operations against one server.
#[derive(Debug, Clone)]
pub struct RemoteBlobClient {
    server: RemoteServer,
}

impl RemoteBlobClient {
    pub fn new(server: RemoteServer) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &RemoteServer {
        &self.server
    }

    fn blob_url(&self, digest: &Digest) -> Result<Url> {
        self.server.url(&format!("api/blobs/{}", digest))
    }

    /// HEAD the blob. 200 means present, 404 absent; anything else leaves the
    /// destination state unknown and is an error.
    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        let response = self
            .server
            .client()
            .head(self.blob_url(digest)?)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CopyError::BlobCheck {
                digest: digest.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Start a GET and return the body stream once headers have arrived.
    /// Size is the `Content-Length`, or 0 when the server sent none.
    pub async fn download(&self, digest: &Digest) -> Result<(BlobStream, u64)> {
        let response = self
            .server
            .client()
            .get(self.blob_url(digest)?)
            .send()
            .await
            .map_err(|e| CopyError::transfer(digest.to_string(), format!("GET failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CopyError::transfer(
                digest.to_string(),
                format!("GET returned HTTP {}: {}", status, body.trim()),
            ));
        }

        let size = response.content_length().unwrap_or(0);
        debug!("{}: download started ({} bytes advertised)", digest, size);

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();
        Ok((stream, size))
    }

    /// POST `body` as the blob content. A known `size` is sent as
    /// `Content-Length`; 0 streams the body chunked.
    ///
    /// HTTP 400 means the server computed a different digest (or speaks a
    /// different protocol version) and is surfaced as-is, never retried.
    pub async fn upload<S>(&self, digest: &Digest, body: S, size: u64) -> Result<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut request = self
            .server
            .client()
            .post(self.blob_url(digest)?)
            .body(Body::wrap_stream(body));
        if size > 0 {
            request = request.header(CONTENT_LENGTH, size);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CopyError::transfer(digest.to_string(), format!("POST failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            debug!("{}: upload accepted ({})", digest, status);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST {
            return Err(CopyError::DigestMismatch {
                digest: digest.to_string(),
                message: body.trim().to_string(),
            });
        }
        Err(CopyError::transfer(
            digest.to_string(),
            format!("POST returned HTTP {}: {}", status, body.trim()),
        ))
    }
}

#[async_trait]
impl BlobStore for RemoteBlobClient {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        RemoteBlobClient::exists(self, digest).await
    }

    fn location(&self) -> Location {
        Location::Remote(self.server.base_url().clone())
    }
}
