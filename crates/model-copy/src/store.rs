//! Common interface over the places blobs can live.

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::Result;
use crate::location::Location;

/// A content-addressed blob store, local or remote.
///
/// The orchestrator only needs presence checks through this seam; moving the
/// bytes is topology-specific and lives in the transfer engine.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether the store already holds `digest`.
    async fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Where this store lives.
    fn location(&self) -> Location;
}
