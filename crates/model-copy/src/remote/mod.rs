//! HTTP access to a remote inference server.
//!
//! Every call goes through an explicit [`RemoteServer`] handle carrying its own
//! base URL, so two servers touched by one copy never share mutable state.

mod blobs;

pub use blobs::RemoteBlobClient;

use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;

use crate::config::HttpConfig;
use crate::error::{CopyError, Result};

/// Build the HTTP client shared by every server handle of one copy.
pub fn build_client(http: &HttpConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
        .user_agent(http.user_agent.clone());
    if let Some(secs) = http.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder
        .build()
        .map_err(|e| CopyError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Per-server HTTP handle.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    client: Client,
    base: Url,
}

impl RemoteServer {
    /// Build a handle with its own client configured from `http`.
    pub fn new(base: Url, http: &HttpConfig) -> Result<Self> {
        Ok(Self::with_client(base, build_client(http)?))
    }

    /// Build a handle sharing an existing client (connection pool).
    pub fn with_client(base: Url, client: Client) -> Self {
        Self { client, base }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve an API path (`api/show`, `api/blobs/...`) against the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| CopyError::Config(format!("invalid API path '{}': {}", path, e)))
    }

    /// Blob endpoint client for this server.
    pub fn blobs(&self) -> RemoteBlobClient {
        RemoteBlobClient::new(self.clone())
    }

    /// POST a JSON body and return the raw response (status not checked).
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        Ok(self.client.post(url).json(body).send().await?)
    }
}
