//! Manifest resolution for local stores and remote servers.
//!
//! A [`Manifest`] is the ordered list of blob layers a model is made of, plus
//! the template, system prompt and parameters that are passed to the create
//! call rather than transferred as blobs.

mod local;
mod modelfile;

pub use local::local_manifest;
pub use modelfile::{
    blob_references, extract_blob_digests, parse_parameters, remote_manifest, remote_modelfile,
    remote_modelfile_parts, BlobReference, Directive, ModelfileParts, ShowResponse,
};

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::local::LocalBlobStore;
use crate::location::{Location, ModelEndpoint, ModelRef};
use crate::remote::RemoteServer;

const MEDIA_TYPE_PREFIX: &str = "application/vnd.ollama.image.";

/// Layer media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Model,
    Projector,
    Adapter,
    /// Anything else, kept verbatim (template, system, params, license, ...).
    Other(String),
}

impl MediaType {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(MEDIA_TYPE_PREFIX) {
            Some("model") => MediaType::Model,
            Some("projector") => MediaType::Projector,
            Some("adapter") => MediaType::Adapter,
            _ => MediaType::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Model => "application/vnd.ollama.image.model",
            MediaType::Projector => "application/vnd.ollama.image.projector",
            MediaType::Adapter => "application/vnd.ollama.image.adapter",
            MediaType::Other(raw) => raw,
        }
    }

    /// Whether layers of this type are moved as blobs by a copy.
    pub fn is_transferable(&self) -> bool {
        !matches!(self, MediaType::Other(_))
    }

    /// Short media type name (`template` for `application/vnd.ollama.image.template`).
    pub(crate) fn suffix(&self) -> Option<&str> {
        self.as_str().strip_prefix(MEDIA_TYPE_PREFIX)
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MediaType::parse(&raw))
    }
}

/// One blob of a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub digest: Digest,
    pub media_type: MediaType,
    /// Size in bytes; 0 when only learned at download time.
    pub size: u64,
}

/// Resolved model description.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Manifest {
    pub layers: Vec<Layer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl Manifest {
    /// Layers that are moved as blobs, in manifest order.
    pub fn transferable_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(|l| l.media_type.is_transferable())
    }

    /// Sum of the known layer sizes.
    pub fn total_size(&self) -> u64 {
        self.transferable_layers().map(|l| l.size).sum()
    }
}

/// Resolves the manifest of a model at either kind of location.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: Client,
}

impl ManifestResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve `endpoint`, retrying once with `:latest` when the reference had
    /// no tag. Returns the reference that actually resolved.
    pub async fn resolve(&self, endpoint: &ModelEndpoint) -> Result<(ModelRef, Manifest)> {
        info!("Resolving manifest for {}", endpoint);
        match self.resolve_ref(&endpoint.location, &endpoint.model).await {
            Ok(manifest) => Ok((endpoint.model.clone(), manifest)),
            Err(CopyError::ManifestUnavailable { model, reason }) => {
                let Some(tagged) = endpoint.model.with_default_tag() else {
                    return Err(CopyError::ManifestUnavailable { model, reason });
                };
                debug!("{} unavailable ({}), retrying as {}", model, reason, tagged);
                let manifest = self.resolve_ref(&endpoint.location, &tagged).await?;
                Ok((tagged, manifest))
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_ref(&self, location: &Location, model: &ModelRef) -> Result<Manifest> {
        match location {
            Location::Local(models_dir) => {
                let store = LocalBlobStore::new(models_dir.clone());
                local_manifest(&store, model).await
            }
            Location::Remote(base) => {
                let server = RemoteServer::with_client(base.clone(), self.client.clone());
                remote_manifest(&server, model).await
            }
        }
    }
}
