//! Model references, endpoint locations and per-blob transfer tasks.

use crate::digest::Digest;
use crate::error::{CopyError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Registry host used when a reference names none.
pub const DEFAULT_HOST: &str = "registry.ollama.ai";

/// Namespace used when a reference names none.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Tag tried when an untagged reference cannot be resolved as written.
pub const DEFAULT_TAG: &str = "latest";

/// A model reference: `[host/][namespace/]model[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub host: String,
    pub namespace: String,
    pub model: String,
    pub tag: Option<String>,
}

impl ModelRef {
    /// Parse a model reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim().trim_matches('/');
        if reference.is_empty() {
            return Err(CopyError::Config("model name is empty".into()));
        }

        let parts: Vec<&str> = reference.split('/').collect();
        let (host, namespace, last) = match parts.as_slice() {
            [model] => (DEFAULT_HOST, DEFAULT_NAMESPACE, *model),
            [namespace, model] => (DEFAULT_HOST, *namespace, *model),
            [host, namespace, model] => (*host, *namespace, *model),
            _ => {
                return Err(CopyError::Config(format!(
                    "model reference '{}' has too many path segments",
                    reference
                )))
            }
        };

        let (model, tag) = match last.split_once(':') {
            Some((model, tag)) => (model, Some(tag.to_string())),
            None => (last, None),
        };

        if model.is_empty() || host.is_empty() || namespace.is_empty() {
            return Err(CopyError::Config(format!(
                "model reference '{}' has an empty component",
                reference
            )));
        }
        if matches!(tag.as_deref(), Some("")) {
            return Err(CopyError::Config(format!(
                "model reference '{}' has an empty tag",
                reference
            )));
        }

        Ok(Self {
            host: host.to_string(),
            namespace: namespace.to_string(),
            model: model.to_string(),
            tag,
        })
    }

    /// The same reference with the implicit `latest` tag, if it had no tag.
    pub fn with_default_tag(&self) -> Option<Self> {
        if self.tag.is_some() {
            return None;
        }
        Some(Self {
            tag: Some(DEFAULT_TAG.to_string()),
            ..self.clone()
        })
    }

    /// Short name as the server API expects it (default host/namespace omitted).
    pub fn api_name(&self) -> String {
        let mut name = if self.host != DEFAULT_HOST {
            format!("{}/{}/{}", self.host, self.namespace, self.model)
        } else if self.namespace != DEFAULT_NAMESPACE {
            format!("{}/{}", self.namespace, self.model)
        } else {
            self.model.clone()
        };
        if let Some(tag) = &self.tag {
            name.push(':');
            name.push_str(tag);
        }
        name
    }

    /// Path of the manifest file below a models directory.
    ///
    /// An untagged reference points at the model directory itself, which is
    /// not a readable manifest; callers retry with [`ModelRef::with_default_tag`].
    pub fn manifest_path(&self, models_dir: &Path) -> PathBuf {
        let mut path = models_dir
            .join("manifests")
            .join(&self.host)
            .join(&self.namespace)
            .join(&self.model);
        if let Some(tag) = &self.tag {
            path.push(tag);
        }
        path
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.api_name())
    }
}

/// Where blobs live: the local store or a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local models directory (containing `manifests/` and `blobs/`).
    Local(PathBuf),
    /// Base URL of a remote inference server.
    Remote(Url),
}

impl Location {
    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "local:{}", path.display()),
            Location::Remote(url) => write!(f, "{}", url.as_str().trim_end_matches('/')),
        }
    }
}

/// A model at a location, as named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEndpoint {
    pub location: Location,
    pub model: ModelRef,
}

impl ModelEndpoint {
    /// Parse `model[:tag]` (local) or `http(s)://host[:port]/model[:tag]` (remote).
    ///
    /// The whole URL path of a remote endpoint is the model reference, so
    /// `http://h/team/llama3:8b` names `team/llama3:8b` and the server API is
    /// always addressed at the URL root. A server mounted below a path prefix
    /// is not reachable this way.
    pub fn parse(text: &str, models_dir: &Path) -> Result<Self> {
        let text = text.trim();
        if text.starts_with("http://") || text.starts_with("https://") {
            let url = Url::parse(text)
                .map_err(|e| CopyError::Config(format!("invalid server URL '{}': {}", text, e)))?;
            let model = ModelRef::parse(url.path())?;
            let mut base = url;
            base.set_path("/");
            base.set_query(None);
            base.set_fragment(None);
            Ok(Self {
                location: Location::Remote(base),
                model,
            })
        } else {
            Ok(Self {
                location: Location::Local(models_dir.to_path_buf()),
                model: ModelRef::parse(text)?,
            })
        }
    }
}

impl fmt::Display for ModelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Location::Local(_) => write!(f, "{}", self.model),
            Location::Remote(_) => write!(f, "{}/{}", self.location, self.model),
        }
    }
}

/// How a blob moves between two locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    LocalToRemote,
    RemoteToLocal,
    RemoteToRemote,
}

/// One blob to move from source to destination.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub digest: Digest,
    /// Expected size in bytes (0 when unknown until download starts).
    pub size: u64,
    pub source: Location,
    pub destination: Location,
}

impl TransferTask {
    /// Classify the task; two local endpoints are handled by the inference binary.
    pub fn topology(&self) -> Result<Topology> {
        topology_of(&self.source, &self.destination)
    }
}

/// Classify a source/destination pair.
pub fn topology_of(source: &Location, destination: &Location) -> Result<Topology> {
    match (source, destination) {
        (Location::Local(_), Location::Remote(_)) => Ok(Topology::LocalToRemote),
        (Location::Remote(_), Location::Local(_)) => Ok(Topology::RemoteToLocal),
        (Location::Remote(_), Location::Remote(_)) => Ok(Topology::RemoteToRemote),
        (Location::Local(_), Location::Local(_)) => Err(CopyError::Config(
            "local-to-local copies are handled by the inference binary's own copy command".into(),
        )),
    }
}
