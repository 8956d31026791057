//! Remote manifests rebuilt from the server's rendered model definition.
//!
//! A remote server does not expose its manifest directly. `POST /api/show`
//! returns the modelfile text, whose `FROM` and `ADAPTER` lines point at blob
//! paths on the server host (`.../blobs/sha256-<hex>`), together with the
//! template, system prompt and parameters.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tracing::debug;

use super::{Layer, Manifest, MediaType};
use crate::digest::{Digest, SHA256_HEX_LEN};
use crate::error::{CopyError, Result};
use crate::location::ModelRef;
use crate::remote::RemoteServer;

const BLOB_FILE_PREFIX: &str = "sha256-";

/// Modelfile instruction a blob was referenced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    From,
    Adapter,
}

/// A blob referenced by a modelfile line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReference {
    pub directive: Directive,
    pub digest: Digest,
}

/// Response body of `POST /api/show`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub modelfile: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    /// Free text (`key value` per line) or a JSON object, depending on server version.
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Template, system prompt and normalised parameters of a remote model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelfileParts {
    pub template: Option<String>,
    pub system: Option<String>,
    pub parameters: Option<Map<String, Value>>,
}

impl From<&ShowResponse> for ModelfileParts {
    fn from(show: &ShowResponse) -> Self {
        Self {
            template: non_empty(show.template.as_deref()),
            system: non_empty(show.system.as_deref()),
            parameters: show
                .parameters
                .as_ref()
                .map(parse_parameters)
                .filter(|p| !p.is_empty()),
        }
    }
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty()).map(str::to_string)
}

/// Blobs referenced from `FROM` and `ADAPTER` lines, de-duplicated, in order.
pub fn blob_references(modelfile: &str) -> Vec<BlobReference> {
    let mut refs: Vec<BlobReference> = Vec::new();
    for line in modelfile.lines() {
        let line = line.trim();
        let Some((keyword, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let directive = if keyword.eq_ignore_ascii_case("FROM") {
            Directive::From
        } else if keyword.eq_ignore_ascii_case("ADAPTER") {
            Directive::Adapter
        } else {
            continue;
        };
        let Some(digest) = find_blob_digest(rest) else {
            continue;
        };
        if refs.iter().any(|r| r.digest == digest) {
            continue;
        }
        refs.push(BlobReference { directive, digest });
    }
    refs
}

/// Canonical `sha256:<hex>` digests of every blob a modelfile references.
pub fn extract_blob_digests(modelfile: &str) -> Vec<Digest> {
    blob_references(modelfile)
        .into_iter()
        .map(|r| r.digest)
        .collect()
}

fn find_blob_digest(text: &str) -> Option<Digest> {
    let mut search = text;
    while let Some(pos) = search.find(BLOB_FILE_PREFIX) {
        let candidate = &search[pos + BLOB_FILE_PREFIX.len()..];
        let hex_len = candidate
            .bytes()
            .take_while(|b| b.is_ascii_hexdigit())
            .count();
        if hex_len == SHA256_HEX_LEN {
            if let Ok(digest) = Digest::sha256(&candidate[..hex_len]) {
                return Some(digest);
            }
        }
        search = candidate;
    }
    None
}

/// Normalise parameters to one JSON object.
///
/// Text is read line by line as `key value`. Repeated keys collect into an
/// array, numbers and booleans are typed, and quoted values are unquoted.
/// An object is enumerated the same way, so string values get typed too.
pub fn parse_parameters(value: &Value) -> Map<String, Value> {
    let mut params = Map::new();
    match value {
        Value::String(text) => {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (key, raw) = match line.split_once(char::is_whitespace) {
                    Some((key, raw)) => (key, raw.trim()),
                    None => (line, ""),
                };
                insert_parameter(&mut params, key, typed_value(raw));
            }
        }
        Value::Object(object) => {
            for (key, value) in object {
                match value {
                    // Lists stay lists, whatever their length.
                    Value::Array(items) => {
                        params.insert(key.clone(), items.iter().map(normalise).collect());
                    }
                    other => insert_parameter(&mut params, key, normalise(other)),
                }
            }
        }
        _ => {}
    }
    params
}

fn normalise(value: &Value) -> Value {
    match value {
        Value::String(s) => typed_value(s),
        other => other.clone(),
    }
}

fn insert_parameter(params: &mut Map<String, Value>, key: &str, value: Value) {
    match params.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = json!([first, value]);
        }
        None => {
            // stop sequences are always a list, even with one entry
            let value = if key == "stop" { json!([value]) } else { value };
            params.insert(key.to_string(), value);
        }
    }
}

fn typed_value(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

async fn show(server: &RemoteServer, name: &str) -> Result<ShowResponse> {
    let response = server
        .post_json("api/show", &json!({ "name": name }))
        .await
        .map_err(|e| CopyError::manifest(name, format!("show request failed: {}", e)))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(CopyError::manifest(name, "model not found on server"));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CopyError::manifest(
            name,
            format!("show returned HTTP {}: {}", status, body.trim()),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| CopyError::manifest(name, format!("malformed show response: {}", e)))
}

/// Fetch the rendered modelfile text of `name`.
pub async fn remote_modelfile(server: &RemoteServer, name: &str) -> Result<String> {
    Ok(show(server, name).await?.modelfile)
}

/// Fetch template, system prompt and parameters of `name`. Absent fields are
/// `None`.
pub async fn remote_modelfile_parts(server: &RemoteServer, name: &str) -> Result<ModelfileParts> {
    Ok(ModelfileParts::from(&show(server, name).await?))
}

/// Build a manifest for a model hosted on `server`.
///
/// The first `FROM` blob is the model weights, further `FROM` blobs are
/// projectors and `ADAPTER` blobs are adapters. Sizes are unknown (0) until
/// the download reports a `Content-Length`.
pub async fn remote_manifest(server: &RemoteServer, model: &ModelRef) -> Result<Manifest> {
    let name = model.api_name();
    let show = show(server, &name).await?;
    let refs = blob_references(&show.modelfile);
    if refs.is_empty() {
        return Err(CopyError::manifest(
            name,
            "modelfile references no sha256 blobs",
        ));
    }

    let mut seen_model = false;
    let layers = refs
        .into_iter()
        .map(|r| {
            let media_type = match r.directive {
                Directive::From if !seen_model => {
                    seen_model = true;
                    MediaType::Model
                }
                Directive::From => MediaType::Projector,
                Directive::Adapter => MediaType::Adapter,
            };
            Layer {
                digest: r.digest,
                media_type,
                size: 0,
            }
        })
        .collect::<Vec<_>>();

    let parts = ModelfileParts::from(&show);
    debug!(
        "Resolved {} on {} ({} blob layers)",
        name,
        server.base_url(),
        layers.len()
    );
    Ok(Manifest {
        layers,
        template: parts.template,
        system: parts.system,
        parameters: parts.parameters,
    })
}
