//! On-disk manifests below `<models>/manifests/`.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Layer, Manifest, MediaType};
use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::local::LocalBlobStore;
use crate::location::ModelRef;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    #[serde(default)]
    layers: Vec<ManifestFileLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFileLayer {
    media_type: MediaType,
    digest: String,
    #[serde(default)]
    size: u64,
}

/// Read the manifest of `model` from the store's models directory.
///
/// Template, system and params layers are read from their blobs and lifted
/// into the [`Manifest`]; the remaining layers are kept in order.
pub async fn local_manifest(store: &LocalBlobStore, model: &ModelRef) -> Result<Manifest> {
    let path = model.manifest_path(store.models_dir());
    let unavailable = |reason: String| CopyError::manifest(model.to_string(), reason);

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| unavailable(format!("cannot read {}: {}", path.display(), e)))?;
    let file: ManifestFile = serde_json::from_slice(&raw)
        .map_err(|e| unavailable(format!("malformed manifest {}: {}", path.display(), e)))?;

    let mut manifest = Manifest::default();
    for entry in file.layers {
        let digest: Digest = entry
            .digest
            .parse()
            .map_err(|e| unavailable(format!("bad layer digest: {}", e)))?;

        match entry.media_type.suffix() {
            Some("template") => {
                manifest.template = Some(read_layer_text(store, model, &digest).await?);
            }
            Some("system") => {
                manifest.system = Some(read_layer_text(store, model, &digest).await?);
            }
            Some("params") => {
                let text = read_layer_text(store, model, &digest).await?;
                let params: Map<String, Value> = serde_json::from_str(&text)
                    .map_err(|e| unavailable(format!("params layer is not a JSON object: {}", e)))?;
                manifest.parameters = Some(params);
            }
            _ if !entry.media_type.is_transferable() => {
                warn!(
                    "{}: layer {} ({}) is neither copied nor passed to create",
                    model,
                    digest,
                    entry.media_type.as_str()
                );
            }
            _ => {}
        }

        manifest.layers.push(Layer {
            digest,
            media_type: entry.media_type,
            size: entry.size,
        });
    }

    debug!(
        "Read local manifest {} ({} layers)",
        path.display(),
        manifest.layers.len()
    );
    Ok(manifest)
}

async fn read_layer_text(store: &LocalBlobStore, model: &ModelRef, digest: &Digest) -> Result<String> {
    store.read_text(digest).await.map_err(|e| {
        CopyError::manifest(
            model.to_string(),
            format!("cannot read layer {}: {}", digest, e),
        )
    })
}
