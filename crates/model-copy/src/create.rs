//! Model registration on the destination (`POST /api/create`).
//!
//! The server answers with newline-delimited JSON status records; the last
//! one must be `success`.

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::manifest::{Manifest, MediaType};
use crate::remote::RemoteServer;

/// Final status a successful create reports.
pub const SUCCESS_STATUS: &str = "success";

/// Body of `POST /api/create`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateRequest {
    pub model: String,
    /// Filename (`model.gguf`, `projector.gguf`, ...) to blob digest.
    pub files: BTreeMap<String, Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    pub stream: bool,
}

impl CreateRequest {
    /// Build the request that recreates `manifest` under `model`.
    pub fn from_manifest(model: impl Into<String>, manifest: &Manifest) -> Self {
        Self {
            model: model.into(),
            files: file_map(manifest),
            template: manifest.template.clone(),
            system: manifest.system.clone(),
            parameters: manifest.parameters.clone(),
            stream: true,
        }
    }
}

/// Name each transferable layer: `model.gguf`, `model_1.gguf`, ...,
/// `projector.gguf`, ..., `adapter.gguf`, ... in manifest order.
pub fn file_map(manifest: &Manifest) -> BTreeMap<String, Digest> {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut files = BTreeMap::new();
    for layer in manifest.transferable_layers() {
        let stem = match layer.media_type {
            MediaType::Model => "model",
            MediaType::Projector => "projector",
            MediaType::Adapter => "adapter",
            MediaType::Other(_) => continue,
        };
        let n = counts.entry(stem).or_insert(0);
        let name = if *n == 0 {
            format!("{}.gguf", stem)
        } else {
            format!("{}_{}.gguf", stem, n)
        };
        *n += 1;
        files.insert(name, layer.digest.clone());
    }
    files
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Splits a byte stream into lines, across chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos);
        self.buf.advance(1);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Streams create progress from one server.
#[derive(Debug, Clone)]
pub struct ModelCreateStreamer {
    server: RemoteServer,
}

impl ModelCreateStreamer {
    pub fn new(server: RemoteServer) -> Self {
        Self { server }
    }

    /// Send `request`, passing every status record to `on_status`, and return
    /// the final status. Anything but a final `success` is a
    /// [`CopyError::CreateFailure`].
    pub async fn create<F>(&self, request: &CreateRequest, mut on_status: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let model = request.model.clone();
        let failure = |status: String| CopyError::CreateFailure {
            model: model.clone(),
            status,
        };

        info!(
            "Creating {} on {} from {} files",
            request.model,
            self.server.base_url(),
            request.files.len()
        );
        let response = self.server.post_json("api/create", request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("HTTP {}: {}", status, body.trim())));
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut last: Option<String> = None;

        loop {
            let chunk = body.next().await.transpose()?;
            let done = chunk.is_none();
            if let Some(chunk) = chunk {
                lines.push(&chunk);
            }

            let mut pending = Vec::new();
            while let Some(line) = lines.next_line() {
                pending.push(line);
            }
            if done {
                pending.extend(lines.finish());
            }

            for line in pending {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: StatusRecord = serde_json::from_str(line)
                    .map_err(|e| failure(format!("unreadable status record '{}': {}", line, e)))?;
                if let Some(error) = record.error {
                    return Err(failure(error));
                }
                if let Some(status) = record.status {
                    debug!("create {}: {}", request.model, status);
                    on_status(&status);
                    last = Some(status);
                }
            }

            if done {
                break;
            }
        }

        match last {
            Some(status) if status == SUCCESS_STATUS => {
                info!("Created {}", request.model);
                Ok(status)
            }
            Some(status) => Err(failure(status)),
            None => Err(failure("no status received".into())),
        }
    }
}
