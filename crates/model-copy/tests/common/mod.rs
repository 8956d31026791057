//! In-process fake inference server for integration tests.
//!
//! Serves `/api/blobs/:digest` (HEAD, GET, POST), `/api/show` and
//! `/api/create` from memory and counts every request.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::Path as FsPath;
use std::sync::Arc;

use model_copy::{Config, Digest, HttpConfig, LocalConfig, TransferConfig};

/// Request counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub head: usize,
    pub get: usize,
    pub post: usize,
    pub show: usize,
    pub create: usize,
}

/// Fault injection switches.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// HEAD answers with this status instead of 200/404.
    pub head_status: Option<u16>,
    /// GET sends half the blob, then aborts the connection.
    pub truncate_downloads: bool,
    /// POST answers 400 regardless of content.
    pub reject_uploads: bool,
    /// POST answers 500 straight away, without reading the body.
    pub reject_uploads_unread: bool,
    /// POST never answers.
    pub stall_uploads: bool,
    /// Create streams an error record.
    pub fail_create: bool,
}

#[derive(Default)]
pub struct ServerState {
    pub blobs: Mutex<HashMap<String, Bytes>>,
    pub models: Mutex<HashMap<String, Value>>,
    pub counts: Mutex<Counts>,
    pub created: Mutex<Vec<Value>>,
    pub faults: Mutex<Faults>,
}

pub struct FakeServer {
    pub url: Url,
    pub state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route(
                "/api/blobs/:digest",
                get(get_blob).head(head_blob).post(post_blob),
            )
            .route("/api/show", post(show))
            .route("/api/create", post(create))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            state,
        }
    }

    /// Model URL as the CLI would name it.
    pub fn model_url(&self, model: &str) -> String {
        format!("{}{}", self.url, model)
    }

    pub fn put_blob(&self, data: &[u8]) -> Digest {
        let digest = digest_of(data);
        self.state
            .blobs
            .lock()
            .insert(digest.to_string(), Bytes::copy_from_slice(data));
        digest
    }

    pub fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.state.blobs.lock().get(&digest.to_string()).cloned()
    }

    /// Register a model whose modelfile references `weights` (and optional extras).
    pub fn put_model(&self, name: &str, show: Value) {
        self.state.models.lock().insert(name.to_string(), show);
    }

    pub fn counts(&self) -> Counts {
        *self.state.counts.lock()
    }

    pub fn created(&self) -> Vec<Value> {
        self.state.created.lock().clone()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.state.faults.lock() = faults;
    }
}

pub fn digest_of(data: &[u8]) -> Digest {
    Digest::sha256(hex::encode(Sha256::digest(data))).unwrap()
}

/// Deterministic, non-repeating-ish test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2654435761) >> 13) as u8 ^ seed)
        .collect()
}

pub fn modelfile_from(digest: &Digest) -> String {
    format!(
        "# Modelfile generated by \"show\"\nFROM /srv/models/blobs/{}\nTEMPLATE \"\"\"{{{{ .Prompt }}}}\"\"\"\nPARAMETER stop \"<|end|>\"\n",
        digest.to_filename()
    )
}

/// Config tuned for tests: small chunks and pipe, fast progress sampling.
pub fn test_config(models_dir: &FsPath, local_server: &Url) -> Config {
    Config {
        local: LocalConfig {
            models_dir: models_dir.to_path_buf(),
            server_url: local_server.to_string(),
        },
        transfer: TransferConfig {
            max_buffered_bytes: Some(256 * 1024),
            chunk_size: 64 * 1024,
            progress_interval_ms: 10,
            ..Default::default()
        },
        http: HttpConfig::default(),
    }
}

/// Write a local manifest with one model layer (plus optional system prompt).
pub fn put_local_model(models_dir: &FsPath, path: &str, weights: &[u8], system: Option<&str>) -> Digest {
    let blobs = models_dir.join("blobs");
    std::fs::create_dir_all(&blobs).unwrap();

    let digest = digest_of(weights);
    std::fs::write(blobs.join(digest.to_filename()), weights).unwrap();

    let mut layers = vec![json!({
        "mediaType": "application/vnd.ollama.image.model",
        "digest": digest.to_string(),
        "size": weights.len(),
    })];
    if let Some(system) = system {
        let system_digest = digest_of(system.as_bytes());
        std::fs::write(blobs.join(system_digest.to_filename()), system).unwrap();
        layers.push(json!({
            "mediaType": "application/vnd.ollama.image.system",
            "digest": system_digest.to_string(),
            "size": system.len(),
        }));
    }

    let manifest_path = models_dir
        .join("manifests/registry.ollama.ai/library")
        .join(path);
    std::fs::create_dir_all(manifest_path.parent().unwrap()).unwrap();
    std::fs::write(
        manifest_path,
        serde_json::to_vec(&json!({"schemaVersion": 2, "layers": layers})).unwrap(),
    )
    .unwrap();
    digest
}

/// Files under `<models>/blobs`, by name.
pub fn blob_files(models_dir: &FsPath) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(models_dir.join("blobs")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

async fn head_blob(State(state): State<Arc<ServerState>>, Path(digest): Path<String>) -> StatusCode {
    state.counts.lock().head += 1;
    if let Some(status) = state.faults.lock().head_status {
        return StatusCode::from_u16(status).unwrap();
    }
    if state.blobs.lock().contains_key(&digest) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_blob(State(state): State<Arc<ServerState>>, Path(digest): Path<String>) -> Response {
    state.counts.lock().get += 1;
    let Some(data) = state.blobs.lock().get(&digest).cloned() else {
        return (StatusCode::NOT_FOUND, "blob not found").into_response();
    };

    if state.faults.lock().truncate_downloads {
        let half = data.slice(..data.len() / 2);
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(half),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected abort")),
        ];
        return Response::builder()
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
    }

    Response::builder()
        .header(header::CONTENT_LENGTH, data.len())
        .body(Body::from(data))
        .unwrap()
}

async fn post_blob(
    State(state): State<Arc<ServerState>>,
    Path(digest): Path<String>,
    body: Body,
) -> (StatusCode, String) {
    state.counts.lock().post += 1;
    let faults = state.faults.lock().clone();
    if faults.reject_uploads_unread {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk full".to_string());
    }
    if faults.stall_uploads {
        std::future::pending::<()>().await;
    }

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()),
    };
    if faults.reject_uploads {
        return (StatusCode::BAD_REQUEST, "digest mismatch".to_string());
    }
    let actual = digest_of(&body).to_string();
    if actual != digest {
        return (
            StatusCode::BAD_REQUEST,
            format!("digest mismatch, expected {} got {}", digest, actual),
        );
    }
    state.blobs.lock().insert(digest, body);
    (StatusCode::CREATED, String::new())
}

async fn show(State(state): State<Arc<ServerState>>, Json(req): Json<Value>) -> Response {
    state.counts.lock().show += 1;
    let name = req["name"].as_str().unwrap_or_default().to_string();
    match state.models.lock().get(&name) {
        Some(show) => (StatusCode::OK, Json(show.clone())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("model '{}' not found", name)})),
        )
            .into_response(),
    }
}

async fn create(State(state): State<Arc<ServerState>>, Json(req): Json<Value>) -> Response {
    state.counts.lock().create += 1;
    state.created.lock().push(req.clone());

    let mut lines = vec![json!({"status": "parsing modelfile"})];
    let missing = req["files"]
        .as_object()
        .map(|files| {
            let blobs = state.blobs.lock();
            files
                .values()
                .filter_map(Value::as_str)
                .filter(|d| !blobs.contains_key(*d))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if state.faults.lock().fail_create {
        lines.push(json!({"error": "unsupported model format"}));
    } else if !missing.is_empty() {
        lines.push(json!({"error": format!("missing blobs: {:?}", missing)}));
    } else {
        lines.push(json!({"status": "using existing layer"}));
        lines.push(json!({"status": "writing manifest"}));
        lines.push(json!({"status": "success"}));
    }

    let body = lines
        .iter()
        .map(|l| format!("{}\n", l))
        .collect::<String>();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}
