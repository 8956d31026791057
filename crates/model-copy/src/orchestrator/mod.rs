//! Copy orchestrator - main workflow coordinator.
//!
//! A copy runs through these phases:
//! ResolvingManifest -> per layer Checking then Skipping or Transferring ->
//! CreatingModel -> Done. Any error ends the copy as Failed; there is no
//! partial success.

use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::create::{CreateRequest, ModelCreateStreamer};
use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::local::LocalBlobStore;
use crate::location::{topology_of, Location, ModelEndpoint, ModelRef, Topology, TransferTask};
use crate::manifest::{Manifest, ManifestResolver};
use crate::remote::{build_client, RemoteServer};
use crate::store::BlobStore;
use crate::transfer::{LegProgress, TransferEngine, TransferSettings};

/// Phase of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyPhase {
    Idle,
    ResolvingManifest,
    Checking,
    Skipping,
    Transferring,
    CreatingModel,
    Done,
    Failed,
}

impl fmt::Display for CopyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CopyPhase::Idle => "idle",
            CopyPhase::ResolvingManifest => "resolving manifest",
            CopyPhase::Checking => "checking",
            CopyPhase::Skipping => "skipping",
            CopyPhase::Transferring => "transferring",
            CopyPhase::CreatingModel => "creating model",
            CopyPhase::Done => "done",
            CopyPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Event published while a copy runs. Delivery is best effort: events are
/// dropped rather than stalling the transfer when the receiver lags.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CopyEvent {
    Phase {
        phase: CopyPhase,
    },
    ManifestResolved {
        model: String,
        layers: usize,
    },
    Layer {
        phase: CopyPhase,
        digest: Digest,
        index: usize,
        total: usize,
        size: u64,
    },
    Progress(LegProgress),
    LayerCompleted {
        digest: Digest,
        bytes: u64,
    },
    CreateStatus {
        status: String,
    },
}

/// What to copy where.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source: ModelEndpoint,
    pub destination: ModelEndpoint,
}

/// How one layer was handled.
#[derive(Debug, Clone, Serialize)]
pub struct LayerOutcome {
    pub digest: Digest,
    /// `skipped` or `transferred`.
    pub action: String,
    pub bytes: u64,
}

/// Result of a successful copy.
#[derive(Debug, Clone, Serialize)]
pub struct CopyResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Source as given, and the reference that resolved (`:latest` retry).
    pub source: String,
    pub source_model: String,

    pub destination: String,

    pub topology: Topology,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the copy started.
    pub started_at: DateTime<Utc>,

    /// When the copy completed.
    pub completed_at: DateTime<Utc>,

    /// Blob layers in the manifest.
    pub layers_total: usize,

    /// Layers already present at the destination.
    pub layers_skipped: usize,

    /// Layers moved by this run.
    pub layers_transferred: usize,

    /// Total bytes moved.
    pub bytes_transferred: u64,

    /// Final status reported by the create call.
    pub create_status: String,

    pub layers: Vec<LayerOutcome>,
}

impl CopyResult {
    /// Convert result to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Copy orchestrator.
pub struct TransferOrchestrator {
    config: Config,
    client: Client,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<CopyEvent>>,
}

impl TransferOrchestrator {
    /// Create a new orchestrator. One HTTP client (and connection pool) is
    /// shared by every server the copy touches.
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let client = build_client(&config.http)?;
        Ok(Self {
            config,
            client,
            cancel,
            events: None,
        })
    }

    /// Publish [`CopyEvent`]s on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<CopyEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: CopyEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                debug!("Dropping copy event: {}", e);
            }
        }
    }

    /// Resolve the manifest of a model without copying anything.
    pub async fn inspect(&self, endpoint: &ModelEndpoint) -> Result<(ModelRef, Manifest)> {
        ManifestResolver::new(self.client.clone())
            .resolve(endpoint)
            .await
    }

    /// Run the copy.
    pub async fn run(&self, request: &CopyRequest) -> Result<CopyResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting copy run {}: {} -> {}",
            run_id, request.source, request.destination
        );

        match self.run_phases(request, run_id, started_at).await {
            Ok(result) => {
                self.emit(CopyEvent::Phase {
                    phase: CopyPhase::Done,
                });
                info!(
                    "Copy complete: {} layers ({} transferred, {} skipped), {} bytes in {:.1}s",
                    result.layers_total,
                    result.layers_transferred,
                    result.layers_skipped,
                    result.bytes_transferred,
                    result.duration_seconds
                );
                Ok(result)
            }
            Err(e) => {
                self.emit(CopyEvent::Phase {
                    phase: CopyPhase::Failed,
                });
                error!("Copy failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        request: &CopyRequest,
        run_id: String,
        started_at: DateTime<Utc>,
    ) -> Result<CopyResult> {
        let source = &request.source;
        let destination = &request.destination;
        let topology = topology_of(&source.location, &destination.location)?;

        // Phase 1: Resolve manifest
        info!("Phase 1: Resolving manifest for {}", source);
        self.emit(CopyEvent::Phase {
            phase: CopyPhase::ResolvingManifest,
        });
        let (source_model, manifest) = self.inspect(source).await?;
        let layers: Vec<_> = manifest.transferable_layers().cloned().collect();
        info!("Found {} blob layers to copy", layers.len());
        self.emit(CopyEvent::ManifestResolved {
            model: source_model.to_string(),
            layers: layers.len(),
        });

        // Phase 2: Check and transfer layers, one at a time
        info!("Phase 2: Transferring layers to {}", destination.location);
        let store = self.destination_store(&destination.location);
        let engine = self.engine();
        let total = layers.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut bytes_transferred = 0u64;

        for (index, layer) in layers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, stopping before next layer");
                return Err(CopyError::Cancelled);
            }

            self.emit_layer(CopyPhase::Checking, &layer.digest, index, total, layer.size);
            if store.exists(&layer.digest).await? {
                info!("{}: already present, skipping", layer.digest);
                self.emit_layer(CopyPhase::Skipping, &layer.digest, index, total, layer.size);
                outcomes.push(LayerOutcome {
                    digest: layer.digest.clone(),
                    action: "skipped".into(),
                    bytes: 0,
                });
                continue;
            }

            self.emit_layer(CopyPhase::Transferring, &layer.digest, index, total, layer.size);
            let task = TransferTask {
                digest: layer.digest.clone(),
                size: layer.size,
                source: source.location.clone(),
                destination: destination.location.clone(),
            };
            let stats = engine.execute(&task).await?;
            bytes_transferred += stats.bytes;
            self.emit(CopyEvent::LayerCompleted {
                digest: layer.digest.clone(),
                bytes: stats.bytes,
            });
            outcomes.push(LayerOutcome {
                digest: layer.digest.clone(),
                action: "transferred".into(),
                bytes: stats.bytes,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }

        // Phase 3: Create the model on the destination
        info!("Phase 3: Creating {} on destination", destination.model);
        self.emit(CopyEvent::Phase {
            phase: CopyPhase::CreatingModel,
        });
        let create_request = CreateRequest::from_manifest(destination.model.api_name(), &manifest);
        let create_status = self
            .create_streamer(&destination.location)?
            .create(&create_request, |status| {
                self.emit(CopyEvent::CreateStatus {
                    status: status.to_string(),
                })
            })
            .await?;

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let layers_skipped = outcomes.iter().filter(|o| o.action == "skipped").count();

        Ok(CopyResult {
            run_id,
            status: "completed".to_string(),
            source: source.to_string(),
            source_model: source_model.to_string(),
            destination: destination.to_string(),
            topology,
            duration_seconds,
            started_at,
            completed_at,
            layers_total: total,
            layers_skipped,
            layers_transferred: total - layers_skipped,
            bytes_transferred,
            create_status,
            layers: outcomes,
        })
    }

    fn emit_layer(&self, phase: CopyPhase, digest: &Digest, index: usize, total: usize, size: u64) {
        debug!("{}: {} ({}/{})", digest, phase, index + 1, total);
        self.emit(CopyEvent::Layer {
            phase,
            digest: digest.clone(),
            index,
            total,
            size,
        });
    }

    fn engine(&self) -> TransferEngine {
        let engine = TransferEngine::new(
            self.client.clone(),
            TransferSettings::from(&self.config.transfer),
            self.cancel.clone(),
        );
        match self.events.clone() {
            Some(tx) => engine.with_progress(Arc::new(move |progress| {
                // Progress is periodic; a dropped sample is superseded by the next.
                let _ = tx.try_send(CopyEvent::Progress(progress));
            })),
            None => engine,
        }
    }

    fn destination_store(&self, location: &Location) -> Box<dyn BlobStore> {
        match location {
            Location::Local(dir) => Box::new(LocalBlobStore::new(dir.clone())),
            Location::Remote(url) => {
                Box::new(RemoteServer::with_client(url.clone(), self.client.clone()).blobs())
            }
        }
    }

    /// Only a server registers manifests, so a local destination is created
    /// through the configured local server.
    fn create_streamer(&self, location: &Location) -> Result<ModelCreateStreamer> {
        let base = match location {
            Location::Remote(url) => url.clone(),
            Location::Local(_) => Url::parse(&self.config.local.server_url).map_err(|e| {
                CopyError::Config(format!(
                    "local.server_url '{}' is not a valid URL: {}",
                    self.config.local.server_url, e
                ))
            })?,
        };
        Ok(ModelCreateStreamer::new(RemoteServer::with_client(
            base,
            self.client.clone(),
        )))
    }
}
