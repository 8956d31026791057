//! # model-copy
//!
//! Blob transfer engine for model stores.
//!
//! A model is a manifest plus content-addressed blobs. This library copies a
//! model between a local models directory and remote inference servers:
//!
//! - **Three topologies**: local to remote, remote to local, remote to remote
//! - **Bounded memory** when relaying between two servers, via a fixed-size pipe
//! - **Bandwidth ceiling** applied per transfer leg
//! - **Idempotent** re-runs: blobs already at the destination are skipped
//! - **Verified downloads** with atomic placement into the local store
//!
//! ## Example
//!
//! ```rust,no_run
//! use model_copy::{Config, CopyRequest, ModelEndpoint, TransferOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> model_copy::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let models_dir = config.local.models_dir.clone();
//!     let request = CopyRequest {
//!         source: ModelEndpoint::parse("llama3:8b", &models_dir)?,
//!         destination: ModelEndpoint::parse("http://gpu-box:11434/llama3:8b", &models_dir)?,
//!     };
//!     let orchestrator = TransferOrchestrator::new(config, CancellationToken::new())?;
//!     let result = orchestrator.run(&request).await?;
//!     println!("Copied {} bytes", result.bytes_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod create;
pub mod digest;
pub mod error;
pub mod local;
pub mod location;
pub mod manifest;
pub mod orchestrator;
pub mod remote;
pub mod store;
pub mod stream;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, HttpConfig, LocalConfig, TransferConfig};
pub use create::{CreateRequest, ModelCreateStreamer};
pub use digest::Digest;
pub use error::{CopyError, Result};
pub use local::LocalBlobStore;
pub use location::{Location, ModelEndpoint, ModelRef, Topology, TransferTask};
pub use manifest::{Layer, Manifest, ManifestResolver, MediaType};
pub use orchestrator::{CopyEvent, CopyPhase, CopyRequest, CopyResult, TransferOrchestrator};
pub use remote::{RemoteBlobClient, RemoteServer};
pub use store::BlobStore;
pub use stream::{BoundedPipe, ProgressReporter, ThrottledStream};
pub use transfer::{TransferEngine, TransferSettings, TransferStats};
