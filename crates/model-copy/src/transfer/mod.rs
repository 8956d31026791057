//! Blob transfer engine.
//!
//! Moves one blob per [`TransferTask`] according to its topology:
//! - local to remote: file stream, throttled and counted, POSTed to the server
//! - remote to local: GET, throttled and counted, into a partial file that is
//!   renamed into place once complete
//! - remote to remote: a download task and an upload task joined by a
//!   [`BoundedPipe`], so no more than the pipe capacity is ever held in memory

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::digest::Digest;
use crate::error::{CopyError, Result};
use crate::local::LocalBlobStore;
use crate::location::{Location, Topology, TransferTask};
use crate::remote::{RemoteBlobClient, RemoteServer};
use crate::stream::{
    spawn_sampler, BlobStream, BoundedPipe, ProgressCounter, ProgressReporter, ProgressUpdate,
    SamplerHandle, ThrottledStream,
};

/// Engine settings derived from the `transfer` config section.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Bytes/sec ceiling per leg (0 = unlimited).
    pub bandwidth_limit: u64,
    pub chunk_size: usize,
    /// Pipe capacity for remote-to-remote transfers.
    pub max_buffered_bytes: usize,
    pub verify_downloads: bool,
    pub progress_interval: Duration,
}

impl From<&TransferConfig> for TransferSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            bandwidth_limit: config.bandwidth_limit,
            chunk_size: config.chunk_size,
            max_buffered_bytes: config.get_max_buffered_bytes(),
            verify_downloads: config.verify_downloads,
            progress_interval: config.progress_interval(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

/// Direction of a transfer leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Download,
    Upload,
}

/// Progress sample of one leg of one blob.
#[derive(Debug, Clone, Serialize)]
pub struct LegProgress {
    pub digest: Digest,
    pub leg: Leg,
    #[serde(flatten)]
    pub update: ProgressUpdate,
}

/// Receives progress samples; called from sampler tasks, never from the data path.
pub type ProgressSink = Arc<dyn Fn(LegProgress) + Send + Sync>;

/// Statistics from a completed transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub digest: Digest,
    pub topology: Topology,
    /// Bytes delivered to the destination.
    pub bytes: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of one leg of a piped transfer.
#[derive(Debug)]
enum LegError {
    /// This leg failed on its own.
    Root(CopyError),
    /// This leg stopped because the other leg failed the pipe.
    Peer,
}

/// A spawned leg that is aborted if the transfer awaiting it is dropped.
struct LegTask<T>(JoinHandle<T>);

impl<T> Future for LegTask<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for LegTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes transfer tasks. Cheap to clone; clones share the HTTP client.
#[derive(Clone)]
pub struct TransferEngine {
    client: Client,
    settings: TransferSettings,
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl TransferEngine {
    pub fn new(client: Client, settings: TransferSettings, cancel: CancellationToken) -> Self {
        Self {
            client,
            settings,
            cancel,
            progress: None,
        }
    }

    /// Report per-leg progress samples to `sink`.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Move one blob. Tasks are never retried here.
    pub async fn execute(&self, task: &TransferTask) -> Result<TransferStats> {
        let topology = task.topology()?;
        if self.cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }

        info!(
            "{}: transferring {} -> {} ({:?}, {} bytes expected)",
            task.digest, task.source, task.destination, topology, task.size
        );
        let start = Instant::now();

        let bytes = match (&task.source, &task.destination) {
            (Location::Local(dir), Location::Remote(url)) => {
                self.local_to_remote(&task.digest, dir, url).await?
            }
            (Location::Remote(url), Location::Local(dir)) => {
                self.remote_to_local(&task.digest, task.size, url, dir)
                    .await?
            }
            (Location::Remote(from), Location::Remote(to)) => {
                self.remote_to_remote(&task.digest, task.size, from, to)
                    .await?
            }
            (Location::Local(_), Location::Local(_)) => {
                return Err(CopyError::Config(
                    "local-to-local copies are not blob transfers".into(),
                ))
            }
        };

        let duration = start.elapsed();
        let mb = bytes as f64 / (1024.0 * 1024.0);
        info!(
            "{}: {:.1} MiB in {:.2}s ({:.1} MiB/s)",
            task.digest,
            mb,
            duration.as_secs_f64(),
            mb / duration.as_secs_f64().max(0.001)
        );

        Ok(TransferStats {
            digest: task.digest.clone(),
            topology,
            bytes,
            duration,
        })
    }

    fn remote(&self, base: &Url) -> RemoteBlobClient {
        RemoteServer::with_client(base.clone(), self.client.clone()).blobs()
    }

    fn start_sampler(
        &self,
        digest: &Digest,
        leg: Leg,
        counter: &Arc<ProgressCounter>,
    ) -> Option<SamplerHandle> {
        let sink = self.progress.clone()?;
        let digest = digest.clone();
        Some(spawn_sampler(
            counter.clone(),
            self.settings.progress_interval,
            move |update| {
                sink(LegProgress {
                    digest: digest.clone(),
                    leg,
                    update,
                })
            },
        ))
    }

    fn throttled(&self, stream: BlobStream, counter: Arc<ProgressCounter>) -> BlobStream {
        ProgressReporter::new(
            ThrottledStream::new(stream, self.settings.bandwidth_limit),
            counter,
        )
        .boxed()
    }

    async fn local_to_remote(&self, digest: &Digest, models_dir: &Path, to: &Url) -> Result<u64> {
        let store = LocalBlobStore::new(models_dir);
        let (file, size) = store.open(digest, self.settings.chunk_size).await?;

        let counter = ProgressCounter::new(size);
        let sampler = self.start_sampler(digest, Leg::Upload, &counter);
        let body = self.throttled(file, counter.clone());

        let destination = self.remote(to);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(CopyError::Cancelled),
            r = destination.upload(digest, body, size) => r,
        };
        finish(sampler).await;

        result.map(|()| counter.bytes())
    }

    async fn remote_to_local(
        &self,
        digest: &Digest,
        expected: u64,
        from: &Url,
        models_dir: &Path,
    ) -> Result<u64> {
        let (body, size) = self.remote(from).download(digest).await?;

        let counter = ProgressCounter::new(if size > 0 { size } else { expected });
        let sampler = self.start_sampler(digest, Leg::Download, &counter);
        let body = self.throttled(body, counter);

        let store = LocalBlobStore::new(models_dir);
        let result = store
            .write_blob(digest, body, self.settings.verify_downloads, &self.cancel)
            .await;
        finish(sampler).await;

        result
    }

    async fn remote_to_remote(
        &self,
        digest: &Digest,
        expected: u64,
        from: &Url,
        to: &Url,
    ) -> Result<u64> {
        let (body, size) = self.remote(from).download(digest).await?;
        let total = if size > 0 { size } else { expected };

        let pipe = Arc::new(BoundedPipe::new(self.settings.max_buffered_bytes));
        debug!(
            "{}: piping {} bytes through a {} byte buffer",
            digest,
            total,
            pipe.capacity()
        );

        let down_counter = ProgressCounter::new(total);
        let up_counter = ProgressCounter::new(total);
        let down_sampler = self.start_sampler(digest, Leg::Download, &down_counter);
        let up_sampler = self.start_sampler(digest, Leg::Upload, &up_counter);

        let download = LegTask(tokio::spawn(pump_into_pipe(
            digest.clone(),
            self.throttled(body, down_counter),
            pipe.clone(),
            self.cancel.clone(),
        )));

        let upload_body = ProgressReporter::new(
            pipe.clone().into_stream(self.settings.chunk_size).boxed(),
            up_counter.clone(),
        );
        let upload = LegTask(tokio::spawn(upload_from_pipe(
            digest.clone(),
            self.remote(to),
            upload_body,
            size,
            pipe.clone(),
            self.cancel.clone(),
        )));
        // Abandoning the relay mid-flight stops both legs and the pipe with them.
        let _abandon = PipeGuard(pipe.clone());

        let (down, up) = tokio::join!(download, upload);
        finish(down_sampler).await;
        finish(up_sampler).await;

        let down = down.unwrap_or_else(|e| Err(LegError::Root(task_failed(digest, "download", e))));
        let up = up.unwrap_or_else(|e| Err(LegError::Root(task_failed(digest, "upload", e))));
        resolve_legs(digest, down, up).map(|()| up_counter.bytes())
    }
}

async fn finish(sampler: Option<SamplerHandle>) {
    if let Some(sampler) = sampler {
        sampler.finish().await;
    }
}

/// Fails the pipe on drop, waking any leg still blocked on it.
struct PipeGuard(Arc<BoundedPipe>);

impl Drop for PipeGuard {
    fn drop(&mut self) {
        self.0.fail(&cancelled_io());
    }
}

fn task_failed(digest: &Digest, leg: &str, err: JoinError) -> CopyError {
    CopyError::transfer(digest.to_string(), format!("{} task failed: {}", leg, err))
}

fn cancelled_io() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled")
}

/// Download leg: copy the throttled GET body into the pipe.
async fn pump_into_pipe(
    digest: Digest,
    mut body: BlobStream,
    pipe: Arc<BoundedPipe>,
    cancel: CancellationToken,
) -> std::result::Result<(), LegError> {
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(LegError::Root(CopyError::Cancelled)),
        r = async {
            while let Some(chunk) = body.next().await {
                let chunk: Bytes = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        return Err(LegError::Root(CopyError::from_transfer_io(
                            &digest.to_string(),
                            e,
                        )))
                    }
                };
                if pipe.write(chunk).await.is_err() {
                    return Err(LegError::Peer);
                }
            }
            Ok(())
        } => r,
    };

    match &result {
        Ok(()) => pipe.complete_writing(),
        Err(LegError::Root(CopyError::Cancelled)) => pipe.fail(&cancelled_io()),
        Err(LegError::Root(e)) => {
            warn!("{}: download leg failed: {}", digest, e);
            pipe.fail(&io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()));
        }
        Err(LegError::Peer) => debug!("{}: download leg stopped by upload failure", digest),
    }
    result
}

/// Upload leg: POST the pipe contents to the destination.
async fn upload_from_pipe(
    digest: Digest,
    destination: RemoteBlobClient,
    body: ProgressReporter<BlobStream>,
    size: u64,
    pipe: Arc<BoundedPipe>,
    cancel: CancellationToken,
) -> std::result::Result<(), LegError> {
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(CopyError::Cancelled),
        r = destination.upload(&digest, body, size) => r,
    };

    match result {
        Ok(()) => {
            // Unblocks a writer still waiting if the server answered early.
            pipe.fail(&io::Error::new(io::ErrorKind::BrokenPipe, "upload finished"));
            Ok(())
        }
        Err(CopyError::Cancelled) => {
            pipe.fail(&cancelled_io());
            Err(LegError::Root(CopyError::Cancelled))
        }
        Err(_) if pipe.is_failed() => Err(LegError::Peer),
        Err(e) => {
            warn!("{}: upload leg failed: {}", digest, e);
            pipe.fail(&io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()));
            Err(LegError::Root(e))
        }
    }
}

/// Combine the two legs into one outcome, reporting the failure that caused
/// the other leg to stop.
fn resolve_legs(
    digest: &Digest,
    down: std::result::Result<(), LegError>,
    up: std::result::Result<(), LegError>,
) -> Result<()> {
    match (down, up) {
        (Err(LegError::Root(e)), _) => Err(e),
        (_, Err(LegError::Root(e))) => Err(e),
        (_, Ok(())) => Ok(()),
        (_, Err(LegError::Peer)) => Err(CopyError::transfer(
            digest.to_string(),
            "upload stopped without a cause",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn digest() -> Digest {
        Digest::sha256("a".repeat(64)).unwrap()
    }

    fn engine(cancel: CancellationToken) -> TransferEngine {
        TransferEngine::new(Client::new(), TransferSettings::default(), cancel)
    }

    #[test]
    fn test_settings_from_config() {
        let config = TransferConfig {
            max_buffered_bytes: Some(4096),
            bandwidth_limit: 100,
            ..Default::default()
        };
        let settings = TransferSettings::from(&config);
        assert_eq!(settings.max_buffered_bytes, 4096);
        assert_eq!(settings.bandwidth_limit, 100);
        assert_eq!(settings.progress_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_resolve_legs_prefers_root_cause() {
        let d = digest();
        let err = resolve_legs(
            &d,
            Err(LegError::Root(CopyError::transfer("x", "reset"))),
            Err(LegError::Peer),
        )
        .unwrap_err();
        assert!(matches!(err, CopyError::Transfer { .. }));

        let err = resolve_legs(
            &d,
            Err(LegError::Peer),
            Err(LegError::Root(CopyError::DigestMismatch {
                digest: "x".into(),
                message: "bad".into(),
            })),
        )
        .unwrap_err();
        assert!(matches!(err, CopyError::DigestMismatch { .. }));

        assert!(resolve_legs(&d, Ok(()), Ok(())).is_ok());
        assert!(resolve_legs(&d, Err(LegError::Peer), Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_local_to_local_rejected() {
        let task = TransferTask {
            digest: digest(),
            size: 1,
            source: Location::Local(PathBuf::from("/a")),
            destination: Location::Local(PathBuf::from("/b")),
        };
        let err = engine(CancellationToken::new())
            .execute(&task)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = TransferTask {
            digest: digest(),
            size: 1,
            source: Location::Remote(Url::parse("http://127.0.0.1:9/").unwrap()),
            destination: Location::Local(PathBuf::from("/tmp")),
        };
        let err = engine(cancel).execute(&task).await.unwrap_err();
        assert!(matches!(err, CopyError::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_leg_is_aborted() {
        let held = Arc::new(());
        let task = {
            let held = held.clone();
            LegTask(tokio::spawn(async move {
                let _held = held;
                std::future::pending::<()>().await
            }))
        };
        drop(task);

        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&held) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pipe_failure_reaches_upload_body() {
        let pipe = Arc::new(BoundedPipe::new(8));
        let d = digest();
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .boxed();

        let result = pump_into_pipe(d, body, pipe.clone(), CancellationToken::new()).await;
        assert!(matches!(result, Err(LegError::Root(CopyError::Transfer { .. }))));
        assert!(pipe.is_failed());
        let mut buf = [0u8; 8];
        assert!(pipe.read(&mut buf).await.is_err());
    }
}
