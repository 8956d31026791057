//! Byte counting for transfer legs, sampled periodically for reporting.

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Snapshot of a transfer leg's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub bytes_so_far: u64,
    /// Expected total (0 when unknown).
    pub total: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ProgressUpdate {
    /// Average throughput in bytes/sec since the leg started.
    pub fn bytes_per_sec(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_so_far as f64 / secs) as u64
        } else {
            0
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Shared cumulative byte counter for one transfer leg.
#[derive(Debug)]
pub struct ProgressCounter {
    bytes: AtomicU64,
    total: AtomicU64,
    started: Instant,
}

impl ProgressCounter {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(total),
            started: Instant::now(),
        })
    }

    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Update the expected total once it becomes known (e.g. from Content-Length).
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            bytes_so_far: self.bytes(),
            total: self.total.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Passes a stream through unchanged while counting its bytes.
pub struct ProgressReporter<S> {
    inner: S,
    counter: Arc<ProgressCounter>,
}

impl<S> ProgressReporter<S> {
    pub fn new(inner: S, counter: Arc<ProgressCounter>) -> Self {
        Self { inner, counter }
    }

    pub fn counter(&self) -> &Arc<ProgressCounter> {
        &self.counter
    }
}

impl<S> Stream for ProgressReporter<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            this.counter.add(chunk.len() as u64);
        }
        Poll::Ready(item)
    }
}

/// Running progress sampler; call [`SamplerHandle::finish`] to stop it.
///
/// Dropping the handle also stops the sampler, which then releases its
/// callback after one final report.
pub struct SamplerHandle {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl SamplerHandle {
    /// Stop sampling after emitting one final report.
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.handle).await {
            tracing::debug!("progress sampler ended abnormally: {}", e);
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Invoke `callback` with a snapshot of `counter` every `interval`, plus once
/// more when stopped. The transfer hot path only touches the atomic counter.
pub fn spawn_sampler<F>(
    counter: Arc<ProgressCounter>,
    interval: Duration,
    mut callback: F,
) -> SamplerHandle
where
    F: FnMut(ProgressUpdate) + Send + 'static,
{
    let stop = CancellationToken::new();
    let token = stop.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => callback(counter.snapshot()),
            }
        }
        callback(counter.snapshot());
    });

    SamplerHandle { stop, handle }
}
