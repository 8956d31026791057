//! Average-rate throttling for byte streams.

use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Caps the average throughput of a wrapped stream.
///
/// Each chunk is released immediately while the average rate since the first
/// poll is at or below the ceiling; otherwise the chunk is held just long
/// enough to bring the average back to the ceiling. At most one chunk is held.
pub struct ThrottledStream<S> {
    inner: S,
    bytes_per_sec: u64,
    started: Option<Instant>,
    transferred: u64,
    delay: Option<Pin<Box<Sleep>>>,
    held: Option<Bytes>,
}

impl<S> ThrottledStream<S> {
    /// Wrap `inner`; a ceiling of 0 disables throttling.
    pub fn new(inner: S, bytes_per_sec: u64) -> Self {
        Self {
            inner,
            bytes_per_sec,
            started: None,
            transferred: 0,
            delay: None,
            held: None,
        }
    }

    /// Bytes released so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// How long the stream must have run for `transferred` bytes to be on-rate.
    fn target_elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.transferred as f64 / self.bytes_per_sec as f64)
    }
}

impl<S> Stream for ThrottledStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
            return Poll::Ready(this.held.take().map(Ok));
        }

        if this.bytes_per_sec == 0 {
            let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
            if let Some(Ok(chunk)) = &item {
                this.transferred += chunk.len() as u64;
            }
            return Poll::Ready(item);
        }

        let started = *this.started.get_or_insert_with(Instant::now);
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.transferred += chunk.len() as u64;
                let target = this.target_elapsed();
                let elapsed = started.elapsed();
                if target <= elapsed {
                    return Poll::Ready(Some(Ok(chunk)));
                }

                let mut delay = Box::pin(tokio::time::sleep(target - elapsed));
                if delay.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Some(Ok(chunk)));
                }
                this.delay = Some(delay);
                this.held = Some(chunk);
                Poll::Pending
            }
            other => Poll::Ready(other),
        }
    }
}
