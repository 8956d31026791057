//! In-memory bounded pipe connecting a download task to an upload task.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::sync::Notify;

/// Terminal error recorded on the pipe. Stored as kind + message so every
/// blocked or later caller can receive its own `io::Error`.
#[derive(Debug, Clone)]
struct PipeFailure {
    kind: io::ErrorKind,
    message: String,
}

impl PipeFailure {
    fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    write_completed: bool,
    error: Option<PipeFailure>,
}

/// Bounded FIFO byte queue between one writer and one reader.
///
/// `buffered_bytes() <= capacity()` holds after every admitted write. Writes
/// wait while the pipe is full, reads wait while it is empty, and both wake on
/// completion or failure. All state lives behind a single mutex.
#[derive(Debug)]
pub struct BoundedPipe {
    capacity: usize,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

impl BoundedPipe {
    /// Create a pipe holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently queued.
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().buffered
    }

    /// Enqueue `data`, waiting for space as needed.
    ///
    /// Data larger than the free space is admitted in slices, so a single
    /// write may span several reads. Concurrent writers are serialised.
    pub async fn write(&self, mut data: Bytes) -> io::Result<()> {
        let _writer = self.write_lock.lock().await;

        while !data.is_empty() {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(err) = &state.error {
                    return Err(err.to_io());
                }
                if state.write_completed {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "write after pipe was completed",
                    ));
                }

                let free = self.capacity - state.buffered;
                if free > 0 {
                    let piece = data.split_to(free.min(data.len()));
                    state.buffered += piece.len();
                    state.chunks.push_back(piece);
                    drop(state);
                    self.readable.notify_waiters();
                    continue;
                }
            }

            notified.await;
        }

        Ok(())
    }

    /// Dequeue up to `max` bytes. `Ok(None)` once writing is complete and drained.
    pub async fn read_chunk(&self, max: usize) -> io::Result<Option<Bytes>> {
        let max = max.max(1);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(err) = &state.error {
                    return Err(err.to_io());
                }
                if let Some(mut chunk) = state.chunks.pop_front() {
                    if chunk.len() > max {
                        let rest = chunk.split_off(max);
                        state.chunks.push_front(rest);
                    }
                    state.buffered -= chunk.len();
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(Some(chunk));
                }
                if state.write_completed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Read into `buf`, returning the number of bytes copied (0 at end of stream).
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read_chunk(buf.len()).await? {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// Mark the write side finished. Idempotent.
    pub fn complete_writing(&self) {
        self.state.lock().write_completed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Record a terminal error; the first failure wins.
    pub fn fail(&self, err: &io::Error) {
        {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(PipeFailure {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Consume the pipe as a stream of chunks of at most `chunk_size` bytes.
    pub fn into_stream(
        self: Arc<Self>,
        chunk_size: usize,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::try_unfold(self, move |pipe| async move {
            let next = pipe.read_chunk(chunk_size).await?;
            Ok::<_, io::Error>(next.map(|chunk| (chunk, pipe)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::time::Duration;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_fifo_order_across_speeds() {
        // Mix of tiny, capacity-sized and oversized writes against a slow reader.
        let pipe = Arc::new(BoundedPipe::new(64));
        let sizes = [1usize, 7, 64, 65, 200, 3, 128, 0, 31];
        let written: Vec<u8> = sizes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| pattern(*n, i as u8))
            .collect();

        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                for (i, n) in sizes.iter().enumerate() {
                    pipe.write(Bytes::from(pattern(*n, i as u8))).await.unwrap();
                    if i % 2 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                pipe.complete_writing();
            })
        };

        let mut read = Vec::new();
        let mut buf = [0u8; 13];
        loop {
            let n = pipe.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            read.extend_from_slice(&buf[..n]);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn test_buffered_bytes_never_exceed_capacity() {
        let capacity = 100;
        let pipe = Arc::new(BoundedPipe::new(capacity));

        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut max_seen = 0;
                for i in 0..50usize {
                    pipe.write(Bytes::from(vec![0u8; (i * 17) % 150 + 1]))
                        .await
                        .unwrap();
                    max_seen = max_seen.max(pipe.buffered_bytes());
                }
                pipe.complete_writing();
                max_seen
            })
        };

        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut max_seen = 0;
                let mut total = 0;
                while let Some(chunk) = pipe.read_chunk(9).await.unwrap() {
                    max_seen = max_seen.max(pipe.buffered_bytes());
                    total += chunk.len();
                    tokio::time::sleep(Duration::from_micros(50)).await;
                }
                (max_seen, total)
            })
        };

        let writer_max = writer.await.unwrap();
        let (reader_max, total) = reader.await.unwrap();
        let expected: usize = (0..50usize).map(|i| (i * 17) % 150 + 1).sum();

        assert_eq!(total, expected);
        assert!(writer_max <= capacity, "writer saw {}", writer_max);
        assert!(reader_max <= capacity, "reader saw {}", reader_max);
    }

    #[tokio::test]
    async fn test_end_of_stream_after_drain() {
        let pipe = BoundedPipe::new(16);
        pipe.write(Bytes::from_static(b"hello")).await.unwrap();
        pipe.complete_writing();
        pipe.complete_writing();

        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 0);
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_complete_fails() {
        let pipe = BoundedPipe::new(16);
        pipe.complete_writing();
        let err = pipe.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_fail_unblocks_waiting_writer() {
        let pipe = Arc::new(BoundedPipe::new(4));
        pipe.write(Bytes::from_static(b"full")).await.unwrap();

        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(Bytes::from_static(b"more")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        pipe.fail(&io::Error::new(io::ErrorKind::ConnectionAborted, "upload failed"));

        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer hung after failure")
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(err.to_string(), "upload failed");
    }

    #[tokio::test]
    async fn test_fail_unblocks_waiting_reader() {
        let pipe = Arc::new(BoundedPipe::new(4));

        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.read_chunk(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        pipe.fail(&io::Error::new(io::ErrorKind::UnexpectedEof, "download failed"));

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader hung after failure")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let pipe = BoundedPipe::new(4);
        pipe.fail(&io::Error::new(io::ErrorKind::TimedOut, "first"));
        pipe.fail(&io::Error::new(io::ErrorKind::Other, "second"));
        assert!(pipe.is_failed());
        let err = pipe.read_chunk(1).await.unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn test_into_stream_yields_bounded_chunks() {
        let pipe = Arc::new(BoundedPipe::new(1024));
        pipe.write(Bytes::from(vec![7u8; 100])).await.unwrap();
        pipe.complete_writing();

        let chunks: Vec<Bytes> = pipe.into_stream(30).try_collect().await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![30, 30, 30, 10]
        );
    }
}
