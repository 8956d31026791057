//! Byte-stream primitives used by the transfer engine.
//!
//! - [`ThrottledStream`] caps the average throughput of a stream
//! - [`BoundedPipe`] couples a concurrent producer and consumer with backpressure
//! - [`ProgressReporter`] counts bytes flowing through a stream

mod pipe;
mod progress;
mod throttle;

pub use pipe::BoundedPipe;
pub use progress::{spawn_sampler, ProgressCounter, ProgressReporter, ProgressUpdate, SamplerHandle};
pub use throttle::ThrottledStream;

use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

/// Boxed stream of blob bytes, the currency between transfer legs.
pub type BlobStream = BoxStream<'static, io::Result<Bytes>>;
