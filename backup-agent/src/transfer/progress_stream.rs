//! Progress-tracking stream wrapper for upload bodies.

use super::progress::{ProgressCallback, UploadProgress};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Stream wrapper that counts bytes and reports every chunk to a callback.
pub struct ProgressStream<S> {
    inner: S,
    total_bytes: u64,
    bytes_read: u64,
    started: Instant,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, total_bytes: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            total_bytes,
            bytes_read: 0,
            started: Instant::now(),
            callback,
        }
    }

    /// Get total bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_read += bytes.len() as u64;
                let progress =
                    UploadProgress::new(self.bytes_read, self.total_bytes, self.started.elapsed());
                (self.callback)(progress);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}
