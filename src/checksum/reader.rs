//! Streaming checksum adapter

use super::{Checksum, ChecksumAlgorithm, Hasher};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// `AsyncRead` adapter that hashes and counts bytes as they pass through.
///
/// Drivers wrap inbound streams in this so the server-side checksum is known
/// the moment the last byte has been written to temporary storage.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Hasher,
    bytes_read: u64,
}

impl<R> ChecksumReader<R> {
    pub fn new(inner: R, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algorithm),
            bytes_read: 0,
        }
    }

    /// Bytes that have flowed through so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Finish hashing, returning the digest and total byte count
    pub fn finish(self) -> (Checksum, u64) {
        (self.hasher.finalize(), self.bytes_read)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChecksumReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        this.hasher.update(fresh);
        this.bytes_read += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}
