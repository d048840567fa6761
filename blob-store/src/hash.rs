use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use harbor_core::digest::{Algorithm, Hasher};
use harbor_core::Digest;
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader, hashing and counting every byte read through it.
#[pin_project]
#[derive(Debug)]
pub struct HashingReader<R> {
    #[pin]
    inner: R,
    hasher: Hasher,
    count: u64,
}

impl<R> HashingReader<R> {
    /// Start hashing `inner` from scratch.
    pub fn new(inner: R, algorithm: Algorithm) -> Self {
        Self::resume(inner, Hasher::new(algorithm), 0)
    }

    /// Continue hashing where a previous reader stopped.
    pub fn resume(inner: R, hasher: Hasher, count: u64) -> Self {
        HashingReader {
            inner,
            hasher,
            count,
        }
    }

    /// Bytes read so far, including any resumed count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The hasher state and byte count, for resuming later.
    pub fn into_state(self) -> (Hasher, u64) {
        (self.hasher, self.count)
    }

    /// Digest of everything read.
    pub fn finish(self) -> (Digest, u64) {
        (self.hasher.finalize(), self.count)
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let polled = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &polled {
            let fresh = &buf.filled()[before..];
            this.hasher.update(fresh);
            *this.count += fresh.len() as u64;
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn hashes_what_passes_through() {
        let mut first = HashingReader::new(&b"hello "[..], Algorithm::Sha256);
        let mut sink = Vec::new();
        first.read_to_end(&mut sink).await.unwrap();
        let (hasher, count) = first.into_state();

        let mut second = HashingReader::resume(&b"world"[..], hasher, count);
        second.read_to_end(&mut sink).await.unwrap();
        let (digest, size) = second.finish();

        assert_eq!(size, 11);
        assert_eq!(digest, Digest::sha256(b"hello world"));
        assert_eq!(sink, b"hello world");
    }
}
