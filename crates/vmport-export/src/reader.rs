//! Counting bytes as they stream through.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader and counts the bytes it has returned.
///
/// The count lives behind an `Arc`, so a [`ByteCounter`] handle can report
/// progress from another task while the reader is being consumed.
#[derive(Debug)]
pub struct ByteCountingReader<R> {
  inner: R,
  count: Arc<AtomicU64>,
}

/// Read-only view of a [`ByteCountingReader`]'s count.
#[derive(Debug, Clone)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
  pub fn get(&self) -> u64 {
    self.0.load(Ordering::Relaxed)
  }
}

impl<R> ByteCountingReader<R> {
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      count: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Bytes returned so far.
  pub fn bytes_read(&self) -> u64 {
    self.count.load(Ordering::Relaxed)
  }

  pub fn counter(&self) -> ByteCounter {
    ByteCounter(self.count.clone())
  }

  pub fn into_inner(self) -> R {
    self.inner
  }

  fn add(&self, n: usize) {
    self.count.fetch_add(n as u64, Ordering::Relaxed);
  }
}

impl<R: Read> Read for ByteCountingReader<R> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let n = self.inner.read(buf)?;
    self.add(n);
    Ok(n)
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for ByteCountingReader<R> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let before = buf.filled().len();
    let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = &poll {
      let n = buf.filled().len() - before;
      self.add(n);
    }
    poll
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use tokio::io::AsyncReadExt;

  #[test]
  fn test_counts_each_read() {
    let mut reader = ByteCountingReader::new(&b"abcdef"[..]);
    let mut buf = [0u8; 2];
    assert_eq!(reader.bytes_read(), 0);

    let mut seen = Vec::new();
    for expected in [2, 4, 6] {
      let n = Read::read(&mut reader, &mut buf).unwrap();
      assert_eq!(n, 2);
      seen.extend_from_slice(&buf[..n]);
      assert_eq!(reader.bytes_read(), expected);
    }
    assert_eq!(seen, b"abcdef");

    // EOF leaves the count alone.
    assert_eq!(Read::read(&mut reader, &mut buf).unwrap(), 0);
    assert_eq!(reader.bytes_read(), 6);
  }

  #[test]
  fn test_counter_handle_tracks_reader() {
    let mut reader = ByteCountingReader::new(&b"0123456789"[..]);
    let counter = reader.counter();
    let mut out = Vec::new();
    Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(counter.get(), 10);
    assert_eq!(out.len(), 10);
  }

  #[tokio::test]
  async fn test_async_reads_are_counted() {
    let mut reader = ByteCountingReader::new(&b"abcdef"[..]);
    let mut buf = [0u8; 4];
    assert_eq!(AsyncReadExt::read(&mut reader, &mut buf).await.unwrap(), 4);
    assert_eq!(reader.bytes_read(), 4);
    assert_eq!(AsyncReadExt::read(&mut reader, &mut buf).await.unwrap(), 2);
    assert_eq!(AsyncReadExt::read(&mut reader, &mut buf).await.unwrap(), 0);
    assert_eq!(reader.bytes_read(), 6);
  }
}
