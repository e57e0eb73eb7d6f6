//! Stream wrappers (C6): a size-limited byte stream for enforcing
//! `MAX_FILE_SIZE` mid-transfer, a byte-counting stream for usage accounting
//! on cache-hit paths, and a tee helper that forwards every chunk to a
//! background cache-write task without blocking the client-facing stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum StreamLimitError {
    #[error("stream exceeded the configured size limit of {0} bytes")]
    SizeCapExceeded(u64),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Shared counter a `Drop` guard reports into, so a client disconnect still
/// leaves behind an accurate count of bytes actually delivered (§5,
/// Cancellation).
pub struct ByteCounter {
    total: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> (Self, Arc<AtomicU64>) {
        let total = Arc::new(AtomicU64::new(0));
        (
            Self {
                total: total.clone(),
            },
            total,
        )
    }

    fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }
}

/// Wraps a `Stream<Item = Result<Bytes, E>>`, counting bytes as they pass
/// through and erroring once `max_size` would be exceeded. The observed
/// total is always available via the `Arc<AtomicU64>` returned alongside the
/// stream, even if the stream is dropped early.
pub struct SizeLimitedStream<S> {
    inner: S,
    max_size: u64,
    seen: u64,
    counter: Arc<AtomicU64>,
}

impl<S, E> SizeLimitedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(inner: S, max_size: u64) -> (Self, Arc<AtomicU64>) {
        let (_counter, shared) = ByteCounter::new();
        (
            Self {
                inner,
                max_size,
                seen: 0,
                counter: shared.clone(),
            },
            shared,
        )
    }
}

impl<S, E> Stream for SizeLimitedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, StreamLimitError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.seen += chunk.len() as u64;
                if self.seen > self.max_size {
                    return Poll::Ready(Some(Err(StreamLimitError::SizeCapExceeded(self.max_size))));
                }
                self.counter.store(self.seen, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(StreamLimitError::Upstream(e.to_string()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Same shape as `SizeLimitedStream` but without a cap, for cache-hit serving
/// paths where usage must be counted against bytes actually delivered.
pub struct ByteCountingStream<S> {
    inner: S,
    seen: u64,
    counter: Arc<AtomicU64>,
}

impl<S, E> ByteCountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S) -> (Self, Arc<AtomicU64>) {
        let (_counter, shared) = ByteCounter::new();
        (
            Self {
                inner,
                seen: 0,
                counter: shared.clone(),
            },
            shared,
        )
    }
}

impl<S, E> Stream for ByteCountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.seen += chunk.len() as u64;
                self.counter.store(self.seen, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Splits a stream into two independently-consumable streams: the one
/// returned flows to the caller (typically the client response body), while
/// every chunk is also pushed into a bounded channel for a background
/// consumer (typically the cache-write task). The client-facing stream is
/// never slowed down by the tee: the channel absorbs bursts up to `buffer`,
/// but if the background consumer falls far enough behind that the channel
/// is full, the tee closes its sending half and marks the returned flag
/// poisoned rather than dropping a chunk silently. A poisoned tee means the
/// background consumer saw a gap and must discard whatever it collected
/// instead of persisting a cached object with a hole in it.
pub fn tee<S>(
    inner: S,
    buffer: usize,
) -> (
    impl Stream<Item = Result<Bytes, StreamLimitError>>,
    mpsc::Receiver<Bytes>,
    Arc<AtomicBool>,
)
where
    S: Stream<Item = Result<Bytes, StreamLimitError>> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(buffer);
    let poisoned = Arc::new(AtomicBool::new(false));
    let tapped = TeeStream {
        inner,
        tx: Some(tx),
        poisoned: poisoned.clone(),
    };
    (tapped, rx, poisoned)
}

struct TeeStream<S> {
    inner: S,
    tx: Option<mpsc::Sender<Bytes>>,
    poisoned: Arc<AtomicBool>,
}

impl<S> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Bytes, StreamLimitError>> + Unpin,
{
    type Item = Result<Bytes, StreamLimitError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tx) = &self.tx {
                    if tx.try_send(chunk.clone()).is_err() {
                        // The background consumer can't keep up (or is gone).
                        // Close the tee rather than hand it a gapped buffer.
                        self.poisoned.store(true, Ordering::Relaxed);
                        self.tx = None;
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Collects a tee'd channel's chunks into one `Bytes` buffer once the
/// producer side signals completion, for use by the background cache-write
/// task. `done` resolves once the client-facing stream has finished (success
/// or error), so the background task knows when no more chunks are coming.
/// Returns `None` if `poisoned` was ever set, meaning the tee dropped the
/// channel early and the collected bytes are incomplete; the caller must not
/// persist them.
pub async fn collect_tee(
    mut rx: mpsc::Receiver<Bytes>,
    done: oneshot::Receiver<bool>,
    poisoned: Arc<AtomicBool>,
) -> Option<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    let _ = done.await;
    if poisoned.load(Ordering::Relaxed) {
        None
    } else {
        Some(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn size_limited_stream_passes_chunks_under_cap() {
        let source = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let (limited, counter) = SizeLimitedStream::new(source, 100);
        let collected: Vec<_> = futures::StreamExt::collect(limited).await;
        assert!(collected.iter().all(|c| c.is_ok()));
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn size_limited_stream_errors_past_cap() {
        let source = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ]);
        let (limited, _counter) = SizeLimitedStream::new(source, 15);
        let collected: Vec<_> = futures::StreamExt::collect(limited).await;
        assert!(collected[0].is_ok());
        assert!(collected[1].is_err());
    }

    #[tokio::test]
    async fn byte_counting_stream_counts_delivered_bytes_even_if_truncated() {
        let source = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"de")),
        ]);
        let (counting, counter) = ByteCountingStream::new(source);
        let mut s = Box::pin(counting);
        use futures::StreamExt;
        // Only pull the first chunk, simulating a client disconnect mid-transfer.
        let _ = s.next().await;
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn tee_forwards_every_chunk_to_the_background_receiver() {
        let source = stream::iter(vec![
            Ok::<_, StreamLimitError>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let (tapped, mut rx, poisoned) = tee(Box::pin(source), 8);
        let (done_tx, done_rx) = oneshot::channel();
        let client_side = tokio::spawn(async move {
            use futures::StreamExt;
            let _: Vec<_> = tapped.collect().await;
            let _ = done_tx.send(true);
        });
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.push(chunk);
        }
        client_side.await.unwrap();
        let _ = done_rx.await;
        assert!(!poisoned.load(Ordering::Relaxed));
        assert_eq!(collected, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
    }

    #[tokio::test]
    async fn tee_poisons_instead_of_silently_dropping_a_chunk_on_a_full_channel() {
        let source = stream::iter(vec![
            Ok::<_, StreamLimitError>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghi")),
        ]);
        // Buffer of 1 and nobody draining `rx`: the second chunk overflows it.
        let (tapped, _rx, poisoned) = tee(Box::pin(source), 1);
        use futures::StreamExt;
        let delivered: Vec<_> = tapped.collect().await;
        // The client-facing stream still sees every chunk...
        assert_eq!(delivered.len(), 3);
        // ...but the tee is marked poisoned so the cache write is discarded.
        assert!(poisoned.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn collect_tee_returns_none_when_poisoned() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let poisoned = Arc::new(AtomicBool::new(true));
        drop(tx);
        let (done_tx, done_rx) = oneshot::channel();
        let _ = done_tx.send(true);
        assert!(collect_tee(rx, done_rx, poisoned).await.is_none());
    }
}
