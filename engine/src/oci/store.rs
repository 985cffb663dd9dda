//! Blob store abstraction.
//!
//! A `BlobStore` is a content-addressed remote (normally an OCI registry)
//! reached through an already-authenticated client. Blob bodies move as
//! lazily-read byte streams so large layers never have to be materialized in
//! memory.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use oci_relay_core::error::{RelayError, Result};
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::time::{Instant, Sleep};
use tokio_util::io::ReaderStream;

use super::digest::ContentDigest;
use super::manifest::Manifest;
use super::reference::ArtifactReference;

/// A boxed stream of blob bytes.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Local content that can be read, then rewound and read again.
pub trait BlobReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> BlobReader for T {}

/// Network-facing operations against one content-addressed store.
///
/// Every call may block on I/O; dropping the returned future cancels it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Host name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether a manifest exists at `reference`. Never fetches the body.
    async fn head_manifest(&self, reference: &ArtifactReference) -> Result<bool>;

    /// Fetch and parse the manifest at `reference` (`NotFound` if absent).
    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest>;

    /// Open a lazily-read stream over a blob in `reference`'s repository.
    async fn fetch_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
    ) -> Result<BlobStream>;

    /// Upload a blob into `reference`'s repository.
    ///
    /// The store may reject content that does not match `digest`/`size` with
    /// `IntegrityError`.
    async fn put_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
        size: u64,
        content: BlobStream,
    ) -> Result<()>;

    /// Publish a manifest. Must follow every blob upload it references.
    async fn put_manifest(
        &self,
        reference: &ArtifactReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<()>;
}

/// Stream a local reader in `chunk_size` pieces.
pub fn reader_stream<R>(reader: R, chunk_size: usize) -> BlobStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::with_capacity(reader, chunk_size.max(1)).map_err(RelayError::from))
}

/// Stream an in-memory buffer as a single chunk.
pub fn bytes_stream(data: Bytes) -> BlobStream {
    Box::pin(futures::stream::once(async move { Ok::<_, RelayError>(data) }))
}

/// Drain a stream into memory. Only for small blobs such as configs.
pub async fn collect_stream(mut stream: BlobStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Fail the stream with `IntegrityError` if it yields more or fewer bytes
/// than `expected`.
pub fn guard_length(inner: BlobStream, digest: ContentDigest, expected: u64) -> BlobStream {
    Box::pin(LengthGuard {
        inner,
        digest,
        expected,
        seen: 0,
        done: false,
    })
}

struct LengthGuard {
    inner: BlobStream,
    digest: ContentDigest,
    expected: u64,
    seen: u64,
    done: bool,
}

impl LengthGuard {
    fn mismatch(&mut self, message: String) -> Poll<Option<Result<Bytes>>> {
        self.done = true;
        Poll::Ready(Some(Err(RelayError::IntegrityError {
            digest: self.digest.to_string(),
            message,
        })))
    }
}

impl Stream for LengthGuard {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.seen += chunk.len() as u64;
                if self.seen > self.expected {
                    let message = format!(
                        "source delivered more than the declared {} bytes",
                        self.expected
                    );
                    return self.mismatch(message);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if self.seen != self.expected {
                    let message = format!(
                        "source delivered {} bytes, descriptor declares {}",
                        self.seen, self.expected
                    );
                    return self.mismatch(message);
                }
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Fail the stream with `RegistryError` if `inner` takes longer than
/// `limit` to produce its next chunk.
///
/// The clock only runs while the consumer is waiting on `inner`; time spent
/// by the consumer between polls is not counted. `None` disables the guard.
pub fn guard_idle(
    inner: BlobStream,
    limit: Option<Duration>,
    registry: &str,
    digest: &ContentDigest,
) -> BlobStream {
    let Some(limit) = limit else {
        return inner;
    };
    Box::pin(IdleGuard {
        inner,
        limit,
        timer: Box::pin(tokio::time::sleep(limit)),
        waiting: false,
        registry: registry.to_string(),
        digest: digest.clone(),
        done: false,
    })
}

struct IdleGuard {
    inner: BlobStream,
    limit: Duration,
    timer: Pin<Box<Sleep>>,
    waiting: bool,
    registry: String,
    digest: ContentDigest,
    done: bool,
}

impl Stream for IdleGuard {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        if !self.waiting {
            let deadline = Instant::now() + self.limit;
            self.timer.as_mut().reset(deadline);
            self.waiting = true;
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.waiting = false;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(other) => {
                self.done = true;
                Poll::Ready(other)
            }
            Poll::Pending => match self.timer.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.done = true;
                    Poll::Ready(Some(Err(RelayError::registry(
                        &self.registry,
                        format!(
                            "Blob {} stalled: no data for {}s",
                            self.digest,
                            self.limit.as_secs()
                        ),
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
