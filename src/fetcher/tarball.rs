use std::{
    future::Future,
    io::{self, Write},
    path::PathBuf,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, trace};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    cache::{BlobWriter, PkgfetchCache},
    fetcher::FetchError,
    integrity::{self, Integrity},
};

const CHANNEL_CAPACITY: usize = 16;
const READ_CHUNK: usize = 64 * 1024;

/// Side-channel data travelling with a tarball stream.
#[derive(Debug)]
struct StreamMeta {
    resolved: OnceLock<String>,
    from: Option<String>,
    expected: OnceLock<Integrity>,
    /// Shared with the fetcher that produced the stream.
    integrity: Arc<OnceLock<String>>,
}

/// How a tarball stream is set up by a fetcher.
pub(crate) struct TarballSource {
    pub cache: PkgfetchCache,
    /// Integrity known before fetching. Enables serving from the cache and
    /// is verified against the produced bytes.
    pub known: Option<Integrity>,
    pub resolved: Option<String>,
    pub from: Option<String>,
    pub integrity: Arc<OnceLock<String>>,
}

/// A tarball being produced in the background.
///
/// Returned before any work happens. Failures at any stage arrive as an
/// `Err` item; a clean end of stream means the bytes were verified and
/// stored. Dropping the stream cancels the work.
pub struct TarballStream {
    rx: mpsc::Receiver<Result<Bytes, FetchError>>,
    meta: Arc<StreamMeta>,
    task: JoinHandle<()>,
}

/// A fully read tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballData {
    pub bytes: Vec<u8>,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub from: Option<String>,
}

impl TarballStream {
    pub fn resolved(&self) -> Option<&str> {
        self.meta.resolved.get().map(String::as_str)
    }

    /// Available once the stream has ended successfully.
    pub fn integrity(&self) -> Option<&str> {
        self.meta.integrity.get().map(String::as_str)
    }

    pub fn from(&self) -> Option<&str> {
        self.meta.from.as_deref()
    }

    /// Reads the whole tarball into memory.
    pub async fn collect(mut self) -> Result<TarballData, FetchError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(TarballData {
            bytes,
            resolved: self.resolved().map(str::to_owned),
            integrity: self.integrity().map(str::to_owned),
            from: self.from().map(str::to_owned),
        })
    }

    /// Copies the tarball into `out`, returning the number of bytes written.
    /// The side-channel accessors stay usable afterwards.
    pub async fn write_to<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> Result<u64, FetchError> {
        let mut written = 0;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

impl Stream for TarballStream {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TarballStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Producer half handed to a fetcher's tarball routine.
pub struct TarballSink {
    tx: mpsc::Sender<Bytes>,
    meta: Arc<StreamMeta>,
}

impl TarballSink {
    pub async fn send(&self, chunk: Bytes) -> Result<(), FetchError> {
        self.tx.send(chunk).await.map_err(|_| FetchError::Cancelled)
    }

    /// Forwards a byte stream, such as an HTTP response body.
    pub async fn pipe<S, E>(&self, mut stream: S) -> Result<(), FetchError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        FetchError: From<E>,
    {
        while let Some(chunk) = stream.next().await {
            self.send(chunk?).await?;
        }
        Ok(())
    }

    pub fn set_resolved(&self, resolved: &str) {
        if self.meta.resolved.set(resolved.to_owned()).is_err() {
            trace!("Tarball for {} already has a resolved value", resolved);
        }
    }

    /// Verifies the produced bytes against `integrity`, unless an integrity
    /// was already expected.
    pub fn expect_integrity(&self, integrity: Integrity) {
        let _ = self.meta.expected.set(integrity);
    }

    /// A writer for producers running on a blocking thread.
    pub fn blocking_writer(&self) -> SinkWriter {
        SinkWriter {
            tx: self.tx.clone(),
        }
    }
}

/// Synchronous [`Write`] into a tarball stream. Must not be used from an
/// async context.
pub struct SinkWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tarball stream was dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Starts producing a tarball and returns the consuming end immediately.
pub(crate) fn spawn_tarball<F, Fut>(source: TarballSource, produce: F) -> TarballStream
where
    F: FnOnce(TarballSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FetchError>> + Send + 'static,
{
    let TarballSource {
        cache,
        known,
        resolved,
        from,
        integrity,
    } = source;

    let meta = Arc::new(StreamMeta {
        resolved: OnceLock::new(),
        from,
        expected: OnceLock::new(),
        integrity,
    });
    if let Some(resolved) = resolved {
        let _ = meta.resolved.set(resolved);
    }

    let (out, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(drive(cache, known, meta.clone(), out, produce));
    TarballStream { rx, meta, task }
}

async fn drive<F, Fut>(
    cache: PkgfetchCache,
    known: Option<Integrity>,
    meta: Arc<StreamMeta>,
    out: mpsc::Sender<Result<Bytes, FetchError>>,
    produce: F,
) where
    F: FnOnce(TarballSink) -> Fut,
    Fut: Future<Output = Result<(), FetchError>>,
{
    if let Some(known) = known {
        if let Some(path) = cache.find(&known) {
            debug!("Serving tarball {} from {}", known, path.display());
            let result = serve_blob(path, &out).await;
            finish(&meta, &out, result.map(|()| known)).await;
            return;
        }
        let _ = meta.expected.set(known);
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let sink = TarballSink {
        tx,
        meta: meta.clone(),
    };

    let forward = {
        let out = out.clone();
        async move {
            let mut blob = cache.blob_writer()?;
            while let Some(chunk) = rx.recv().await {
                blob.write_all(&chunk)?;
                out.send(Ok(chunk))
                    .await
                    .map_err(|_| FetchError::Cancelled)?;
            }
            Ok::<BlobWriter, FetchError>(blob)
        }
    };

    let (produced, forwarded) = tokio::join!(produce(sink), forward);
    let result = match (produced, forwarded) {
        (Err(error), _) | (Ok(()), Err(error)) => Err(error),
        (Ok(()), Ok(blob)) => store(blob, meta.expected.get()),
    };
    finish(&meta, &out, result).await;
}

fn store(blob: BlobWriter, expected: Option<&Integrity>) -> Result<Integrity, FetchError> {
    let actual = blob.integrity();
    if let Some(expected) = expected {
        if !expected.matches(&actual) {
            return Err(FetchError::Integrity {
                expected: expected.to_string(),
                actual: integrity::label(&actual),
            });
        }
    }
    Ok(blob.commit()?)
}

async fn finish(
    meta: &StreamMeta,
    out: &mpsc::Sender<Result<Bytes, FetchError>>,
    result: Result<Integrity, FetchError>,
) {
    match result {
        Ok(integrity) => {
            let label = integrity::label(&integrity);
            trace!("Tarball complete: {}", label);
            let _ = meta.integrity.set(label);
        }
        Err(error) => {
            let _ = out.send(Err(error)).await;
        }
    }
}

async fn serve_blob(
    path: PathBuf,
    out: &mpsc::Sender<Result<Bytes, FetchError>>,
) -> Result<(), FetchError> {
    let mut file = tokio::fs::File::open(&path).await?;
    let mut buf = vec![0; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        out.send(Ok(Bytes::copy_from_slice(&buf[..read])))
            .await
            .map_err(|_| FetchError::Cancelled)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn source(cache: &PkgfetchCache, known: Option<Integrity>) -> TarballSource {
        TarballSource {
            cache: cache.clone(),
            known,
            resolved: Some("https://example.com/a.tgz".to_owned()),
            from: Some("a@1".to_owned()),
            integrity: Arc::new(OnceLock::new()),
        }
    }

    #[tokio::test]
    async fn stream_hash_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();
        let cell = Arc::new(OnceLock::new());

        let stream = spawn_tarball(
            TarballSource {
                integrity: cell.clone(),
                ..source(&cache, None)
            },
            |sink| async move {
                sink.send(Bytes::from_static(b"hello ")).await?;
                sink.send(Bytes::from_static(b"world")).await
            },
        );
        let data = stream.collect().await.unwrap();

        let expected = integrity::label(&Integrity::from_bytes(b"hello world"));
        assert_eq!(data.bytes, b"hello world");
        assert_eq!(data.integrity.as_deref(), Some(expected.as_str()));
        assert_eq!(data.resolved.as_deref(), Some("https://example.com/a.tgz"));
        assert_eq!(data.from.as_deref(), Some("a@1"));
        assert_eq!(cell.get(), Some(&expected));
        assert!(cache.find(&Integrity::from_bytes(b"hello world")).is_some());
    }

    #[tokio::test]
    async fn serve_known_integrity_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();
        let mut blob = cache.blob_writer().unwrap();
        blob.write_all(b"cached").unwrap();
        let known = blob.commit().unwrap();

        // A producer that would fail proves it never ran.
        let stream = spawn_tarball(source(&cache, Some(known)), |_| async {
            Err(FetchError::Cancelled)
        });
        assert_eq!(stream.collect().await.unwrap().bytes, b"cached");
    }

    #[tokio::test]
    async fn integrity_mismatch_is_a_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();

        let stream = spawn_tarball(source(&cache, None), |sink| async move {
            sink.expect_integrity(Integrity::from_bytes(b"expected"));
            sink.send(Bytes::from_static(b"actual")).await
        });
        let error = stream.collect().await.unwrap_err();
        assert!(matches!(error, FetchError::Integrity { .. }), "{error}");
        assert!(cache.find(&Integrity::from_bytes(b"actual")).is_none());
    }

    #[tokio::test]
    async fn producer_error_reaches_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();

        let mut stream = spawn_tarball(source(&cache, None), |sink| async move {
            sink.send(Bytes::from_static(b"partial")).await?;
            Err(FetchError::NoRemote {
                spec: "x".to_owned(),
            })
        });
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(matches!(
            stream.next().await,
            Some(Err(FetchError::NoRemote { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.integrity(), None);
    }

    #[tokio::test]
    async fn blocking_producer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();

        let stream = spawn_tarball(source(&cache, None), |sink| async move {
            let mut writer = sink.blocking_writer();
            tokio::task::spawn_blocking(move || writer.write_all(b"from a thread")).await??;
            Ok::<(), FetchError>(())
        });
        assert_eq!(stream.collect().await.unwrap().bytes, b"from a thread");
    }
}
