//! The download queue and its concurrency/timeout invariants.

use crate::error::FetchError;
use crate::source::ChunkSource;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Configuration for the download manager.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum number of downloads in flight at once.
    pub max_active: usize,
    /// A download that receives no bytes for this long is failed and evicted.
    pub idle_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_active: 4,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloadConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency cap, clamped to the supported 1..=10 range.
    #[must_use]
    pub fn with_max_active(mut self, value: usize) -> Self {
        self.max_active = value.clamp(1, 10);
        self
    }

    /// Sets the inactivity timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }
}

/// A single download: fetch `url`, atomically place the bytes at `dest`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Absolute URL to GET.
    pub url: String,
    /// Final artifact path; parent directories are created as needed.
    pub dest: PathBuf,
}

/// Completion result: the final path on success.
pub type DownloadResult = Result<PathBuf, FetchError>;

struct Queued {
    request: DownloadRequest,
    reply: oneshot::Sender<DownloadResult>,
}

struct Shared {
    source: Rc<dyn ChunkSource>,
    config: DownloadConfig,
    queue: RefCell<VecDeque<Queued>>,
    active: Cell<usize>,
}

/// Single-threaded bounded-concurrency download queue.
///
/// Lives on a cache's worker thread and multiplexes up to
/// [`DownloadConfig::max_active`] transfers cooperatively on that thread's
/// event loop. Each download streams into a temporary file in the destination
/// directory and is renamed into place only once complete, so a half-written
/// artifact is never observable; on any failure the partial file is discarded.
///
/// Completion is delivered through the oneshot receiver returned by
/// [`enqueue`](Self::enqueue). Dropping the receiver does not cancel the
/// transfer; the only cancellation path is the inactivity timeout.
///
/// Must be used from within a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct DownloadManager {
    shared: Rc<Shared>,
}

impl DownloadManager {
    /// Creates a manager over the given byte source.
    #[must_use]
    pub fn new(source: Rc<dyn ChunkSource>, config: DownloadConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                source,
                config,
                queue: RefCell::new(VecDeque::new()),
                active: Cell::new(0),
            }),
        }
    }

    /// Queues a download and returns its completion receiver.
    ///
    /// The transfer starts immediately if an active slot is free, otherwise
    /// when one opens up.
    pub fn enqueue(&self, request: DownloadRequest) -> oneshot::Receiver<DownloadResult> {
        let (tx, rx) = oneshot::channel();
        self.shared.queue.borrow_mut().push_back(Queued {
            request,
            reply: tx,
        });
        Self::pump(&self.shared);
        rx
    }

    /// Number of downloads currently in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.get()
    }

    /// Number of downloads waiting for a slot.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Starts queued downloads while slots are free.
    fn pump(shared: &Rc<Shared>) {
        loop {
            if shared.active.get() >= shared.config.max_active {
                return;
            }
            let Some(next) = shared.queue.borrow_mut().pop_front() else {
                return;
            };
            shared.active.set(shared.active.get() + 1);

            let task_shared = Rc::clone(shared);
            tokio::task::spawn_local(async move {
                let result = run_download(&task_shared, &next.request).await;
                match &result {
                    Ok(path) => {
                        debug!(url = %next.request.url, path = %path.display(), "download complete");
                    }
                    Err(e) => {
                        warn!(url = %next.request.url, error = %e, "download failed");
                    }
                }
                let _ = next.reply.send(result);
                task_shared.active.set(task_shared.active.get() - 1);
                Self::pump(&task_shared);
            });
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("active", &self.shared.active.get())
            .field("queued", &self.shared.queue.borrow().len())
            .field("max_active", &self.shared.config.max_active)
            .finish()
    }
}

/// Streams one download into a temp file and persists it atomically.
async fn run_download(shared: &Shared, request: &DownloadRequest) -> DownloadResult {
    let parent = request
        .dest
        .parent()
        .ok_or_else(|| FetchError::transport("destination has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;

    let mut stream = shared.source.open(&request.url).await?;
    loop {
        let chunk = tokio::time::timeout(shared.config.idle_timeout, stream.next_chunk())
            .await
            .map_err(|_| FetchError::TimedOut)??;
        match chunk {
            Some(bytes) => temp.write_all(&bytes)?,
            None => break,
        }
    }
    temp.flush()?;

    // Only a fully-written body reaches the final path. Failure above drops
    // the temp file, which removes it from disk.
    temp.persist(&request.dest)
        .map_err(|e| FetchError::Io(e.error))?;
    Ok(request.dest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::tempdir;

    /// Scripted chunk source that tracks concurrent streams.
    struct MockSource {
        bodies: RefCell<std::collections::HashMap<String, Vec<Result<Bytes, FetchError>>>>,
        chunk_delay: Duration,
        counters: Rc<Counters>,
    }

    #[derive(Default)]
    struct Counters {
        open: Cell<usize>,
        max_seen: Cell<usize>,
    }

    impl MockSource {
        fn new(chunk_delay: Duration) -> Self {
            Self {
                bodies: RefCell::new(std::collections::HashMap::new()),
                chunk_delay,
                counters: Rc::new(Counters::default()),
            }
        }

        fn body(&self, url: &str, chunks: Vec<Result<Bytes, FetchError>>) {
            self.bodies.borrow_mut().insert(url.to_string(), chunks);
        }
    }

    #[async_trait(?Send)]
    impl ChunkSource for MockSource {
        async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
            let chunks = self
                .bodies
                .borrow_mut()
                .remove(url)
                .ok_or(FetchError::Status { code: 404 })?;
            let counters = Rc::clone(&self.counters);
            counters.open.set(counters.open.get() + 1);
            counters
                .max_seen
                .set(counters.max_seen.get().max(counters.open.get()));
            Ok(Box::new(MockStream {
                chunks: chunks.into(),
                delay: self.chunk_delay,
                counters,
            }))
        }
    }

    struct MockStream {
        chunks: VecDeque<Result<Bytes, FetchError>>,
        delay: Duration,
        counters: Rc<Counters>,
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            self.counters.open.set(self.counters.open.get() - 1);
        }
    }

    #[async_trait(?Send)]
    impl ByteStream for MockStream {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
            tokio::time::sleep(self.delay).await;
            match self.chunks.pop_front() {
                Some(chunk) => chunk.map(Some),
                None => Ok(None),
            }
        }
    }

    fn chunk(data: &[u8]) -> Result<Bytes, FetchError> {
        Ok(Bytes::copy_from_slice(data))
    }

    #[tokio::test]
    async fn download_writes_full_body_to_destination() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let temp = tempdir().unwrap();
                let dest = temp.path().join("album").join("photo.jpg");

                let source = MockSource::new(Duration::ZERO);
                source.body("http://cloud/p1", vec![chunk(b"hello "), chunk(b"world")]);

                let manager =
                    DownloadManager::new(Rc::new(source), DownloadConfig::default());
                let rx = manager.enqueue(DownloadRequest {
                    url: "http://cloud/p1".into(),
                    dest: dest.clone(),
                });

                let path = rx.await.unwrap().unwrap();
                assert_eq!(path, dest);
                assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
            })
            .await;
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let temp = tempdir().unwrap();
                let source = MockSource::new(Duration::from_millis(20));
                let counters = Rc::clone(&source.counters);

                let mut receivers = Vec::new();
                for i in 0..6 {
                    source.body(&format!("http://cloud/{i}"), vec![chunk(b"x")]);
                }
                let manager = DownloadManager::new(
                    Rc::new(source),
                    DownloadConfig::new().with_max_active(2),
                );
                for i in 0..6 {
                    receivers.push(manager.enqueue(DownloadRequest {
                        url: format!("http://cloud/{i}"),
                        dest: temp.path().join(format!("f{i}")),
                    }));
                }
                assert!(manager.active_count() <= 2);

                for rx in receivers {
                    rx.await.unwrap().unwrap();
                }
                assert!(counters.max_seen.get() <= 2);
                assert_eq!(manager.active_count(), 0);
                assert_eq!(manager.queued_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn stalled_download_times_out_and_leaves_no_partial_file() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let temp = tempdir().unwrap();
                let dest = temp.path().join("stalled.jpg");

                // One chunk arrives, then the stream stalls past the window.
                let source = MockSource::new(Duration::from_millis(5));
                source.body("http://cloud/slow", vec![chunk(b"partial"), chunk(b"rest")]);

                let manager = DownloadManager::new(
                    Rc::new(StallAfterFirst { inner: source }),
                    DownloadConfig::new().with_idle_timeout(Duration::from_millis(50)),
                );
                let rx = manager.enqueue(DownloadRequest {
                    url: "http://cloud/slow".into(),
                    dest: dest.clone(),
                });

                let result = rx.await.unwrap();
                assert!(matches!(result, Err(FetchError::TimedOut)));
                assert!(!dest.exists());

                // The discarded temp file is gone too.
                let leftovers: Vec<_> = std::fs::read_dir(temp.path())
                    .unwrap()
                    .flatten()
                    .collect();
                assert!(leftovers.is_empty());
            })
            .await;
    }

    /// Wraps a source so every stream stalls after its first chunk.
    struct StallAfterFirst {
        inner: MockSource,
    }

    #[async_trait(?Send)]
    impl ChunkSource for StallAfterFirst {
        async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
            let inner = self.inner.open(url).await?;
            Ok(Box::new(StallingStream {
                inner,
                served: false,
            }))
        }
    }

    struct StallingStream {
        inner: Box<dyn ByteStream>,
        served: bool,
    }

    #[async_trait(?Send)]
    impl ByteStream for StallingStream {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
            if self.served {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.served = true;
            self.inner.next_chunk().await
        }
    }

    #[tokio::test]
    async fn transfer_error_discards_the_partial_file() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let temp = tempdir().unwrap();
                let dest = temp.path().join("broken.jpg");

                let source = MockSource::new(Duration::ZERO);
                source.body(
                    "http://cloud/broken",
                    vec![chunk(b"start"), Err(FetchError::transport("reset"))],
                );

                let manager =
                    DownloadManager::new(Rc::new(source), DownloadConfig::default());
                let rx = manager.enqueue(DownloadRequest {
                    url: "http://cloud/broken".into(),
                    dest: dest.clone(),
                });

                assert!(rx.await.unwrap().is_err());
                assert!(!dest.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn refused_request_fails_without_touching_disk() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let temp = tempdir().unwrap();
                let dest = temp.path().join("missing.jpg");

                let source = MockSource::new(Duration::ZERO);
                let manager =
                    DownloadManager::new(Rc::new(source), DownloadConfig::default());
                let rx = manager.enqueue(DownloadRequest {
                    url: "http://cloud/unknown".into(),
                    dest: dest.clone(),
                });

                let result = rx.await.unwrap();
                assert!(matches!(result, Err(FetchError::Status { code: 404 })));
                assert!(!dest.exists());
            })
            .await;
    }

    #[test]
    fn config_clamps_the_cap() {
        assert_eq!(DownloadConfig::new().with_max_active(0).max_active, 1);
        assert_eq!(DownloadConfig::new().with_max_active(64).max_active, 10);
        assert_eq!(DownloadConfig::new().with_max_active(6).max_active, 6);
    }
}
