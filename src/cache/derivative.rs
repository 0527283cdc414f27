use crate::cache::{build_key, Cache, CacheKey, Dimension};
use crate::config::ImageFormat;
use crate::store::{Original, OriginalStore};
use crate::transform::{TranscodeRequest, Transcoder};
use crate::{ImageServerError, METRICS};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Bytes of a derivative and how they were obtained.
#[derive(Debug, Clone)]
pub struct Derivative {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub key: CacheKey,
    pub status: CacheStatus,
}

/// Per-path generation locks, so one process transcodes a key at most once at a time.
#[derive(Default)]
struct InFlight {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

struct FlightGuard {
    table: Arc<InFlight>,
    path: PathBuf,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InFlight {
    async fn acquire(self: &Arc<Self>, path: PathBuf) -> FlightGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(path.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        FlightGuard { table: Arc::clone(self), path, lock, guard: Some(guard) }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.table.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table and this guard still hold the lock: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.path);
        }
    }
}

/// Read-through cache of derivatives.
///
/// A hit is served straight from disk with no freshness check. A miss runs
/// the transcoder on the blocking pool, persists the result atomically and
/// returns it. Generation runs in its own task, so a client going away
/// mid-request does not stop the derivative from being written.
pub struct DerivativeCache {
    store: OriginalStore,
    cache: Arc<dyn Cache>,
    transcoder: Arc<dyn Transcoder>,
    quality: u8,
    in_flight: Arc<InFlight>,
}

impl DerivativeCache {
    pub fn new(store: OriginalStore, cache: Arc<dyn Cache>, transcoder: Arc<dyn Transcoder>, quality: u8) -> Self {
        Self { store, cache, transcoder, quality, in_flight: Arc::default() }
    }

    pub fn store(&self) -> &OriginalStore {
        &self.store
    }

    pub fn transcoder(&self) -> &dyn Transcoder {
        self.transcoder.as_ref()
    }

    /// Resolves the original for `image` and serves the requested derivative.
    pub async fn fetch(
        &self,
        image: &str,
        width: Option<Dimension>,
        height: Option<Dimension>,
        format: ImageFormat,
    ) -> Result<Derivative, ImageServerError> {
        let original = self.store.locate(image).await?;
        self.fetch_original(&original, width, height, format).await
    }

    /// Serves the derivative of an already located original.
    pub async fn fetch_original(
        &self,
        original: &Original,
        width: Option<Dimension>,
        height: Option<Dimension>,
        format: ImageFormat,
    ) -> Result<Derivative, ImageServerError> {
        let key = build_key(width, height, &original.name);

        if let Some(bytes) = self.cache.get(&original.name, &key, format).await? {
            tracing::debug!(image = %original.name, key = %key, %format, "Cache hit");
            return Ok(Derivative { bytes, format, key, status: CacheStatus::Hit });
        }

        let path = self.cache.path_for(&original.name, &key, format);
        let flight = self.in_flight.acquire(path).await;

        // Someone else may have generated it while we waited for the lock.
        if let Some(bytes) = self.cache.get(&original.name, &key, format).await? {
            tracing::debug!(image = %original.name, key = %key, %format, "Cache hit after waiting on generation");
            return Ok(Derivative { bytes, format, key, status: CacheStatus::Hit });
        }

        tracing::info!(image = %original.name, key = %key, %format, "Cache miss, generating derivative");
        let request = TranscodeRequest {
            width: width.map(Dimension::get),
            height: height.map(Dimension::get),
            format,
            quality: self.quality,
        };
        // A full-size derivative named like another original would shadow the real one on lookup.
        let persist = !(key.as_str() == original.name && self.store.would_shadow(original, format.extension()));
        let job = Generation {
            original: original.clone(),
            key: key.clone(),
            request,
            persist,
            cache: Arc::clone(&self.cache),
            transcoder: Arc::clone(&self.transcoder),
        };
        let bytes = tokio::spawn(job.run(flight))
            .await
            .map_err(|e| ImageServerError::InternalError(e.to_string()))??;

        Ok(Derivative { bytes, format, key, status: CacheStatus::Miss })
    }
}

struct Generation {
    original: Original,
    key: CacheKey,
    request: TranscodeRequest,
    persist: bool,
    cache: Arc<dyn Cache>,
    transcoder: Arc<dyn Transcoder>,
}

impl Generation {
    async fn run(self, _flight: FlightGuard) -> Result<Bytes, ImageServerError> {
        let source = match tokio::fs::read(&self.original.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageServerError::NotFound(format!("original for {:?} disappeared", self.original.name)));
            }
            Err(e) => return Err(ImageServerError::GenerationError(format!("reading original: {}", e))),
        };

        METRICS.generations.fetch_add(1, Ordering::Relaxed);
        let transcoder = Arc::clone(&self.transcoder);
        let request = self.request;
        let encoded = tokio::task::spawn_blocking(move || transcoder.transcode(&source, &request))
            .await
            .map_err(|e| ImageServerError::GenerationError(e.to_string()))?;

        let encoded = match encoded {
            Ok(b) if b.is_empty() => {
                return Err(ImageServerError::GenerationError("transcoder produced no output".into()));
            }
            Ok(b) => Bytes::from(b),
            Err(e @ ImageServerError::GenerationError(_)) => return Err(e),
            Err(other) => return Err(ImageServerError::GenerationError(other.to_string())),
        };

        if !self.persist {
            tracing::debug!(image = %self.original.name, key = %self.key, "Serving uncached full-size derivative");
        } else if let Err(e) = self.cache.put(&self.original.name, &self.key, self.request.format, encoded.clone()).await {
            // The bytes are still good to serve; the next request will just regenerate.
            tracing::warn!(image = %self.original.name, key = %self.key, error = %e, "Failed to cache derivative");
        }

        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingTranscoder {
        calls: AtomicUsize,
    }

    impl Transcoder for CountingTranscoder {
        fn transcode(&self, _original: &[u8], request: &TranscodeRequest) -> Result<Vec<u8>, ImageServerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(format!("{:?}x{:?}.{}", request.width, request.height, request.format).into_bytes())
        }
    }

    struct FailingTranscoder;

    impl Transcoder for FailingTranscoder {
        fn transcode(&self, _original: &[u8], _request: &TranscodeRequest) -> Result<Vec<u8>, ImageServerError> {
            Err(ImageServerError::GenerationError("corrupt".into()))
        }
    }

    fn setup(transcoder: Arc<dyn Transcoder>) -> (TempDir, DerivativeCache) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cat")).unwrap();
        std::fs::write(dir.path().join("cat/cat.jpg"), b"original").unwrap();
        let store = OriginalStore::new(dir.path(), vec!["jpg".into(), "png".into(), "jpeg".into()]);
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        (dir, DerivativeCache::new(store, cache, transcoder, 80))
    }

    fn dim(v: i64) -> Option<Dimension> {
        Some(Dimension::new(v, 1000).unwrap())
    }

    #[tokio::test]
    async fn second_fetch_is_a_hit() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder.clone());

        let first = cache.fetch("cat", dim(200), dim(200), ImageFormat::webp).await.unwrap();
        let second = cache.fetch("cat", dim(200), dim(200), ImageFormat::webp).await.unwrap();

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("cat/200x200.webp").is_file());
    }

    #[tokio::test]
    async fn clamped_requests_share_an_entry() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder.clone());

        cache.fetch("cat", Dimension::new(5000, 1000).ok(), None, ImageFormat::png).await.unwrap();
        let again = cache.fetch("cat", dim(1000), None, ImageFormat::png).await.unwrap();

        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("cat/1000x.png").is_file());
    }

    #[tokio::test]
    async fn full_size_uses_image_name_as_key() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder);

        let d = cache.fetch("cat", None, None, ImageFormat::avif).await.unwrap();
        assert_eq!(d.key.as_str(), "cat");
        assert!(dir.path().join("cat/cat.avif").is_file());
    }

    #[tokio::test]
    async fn missing_original_never_generates() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder.clone());

        let err = cache.fetch("dog", dim(10), None, ImageFormat::png).await.unwrap_err();
        assert!(matches!(err, ImageServerError::NotFound(_)));
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("dog").exists());
    }

    #[tokio::test]
    async fn failed_generation_leaves_no_file() {
        let (dir, cache) = setup(Arc::new(FailingTranscoder));

        let err = cache.fetch("cat", dim(10), dim(10), ImageFormat::png).await.unwrap_err();
        assert!(matches!(err, ImageServerError::GenerationError(_)));

        let names: Vec<_> = std::fs::read_dir(dir.path().join("cat"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["cat.jpg".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_generate_once() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (_dir, cache) = setup(transcoder.clone());
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.fetch("cat", dim(64), dim(32), ImageFormat::webp).await })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let bodies: Vec<Bytes> = results.into_iter().map(|r| r.unwrap().unwrap().bytes).collect();
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_size_never_shadows_the_original() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder.clone());
        std::fs::create_dir(dir.path().join("dog")).unwrap();
        std::fs::write(dir.path().join("dog/dog.png"), b"original").unwrap();

        cache.fetch("dog", None, None, ImageFormat::jpg).await.unwrap();
        assert!(!dir.path().join("dog/dog.jpg").exists());
        let original = cache.store().locate("dog").await.unwrap();
        assert_eq!(original.path, dir.path().join("dog/dog.png"));

        // Same format as the original: the original itself is the cached entry.
        let same = cache.fetch("dog", None, None, ImageFormat::png).await.unwrap();
        assert_eq!(same.status, CacheStatus::Hit);
        assert_eq!(&same.bytes[..], b"original");
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn vanished_derivative_is_regenerated() {
        let transcoder = Arc::new(CountingTranscoder::default());
        let (dir, cache) = setup(transcoder.clone());

        cache.fetch("cat", None, dim(50), ImageFormat::gif).await.unwrap();
        std::fs::remove_file(dir.path().join("cat/x50.gif")).unwrap();
        let again = cache.fetch("cat", None, dim(50), ImageFormat::gif).await.unwrap();

        assert_eq!(again.status, CacheStatus::Miss);
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 2);
    }
}
