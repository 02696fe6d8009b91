//! Model asset cache with single-flight download.
//!
//! The three network weight sets (detection, landmark, recognition) are
//! fetched from a fixed HTTPS asset host on first use and cached on disk.
//! The cache is an explicit state machine — `Unloaded`, `Loading`, `Ready`,
//! `Failed` — with one in-flight download at a time: concurrent callers of
//! [`ModelCache::ensure`] before the first resolution share a single fetch.
//! A failed load parks the cache in `Failed`; the next call starts over.
//! There is no automatic retry or backoff.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

/// One downloadable weight set.
pub struct ModelSpec {
    pub name: &'static str,
    pub file_name: &'static str,
}

pub const DETECTION_MODEL: ModelSpec = ModelSpec {
    name: "detection",
    file_name: "face_detect_lite_416.onnx",
};
pub const LANDMARK_MODEL: ModelSpec = ModelSpec {
    name: "landmark",
    file_name: "face_landmark_5pt.onnx",
};
pub const RECOGNITION_MODEL: ModelSpec = ModelSpec {
    name: "recognition",
    file_name: "face_recognition_128d.onnx",
};

const ALL_MODELS: [&ModelSpec; 3] = [&DETECTION_MODEL, &LANDMARK_MODEL, &RECOGNITION_MODEL];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("download failed for {asset}: {reason}")]
    DownloadFailed { asset: String, reason: String },
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("http client: {0}")]
    Client(String),
}

/// Resolved on-disk locations of the three weight sets.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detection: PathBuf,
    pub landmark: PathBuf,
    pub recognition: PathBuf,
}

/// Downloads one asset to a destination path. Seam for tests.
pub trait ModelFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<(), ModelError>> + Send;
}

/// HTTPS fetcher backed by a reqwest client with a request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ModelFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), ModelError> {
        let failed = |reason: String| ModelError::DownloadFailed {
            asset: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }

        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

enum CacheState {
    Unloaded,
    Loading(watch::Receiver<()>),
    Ready(ModelPaths),
    Failed(String),
}

/// What a caller should do after inspecting the state under the lock.
enum Ticket {
    Done(ModelPaths),
    Fail(String),
    Begin(watch::Sender<()>),
    Wait(watch::Receiver<()>),
}

/// Lazily-downloaded model store shared by all consumers.
pub struct ModelCache<F> {
    fetcher: F,
    base_url: String,
    cache_dir: PathBuf,
    state: Mutex<CacheState>,
}

impl<F: ModelFetcher> ModelCache<F> {
    pub fn new(fetcher: F, base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            cache_dir: cache_dir.into(),
            state: Mutex::new(CacheState::Unloaded),
        }
    }

    /// Current state, for status reporting.
    pub async fn state_name(&self) -> &'static str {
        match &*self.state.lock().await {
            CacheState::Unloaded => "unloaded",
            CacheState::Loading(_) => "loading",
            CacheState::Ready(_) => "ready",
            CacheState::Failed(_) => "failed",
        }
    }

    pub async fn is_ready(&self) -> bool {
        matches!(&*self.state.lock().await, CacheState::Ready(_))
    }

    /// Resolve the model paths, downloading missing assets first.
    ///
    /// Idempotent and single-flight: while a download is in flight, further
    /// callers wait on it instead of fetching again; once `Ready`, this
    /// returns immediately. Callers that waited on a load that failed get
    /// the loader's error; a fresh call against a `Failed` cache retries.
    pub async fn ensure(&self) -> Result<ModelPaths, ModelError> {
        let mut waited = false;

        loop {
            let ticket = {
                let mut state = self.state.lock().await;
                match &*state {
                    CacheState::Ready(paths) => Ticket::Done(paths.clone()),
                    CacheState::Failed(msg) if waited => Ticket::Fail(msg.clone()),
                    // A receiver whose sender is gone means the loading
                    // future was dropped mid-flight; take the load over.
                    CacheState::Loading(rx) if rx.has_changed().is_ok() => Ticket::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(());
                        *state = CacheState::Loading(rx);
                        Ticket::Begin(tx)
                    }
                }
            };

            match ticket {
                Ticket::Done(paths) => return Ok(paths),
                Ticket::Fail(msg) => return Err(ModelError::LoadFailed(msg)),
                Ticket::Wait(mut rx) => {
                    waited = true;
                    let _ = rx.changed().await;
                }
                Ticket::Begin(settled) => {
                    let result = self.fetch_all().await;
                    let mut state = self.state.lock().await;
                    return match result {
                        Ok(paths) => {
                            *state = CacheState::Ready(paths.clone());
                            let _ = settled.send(());
                            Ok(paths)
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "model download failed");
                            *state = CacheState::Failed(e.to_string());
                            let _ = settled.send(());
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    async fn fetch_all(&self) -> Result<ModelPaths, ModelError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let mut resolved = Vec::with_capacity(ALL_MODELS.len());
        for spec in ALL_MODELS {
            let dest = self.cache_dir.join(spec.file_name);

            if cached_digest_matches(&dest).await? {
                tracing::debug!(asset = spec.name, "model already cached");
            } else {
                let url = format!("{}/{}", self.base_url.trim_end_matches('/'), spec.file_name);
                tracing::info!(asset = spec.name, url = %url, "fetching model");
                self.fetcher.fetch(&url, &dest).await?;
                record_digest(&dest).await?;
            }

            resolved.push(dest);
        }

        Ok(ModelPaths {
            detection: resolved[0].clone(),
            landmark: resolved[1].clone(),
            recognition: resolved[2].clone(),
        })
    }
}

fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    file.with_file_name(name)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Record the digest of a freshly downloaded file next to it.
async fn record_digest(file: &Path) -> Result<(), ModelError> {
    let bytes = tokio::fs::read(file).await?;
    tokio::fs::write(sidecar_path(file), sha256_hex(&bytes)).await?;
    Ok(())
}

/// True when the file exists and still matches its recorded digest.
async fn cached_digest_matches(file: &Path) -> Result<bool, ModelError> {
    let sidecar = sidecar_path(file);
    if !file.exists() || !sidecar.exists() {
        return Ok(false);
    }
    let bytes = tokio::fs::read(file).await?;
    let recorded = tokio::fs::read_to_string(&sidecar).await?;
    Ok(sha256_hex(&bytes) == recorded.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct FakeFetcher {
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ModelFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<(), ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Force overlap so concurrent callers actually race.
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ModelError::DownloadFailed {
                    asset: url.to_string(),
                    reason: "fake outage".into(),
                });
            }
            tokio::fs::write(dest, b"weights").await?;
            Ok(())
        }
    }

    fn cache_in(dir: &Path, fetcher: FakeFetcher) -> ModelCache<FakeFetcher> {
        ModelCache::new(fetcher, "https://assets.test/models", dir)
    }

    #[tokio::test]
    async fn ensure_downloads_all_three_assets() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new();
        let calls = fetcher.calls.clone();
        let cache = cache_in(dir.path(), fetcher);

        let paths = cache.ensure().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(paths.detection.exists());
        assert!(paths.landmark.exists());
        assert!(paths.recognition.exists());
        assert!(cache.is_ready().await);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new();
        let calls = fetcher.calls.clone();
        let cache = Arc::new(cache_in(dir.path(), fetcher));

        let a = cache.clone();
        let b = cache.clone();
        let (ra, rb) = tokio::join!(a.ensure(), b.ensure());

        assert!(ra.is_ok());
        assert!(rb.is_ok());
        // Three assets, fetched once each despite two callers.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waiter_receives_loader_error_without_refetching() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new();
        let calls = fetcher.calls.clone();
        fetcher.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(cache_in(dir.path(), fetcher));

        let a = cache.clone();
        let b = cache.clone();
        let (ra, rb) = tokio::join!(a.ensure(), b.ensure());

        assert!(ra.is_err());
        assert!(rb.is_err());
        // The load failed on the first asset; the waiter did not retry.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state_name().await, "failed");
    }

    #[tokio::test]
    async fn failed_load_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new();
        let calls = fetcher.calls.clone();
        let fail = fetcher.fail.clone();
        let cache = cache_in(dir.path(), fetcher);

        fail.store(true, Ordering::SeqCst);
        assert!(cache.ensure().await.is_err());
        assert_eq!(cache.state_name().await, "failed");

        // Outage over; a fresh call starts from scratch.
        fail.store(false, Ordering::SeqCst);
        assert!(cache.ensure().await.is_ok());
        assert!(cache.is_ready().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1 + 3);
    }

    #[tokio::test]
    async fn intact_cache_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();

        let first = FakeFetcher::new();
        cache_in(dir.path(), first).ensure().await.unwrap();

        // A new process (fresh cache state) over the same directory.
        let second = FakeFetcher::new();
        let second_calls = second.calls.clone();
        let cache = cache_in(dir.path(), second);
        cache.ensure().await.unwrap();

        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupted_asset_is_refetched() {
        let dir = tempfile::tempdir().unwrap();

        let first = FakeFetcher::new();
        let paths = cache_in(dir.path(), first).ensure().await.unwrap();

        // Corrupt one cached file; its digest no longer matches.
        tokio::fs::write(&paths.landmark, b"truncated").await.unwrap();

        let second = FakeFetcher::new();
        let second_calls = second.calls.clone();
        cache_in(dir.path(), second).ensure().await.unwrap();

        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sidecar_sits_next_to_asset() {
        let p = sidecar_path(Path::new("/cache/face_detect_lite_416.onnx"));
        assert_eq!(
            p,
            Path::new("/cache/face_detect_lite_416.onnx.sha256")
        );
    }
}
