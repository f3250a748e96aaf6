//! Content-addressed asset cache.
//!
//! Assets are keyed by URL and stored on disk under the SHA-256 of the key,
//! with LRU eviction once the configured size is exceeded. [`ContentCache::fetch`]
//! streams [`DownloadProgress`] for one key, retrying transient network
//! failures with exponential backoff.

use crate::config::{CacheSettings, RetrySettings};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use walkdir::WalkDir;

/// Progress of one fetch. The last event of a successful fetch has
/// `done == true` and carries the stored artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub key: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub done: bool,
    pub artifact: Option<PathBuf>,
}

impl DownloadProgress {
    fn partial(key: &str, bytes_done: u64, bytes_total: Option<u64>) -> Self {
        Self {
            key: key.to_string(),
            bytes_done,
            bytes_total,
            done: false,
            artifact: None,
        }
    }

    fn finished(key: &str, size: u64, artifact: PathBuf) -> Self {
        Self {
            key: key.to_string(),
            bytes_done: size,
            bytes_total: Some(size),
            done: true,
            artifact: Some(artifact),
        }
    }

    /// Completed fraction, when the total is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_done as f64 / total as f64).min(1.0) as f32),
            None if self.done => Some(1.0),
            None => None,
        }
    }
}

/// An open response body.
pub struct Download {
    pub total: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Where bytes come from on a cache miss.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Download>;
}

/// HTTP transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, token: Option<String>) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<Download> {
        let url = url::Url::parse(url)
            .map_err(|e| Error::permanent(format!("Invalid URL {}: {}", url, e)))?;

        let mut request = self.client.get(url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        let total = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(Download { total, body })
    }
}

/// Metadata for a cached asset.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
}

/// On-disk store with LRU bookkeeping.
struct CacheStore {
    /// Base directory for cached files.
    cache_dir: PathBuf,
    /// Maximum cache size in bytes.
    max_size: u64,
    /// Current cache size in bytes.
    current_size: u64,
    /// Entries by key digest, least recently used first out.
    lru: LruCache<String, CacheEntry>,
}

impl CacheStore {
    fn open(cache_dir: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;

        let mut store = Self {
            cache_dir,
            max_size,
            current_size: 0,
            lru: LruCache::unbounded(),
        };
        store.scan_existing();

        tracing::info!(
            "Cache initialized: {:.2} MB / {:.2} MB used, {} entries",
            store.current_size as f64 / 1024.0 / 1024.0,
            max_size as f64 / 1024.0 / 1024.0,
            store.lru.len()
        );

        Ok(store)
    }

    /// Rebuild the index from `<dir>/<shard>/<digest>` files. Partial
    /// downloads left by a crash are removed.
    fn scan_existing(&mut self) {
        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.contains(".part") {
                let _ = fs::remove_file(&path);
                continue;
            }

            if let Ok(metadata) = fs::metadata(&path) {
                let size = metadata.len();
                self.lru.put(name.to_string(), CacheEntry { path, size });
                self.current_size += size;
            }
        }
    }

    fn digest(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Self::digest(key);
        self.cache_dir.join(&digest[..2]).join(digest)
    }

    /// Path of a cached key, promoting it to most recently used.
    fn get(&mut self, key: &str) -> Option<(PathBuf, u64)> {
        let digest = Self::digest(key);
        let entry = self.lru.get(&digest)?.clone();
        if entry.path.exists() {
            return Some((entry.path, entry.size));
        }

        // File vanished behind our back.
        self.lru.pop(&digest);
        self.current_size = self.current_size.saturating_sub(entry.size);
        None
    }

    fn insert(&mut self, key: &str, path: PathBuf, size: u64) {
        let digest = Self::digest(key);
        if let Some(old) = self.lru.put(digest, CacheEntry { path, size }) {
            self.current_size = self.current_size.saturating_sub(old.size);
        }
        self.current_size += size;

        // The entry just inserted is most recent and never the victim.
        while self.current_size > self.max_size && self.lru.len() > 1 {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Evict the least recently used item.
    fn evict_lru(&mut self) -> bool {
        let Some((_, entry)) = self.lru.pop_lru() else {
            return false;
        };
        tracing::debug!("Evicting {:?}", entry.path);
        Self::remove_file(&entry);
        self.current_size = self.current_size.saturating_sub(entry.size);
        true
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.lru.pop(&Self::digest(key)) {
            Some(entry) => {
                Self::remove_file(&entry);
                self.current_size = self.current_size.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    fn remove_file(entry: &CacheEntry) {
        if entry.path.exists() {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove cached file: {}", e);
            }
        }
        // Shard directory goes away once empty.
        if let Some(parent) = entry.path.parent() {
            let _ = fs::remove_dir(parent);
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
}

/// Stream returned by [`ContentCache::fetch`].
///
/// Dropping it cancels the fetch, as does [`FetchStream::cancel`]. A
/// cancelled fetch ends the stream without an error.
pub struct FetchStream {
    inner: ReceiverStream<Result<DownloadProgress>>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl FetchStream {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Drain the stream, returning the artifact of a successful fetch.
    /// `Ok(None)` means the fetch was cancelled.
    pub async fn into_artifact(mut self) -> Result<Option<PathBuf>> {
        while let Some(event) = self.next().await {
            let progress = event?;
            if progress.done {
                return Ok(progress.artifact);
            }
        }
        Ok(None)
    }
}

impl Stream for FetchStream {
    type Item = Result<DownloadProgress>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// URL-keyed download cache shared by every media controller.
#[derive(Clone)]
pub struct ContentCache {
    store: Arc<RwLock<CacheStore>>,
    transport: Arc<dyn Transport>,
    retry: RetrySettings,
    progress_interval: std::time::Duration,
    progress_step_bytes: u64,
    downloads: Arc<Semaphore>,
    inflight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_download: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

/// A running download and the number of fetch streams attached to it.
struct InFlight {
    id: u64,
    events: broadcast::Sender<Shared>,
    subscribers: usize,
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Download event as fanned out to every subscriber.
#[derive(Clone)]
enum Shared {
    Progress(DownloadProgress),
    Failed(Arc<Error>),
}

impl ContentCache {
    pub fn open(
        settings: &CacheSettings,
        retry: RetrySettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let store = CacheStore::open(settings.dir.clone(), settings.max_size_bytes())?;
        Ok(Self {
            store: Arc::new(RwLock::new(store)),
            transport,
            retry,
            progress_interval: settings.progress_interval(),
            progress_step_bytes: settings.progress_step_bytes.max(1),
            downloads: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_download: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Fetch `key`, serving from disk when possible.
    ///
    /// A fetch of a key that is already downloading attaches to that
    /// download instead of opening a second transfer. The download is
    /// cancelled once every stream attached to it has been cancelled.
    pub fn fetch(&self, key: &str) -> FetchStream {
        let (tx, rx) = mpsc::channel(16);
        let token = self.shutdown.child_token();

        if !self.shutdown.is_cancelled() {
            let (id, events) = self.subscribe(key);
            let cache = self.clone();
            let key = key.to_string();
            let task_token = token.clone();
            tokio::spawn(async move {
                cache.forward(key, id, events, task_token, tx).await;
            });
        }

        FetchStream {
            inner: ReceiverStream::new(rx),
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    /// Warm the cache for `key` in the background. Cancel through the
    /// returned token.
    pub fn prefetch(&self, key: &str) -> CancellationToken {
        let stream = self.fetch(key);
        let token = stream.cancellation_token();
        let key = key.to_string();
        tokio::spawn(async move {
            match stream.into_artifact().await {
                Ok(Some(_)) => tracing::debug!("Prefetched {}", key),
                Ok(None) => tracing::debug!("Prefetch of {} cancelled", key),
                Err(e) => tracing::warn!("Failed to prefetch {}: {}", key, e),
            }
        });
        token
    }

    /// Path of a cached asset, if present.
    pub async fn cached_path(&self, key: &str) -> Option<PathBuf> {
        self.store.write().await.get(key).map(|(path, _)| path)
    }

    /// Mark an asset as recently used.
    pub async fn touch(&self, key: &str) {
        let _ = self.store.write().await.get(key);
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.store.write().await.remove(key)
    }

    /// Drop every cached asset whose key is not in `keep`.
    pub async fn retain(&self, keep: &HashSet<&str>) {
        let keep: HashSet<String> = keep.iter().map(|k| CacheStore::digest(k)).collect();
        let mut store = self.store.write().await;
        let orphans: Vec<String> = store
            .lru
            .iter()
            .filter(|(digest, _)| !keep.contains(digest.as_str()))
            .map(|(digest, _)| digest.clone())
            .collect();

        for digest in orphans {
            if let Some(entry) = store.lru.pop(&digest) {
                tracing::debug!("Removing orphaned cache entry: {:?}", entry.path);
                CacheStore::remove_file(&entry);
                store.current_size = store.current_size.saturating_sub(entry.size);
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let store = self.store.read().await;
        CacheStats {
            current_size: store.current_size,
            max_size: store.max_size,
            item_count: store.lru.len(),
        }
    }

    /// Cancel every fetch. Nothing is emitted afterwards.
    pub fn dispose(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("Content cache disposed");
            self.shutdown.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach to the download of `key`, starting one if none is running.
    fn subscribe(&self, key: &str) -> (u64, broadcast::Receiver<Shared>) {
        let mut inflight = self.inflight();
        if let Some(entry) = inflight.get_mut(key) {
            entry.subscribers += 1;
            tracing::debug!(
                "Joining in-flight download of {} ({} subscribers)",
                key,
                entry.subscribers
            );
            return (entry.id, entry.events.subscribe());
        }

        let id = self.next_download.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = broadcast::channel(16);
        let cancel = self.shutdown.child_token();
        let finished = CancellationToken::new();
        inflight.insert(
            key.to_string(),
            InFlight {
                id,
                events: events.clone(),
                subscribers: 1,
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );

        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _finished = finished.drop_guard();
            let outcome = cache.run_fetch(&key, &cancel, &events).await;
            cache.forget(&key, id);
            match outcome {
                Some(Ok(done)) => {
                    let _ = events.send(Shared::Progress(done));
                }
                Some(Err(e)) => {
                    let _ = events.send(Shared::Failed(Arc::new(e)));
                }
                None => tracing::debug!("Fetch of {} cancelled", key),
            }
        });

        (id, rx)
    }

    /// Unregister a download that has run to its end.
    fn forget(&self, key: &str, id: u64) {
        let mut inflight = self.inflight();
        if inflight.get(key).map_or(false, |entry| entry.id == id) {
            inflight.remove(key);
        }
    }

    /// Detach one subscriber. The last one out cancels the download and
    /// gets a token that fires once the download has cleaned up.
    fn release(&self, key: &str, id: u64) -> Option<CancellationToken> {
        let mut inflight = self.inflight();
        let entry = inflight.get_mut(key).filter(|entry| entry.id == id)?;
        entry.subscribers -= 1;
        if entry.subscribers > 0 {
            return None;
        }
        let entry = inflight.remove(key)?;
        tracing::debug!("No subscribers left for {}, cancelling download", key);
        entry.cancel.cancel();
        Some(entry.finished)
    }

    /// Relay one download's events to a single fetch stream.
    async fn forward(
        self,
        key: String,
        id: u64,
        mut events: broadcast::Receiver<Shared>,
        token: CancellationToken,
        tx: mpsc::Sender<Result<DownloadProgress>>,
    ) {
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = events.recv() => received,
            };

            let (event, terminal) = match received {
                Ok(Shared::Progress(progress)) => {
                    let done = progress.done;
                    (Ok(progress), done)
                }
                Ok(Shared::Failed(e)) => (Err(e.duplicate()), true),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} progress events for {}", skipped, key);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let sent = tokio::select! {
                _ = token.cancelled() => false,
                sent = tx.send(event) => sent.is_ok(),
            };
            if !sent || terminal {
                break;
            }
        }

        // The stream stays open until the partial file is gone.
        if let Some(finished) = self.release(&key, id) {
            finished.cancelled().await;
        }
    }

    /// Serve a hit or download with retries. `None` when cancelled.
    async fn run_fetch(
        &self,
        key: &str,
        token: &CancellationToken,
        events: &broadcast::Sender<Shared>,
    ) -> Option<Result<DownloadProgress>> {
        if token.is_cancelled() {
            return None;
        }

        let hit = self.store.write().await.get(key);
        if let Some((path, size)) = hit {
            tracing::debug!("Cache hit for {}", key);
            return Some(Ok(DownloadProgress::finished(key, size, path)));
        }

        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return None;
            }

            let permit = tokio::select! {
                _ = token.cancelled() => return None,
                permit = self.downloads.clone().acquire_owned() => permit.ok()?,
            };

            let result = self.download_once(key, token, events).await;
            drop(permit);

            match result {
                Ok(Some(done)) => return Some(Ok(done)),
                Ok(None) => return None,
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Download of {} failed: {}, retrying in {:?} (attempt {}/{})",
                        key,
                        e,
                        delay,
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    let e = match e {
                        Error::Network { message, transient: true } => Error::Network {
                            message: format!("{} (gave up after {} attempts)", message, attempt + 1),
                            transient: true,
                        },
                        other => other,
                    };
                    tracing::warn!("Download of {} failed: {}", key, e);
                    return Some(Err(e));
                }
            }
        }
    }

    /// One download attempt. `Ok(None)` when cancelled.
    async fn download_once(
        &self,
        key: &str,
        token: &CancellationToken,
        events: &broadcast::Sender<Shared>,
    ) -> Result<Option<DownloadProgress>> {
        let download = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            download = self.transport.open(key) => download?,
        };

        let path = self.store.read().await.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = path.with_extension(format!("part-{:08x}", rand::random::<u32>()));

        tracing::debug!("Downloading {} to {:?}", key, path);

        let written = match self.write_body(key, download, &part, token, events).await {
            Ok(Some(written)) if !token.is_cancelled() => written,
            other => {
                let _ = tokio::fs::remove_file(&part).await;
                return other.map(|_| None);
            }
        };

        tokio::fs::rename(&part, &path).await?;
        self.store.write().await.insert(key, path.clone(), written);

        tracing::debug!("Cached {} ({:.2} KB)", key, written as f64 / 1024.0);

        Ok(Some(DownloadProgress::finished(key, written, path)))
    }

    async fn write_body(
        &self,
        key: &str,
        download: Download,
        part: &Path,
        token: &CancellationToken,
        events: &broadcast::Sender<Shared>,
    ) -> Result<Option<u64>> {
        let Download { total, mut body } = download;
        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        let mut reported = 0u64;
        let mut last_report = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Ok(None),
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;

            let due = written - reported >= self.progress_step_bytes
                || last_report.elapsed() >= self.progress_interval;
            if due {
                reported = written;
                last_report = Instant::now();
                // Nobody listening yet is fine; late subscribers pick up the next one.
                let _ = events.send(Shared::Progress(DownloadProgress::partial(key, written, total)));
            }
        }

        file.flush().await?;

        if let Some(total) = total {
            if written != total {
                return Err(Error::transient(format!(
                    "Body truncated: {} of {} bytes",
                    written, total
                )));
            }
        }

        Ok(Some(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedTransport};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn settings(dir: &TempDir) -> CacheSettings {
        CacheSettings {
            dir: dir.path().to_path_buf(),
            max_size_mb: 1,
            max_concurrent_downloads: 2,
            progress_interval_ms: 60_000,
            progress_step_bytes: 4,
        }
    }

    fn retry(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        }
    }

    fn open(dir: &TempDir, transport: &Arc<ScriptedTransport>, attempts: u32) -> ContentCache {
        ContentCache::open(&settings(dir), retry(attempts), transport.clone()).unwrap()
    }

    async fn collect(stream: FetchStream) -> Vec<Result<DownloadProgress>> {
        stream.collect().await
    }

    const URL: &str = "https://cdn.example/a.jpg";

    #[tokio::test]
    async fn test_miss_streams_progress_then_done() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::body(&[b"abcd", b"efgh", b"ij"])]);
        let cache = open(&dir, &transport, 3);

        let events = collect(cache.fetch(URL)).await;
        let events: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();

        let (last, partials) = events.split_last().unwrap();
        assert!(!partials.is_empty());
        assert!(partials.iter().all(|p| !p.done && p.key == URL));
        assert!(partials.windows(2).all(|w| w[0].bytes_done < w[1].bytes_done));
        assert_eq!(partials[0].bytes_total, Some(10));

        assert!(last.done);
        assert_eq!(last.bytes_done, 10);
        let artifact = last.artifact.clone().unwrap();
        assert_eq!(std::fs::read(&artifact).unwrap(), b"abcdefghij");
        assert_eq!(cache.cached_path(URL).await, Some(artifact));
    }

    #[tokio::test]
    async fn test_hit_emits_exactly_one_done_event() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::body(&[b"abcd", b"efgh"])]);
        let cache = open(&dir, &transport, 3);

        cache.fetch(URL).into_artifact().await.unwrap().unwrap();
        let events = collect(cache.fetch(URL)).await;

        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert!(event.done);
        assert_eq!(event.bytes_done, 8);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_one_network_error() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(Error::transient("connection reset")),
            Reply::Fail(Error::transient("connection reset")),
            Reply::Fail(Error::transient("connection reset")),
        ]);
        let cache = open(&dir, &transport, 3);

        let events = collect(cache.fetch(URL)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(Error::Network { transient: true, .. })));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(Error::transient("503")),
            Reply::body(&[b"ok"]),
        ]);
        let cache = open(&dir, &transport, 3);

        let artifact = cache.fetch(URL).into_artifact().await.unwrap();
        assert!(artifact.is_some());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(Error::permanent("404 Not Found")),
            Reply::body(&[b"never"]),
        ]);
        let cache = open(&dir, &transport, 5);

        let events = collect(cache.fetch(URL)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(Error::Network { transient: false, .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_download_ends_quietly() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::Stall(b"abcdefgh")]);
        let cache = open(&dir, &transport, 3);

        let mut stream = cache.fetch(URL);
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.done);

        stream.cancel();
        assert!(stream.next().await.is_none());

        assert_eq!(cache.cached_path(URL).await, None);
        let leftovers = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_second_fetch_joins_running_download() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::new(vec![Reply::Gated(
            vec![b"abcd".to_vec(), b"efgh".to_vec()],
            gate.clone(),
        )]);
        let cache = open(&dir, &transport, 3);

        let mut first = cache.fetch(URL);
        assert!(!first.next().await.unwrap().unwrap().done);
        let second = cache.fetch(URL);
        gate.notify_one();

        let a = first.into_artifact().await.unwrap().unwrap();
        let b = second.into_artifact().await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), b"abcdefgh");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_then_fetch_opens_one_transfer() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::new(vec![Reply::Gated(
            vec![b"abcd".to_vec(), b"efgh".to_vec()],
            gate.clone(),
        )]);
        let cache = open(&dir, &transport, 3);

        cache.prefetch(URL);
        let stream = cache.fetch(URL);
        gate.notify_one();

        assert!(stream.into_artifact().await.unwrap().is_some());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_leaves_shared_download_running() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::new(vec![Reply::Gated(
            vec![b"abcd".to_vec(), b"efgh".to_vec()],
            gate.clone(),
        )]);
        let cache = open(&dir, &transport, 3);

        let mut first = cache.fetch(URL);
        first.next().await.unwrap().unwrap();
        let second = cache.fetch(URL);
        first.cancel();
        assert!(first.next().await.is_none());
        gate.notify_one();

        assert!(second.into_artifact().await.unwrap().is_some());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_disposed_cache_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::body(&[b"abcd"])]);
        let cache = open(&dir, &transport, 3);

        cache.dispose();
        assert!(collect(cache.fetch(URL)).await.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_dispose_during_download_stops_stream() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::Stall(b"abcdefgh")]);
        let cache = open(&dir, &transport, 3);

        let mut stream = cache.fetch(URL);
        stream.next().await.unwrap().unwrap();
        cache.dispose();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let big = vec![7u8; 700 * 1024];
        let transport = ScriptedTransport::new(vec![
            Reply::owned(vec![big.clone()]),
            Reply::owned(vec![big]),
        ]);
        let cache = open(&dir, &transport, 1);

        cache.fetch("https://cdn.example/1").into_artifact().await.unwrap();
        cache.fetch("https://cdn.example/2").into_artifact().await.unwrap();

        assert_eq!(cache.cached_path("https://cdn.example/1").await, None);
        assert!(cache.cached_path("https://cdn.example/2").await.is_some());
        assert_eq!(cache.stats().await.item_count, 1);
    }

    #[tokio::test]
    async fn test_reopen_finds_existing_entries() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::body(&[b"persisted"])]);
        open(&dir, &transport, 1)
            .fetch(URL)
            .into_artifact()
            .await
            .unwrap();

        let empty = ScriptedTransport::new(vec![]);
        let reopened = open(&dir, &empty, 1);
        let events = collect(reopened.fetch(URL)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().done);
        assert_eq!(empty.calls(), 0);
    }

    #[tokio::test]
    async fn test_retain_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::body(&[b"1"]), Reply::body(&[b"2"])]);
        let cache = open(&dir, &transport, 1);
        cache.fetch("https://cdn.example/keep").into_artifact().await.unwrap();
        cache.fetch("https://cdn.example/drop").into_artifact().await.unwrap();

        let keep: HashSet<&str> = ["https://cdn.example/keep"].into_iter().collect();
        cache.retain(&keep).await;

        assert!(cache.cached_path("https://cdn.example/keep").await.is_some());
        assert!(cache.cached_path("https://cdn.example/drop").await.is_none());
        assert_eq!(cache.stats().await.current_size, 1);
    }

    #[test]
    fn test_fraction() {
        let mut p = DownloadProgress::partial(URL, 25, Some(100));
        assert_eq!(p.fraction(), Some(0.25));
        p.bytes_total = None;
        assert_eq!(p.fraction(), None);
    }
}
