use super::backend::DecodeBackend;
use super::{fetch_asset, MediaController, MediaSignal, ResourceHandle, SignalSink};
use crate::cache::ContentCache;
use crate::error::Error;
use crate::model::Item;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Video: downloaded through the cache, then opened by the decode backend,
/// which supplies the duration and does the actual playing.
pub struct VideoController {
    cache: ContentCache,
    backend: Box<dyn DecodeBackend>,
    ready: AtomicBool,
    disposed: AtomicBool,
}

impl VideoController {
    pub fn new(cache: ContentCache, backend: Box<dyn DecodeBackend>) -> Self {
        Self {
            cache,
            backend,
            ready: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaController for VideoController {
    async fn load(&self, item: &Item, signals: &SignalSink) {
        let path = match fetch_asset(&self.cache, item, signals).await {
            Ok(Some(path)) => path,
            Ok(None) => return,
            Err(e) => {
                signals.error(e);
                return;
            }
        };

        let decoded = match self.backend.initialize(&path).await {
            Ok(duration) => duration,
            Err(e) => {
                signals.error(Error::load(format!("Decoder rejected {}: {}", item.id, e)));
                return;
            }
        };

        let Some(duration) = decoded.or(item.duration) else {
            signals.error(Error::load(format!("Duration of video {} is unknown", item.id)));
            return;
        };
        signals.emit(MediaSignal::DurationKnown(duration));

        // Disposed while the decoder was opening.
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.backend.play() {
            signals.error(Error::load(format!("Failed to start {}: {}", item.id, e)));
            return;
        }

        tracing::debug!("Video {} ready ({:?})", item.id, duration);
        self.ready.store(true, Ordering::SeqCst);
        signals.ready(ResourceHandle::Video { path }, duration);
    }

    fn pause(&self) {
        if !self.is_ready() || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.backend.pause() {
            tracing::warn!("Failed to pause video: {}", e);
        }
    }

    fn resume(&self) {
        if !self.is_ready() || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.backend.play() {
            tracing::warn!("Failed to resume video: {}", e);
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        self.backend.dispose();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
