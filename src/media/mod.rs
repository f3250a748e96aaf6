//! Per-kind media resource controllers.
//!
//! Every controller implements the same [`MediaController`] capability and
//! reports through a [`SignalSink`] instead of returning results, so a load
//! failure never crosses the controller boundary as an error value or panic.

pub mod backend;
mod custom;
#[cfg(feature = "gstreamer")]
pub mod gstreamer;
mod image;
mod text;
mod video;

pub use self::custom::CustomController;
pub use self::image::ImageController;
pub use self::text::TextController;
pub use self::video::VideoController;

use crate::cache::{ContentCache, DownloadProgress};
use crate::config::PlaybackSettings;
use crate::error::{Error, Result};
use crate::model::{Item, ItemKind};
use async_trait::async_trait;
use backend::DecoderFactory;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifies one `switch_to` call. Signals from any other generation are void.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Something the renderer can draw.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceHandle {
    Image {
        path: PathBuf,
        width: u32,
        height: u32,
    },
    Video {
        path: PathBuf,
    },
    Text {
        body: String,
    },
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

/// What a controller reports while loading.
#[derive(Debug)]
pub enum MediaSignal {
    /// Download progress of the item's asset.
    Buffering(DownloadProgress),
    /// Intrinsic duration became known. Precedes `Ready`.
    DurationKnown(Duration),
    Ready {
        resource: ResourceHandle,
        duration: Duration,
    },
    Error(Error),
}

/// A signal stamped with the generation it was issued under.
#[derive(Debug)]
pub struct TaggedSignal {
    pub generation: Generation,
    pub item_id: String,
    pub signal: MediaSignal,
}

/// Outlet handed to a controller's `load`. Every signal is tagged with the
/// generation of the switch that created the sink. Clones share whether a
/// terminal signal has been sent.
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: Generation,
    item_id: String,
    tx: mpsc::UnboundedSender<TaggedSignal>,
    settled: Arc<AtomicBool>,
}

impl SignalSink {
    pub fn new(
        generation: Generation,
        item_id: impl Into<String>,
        tx: mpsc::UnboundedSender<TaggedSignal>,
    ) -> Self {
        Self {
            generation,
            item_id: item_id.into(),
            tx,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether `Ready` or `Error` has been sent.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn emit(&self, signal: MediaSignal) {
        if matches!(signal, MediaSignal::Ready { .. } | MediaSignal::Error(_)) {
            self.settled.store(true, Ordering::SeqCst);
        }
        let tagged = TaggedSignal {
            generation: self.generation,
            item_id: self.item_id.clone(),
            signal,
        };
        // Receiver gone means the manager was dropped; nothing to report to.
        let _ = self.tx.send(tagged);
    }

    pub fn ready(&self, resource: ResourceHandle, duration: Duration) {
        self.emit(MediaSignal::Ready { resource, duration });
    }

    pub fn error(&self, error: Error) {
        self.emit(MediaSignal::Error(error));
    }
}

/// Capability shared by every content kind.
#[async_trait]
pub trait MediaController: Send + Sync {
    /// Prepare the item and report `Ready` or `Error` exactly once.
    async fn load(&self, item: &Item, signals: &SignalSink);

    /// No-op for static content.
    fn pause(&self) {}

    /// No-op for static content.
    fn resume(&self) {}

    /// Release resources. Safe to call more than once.
    async fn dispose(&self) {}

    fn is_ready(&self) -> bool;
}

/// Maps an item kind to its controller strategy.
#[derive(Clone)]
pub struct ControllerFactory {
    cache: ContentCache,
    decoders: Arc<dyn DecoderFactory>,
    playback: PlaybackSettings,
}

impl ControllerFactory {
    pub fn new(
        cache: ContentCache,
        decoders: Arc<dyn DecoderFactory>,
        playback: PlaybackSettings,
    ) -> Self {
        Self {
            cache,
            decoders,
            playback,
        }
    }

    pub fn create(&self, item: &Item) -> Arc<dyn MediaController> {
        match &item.kind {
            ItemKind::Image { .. } => Arc::new(ImageController::new(
                self.cache.clone(),
                self.playback.default_image_duration(),
            )),
            ItemKind::Video { .. } => Arc::new(VideoController::new(
                self.cache.clone(),
                self.decoders.create(),
            )),
            ItemKind::Text { .. } => Arc::new(TextController::new(self.playback.clone())),
            ItemKind::Custom { .. } => Arc::new(CustomController::new()),
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }
}

/// Fetch an item's asset, forwarding progress as `Buffering`.
/// `Ok(None)` when the fetch was cancelled. A disposed cache is an error.
async fn fetch_asset(
    cache: &ContentCache,
    item: &Item,
    signals: &SignalSink,
) -> Result<Option<PathBuf>> {
    let Some(url) = item.kind.source_url() else {
        return Err(Error::load(format!(
            "{} item {} has no source url",
            item.kind.as_str(),
            item.id
        )));
    };

    let mut stream = cache.fetch(url);
    while let Some(event) = stream.next().await {
        let progress = event?;
        if progress.done {
            return Ok(progress.artifact);
        }
        signals.emit(MediaSignal::Buffering(progress));
    }
    if cache.is_disposed() {
        return Err(Error::load(format!(
            "Content cache closed before {} was fetched",
            item.id
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemKind;
    use crate::testing::{test_cache, ScriptedDecoders, ScriptedTransport};
    use tempfile::TempDir;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedSignal>) -> Vec<MediaSignal> {
        let mut out = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            out.push(tagged.signal);
        }
        out
    }

    #[tokio::test]
    async fn test_factory_picks_strategy_per_kind() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, ScriptedTransport::new(vec![]));
        let factory = ControllerFactory::new(
            cache,
            ScriptedDecoders::new(Some(Duration::from_secs(3))),
            PlaybackSettings::default(),
        );

        let text = Item::new("t", "g", ItemKind::Text { body: "hello".into() });
        let controller = factory.create(&text);
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.load(&text, &SignalSink::new(Generation(4), "t", tx)).await;

        assert!(controller.is_ready());
        let signals = drain(&mut rx);
        assert_eq!(signals.len(), 1);
        assert!(matches!(
            &signals[0],
            MediaSignal::Ready { resource: ResourceHandle::Text { body }, .. } if body == "hello"
        ));
    }

    #[tokio::test]
    async fn test_sink_tags_generation_and_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = SignalSink::new(Generation(9), "x", tx);
        sink.error(Error::load("boom"));

        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.generation, Generation(9));
        assert_eq!(tagged.item_id, "x");
        assert!(matches!(tagged.signal, MediaSignal::Error(Error::Load(_))));
    }

    #[tokio::test]
    async fn test_missing_url_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, ScriptedTransport::new(vec![]));
        let item = Item::new("c", "g", ItemKind::Text { body: String::new() });
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = fetch_asset(&cache, &item, &SignalSink::new(Generation(1), "c", tx)).await;
        assert!(matches!(result, Err(Error::Load(_))));
    }

    #[tokio::test]
    async fn test_fetch_from_disposed_cache_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir, ScriptedTransport::serving(b"img"));
        cache.dispose();
        let item = Item::new(
            "i",
            "g",
            ItemKind::Image {
                url: "https://cdn.example/i.png".into(),
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = fetch_asset(&cache, &item, &SignalSink::new(Generation(1), "i", tx)).await;
        assert!(matches!(result, Err(Error::Load(_))));
    }

    #[test]
    fn test_sink_clones_share_settled_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = SignalSink::new(Generation(1), "x", tx);
        let clone = sink.clone();

        clone.emit(MediaSignal::DurationKnown(Duration::from_secs(1)));
        assert!(!sink.is_settled());
        clone.error(Error::load("boom"));
        assert!(sink.is_settled());
    }
}
