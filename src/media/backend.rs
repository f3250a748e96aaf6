//! Decode/player backend collaborator used by video items.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A decoder/player for a single video.
#[async_trait]
pub trait DecodeBackend: Send + Sync {
    /// Open and preroll `source`, returning its duration when the container
    /// reports one.
    async fn initialize(&self, source: &Path) -> Result<Option<Duration>>;

    fn play(&self) -> Result<()>;

    fn pause(&self) -> Result<()>;

    /// Release the decoder. Must tolerate repeated calls.
    fn dispose(&self);
}

/// Creates one backend per video item.
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn DecodeBackend>;
}

/// Backend for headless runs: accepts any file, reports no intrinsic
/// duration and only tracks play state.
#[derive(Debug, Default)]
pub struct HeadlessDecoder {
    playing: AtomicBool,
}

impl HeadlessDecoder {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecodeBackend for HeadlessDecoder {
    async fn initialize(&self, source: &Path) -> Result<Option<Duration>> {
        tokio::fs::metadata(source).await?;
        Ok(None)
    }

    fn play(&self) -> Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessDecoders;

impl DecoderFactory for HeadlessDecoders {
    fn create(&self) -> Box<dyn DecodeBackend> {
        Box::new(HeadlessDecoder::default())
    }
}

/// Default decoder factory for this build: GStreamer when the `gstreamer`
/// feature is enabled, headless otherwise.
pub fn default_decoders() -> crate::Result<Arc<dyn DecoderFactory>> {
    #[cfg(feature = "gstreamer")]
    {
        super::gstreamer::GstDecoders::init().map(|f| Arc::new(f) as Arc<dyn DecoderFactory>)
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        Ok(Arc::new(HeadlessDecoders))
    }
}
