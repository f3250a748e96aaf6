//! GStreamer decode backend.
//!
//! Each video gets its own `playbin`. `initialize` prerolls it to `Paused`
//! on a blocking thread so the container's duration can be queried before
//! playback starts.

use super::backend::{DecodeBackend, DecoderFactory};
use crate::error::{Error, Result};
use ::gstreamer as gst;
use async_trait::async_trait;
use gst::prelude::*;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const PREROLL_TIMEOUT_SECS: u64 = 10;

pub struct GstDecoders;

impl GstDecoders {
    /// Initialize GStreamer (once per process).
    pub fn init() -> Result<Self> {
        gst::init().map_err(|e| Error::config(format!("Failed to initialize GStreamer: {}", e)))?;
        tracing::info!("GStreamer initialized: {}", gst::version_string());
        Ok(Self)
    }
}

impl DecoderFactory for GstDecoders {
    fn create(&self) -> Box<dyn DecodeBackend> {
        Box::new(GstDecoder::default())
    }
}

#[derive(Default)]
pub struct GstDecoder {
    pipeline: Mutex<Option<gst::Element>>,
}

impl GstDecoder {
    fn pipeline(&self) -> MutexGuard<'_, Option<gst::Element>> {
        self.pipeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: gst::State) -> Result<()> {
        let Some(ref pipeline) = *self.pipeline() else {
            return Ok(());
        };
        pipeline
            .set_state(state)
            .map_err(|e| Error::load(format!("Failed to set pipeline to {:?}: {}", state, e)))?;
        Ok(())
    }
}

fn uri_for(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::fs::canonicalize(path)?
    };
    url::Url::from_file_path(&path)
        .map(String::from)
        .map_err(|_| Error::load(format!("Cannot build a URI for {}", path.display())))
}

fn preroll(playbin: &gst::Element) -> Result<Option<Duration>> {
    playbin
        .set_state(gst::State::Paused)
        .map_err(|e| Error::load(format!("Failed to preroll: {}", e)))?;

    let (result, _, _) = playbin.state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
    if result.is_err() {
        let reason = playbin
            .bus()
            .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
            .and_then(|msg| match msg.view() {
                gst::MessageView::Error(err) => Some(err.error().to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "state change failed".to_string());
        let _ = playbin.set_state(gst::State::Null);
        return Err(Error::load(format!("Failed to preroll: {}", reason)));
    }

    Ok(playbin
        .query_duration::<gst::ClockTime>()
        .map(|d| Duration::from_nanos(d.nseconds())))
}

#[async_trait]
impl DecodeBackend for GstDecoder {
    async fn initialize(&self, source: &Path) -> Result<Option<Duration>> {
        let uri = uri_for(source)?;
        tracing::debug!("Opening {}", uri);

        let playbin = gst::ElementFactory::make("playbin")
            .property("uri", &uri)
            .build()
            .map_err(|e| Error::load(format!("Failed to create playbin: {}", e)))?;

        // Stored before preroll so a dispose during loading tears it down.
        *self.pipeline() = Some(playbin.clone());

        tokio::task::spawn_blocking(move || preroll(&playbin))
            .await
            .map_err(|e| Error::load(format!("Preroll task failed: {}", e)))?
    }

    fn play(&self) -> Result<()> {
        self.set_state(gst::State::Playing)
    }

    fn pause(&self) -> Result<()> {
        self.set_state(gst::State::Paused)
    }

    fn dispose(&self) {
        if let Some(pipeline) = self.pipeline().take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                tracing::warn!("Failed to stop pipeline: {}", e);
            }
        }
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        self.dispose();
    }
}
