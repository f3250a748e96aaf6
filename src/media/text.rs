use super::{MediaController, ResourceHandle, SignalSink};
use crate::config::PlaybackSettings;
use crate::error::Error;
use crate::model::{Item, ItemKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Text card. Ready immediately; its duration comes from the item or is
/// derived from the body length.
pub struct TextController {
    playback: PlaybackSettings,
    ready: AtomicBool,
}

impl TextController {
    pub fn new(playback: PlaybackSettings) -> Self {
        Self {
            playback,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaController for TextController {
    async fn load(&self, item: &Item, signals: &SignalSink) {
        let ItemKind::Text { body } = &item.kind else {
            signals.error(Error::load(format!("Item {} is not text", item.id)));
            return;
        };

        let duration = item
            .duration
            .unwrap_or_else(|| self.playback.text_duration(body));
        self.ready.store(true, Ordering::SeqCst);
        signals.ready(ResourceHandle::Text { body: body.clone() }, duration);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
