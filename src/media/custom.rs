use super::{MediaController, ResourceHandle, SignalSink};
use crate::error::Error;
use crate::model::{Item, ItemKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Caller-defined content rendered by the UI. The item must carry its own
/// duration. Animated items honour pause and resume.
pub struct CustomController {
    ready: AtomicBool,
    animated: AtomicBool,
    paused: AtomicBool,
}

impl CustomController {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            animated: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Default for CustomController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaController for CustomController {
    async fn load(&self, item: &Item, signals: &SignalSink) {
        let ItemKind::Custom {
            name,
            payload,
            animated,
        } = &item.kind
        else {
            signals.error(Error::load(format!("Item {} is not custom", item.id)));
            return;
        };

        let Some(duration) = item.duration else {
            signals.error(Error::config(format!(
                "Custom item {} ({}) has no duration",
                item.id, name
            )));
            return;
        };

        self.animated.store(*animated, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        signals.ready(
            ResourceHandle::Custom {
                name: name.clone(),
                payload: payload.clone(),
            },
            duration,
        );
    }

    fn pause(&self) {
        if self.animated.load(Ordering::SeqCst) {
            self.paused.store(true, Ordering::SeqCst);
        }
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
