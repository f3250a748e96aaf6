use super::{fetch_asset, MediaController, ResourceHandle, SignalSink};
use crate::cache::ContentCache;
use crate::error::Error;
use crate::model::Item;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Still image: downloaded through the cache, header-probed to make sure it
/// decodes. Static, so pause and resume do nothing.
pub struct ImageController {
    cache: ContentCache,
    default_duration: Duration,
    ready: AtomicBool,
}

impl ImageController {
    pub fn new(cache: ContentCache, default_duration: Duration) -> Self {
        Self {
            cache,
            default_duration,
            ready: AtomicBool::new(false),
        }
    }
}

fn probe(path: PathBuf) -> Result<(PathBuf, u32, u32), Error> {
    let (width, height) = ::image::ImageReader::open(&path)?
        .with_guessed_format()?
        .into_dimensions()
        .map_err(|e| Error::load(format!("Undecodable image {:?}: {}", path, e)))?;
    Ok((path, width, height))
}

#[async_trait]
impl MediaController for ImageController {
    async fn load(&self, item: &Item, signals: &SignalSink) {
        let path = match fetch_asset(&self.cache, item, signals).await {
            Ok(Some(path)) => path,
            Ok(None) => return,
            Err(e) => {
                signals.error(e);
                return;
            }
        };

        let probed = tokio::task::spawn_blocking(move || probe(path))
            .await
            .map_err(|e| Error::load(format!("Image probe task failed: {}", e)))
            .and_then(|r| r);

        match probed {
            Ok((path, width, height)) => {
                tracing::debug!("Image {} ready ({}x{})", item.id, width, height);
                self.ready.store(true, Ordering::SeqCst);
                signals.ready(
                    ResourceHandle::Image {
                        path,
                        width,
                        height,
                    },
                    item.duration.unwrap_or(self.default_duration),
                );
            }
            Err(e) => signals.error(e),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
