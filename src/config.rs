//! Runtime settings, loaded from an optional TOML file and `STORY_*` env vars.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub playback: PlaybackSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory holding cached assets.
    pub dir: PathBuf,
    pub max_size_mb: u64,
    /// Network downloads allowed at once (current item plus prefetch).
    pub max_concurrent_downloads: usize,
    /// Minimum spacing between progress events of one download.
    pub progress_interval_ms: u64,
    /// Bytes after which a progress event is due regardless of spacing.
    pub progress_step_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("story-player-cache"),
            max_size_mb: 512,
            max_concurrent_downloads: 2,
            progress_interval_ms: 100,
            progress_step_bytes: 256 * 1024,
        }
    }
}

impl CacheSettings {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Backoff for transient download failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Delay before the retry that follows failed attempt `attempt` (0-based):
    /// `base * 2^attempt` plus jitter, never above `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let base = exp.min(self.max_delay_ms);

        let delay = if self.jitter {
            let jitter = (base as f64 * 0.25 * rand::random::<f64>()) as u64;
            base.saturating_add(jitter).min(self.max_delay_ms)
        } else {
            base
        };

        Duration::from_millis(delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub tick_interval_ms: u64,
    /// A load that has neither succeeded nor failed by then is an error.
    pub load_timeout_ms: u64,
    /// Delay before the default recovery skips a failed item.
    pub error_skip_delay_ms: u64,
    pub default_image_duration_ms: u64,
    pub text_base_ms: u64,
    pub text_per_char_ms: u64,
    pub text_min_ms: u64,
    pub text_max_ms: u64,
    /// Start downloading the next item once the current one is ready.
    pub prefetch: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            load_timeout_ms: 15_000,
            error_skip_delay_ms: 1_500,
            default_image_duration_ms: 5_000,
            text_base_ms: 2_000,
            text_per_char_ms: 50,
            text_min_ms: 3_000,
            text_max_ms: 15_000,
            prefetch: true,
        }
    }
}

impl PlaybackSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn error_skip_delay(&self) -> Duration {
        Duration::from_millis(self.error_skip_delay_ms)
    }

    pub fn default_image_duration(&self) -> Duration {
        Duration::from_millis(self.default_image_duration_ms)
    }

    /// Reading time for a text item.
    pub fn text_duration(&self, body: &str) -> Duration {
        let chars = body.chars().count() as u64;
        let ms = self
            .text_base_ms
            .saturating_add(self.text_per_char_ms.saturating_mul(chars))
            .clamp(self.text_min_ms, self.text_max_ms.max(self.text_min_ms));
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Endpoint returning the collection as JSON.
    pub playlist_url: String,
    pub bearer_token: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            playlist_url: "http://localhost:8090/api/stories".into(),
            bearer_token: None,
        }
    }
}

impl Settings {
    /// Load settings from `path` (if given and present) layered under
    /// `STORY_` environment variables, e.g. `STORY_PLAYBACK__PREFETCH=false`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("STORY")
                .prefix_separator("_")
                .separator("__"),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.playback.tick_interval_ms == 0 {
            return Err(Error::config("playback.tick_interval_ms must be positive"));
        }
        if self.playback.load_timeout_ms == 0 {
            return Err(Error::config("playback.load_timeout_ms must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.cache.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "cache.max_concurrent_downloads must be at least 1",
            ));
        }
        Ok(())
    }
}
