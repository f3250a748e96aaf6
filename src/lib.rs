//! Playback core for a story viewer.
//!
//! A [`Collection`](model::Collection) of groups is played item by item. The
//! [`orchestrator`] drives it: [`navigation`] picks the next position, the
//! [`lifecycle`] manager loads the item through a [`media`] controller backed
//! by the [`cache`], and the [`progress`] engine times how long it stays up.

pub mod cache;
pub mod config;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod media;
pub mod model;
pub mod navigation;
pub mod orchestrator;
pub mod progress;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorHandle, PauseReason, Phase, PlaybackEvent,
    PlaybackOrchestrator, StartAt,
};
