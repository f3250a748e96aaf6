//! The playback loop.
//!
//! One task owns the cursor and every playback decision. The UI talks to it
//! through an [`OrchestratorHandle`] and hears back on the event channel the
//! orchestrator was built with; media signals arrive already filtered to the
//! current generation by the [`MediaLifecycleManager`].

use crate::cache::DownloadProgress;
use crate::config::PlaybackSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::history::ViewHistory;
use crate::lifecycle::MediaLifecycleManager;
use crate::media::{ControllerFactory, MediaSignal, ResourceHandle, TaggedSignal};
use crate::model::{Collection, Cursor, Item};
use crate::navigation::{self, NavResult};
use crate::progress::ProgressEngine;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Loading,
    Playing,
    Paused,
    Transitioning,
    Completed,
    Error,
}

/// Why playback is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PauseReason {
    /// Pause button or API call.
    Explicit,
    /// The view lost focus (app backgrounded, overlay shown).
    FocusLost,
    /// Press-and-hold on the item.
    Hold,
}

/// Set of active pause reasons. Playback resumes only once it is empty.
#[derive(Debug, Clone, Default)]
pub struct PauseReasons {
    active: BTreeSet<PauseReason>,
}

impl PauseReasons {
    /// Add or clear a reason. Returns whether the set changed.
    pub fn set(&mut self, reason: PauseReason, paused: bool) -> bool {
        if paused {
            self.active.insert(reason)
        } else {
            self.active.remove(&reason)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, reason: PauseReason) -> bool {
        self.active.contains(&reason)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}

/// Outbound notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    ItemChanged { group_id: String, item_id: String },
    GroupChanged { group_id: String },
    ProgressTick(f32),
    Completed,
    Error { kind: ErrorKind, message: String },
    MediaReadyForRender(ResourceHandle),
    Buffering(DownloadProgress),
    PhaseChanged(Phase),
}

/// What to do about an item that failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    SkipAfter(Duration),
    RetryAfter(Duration),
    /// Stay on the error until the user navigates or retries.
    Stay,
}

pub trait RecoveryPolicy: Send + Sync {
    /// `attempts` counts consecutive failures of this item, starting at 1.
    fn on_error(&self, item: &Item, error: &Error, attempts: u32) -> Recovery;
}

/// Show the error briefly, then move on.
#[derive(Debug, Clone)]
pub struct SkipOnError {
    pub delay: Duration,
}

impl RecoveryPolicy for SkipOnError {
    fn on_error(&self, _item: &Item, _error: &Error, _attempts: u32) -> Recovery {
        Recovery::SkipAfter(self.delay)
    }
}

/// Reload a failed item a few times before skipping it. Configuration errors
/// are skipped straight away.
#[derive(Debug, Clone)]
pub struct RetryThenSkip {
    pub retries: u32,
    pub delay: Duration,
}

impl RecoveryPolicy for RetryThenSkip {
    fn on_error(&self, _item: &Item, error: &Error, attempts: u32) -> Recovery {
        if attempts <= self.retries && error.kind() != ErrorKind::Configuration {
            Recovery::RetryAfter(self.delay)
        } else {
            Recovery::SkipAfter(self.delay)
        }
    }
}

/// Where playback starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartAt {
    #[default]
    Beginning,
    FirstUnviewed,
    Item(String),
}

#[derive(Debug)]
enum Command {
    Next { seq: u64 },
    Previous { seq: u64 },
    Jump { item_id: String },
    SetPaused { reason: PauseReason, paused: bool },
    Retry,
    UpdateCollection(Box<Collection>),
    Dispose { done: oneshot::Sender<()> },
}

/// Inbound side of a running orchestrator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Command>,
    issued: Arc<AtomicU64>,
}

impl OrchestratorHandle {
    fn seq(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Orchestrator already stopped, command ignored");
        }
    }

    pub fn request_next(&self) {
        let seq = self.seq();
        self.send(Command::Next { seq });
    }

    pub fn request_previous(&self) {
        let seq = self.seq();
        self.send(Command::Previous { seq });
    }

    /// Jumps name their target, so they are never coalesced.
    pub fn request_jump(&self, item_id: impl Into<String>) {
        self.send(Command::Jump {
            item_id: item_id.into(),
        });
    }

    pub fn set_paused(&self, reason: PauseReason, paused: bool) {
        self.send(Command::SetPaused { reason, paused });
    }

    /// Reload the current item.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    pub fn update_collection(&self, collection: Collection) {
        self.send(Command::UpdateCollection(Box::new(collection)));
    }

    /// Stop playback and release media. Resolves once released.
    pub async fn dispose(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Dispose { done }).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct OrchestratorBuilder {
    collection: Collection,
    factory: ControllerFactory,
    playback: PlaybackSettings,
    start: StartAt,
    recovery: Option<Arc<dyn RecoveryPolicy>>,
    history: Option<ViewHistory>,
}

impl OrchestratorBuilder {
    pub fn new(collection: Collection, factory: ControllerFactory, playback: PlaybackSettings) -> Self {
        Self {
            collection,
            factory,
            playback,
            start: StartAt::default(),
            recovery: None,
            history: None,
        }
    }

    pub fn start_at(mut self, start: StartAt) -> Self {
        self.start = start;
        self
    }

    pub fn recovery(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.recovery = Some(policy);
        self
    }

    pub fn history(mut self, history: ViewHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Build an orchestrator that reports on `events`.
    pub fn build(
        self,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> Result<(PlaybackOrchestrator, OrchestratorHandle)> {
        let collection = match self.history {
            Some(ref history) => history.apply(&self.collection),
            None => self.collection,
        };

        let start = start_cursor(&collection, &self.start)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let issued = Arc::new(AtomicU64::new(0));
        let recovery = self.recovery.unwrap_or_else(|| {
            Arc::new(SkipOnError {
                delay: self.playback.error_skip_delay(),
            })
        });

        let orchestrator = PlaybackOrchestrator {
            collection,
            start: Some(start),
            cursor: None,
            phase: Phase::Loading,
            pauses: PauseReasons::default(),
            progress: ProgressEngine::new(),
            media: MediaLifecycleManager::new(self.factory, self.playback.load_timeout()),
            recovery,
            history: self.history,
            events,
            commands: rx,
            issued: issued.clone(),
            settled_seq: 0,
            tick_interval: self.playback.tick_interval(),
            prefetch: self.playback.prefetch,
            prefetching: None,
            pending_duration: None,
            recovery_due: None,
            failures: 0,
        };

        Ok((orchestrator, OrchestratorHandle { tx, issued }))
    }

    /// Build and run on a new task.
    pub fn spawn(
        self,
    ) -> Result<(
        OrchestratorHandle,
        mpsc::Receiver<PlaybackEvent>,
        JoinHandle<()>,
    )> {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (orchestrator, handle) = self.build(events_tx)?;
        let task = tokio::spawn(orchestrator.run());
        Ok((handle, events_rx, task))
    }
}

fn start_cursor(collection: &Collection, start: &StartAt) -> Result<Cursor> {
    let cursor = match start {
        StartAt::Beginning => navigation::initial_cursor(collection),
        StartAt::FirstUnviewed => navigation::first_unviewed(collection),
        StartAt::Item(item_id) => Some(navigation::jump(collection, item_id)?),
    };
    cursor.ok_or_else(|| Error::config("Collection has no items to play"))
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy)]
enum RecoveryAction {
    Skip,
    Retry,
}

pub struct PlaybackOrchestrator {
    collection: Collection,
    /// Starting position, consumed by `run`.
    start: Option<Cursor>,
    cursor: Option<Cursor>,
    phase: Phase,
    pauses: PauseReasons,
    progress: ProgressEngine,
    media: MediaLifecycleManager,
    recovery: Arc<dyn RecoveryPolicy>,
    history: Option<ViewHistory>,
    events: mpsc::Sender<PlaybackEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    issued: Arc<AtomicU64>,
    /// Navigation requests numbered below this were issued before the last
    /// transition settled and are folded into it.
    settled_seq: u64,
    tick_interval: Duration,
    prefetch: bool,
    prefetching: Option<(String, CancellationToken)>,
    pending_duration: Option<Duration>,
    recovery_due: Option<(Instant, RecoveryAction)>,
    /// Consecutive load failures of the current item.
    failures: u32,
}

impl PlaybackOrchestrator {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub async fn run(mut self) {
        if let Some(start) = self.start.take() {
            self.go_to(start).await;
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let recovery_at = self.recovery_due.map(|(at, _)| at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!("All handles dropped, stopping playback");
                        self.shutdown().await;
                        return;
                    }
                },
                Some(tagged) = self.media.recv() => self.handle_signal(tagged).await,
                _ = ticker.tick(), if self.progress.is_running() => self.on_tick().await,
                _ = sleep_until(recovery_at), if recovery_at.is_some() => self.run_recovery().await,
            }
        }
    }

    /// Returns false once the orchestrator has been disposed.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Next { seq } => {
                if !self.coalesced(seq, "next") {
                    self.advance(Direction::Forward).await;
                }
            }
            Command::Previous { seq } => {
                if !self.coalesced(seq, "previous") {
                    self.advance(Direction::Backward).await;
                }
            }
            Command::Jump { item_id } => {
                match navigation::jump(&self.collection, &item_id) {
                    Ok(cursor) => self.go_to(cursor).await,
                    Err(e) => {
                        tracing::warn!("Jump failed: {}", e);
                        self.report(&e).await;
                    }
                }
            }
            Command::SetPaused { reason, paused } => self.set_paused(reason, paused).await,
            Command::Retry => {
                if let Some(cursor) = self.cursor.clone() {
                    tracing::info!("Retrying {}", cursor);
                    self.load(cursor, false).await;
                }
            }
            Command::UpdateCollection(collection) => self.replace_collection(*collection).await,
            Command::Dispose { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn coalesced(&self, seq: u64, what: &str) -> bool {
        if seq < self.settled_seq {
            tracing::debug!(
                "Coalescing {} request #{} into the transition that already settled",
                what,
                seq
            );
            return true;
        }
        false
    }

    async fn advance(&mut self, direction: Direction) {
        let Some(cursor) = self.cursor.clone() else {
            return;
        };

        let result = match direction {
            Direction::Forward => navigation::next(&self.collection, &cursor),
            Direction::Backward => navigation::previous(&self.collection, &cursor),
        };
        tracing::debug!("Navigation from {}: {:?}", cursor, result);

        match result {
            NavResult::WithinGroup(next) | NavResult::NextGroup(next) | NavResult::PreviousGroup(next) => {
                self.go_to(next).await;
            }
            NavResult::Completed => self.finish().await,
            NavResult::AtBeginning => {}
        }
    }

    /// Move the cursor and start loading its item.
    async fn go_to(&mut self, cursor: Cursor) {
        let same_item = self
            .cursor
            .as_ref()
            .is_some_and(|c| c.item_id == cursor.item_id);
        if !same_item {
            self.failures = 0;
        }

        let group_changed = self
            .cursor
            .as_ref()
            .map_or(true, |c| c.group_id != cursor.group_id);

        self.load(cursor, group_changed).await;
    }

    async fn load(&mut self, cursor: Cursor, group_changed: bool) {
        let Some(item) = navigation::resolve(&self.collection, &cursor).cloned() else {
            tracing::warn!("Cursor {} does not resolve, finishing", cursor);
            self.finish().await;
            return;
        };

        self.set_phase(Phase::Transitioning).await;
        self.progress.reset();
        self.pending_duration = None;
        self.recovery_due = None;
        self.cancel_prefetch_unless(item.kind.source_url());

        self.cursor = Some(cursor.clone());
        self.media.switch_to(&item).await;
        self.settled_seq = self.issued.load(Ordering::SeqCst);

        if group_changed {
            self.emit(PlaybackEvent::GroupChanged {
                group_id: cursor.group_id.clone(),
            })
            .await;
        }
        self.emit(PlaybackEvent::ItemChanged {
            group_id: cursor.group_id,
            item_id: cursor.item_id,
        })
        .await;
        self.set_phase(Phase::Loading).await;
    }

    async fn finish(&mut self) {
        if self.phase == Phase::Completed {
            tracing::debug!("Already completed");
            return;
        }
        self.progress.reset();
        self.recovery_due = None;
        self.media.dispose().await;
        self.settled_seq = self.issued.load(Ordering::SeqCst);
        tracing::info!("Playback completed");
        self.set_phase(Phase::Completed).await;
        self.emit(PlaybackEvent::Completed).await;
    }

    async fn handle_signal(&mut self, tagged: TaggedSignal) {
        let is_current = self
            .cursor
            .as_ref()
            .is_some_and(|c| c.item_id == tagged.item_id);
        if !is_current {
            tracing::debug!("Ignoring signal for {}, not the current item", tagged.item_id);
            return;
        }

        match tagged.signal {
            MediaSignal::Buffering(progress) => {
                self.try_emit(PlaybackEvent::Buffering(progress));
            }
            MediaSignal::DurationKnown(duration) => {
                self.pending_duration = Some(duration);
            }
            MediaSignal::Ready { resource, duration } => {
                if self.phase != Phase::Loading {
                    tracing::debug!("Ready for {} while {:?}, ignoring", tagged.item_id, self.phase);
                    return;
                }
                self.on_ready(&tagged.item_id, resource, duration).await;
            }
            MediaSignal::Error(error) => self.fail(error).await,
        }
    }

    async fn on_ready(&mut self, item_id: &str, resource: ResourceHandle, duration: Duration) {
        let duration = self.pending_duration.take().unwrap_or(duration);
        self.failures = 0;
        tracing::debug!("{} ready, playing for {:?}", item_id, duration);

        self.progress.start(duration);
        self.mark_viewed(item_id);
        self.emit(PlaybackEvent::MediaReadyForRender(resource)).await;
        self.try_emit(PlaybackEvent::ProgressTick(0.0));

        if self.pauses.is_empty() {
            self.set_phase(Phase::Playing).await;
        } else {
            self.progress.pause();
            self.media.pause();
            self.set_phase(Phase::Paused).await;
        }

        self.start_prefetch();
    }

    async fn fail(&mut self, error: Error) {
        let Some(item) = self
            .cursor
            .as_ref()
            .and_then(|c| navigation::resolve(&self.collection, c))
            .cloned()
        else {
            return;
        };

        tracing::warn!("Failed to load {}: {}", item.id, error);
        self.progress.reset();
        self.failures += 1;
        self.set_phase(Phase::Error).await;
        self.report(&error).await;

        self.recovery_due = match self.recovery.on_error(&item, &error, self.failures) {
            Recovery::SkipAfter(delay) => Some((Instant::now() + delay, RecoveryAction::Skip)),
            Recovery::RetryAfter(delay) => Some((Instant::now() + delay, RecoveryAction::Retry)),
            Recovery::Stay => None,
        };
    }

    async fn run_recovery(&mut self) {
        let Some((_, action)) = self.recovery_due.take() else {
            return;
        };
        if self.phase != Phase::Error {
            return;
        }

        match action {
            RecoveryAction::Skip => {
                tracing::info!("Skipping failed item");
                self.advance(Direction::Forward).await;
            }
            RecoveryAction::Retry => {
                if let Some(cursor) = self.cursor.clone() {
                    tracing::info!("Retrying {} (failure {})", cursor, self.failures);
                    self.load(cursor, false).await;
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let sample = self.progress.poll();
        self.try_emit(PlaybackEvent::ProgressTick(sample.fraction));
        if sample.completed {
            self.advance(Direction::Forward).await;
        }
    }

    async fn set_paused(&mut self, reason: PauseReason, paused: bool) {
        if !self.pauses.set(reason, paused) {
            return;
        }
        tracing::debug!(
            "Pause reason {:?} {}, {} active",
            reason,
            if paused { "set" } else { "cleared" },
            self.pauses.len()
        );

        if !self.pauses.is_empty() && self.phase == Phase::Playing {
            self.progress.pause();
            self.media.pause();
            self.set_phase(Phase::Paused).await;
        } else if self.pauses.is_empty() && self.phase == Phase::Paused {
            self.progress.resume();
            self.media.resume();
            self.set_phase(Phase::Playing).await;
        }
    }

    async fn replace_collection(&mut self, mut collection: Collection) {
        // Views recorded this session survive a replacement that lacks them.
        for item in collection.groups.iter_mut().flat_map(|g| g.items.iter_mut()) {
            if item.viewed_at.is_none() {
                item.viewed_at = self.collection.item(&item.id).and_then(|old| old.viewed_at);
            }
        }
        self.collection = match self.history {
            Some(ref history) => history.apply(&collection),
            None => collection,
        };

        let Some(cursor) = self.cursor.clone() else {
            return;
        };

        match navigation::jump(&self.collection, &cursor.item_id) {
            Ok(relocated) => {
                tracing::debug!("Collection updated, {} still present", cursor.item_id);
                self.cursor = Some(relocated);
            }
            Err(_) => {
                tracing::info!("Current item {} was removed, restarting", cursor.item_id);
                match navigation::next_unviewed(&self.collection) {
                    Some(start) => self.go_to(start).await,
                    None => self.finish().await,
                }
            }
        }
    }

    fn mark_viewed(&mut self, item_id: &str) {
        let Some(item) = self.collection.item(item_id) else {
            return;
        };
        let now = Utc::now();
        let viewed = item.with_viewed_at(now);
        self.collection = self.collection.with_item(viewed);

        if let Some(ref history) = self.history {
            history.spawn_mark_viewed(item_id, now);
        }
    }

    fn start_prefetch(&mut self) {
        if !self.prefetch {
            return;
        }
        let Some(ref cursor) = self.cursor else {
            return;
        };
        let Some(url) = navigation::peek_next(&self.collection, cursor)
            .and_then(|item| item.kind.source_url())
            .map(str::to_string)
        else {
            return;
        };
        if self.prefetching.as_ref().is_some_and(|(key, _)| *key == url) {
            return;
        }

        self.cancel_prefetch_unless(None);
        tracing::debug!("Prefetching {}", url);
        let token = self.media.factory().cache().prefetch(&url);
        self.prefetching = Some((url, token));
    }

    /// Cancel the running prefetch unless it is for `keep`.
    fn cancel_prefetch_unless(&mut self, keep: Option<&str>) {
        let Some((key, token)) = self.prefetching.take() else {
            return;
        };
        if keep == Some(key.as_str()) {
            self.prefetching = Some((key, token));
            return;
        }
        token.cancel();
    }

    async fn shutdown(&mut self) {
        self.cancel_prefetch_unless(None);
        self.progress.reset();
        self.recovery_due = None;
        self.media.dispose().await;
        self.cursor = None;
        tracing::debug!("Orchestrator disposed");
    }

    async fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        self.phase = phase;
        self.emit(PlaybackEvent::PhaseChanged(phase)).await;
    }

    async fn report(&self, error: &Error) {
        self.emit(PlaybackEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        })
        .await;
    }

    async fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }

    /// Emit a high-frequency event, dropping it if the UI is behind.
    fn try_emit(&self, event: PlaybackEvent) {
        let _ = self.events.try_send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
