//! Ownership of the one active media controller.
//!
//! Each `switch_to` opens a new [`Generation`]. Signals are tagged with the
//! generation of the switch that produced them and [`MediaLifecycleManager::recv`]
//! only yields signals of the current one, so a load that was overtaken by
//! navigation can never touch playback state.

use crate::error::Error;
use crate::media::{
    ControllerFactory, Generation, MediaController, MediaSignal, SignalSink, TaggedSignal,
};
use crate::model::Item;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ActiveMedia {
    generation: Generation,
    item_id: String,
    controller: Arc<dyn MediaController>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MediaLifecycleManager {
    factory: ControllerFactory,
    load_timeout: Duration,
    generation: Generation,
    active: Option<ActiveMedia>,
    tx: mpsc::UnboundedSender<TaggedSignal>,
    rx: mpsc::UnboundedReceiver<TaggedSignal>,
}

impl MediaLifecycleManager {
    pub fn new(factory: ControllerFactory, load_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            factory,
            load_timeout,
            generation: Generation::default(),
            active: None,
            tx,
            rx,
        }
    }

    /// Replace the active controller with one for `item` and start loading it.
    ///
    /// The previous load is cancelled and its controller disposed before the
    /// new one is created. Returns the new generation.
    pub async fn switch_to(&mut self, item: &Item) -> Generation {
        self.generation = self.generation.next();
        let generation = self.generation;
        tracing::debug!("Switching to {} ({})", item.id, generation);

        self.release_active().await;

        let controller = self.factory.create(item);
        let cancel = CancellationToken::new();
        let sink = SignalSink::new(generation, item.id.clone(), self.tx.clone());
        let task = tokio::spawn(run_load(
            controller.clone(),
            item.clone(),
            sink,
            cancel.clone(),
            self.load_timeout,
        ));

        self.active = Some(ActiveMedia {
            generation,
            item_id: item.id.clone(),
            controller,
            cancel,
            task,
        });

        generation
    }

    /// Next signal of the current generation. Stale signals are discarded.
    pub async fn recv(&mut self) -> Option<TaggedSignal> {
        loop {
            let tagged = self.rx.recv().await?;
            if let Some(current) = self.accept(tagged) {
                return Some(current);
            }
        }
    }

    /// Non-blocking [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<TaggedSignal> {
        while let Ok(tagged) = self.rx.try_recv() {
            if let Some(current) = self.accept(tagged) {
                return Some(current);
            }
        }
        None
    }

    fn accept(&self, tagged: TaggedSignal) -> Option<TaggedSignal> {
        let current = self
            .active
            .as_ref()
            .is_some_and(|a| a.generation == tagged.generation);
        if current {
            return Some(tagged);
        }

        tracing::debug!(
            "Dropping stale {} signal for {} from {} (current {})",
            signal_name(&tagged.signal),
            tagged.item_id,
            tagged.generation,
            self.generation
        );
        None
    }

    pub fn pause(&self) {
        if let Some(ref active) = self.active {
            active.controller.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(ref active) = self.active {
            active.controller.resume();
        }
    }

    /// Void the current generation and release the active controller.
    pub async fn dispose(&mut self) {
        self.generation = self.generation.next();
        self.release_active().await;
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn active_item_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.item_id.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.controller.is_ready())
    }

    pub fn factory(&self) -> &ControllerFactory {
        &self.factory
    }

    async fn release_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        if let Err(e) = active.task.await {
            tracing::error!("Load task for {} failed: {}", active.item_id, e);
        }
        active.controller.dispose().await;
        tracing::debug!("Released {} ({})", active.item_id, active.generation);
    }

    #[cfg(test)]
    pub(crate) fn sink_for(&self, generation: Generation, item_id: &str) -> SignalSink {
        SignalSink::new(generation, item_id, self.tx.clone())
    }
}

async fn run_load(
    controller: Arc<dyn MediaController>,
    item: Item,
    sink: SignalSink,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let load = AssertUnwindSafe(controller.load(&item, &sink)).catch_unwind();

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Load of {} cancelled", item.id);
        }
        result = tokio::time::timeout(timeout, load) => match result {
            Ok(Ok(())) => {
                if !sink.is_settled() && !cancel.is_cancelled() {
                    tracing::warn!("Load of {} finished without reporting a result", item.id);
                    sink.error(Error::load(format!("Load of {} finished without a result", item.id)));
                }
            }
            Ok(Err(_)) => {
                tracing::error!("Controller panicked while loading {}", item.id);
                sink.error(Error::load(format!("Controller panicked while loading {}", item.id)));
            }
            Err(_) => {
                tracing::warn!("Load of {} timed out after {:?}", item.id, timeout);
                sink.error(Error::Timeout(timeout));
            }
        },
    }
}

fn signal_name(signal: &MediaSignal) -> &'static str {
    match signal {
        MediaSignal::Buffering(_) => "buffering",
        MediaSignal::DurationKnown(_) => "duration",
        MediaSignal::Ready { .. } => "ready",
        MediaSignal::Error(_) => "error",
    }
}
