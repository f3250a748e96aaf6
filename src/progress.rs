//! Elapsed-time tracking for the item on screen.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Idle,
    Running,
    Paused,
    Completed,
}

/// One observation of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// 0.0 to 1.0.
    pub fraction: f32,
    /// Set exactly once, on the poll that first observes the end.
    pub completed: bool,
}

/// Tracks how far through its duration the current item is.
///
/// Elapsed time only grows while `Running` and is frozen while `Paused`.
/// The engine does not tick itself; the owner polls it on an interval, so
/// completion is reported no earlier than the duration and at most one poll
/// interval after it.
#[derive(Debug)]
pub struct ProgressEngine {
    state: ProgressState,
    duration: Duration,
    /// Elapsed time banked before the current running span.
    banked: Duration,
    running_since: Option<Instant>,
}

impl Default for ProgressEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEngine {
    pub fn new() -> Self {
        Self {
            state: ProgressState::Idle,
            duration: Duration::ZERO,
            banked: Duration::ZERO,
            running_since: None,
        }
    }

    pub fn start(&mut self, duration: Duration) {
        self.duration = duration;
        self.banked = Duration::ZERO;
        self.running_since = Some(Instant::now());
        self.state = ProgressState::Running;
    }

    pub fn pause(&mut self) {
        if self.state != ProgressState::Running {
            return;
        }
        if let Some(since) = self.running_since.take() {
            self.banked += since.elapsed();
        }
        self.state = ProgressState::Paused;
    }

    pub fn resume(&mut self) {
        if self.state != ProgressState::Paused {
            return;
        }
        self.running_since = Some(Instant::now());
        self.state = ProgressState::Running;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_running(&self) -> bool {
        self.state == ProgressState::Running
    }

    pub fn elapsed(&self) -> Duration {
        let running = self
            .running_since
            .map(|since| since.elapsed())
            .unwrap_or_default();
        (self.banked + running).min(self.duration)
    }

    pub fn fraction(&self) -> f32 {
        match self.state {
            ProgressState::Idle => 0.0,
            ProgressState::Completed => 1.0,
            _ if self.duration.is_zero() => 1.0,
            _ => (self.elapsed().as_secs_f64() / self.duration.as_secs_f64()).min(1.0) as f32,
        }
    }

    /// Observe the engine, moving it to `Completed` once the duration has
    /// elapsed.
    pub fn poll(&mut self) -> ProgressSample {
        if self.state == ProgressState::Running && self.elapsed() >= self.duration {
            self.banked = self.duration;
            self.running_since = None;
            self.state = ProgressState::Completed;
            return ProgressSample {
                fraction: 1.0,
                completed: true,
            };
        }

        ProgressSample {
            fraction: self.fraction(),
            completed: false,
        }
    }
}
