//! Continuous scan-verify loop.
//!
//! A single tokio task ticks on a fixed interval, captures a still, verifies
//! it and folds the outcome into [`ScanState`]. Confirmations (fresh or
//! duplicate) hold the loop for a settle delay so the message stays readable;
//! misses and transport errors never pause it.
//!
//! Attempts run strictly one after another inside that task, so there is at
//! most one verification in flight. Every result is applied under the
//! shared-state lock only if the loop's generation still matches; `stop()`
//! bumps the generation under the same lock, which is what guarantees that
//! nothing is emitted once it returns.

use crate::activity::{ActivityLog, DEFAULT_ACTIVITY_CAPACITY};
use crate::client::VerificationClient;
use crate::cooldown::CooldownTracker;
use crate::types::{
    ActivityLogEntry, FailureReason, FrameUnavailable, ScanAttempt, ScanState, StillFrame,
    VerificationOutcome,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(15_000);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2000);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("scan loop is already running")]
    AlreadyRunning,
    #[error("scan interval must be greater than zero")]
    ZeroInterval,
}

/// Supplies one encoded still per call.
pub trait FrameSource: Send + Sync + 'static {
    fn capture(&self) -> impl Future<Output = Result<StillFrame, FrameUnavailable>> + Send;
}

/// Wall-clock source for cooldown and activity timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// UI sink. Called on the loop task while the state lock is held, so
/// implementations must return promptly and must not call back into the
/// owning [`ScanLoop`] (`state()`, `recent_activity()`, `stop()`): the lock
/// is not reentrant and such a call deadlocks. Use the arguments instead.
pub trait ScanObserver: Send + Sync {
    fn on_state_change(&self, state: &ScanState, recent: &[ActivityLogEntry]);

    /// A fresh confirmation was appended to the activity log.
    fn on_activity(&self, _entry: &ActivityLogEntry) {}
}

/// Observer notifications as channel messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    StateChanged {
        state: ScanState,
        recent: Vec<ActivityLogEntry>,
    },
    Activity(ActivityLogEntry),
}

/// Forwards observer callbacks onto an unbounded channel; sending never blocks.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ScanObserver for ChannelObserver {
    fn on_state_change(&self, state: &ScanState, recent: &[ActivityLogEntry]) {
        let _ = self.tx.send(ScanEvent::StateChanged {
            state: state.clone(),
            recent: recent.to_vec(),
        });
    }

    fn on_activity(&self, entry: &ActivityLogEntry) {
        let _ = self.tx.send(ScanEvent::Activity(entry.clone()));
    }
}

/// Tick cadence and duplicate window for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
    pub interval: Duration,
    pub cooldown: Duration,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SCAN_INTERVAL,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// State owned by the loop. Survives stop/start within a process.
struct Shared {
    generation: u64,
    state: ScanState,
    cooldown: CooldownTracker,
    activity: ActivityLog,
}

impl Shared {
    fn new(activity_capacity: usize) -> Self {
        Self {
            generation: 0,
            state: ScanState::Scanning,
            cooldown: CooldownTracker::new(),
            activity: ActivityLog::new(activity_capacity),
        }
    }

    /// Fold one verification outcome into the state. Returns the activity
    /// entry when the outcome was a fresh confirmation.
    fn apply(
        &mut self,
        outcome: VerificationOutcome,
        at_ms: i64,
        cooldown_ms: i64,
    ) -> Option<ActivityLogEntry> {
        match outcome {
            VerificationOutcome::Matched {
                identity,
                confidence,
                server_timestamp,
                attendance_id,
            } => {
                if self.cooldown.check_and_record(&identity.id, at_ms, cooldown_ms) {
                    tracing::debug!(identity = %identity.id, "duplicate confirmation inside cooldown");
                    self.state = ScanState::Duplicate(identity);
                    return None;
                }
                tracing::info!(
                    identity = %identity.id,
                    name = %identity.name,
                    confidence = ?confidence,
                    "attendance confirmed"
                );
                let entry = ActivityLogEntry {
                    identity: identity.clone(),
                    confirmed_at_ms: at_ms,
                    server_timestamp,
                    attendance_id,
                };
                self.activity.append(entry.clone());
                self.state = ScanState::Confirmed(identity);
                Some(entry)
            }
            VerificationOutcome::Unmatched => {
                tracing::debug!("face not recognized");
                self.state = ScanState::Failed(FailureReason::NotRecognized);
                None
            }
            VerificationOutcome::TransportError(err) => {
                tracing::warn!(error = %err, "verification failed");
                self.state = ScanState::Failed(err.into());
                None
            }
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives capture → verify → state on a fixed cadence.
pub struct ScanLoop<F, V> {
    frames: Arc<F>,
    verifier: Arc<V>,
    clock: Arc<dyn Clock>,
    settle_delay: Duration,
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
}

impl<F: FrameSource, V: VerificationClient> ScanLoop<F, V> {
    pub fn new(frames: F, verifier: V) -> Self {
        Self {
            frames: Arc::new(frames),
            verifier: Arc::new(verifier),
            clock: Arc::new(SystemClock),
            settle_delay: DEFAULT_SETTLE_DELAY,
            shared: Arc::new(Mutex::new(Shared::new(DEFAULT_ACTIVITY_CAPACITY))),
            task: None,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Replaces the activity log with an empty one of the given capacity.
    pub fn with_activity_capacity(self, capacity: usize) -> Self {
        lock(&self.shared).activity = ActivityLog::new(capacity);
        self
    }

    /// Begin ticking. The first attempt runs immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &mut self,
        timing: ScanTiming,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<(), ScanError> {
        if self.is_running() {
            return Err(ScanError::AlreadyRunning);
        }
        if timing.interval.is_zero() {
            return Err(ScanError::ZeroInterval);
        }

        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.state = ScanState::Scanning;
            shared.generation
        };

        let worker = Worker {
            frames: Arc::clone(&self.frames),
            verifier: Arc::clone(&self.verifier),
            clock: Arc::clone(&self.clock),
            shared: Arc::clone(&self.shared),
            observer,
            generation,
            interval: timing.interval,
            cooldown_ms: i64::try_from(timing.cooldown.as_millis()).unwrap_or(i64::MAX),
            settle_delay: self.settle_delay,
        };
        self.task = Some(tokio::spawn(worker.run()));

        tracing::info!(
            interval_ms = timing.interval.as_millis() as u64,
            cooldown_ms = timing.cooldown.as_millis() as u64,
            settle_ms = self.settle_delay.as_millis() as u64,
            generation,
            "scan loop started"
        );
        Ok(())
    }
}

impl<F, V> ScanLoop<F, V> {
    /// Cancel all scheduled work and reset the state to `Scanning`. No-op
    /// when not running.
    pub fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.state = ScanState::Scanning;
        }
        task.abort();
        tracing::info!("scan loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn state(&self) -> ScanState {
        lock(&self.shared).state.clone()
    }

    /// Recent fresh confirmations, newest first.
    pub fn recent_activity(&self) -> Vec<ActivityLogEntry> {
        lock(&self.shared).activity.snapshot()
    }
}

impl<F, V> Drop for ScanLoop<F, V> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<F, V> {
    frames: Arc<F>,
    verifier: Arc<V>,
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<Shared>>,
    observer: Arc<dyn ScanObserver>,
    generation: u64,
    interval: Duration,
    cooldown_ms: i64,
    settle_delay: Duration,
}

impl<F: FrameSource, V: VerificationClient> Worker<F, V> {
    async fn run(self) {
        let mut ticker = self.ticker(Instant::now());
        loop {
            ticker.tick().await;

            let Some(pause) = self.attempt().await else {
                return;
            };
            if !pause {
                continue;
            }

            tokio::time::sleep(self.settle_delay).await;
            let resumed = self.commit(|shared| {
                shared.state = ScanState::Scanning;
                None
            });
            if resumed.is_none() {
                return;
            }
            ticker = self.ticker(Instant::now() + self.interval);
        }
    }

    /// Missed ticks collapse into one, so a slow call never queues a burst.
    fn ticker(&self, first: Instant) -> Interval {
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// One tick. `None` means the loop was stopped underneath us.
    async fn attempt(&self) -> Option<bool> {
        let started_at_ms = self.clock.now_ms();
        let frame = match self.frames.capture().await {
            Ok(frame) => frame,
            Err(unavailable) => {
                tracing::warn!(reason = %unavailable.0, "no frame for scan attempt");
                return self.commit(|shared| {
                    shared.state = ScanState::Failed(FailureReason::NoFrame);
                    None
                });
            }
        };

        let attempt = ScanAttempt {
            frame,
            started_at_ms,
        };
        tracing::trace!(bytes = attempt.frame.data.len(), at_ms = started_at_ms, "verifying frame");
        let outcome = self.verifier.verify(&attempt.frame).await;

        let cooldown_ms = self.cooldown_ms;
        self.commit(move |shared| shared.apply(outcome, attempt.started_at_ms, cooldown_ms))
    }

    /// Apply a state change and notify the observer, unless this worker's
    /// generation is stale. Returns whether the new state pauses scanning.
    fn commit(
        &self,
        apply: impl FnOnce(&mut Shared) -> Option<ActivityLogEntry>,
    ) -> Option<bool> {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            tracing::debug!(generation = self.generation, "dropping result from stopped scan loop");
            return None;
        }

        let entry = apply(&mut shared);
        if let Some(entry) = &entry {
            self.observer.on_activity(entry);
        }
        let recent = shared.activity.snapshot();
        self.observer.on_state_change(&shared.state, &recent);
        Some(shared.state.pauses_scanning())
    }
}
