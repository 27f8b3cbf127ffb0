use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::backoff::{Backoff, RetryState};
use super::error::SensorError;
use super::sensor::{LocationSensor, Subscription};
use super::state::PositionWriter;
use super::types::{Accuracy, LocationFix, PermissionStatus, WatchOptions};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingOptions {
    /// Accuracy of the continuous watch and of manual refreshes.
    pub accuracy: Accuracy,
    /// Accuracy of the one-shot fix taken while the watch spins up.
    pub cold_start_accuracy: Accuracy,
    pub time_interval: Duration,
    pub distance_interval_m: f64,
    pub backoff: Backoff,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            cold_start_accuracy: Accuracy::Low,
            time_interval: Duration::from_secs(5),
            distance_interval_m: 10.0,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerMode {
    Idle,
    Starting,
    Watching,
    RetryPending,
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerStatus {
    pub mode: TrackerMode,
    pub retry_attempts: u32,
    pub next_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    WatchStarted,
    FixPublished { fix: LocationFix },
    RetryScheduled { attempt: u32, delay_ms: u64 },
    PermissionLost { reason: String },
    Stopped,
}

#[derive(Debug)]
struct Shared {
    status: TrackerStatus,
    retry: RetryState,
}

/// State the watch session task needs. It deliberately does not own the
/// worker handle, so dropping every `PositionTracker` ends the session.
struct Context {
    sensor: Arc<dyn LocationSensor>,
    writer: PositionWriter,
    options: TrackingOptions,
    events: broadcast::Sender<TrackerEvent>,
    shared: StdMutex<Shared>,
    /// Bumped by every stop. Work started under an older epoch must not
    /// publish.
    epoch: AtomicU64,
}

#[derive(Debug)]
struct WorkerHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Control {
    /// Token of the start currently in flight.
    starting: Option<u64>,
    next_start: u64,
    worker: Option<WorkerHandle>,
}

/// Releases the single-flight slot when a start finishes or its future is
/// dropped mid-way.
struct StartGuard {
    control: Arc<StdMutex<Control>>,
    token: u64,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.starting == Some(self.token) {
            control.starting = None;
        }
    }
}

/// Keeps the location store fed from the device sensor.
///
/// At most one watch session task exists at a time. The session owns the
/// sensor subscription and the pending retry timer, so stopping the session
/// cancels both.
#[derive(Clone)]
pub struct PositionTracker {
    ctx: Arc<Context>,
    control: Arc<StdMutex<Control>>,
}

impl PositionTracker {
    pub fn new(
        sensor: Arc<dyn LocationSensor>,
        writer: PositionWriter,
        options: TrackingOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx: Arc::new(Context {
                sensor,
                writer,
                options,
                events,
                shared: StdMutex::new(Shared {
                    status: TrackerStatus {
                        mode: TrackerMode::Idle,
                        retry_attempts: 0,
                        next_retry_ms: None,
                    },
                    retry: RetryState::default(),
                }),
                epoch: AtomicU64::new(0),
            }),
            control: Arc::new(StdMutex::new(Control::default())),
        }
    }

    pub fn status(&self) -> TrackerStatus {
        self.ctx.lock().status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.ctx.events.subscribe()
    }

    /// Asks for foreground permission. A denial is recorded as a terminal
    /// error and is never retried.
    pub async fn request_permission(&self) -> bool {
        match self.ctx.sensor.request_foreground_permission().await {
            PermissionStatus::Granted => true,
            PermissionStatus::Denied => {
                self.ctx.lose_permission(&SensorError::PermissionDenied);
                false
            }
        }
    }

    pub async fn start_watching(&self) {
        let _guard = {
            let mut control = self.control();
            if control.starting.is_some() {
                debug!("Watch start already in flight, ignoring request");
                return;
            }
            let token = control.next_start;
            control.next_start += 1;
            control.starting = Some(token);
            StartGuard {
                control: self.control.clone(),
                token,
            }
        };

        self.stop_session().await;

        let epoch = self.ctx.epoch();
        self.ctx.set_mode(TrackerMode::Starting);
        let established = self.ctx.establish(epoch).await;

        let mut control = self.control();
        if self.ctx.epoch() != epoch {
            drop(control);
            debug!("Watch stopped while starting, discarding subscription");
            return;
        }

        if let Err(err) = &established {
            if err.is_permission() {
                drop(control);
                self.ctx.lose_permission(err);
                return;
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run_session(self.ctx.clone(), epoch, established, stop_rx));
        control.worker = Some(WorkerHandle { stop_tx, join });
    }

    /// Cancels the active subscription and any pending retry. Returns once
    /// the session task has finished. A start still in flight is abandoned.
    pub async fn stop_watching(&self) {
        self.control().starting = None;
        self.stop_session().await;
    }

    async fn stop_session(&self) {
        let worker = {
            let mut control = self.control();
            self.ctx.epoch.fetch_add(1, Ordering::SeqCst);
            control.worker.take()
        };

        let stopped = worker.is_some();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let _ = worker.join.await;
        }

        {
            let mut shared = self.ctx.lock();
            shared.retry.reset();
            shared.status.retry_attempts = 0;
            shared.status.next_retry_ms = None;
            if shared.status.mode != TrackerMode::PermissionDenied {
                shared.status.mode = TrackerMode::Idle;
            }
        }
        self.ctx.writer.end_session();

        if stopped {
            info!("Location watch stopped");
            self.ctx.emit(TrackerEvent::Stopped);
        }
    }

    /// One-shot fix outside the continuous watch. Failures are swallowed.
    pub async fn refresh_location(&self) {
        match self
            .ctx
            .sensor
            .current_position(self.ctx.options.accuracy)
            .await
        {
            Ok(fix) => self.ctx.publish(fix),
            Err(err) => debug!("Location refresh failed: {}", err),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Context {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn set_mode(&self, mode: TrackerMode) {
        self.lock().status.mode = mode;
    }

    /// Permission, cold-start fixes, then the continuous watch. Cold-start
    /// fixes are dropped once a stop has moved the epoch past `epoch`.
    async fn establish(&self, epoch: u64) -> Result<Subscription, SensorError> {
        self.writer.begin_session();

        if self.sensor.request_foreground_permission().await == PermissionStatus::Denied {
            return Err(SensorError::PermissionDenied);
        }

        match self.sensor.last_known_position().await {
            Ok(Some(fix)) => self.publish_in(epoch, fix),
            Ok(None) => {}
            Err(err) => debug!("Last known position unavailable: {}", err),
        }

        match self
            .sensor
            .current_position(self.options.cold_start_accuracy)
            .await
        {
            Ok(fix) => self.publish_in(epoch, fix),
            Err(err) => debug!("Cold start fix unavailable: {}", err),
        }

        self.sensor.watch_position(WatchOptions {
            accuracy: self.options.accuracy,
            time_interval: self.options.time_interval,
            distance_interval_m: self.options.distance_interval_m,
        })
    }

    fn publish_in(&self, epoch: u64, fix: LocationFix) {
        if self.epoch() == epoch {
            self.publish(fix);
        } else {
            debug!("Dropping cold start fix from a stopped session");
        }
    }

    fn publish(&self, fix: LocationFix) {
        self.writer.publish(fix);
        self.emit(TrackerEvent::FixPublished { fix });
    }

    fn watch_started(&self) {
        {
            let mut shared = self.lock();
            shared.status.mode = TrackerMode::Watching;
            shared.status.next_retry_ms = None;
        }
        info!("Location watch started");
        self.emit(TrackerEvent::WatchStarted);
    }

    fn watch_fix(&self, fix: LocationFix) {
        {
            let mut shared = self.lock();
            shared.retry.reset();
            shared.status.retry_attempts = 0;
        }
        self.publish(fix);
    }

    fn schedule_retry(&self, err: &SensorError) -> Duration {
        let (attempt, delay) = {
            let mut shared = self.lock();
            let delay = shared.retry.next_delay(&self.options.backoff);
            let attempt = shared.retry.attempts;
            shared.status.mode = TrackerMode::RetryPending;
            shared.status.retry_attempts = attempt;
            shared.status.next_retry_ms = Some(delay.as_millis() as u64);
            (attempt, delay)
        };

        self.writer.fail_if_no_fix(err.to_string());
        warn!(
            "Location watch failed ({}), retry {} in {:?}",
            err, attempt, delay
        );
        self.emit(TrackerEvent::RetryScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        delay
    }

    fn lose_permission(&self, err: &SensorError) {
        self.writer.fail(err.to_string());
        {
            let mut shared = self.lock();
            shared.retry.reset();
            shared.status.mode = TrackerMode::PermissionDenied;
            shared.status.retry_attempts = 0;
            shared.status.next_retry_ms = None;
        }
        warn!("Location tracking halted: {}", err);
        self.emit(TrackerEvent::PermissionLost {
            reason: err.to_string(),
        });
    }
}

async fn run_session(
    ctx: Arc<Context>,
    epoch: u64,
    initial: Result<Subscription, SensorError>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut next = initial;

    loop {
        let mut subscription = match next {
            Ok(subscription) => subscription,
            Err(err) if err.is_permission() => {
                ctx.lose_permission(&err);
                return;
            }
            Err(err) => {
                let delay = ctx.schedule_retry(&err);
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => return,
                    _ = sleep(delay) => {}
                }

                ctx.set_mode(TrackerMode::Starting);
                next = tokio::select! {
                    biased;
                    _ = &mut stop_rx => return,
                    result = ctx.establish(epoch) => result,
                };
                continue;
            }
        };

        ctx.watch_started();

        next = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => return,
                event = subscription.next() => match event {
                    Some(Ok(fix)) => ctx.watch_fix(fix),
                    Some(Err(err)) => break Err(err),
                    None => break Err(SensorError::Unavailable("watch closed by sensor".into())),
                },
            }
        };

        // Full teardown before any retry.
        subscription.remove();
    }
}
