use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::location::{
    Accuracy, LocationFix, LocationSensor, PermissionStatus, SensorError, Subscription,
    WatchEvent, WatchOptions,
};

#[derive(Debug)]
struct SensorState {
    permission: PermissionStatus,
    permission_latency: Option<Duration>,
    last_known: Option<LocationFix>,
    current: Result<LocationFix, SensorError>,
    watch_failure: Option<SensorError>,
    watchers: Vec<(u64, mpsc::UnboundedSender<WatchEvent>)>,
    next_watch_id: u64,
    watch_calls: usize,
    last_watch_options: Option<WatchOptions>,
}

/// Watch bookkeeping reported at the end of a scenario run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStats {
    pub active_watches: usize,
    pub watch_calls: usize,
    pub last_watch_options: Option<WatchOptions>,
}

/// Scriptable stand-in for the device sensor. Fixes and errors are pushed
/// into every live watch by the caller.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    state: Arc<StdMutex<SensorState>>,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(SensorState {
                permission: PermissionStatus::Granted,
                permission_latency: None,
                last_known: None,
                current: Err(SensorError::Unavailable("no fix available".into())),
                watch_failure: None,
                watchers: Vec::new(),
                next_watch_id: 0,
                watch_calls: 0,
                last_watch_options: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_permission(&self, permission: PermissionStatus) {
        self.lock().permission = permission;
    }

    pub fn set_permission_latency(&self, latency: Option<Duration>) {
        self.lock().permission_latency = latency;
    }

    pub fn set_last_known(&self, fix: Option<LocationFix>) {
        self.lock().last_known = fix;
    }

    pub fn set_current(&self, result: Result<LocationFix, SensorError>) {
        self.lock().current = result;
    }

    pub fn set_watch_failure(&self, failure: Option<SensorError>) {
        self.lock().watch_failure = failure;
    }

    /// Delivers `fix` to every live watch; returns how many received it.
    pub fn emit_fix(&self, fix: LocationFix) -> usize {
        self.broadcast(Ok(fix))
    }

    pub fn emit_error(&self, err: SensorError) -> usize {
        self.broadcast(Err(err))
    }

    pub fn active_watches(&self) -> usize {
        self.lock().watchers.len()
    }

    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        self.lock().last_watch_options
    }

    pub fn stats(&self) -> SensorStats {
        SensorStats {
            active_watches: self.active_watches(),
            watch_calls: self.watch_calls(),
            last_watch_options: self.last_watch_options(),
        }
    }

    fn broadcast(&self, event: WatchEvent) -> usize {
        let mut state = self.lock();
        state
            .watchers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        state.watchers.len()
    }
}

#[async_trait]
impl LocationSensor for SimulatedSensor {
    async fn request_foreground_permission(&self) -> PermissionStatus {
        let latency = self.lock().permission_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.lock().permission
    }

    async fn last_known_position(&self) -> Result<Option<LocationFix>, SensorError> {
        Ok(self.lock().last_known)
    }

    async fn current_position(&self, _accuracy: Accuracy) -> Result<LocationFix, SensorError> {
        self.lock().current.clone()
    }

    fn watch_position(&self, options: WatchOptions) -> Result<Subscription, SensorError> {
        let mut state = self.lock();
        state.watch_calls += 1;
        state.last_watch_options = Some(options);
        if let Some(err) = state.watch_failure.clone() {
            return Err(err);
        }

        let id = state.next_watch_id;
        state.next_watch_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push((id, tx));
        drop(state);

        let registry = self.state.clone();
        Ok(Subscription::new(rx, move || {
            let mut state = registry.lock().unwrap_or_else(PoisonError::into_inner);
            state.watchers.retain(|(watch_id, _)| *watch_id != id);
        }))
    }
}
