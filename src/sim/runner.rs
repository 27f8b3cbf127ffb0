use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use super::collaborators::SimulatedBackend;
use super::parser::{
    AppCommand, CollaboratorsCommand, Command, ReconnectCommand, Scenario, SensorCommand,
    TrackerCommand, TransportCommand, TripCommand,
};
use super::sensor::{SensorStats, SimulatedSensor};
use crate::config::Config;
use crate::geocode::{GeocodeError, GeocodeService, GeocodeStats};
use crate::location::{
    LocationState, LocationStore, PermissionStatus, PositionTracker, TrackerEvent, TrackerStatus,
};
use crate::reconnect::{
    AppLifecycle, LifecycleEvent, ReconnectCoordinator, ReconnectOutcome, ResyncBus,
};
use crate::trip::{ActiveRide, TripPhase, TripPhaseQuery, TripPhaseStore};

const RESYNC_SUBSYSTEMS: [&str; 3] = ["location_sharing", "trip_sheet", "matching"];

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("geocoder setup failed: {0}")]
    Geocoder(#[from] GeocodeError),
}

type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub location: LocationState,
    pub tracker: TrackerStatus,
    pub sensor: SensorStats,
    pub phase: TripPhase,
    pub geocode: GeocodeStats,
    pub reconnects: Vec<ReconnectOutcome>,
    pub resync_deliveries: Vec<String>,
    pub prefetch_calls: usize,
    pub chat_syncs: Vec<String>,
    pub tracker_events: Vec<TrackerEvent>,
}

pub struct Runner {
    pub scenario: Scenario,
    pub config: Config,
}

type Collected<T> = Arc<StdMutex<Vec<T>>>;

fn take<T: Clone>(collected: &Collected<T>) -> Vec<T> {
    collected
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

impl Runner {
    pub async fn run(self) -> RunnerResult<RunSummary> {
        let sensor = Arc::new(SimulatedSensor::new());
        let store = LocationStore::new();
        let tracker = PositionTracker::new(
            sensor.clone(),
            store.position_writer(),
            self.config.tracking.options(),
        );

        let geocode = GeocodeService::new(
            self.config.geocode.build_geocoder()?,
            store.address_writer(),
            self.config.geocode.min_distance_m,
        );
        let geocode_worker = geocode.spawn(store.subscribe());

        let phases = TripPhaseStore::new();
        let rides = ActiveRide::new();
        let backend = Arc::new(SimulatedBackend::new());
        let bus = ResyncBus::new();
        let deliveries: Collected<String> = Arc::default();
        let listeners = spawn_resync_listeners(&bus, &deliveries);
        let coordinator = Arc::new(ReconnectCoordinator::new(
            Arc::new(phases.clone()),
            Arc::new(rides.clone()),
            backend.clone(),
            backend.clone(),
            bus,
        ));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let lifecycle_worker = coordinator.clone().listen(lifecycle_rx, outcome_tx);

        let events: Collected<TrackerEvent> = Arc::default();
        let collector = {
            let mut rx = tracker.subscribe_events();
            let events = events.clone();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    events
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event);
                }
            })
        };

        let started = Instant::now();
        let started_wall = Utc::now();
        let mut reconnects = Vec::new();

        for (i, step) in self.scenario.steps.iter().enumerate() {
            if let Some(time) = &step.time {
                sleep_until(time.deadline(started, started_wall)).await;
            }
            info!("step {}: {}", i, step.command.name());

            match &step.command {
                Command::Sensor(command) => apply_sensor(&sensor, command),
                Command::Tracker(TrackerCommand::Start) => tracker.start_watching().await,
                Command::Tracker(TrackerCommand::Stop) => tracker.stop_watching().await,
                Command::Tracker(TrackerCommand::Refresh) => tracker.refresh_location().await,
                Command::Tracker(TrackerCommand::RequestPermission) => {
                    let granted = tracker.request_permission().await;
                    info!("Location permission granted: {}", granted);
                }
                Command::Trip(TripCommand::SetPhase { phase }) => {
                    phases.transition(*phase);
                }
                Command::Trip(TripCommand::SetRide { ride_id }) => rides.set(ride_id.clone()),
                Command::Trip(TripCommand::ClearRide) => rides.clear(),
                Command::App(command) => {
                    let state = match command {
                        AppCommand::Foreground => AppLifecycle::Active,
                        AppCommand::Inactive => AppLifecycle::Inactive,
                        AppCommand::Background => AppLifecycle::Background,
                    };
                    let event = LifecycleEvent::App(state);
                    reconnects.extend(dispatch(&lifecycle_tx, &mut outcome_rx, event).await);
                }
                Command::Transport(TransportCommand::Reconnected) => {
                    let event = LifecycleEvent::TransportReconnected;
                    reconnects.extend(dispatch(&lifecycle_tx, &mut outcome_rx, event).await);
                }
                Command::Reconnect(ReconnectCommand::SkipNext) => coordinator.skip_next_reconnect(),
                Command::Collaborators(CollaboratorsCommand::Set {
                    fail_prefetch,
                    fail_chat,
                }) => {
                    if let Some(fail) = fail_prefetch {
                        backend.set_prefetch_failure(*fail);
                    }
                    if let Some(fail) = fail_chat {
                        backend.set_chat_failure(*fail);
                    }
                }
            }
        }

        if let Ok(settle) = self.scenario.settle.to_std() {
            sleep(settle).await;
        }

        drop(lifecycle_tx);
        let _ = lifecycle_worker.await;

        tracker.stop_watching().await;
        let tracker_status = tracker.status();
        // Dropping the tracker closes its event channel and ends the collector.
        drop(tracker);
        let _ = collector.await;
        geocode_worker.abort();
        for listener in listeners {
            listener.abort();
        }

        Ok(RunSummary {
            location: store.snapshot(),
            tracker: tracker_status,
            sensor: sensor.stats(),
            phase: phases.current_phase(),
            geocode: geocode.stats(),
            reconnects,
            resync_deliveries: take(&deliveries),
            prefetch_calls: backend.prefetch_calls(),
            chat_syncs: backend.chat_syncs(),
            tracker_events: take(&events),
        })
    }
}

fn apply_sensor(sensor: &SimulatedSensor, command: &SensorCommand) {
    match command {
        SensorCommand::Fix(fix) => {
            if sensor.emit_fix(*fix) == 0 {
                warn!("No active watch, fix dropped");
            }
        }
        SensorCommand::Error { kind, message } => {
            if sensor.emit_error(kind.to_error(message.as_deref())) == 0 {
                warn!("No active watch, sensor error dropped");
            }
        }
        SensorCommand::SetPermission { granted } => sensor.set_permission(if *granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }),
        SensorCommand::SetLastKnown(fix) => sensor.set_last_known(Some(*fix)),
        SensorCommand::SetCurrent(fix) => sensor.set_current(Ok(*fix)),
        SensorCommand::SetPermissionLatency { latency } => {
            sensor.set_permission_latency((!latency.is_zero()).then_some(*latency))
        }
        SensorCommand::FailWatch { kind, message } => {
            sensor.set_watch_failure(Some(kind.to_error(message.as_deref())))
        }
        SensorCommand::RestoreWatch => sensor.set_watch_failure(None),
    }
}

/// Hands `event` to the coordinator's listener and waits for its verdict, so
/// later steps observe the reconnect's effects.
async fn dispatch(
    events: &mpsc::UnboundedSender<LifecycleEvent>,
    outcomes: &mut mpsc::UnboundedReceiver<Option<ReconnectOutcome>>,
    event: LifecycleEvent,
) -> Option<ReconnectOutcome> {
    if events.send(event).is_err() {
        warn!("Lifecycle listener is gone, dropping {:?}", event);
        return None;
    }
    outcomes.recv().await.flatten()
}

fn spawn_resync_listeners(bus: &ResyncBus, deliveries: &Collected<String>) -> Vec<JoinHandle<()>> {
    RESYNC_SUBSYSTEMS
        .iter()
        .map(|name| {
            let mut rx = bus.subscribe();
            let deliveries = deliveries.clone();
            tokio::spawn(async move {
                while let Ok(signal) = rx.recv().await {
                    info!(
                        "{} refetching server state after {} ({})",
                        name, signal.trigger, signal.phase
                    );
                    deliveries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(name.to_string());
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::TrackerMode;
    use crate::reconnect::RecoveryStrategy;
    use std::time::Duration;

    async fn run(yaml: &str) -> RunSummary {
        let runner = Runner {
            scenario: Scenario::from_str(yaml).unwrap(),
            config: Config::default(),
        };
        runner.run().await.unwrap()
    }

    fn report(outcome: &ReconnectOutcome) -> &crate::reconnect::ReconnectReport {
        match outcome {
            ReconnectOutcome::Completed(report) => report,
            other => panic!("expected completed reconnect, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ride_in_progress_end_to_end() {
        let summary = run(r#"
settle: 1s
steps:
  - tracker: { action: start }
  - sensor: { action: fix, latitude: -26.2041, longitude: 28.0473 }
  - time: T+1s
    sensor: { action: fix, latitude: -26.20274832, longitude: 28.0473 }
  - time: T+2s
    sensor: { action: fix, latitude: -26.20265839, longitude: 28.0473 }
  - trip: { action: set_phase, phase: in_progress }
  - trip: { action: set_ride, ride_id: ride-7 }
  - app: { action: background }
  - time: T+3s
    app: { action: foreground }
  - trip: { action: set_phase, phase: completed }
  - transport: { action: reconnected }
"#)
        .await;

        assert_eq!(summary.geocode.issued, 2);
        assert_eq!(summary.location.revision, 3);
        assert_eq!(
            summary.location.address.as_ref().and_then(|a| a.address.as_deref()),
            Some("-26.20275, 28.04730")
        );

        assert_eq!(summary.reconnects.len(), 2);
        let foreground = report(&summary.reconnects[0]);
        assert_eq!(foreground.strategy, RecoveryStrategy::FullResync);
        assert_eq!(
            foreground.chat.as_ref().map(|c| c.ride_id.as_str()),
            Some("ride-7")
        );
        let transport = report(&summary.reconnects[1]);
        assert_eq!(transport.strategy, RecoveryStrategy::Prefetch);

        assert_eq!(summary.resync_deliveries.len(), 3);
        assert_eq!(summary.prefetch_calls, 1);
        assert_eq!(summary.chat_syncs, vec!["ride-7", "ride-7"]);
        assert_eq!(summary.phase, TripPhase::Completed);
        assert_eq!(summary.tracker.mode, TrackerMode::Idle);
        assert_eq!(summary.sensor.watch_calls, 1);
        assert_eq!(summary.sensor.active_watches, 0);
        assert!(summary
            .tracker_events
            .iter()
            .any(|e| matches!(e, TrackerEvent::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_permission_end_to_end() {
        let summary = run(r#"
steps:
  - sensor: { action: set_permission, granted: false }
  - tracker: { action: start }
  - time: T+1m
    reconnect: { action: skip_next }
  - app: { action: background }
  - app: { action: foreground }
"#)
        .await;

        assert!(!summary.location.loading);
        assert!(summary.location.error.is_some());
        assert_eq!(summary.tracker.mode, TrackerMode::PermissionDenied);
        assert!(!summary
            .tracker_events
            .iter()
            .any(|e| matches!(e, TrackerEvent::RetryScheduled { .. })));
        assert!(matches!(
            summary.reconnects.as_slice(),
            [ReconnectOutcome::Skipped { .. }]
        ));
        assert_eq!(summary.prefetch_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_outage_retries_until_recovery() {
        let summary = run(r#"
settle: 10s
steps:
  - sensor: { action: set_current, latitude: 1.0, longitude: 1.0 }
  - tracker: { action: start }
  - sensor: { action: error, kind: unavailable }
"#)
        .await;

        let delays: Vec<_> = summary
            .tracker_events
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![2000]);
        assert_eq!(
            summary
                .tracker_events
                .iter()
                .filter(|e| matches!(e, TrackerEvent::WatchStarted))
                .count(),
            2
        );
        assert_eq!(summary.location.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_follow_the_scenario_timeline() {
        let started = Instant::now();
        run(r#"
settle: 500ms
steps:
  - time: T+1s
    tracker: { action: refresh }
  - time: T+3s
    tracker: { action: refresh }
  - time: T+2s
    tracker: { action: refresh }
"#)
        .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_watch_creation_recovers_after_restore() {
        let summary = run(r#"
settle: 3s
steps:
  - sensor: { action: fail_watch, kind: timeout }
  - tracker: { action: start }
  - time: T+1s
    sensor: { action: restore_watch }
"#)
        .await;

        assert_eq!(summary.sensor.watch_calls, 2);
        assert_eq!(summary.sensor.active_watches, 0);
        assert_eq!(
            summary.sensor.last_watch_options.map(|o| o.accuracy),
            Some(crate::location::Accuracy::High)
        );
        let retries = summary
            .tracker_events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::RetryScheduled { delay_ms: 2000, .. }))
            .count();
        assert_eq!(retries, 1);
        assert!(summary
            .tracker_events
            .iter()
            .any(|e| matches!(e, TrackerEvent::WatchStarted)));
    }
}
