use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::{ReconnectTrigger, ResyncBus, ResyncSignal};
use super::collaborators::{ChatHistory, ResourcePrefetcher};
use super::error::CollaboratorError;
use crate::trip::{RideCache, TripPhase, TripPhaseQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycle {
    Active,
    Inactive,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    App(AppLifecycle),
    TransportReconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Prefetch,
    FullResync,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed { error: String },
}

impl ActionOutcome {
    fn from_result<T>(result: &Result<T, CollaboratorError>) -> Self {
        match result {
            Ok(_) => ActionOutcome::Succeeded,
            Err(err) => ActionOutcome::Failed {
                error: err.to_string(),
            },
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResync {
    pub ride_id: String,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconnectReport {
    pub trigger: ReconnectTrigger,
    pub phase: TripPhase,
    pub strategy: RecoveryStrategy,
    pub recovery: ActionOutcome,
    pub chat: Option<ChatResync>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Skipped { trigger: ReconnectTrigger },
    Completed(ReconnectReport),
}

/// Picks the recovery strategy after the app returns to the foreground or
/// the messaging transport reconnects.
pub struct ReconnectCoordinator {
    phases: Arc<dyn TripPhaseQuery>,
    rides: Arc<dyn RideCache>,
    prefetcher: Arc<dyn ResourcePrefetcher>,
    chat: Arc<dyn ChatHistory>,
    bus: ResyncBus,
    skip_next: AtomicBool,
    app_state: StdMutex<AppLifecycle>,
}

impl ReconnectCoordinator {
    pub fn new(
        phases: Arc<dyn TripPhaseQuery>,
        rides: Arc<dyn RideCache>,
        prefetcher: Arc<dyn ResourcePrefetcher>,
        chat: Arc<dyn ChatHistory>,
        bus: ResyncBus,
    ) -> Self {
        Self {
            phases,
            rides,
            prefetcher,
            chat,
            bus,
            skip_next: AtomicBool::new(false),
            app_state: StdMutex::new(AppLifecycle::Active),
        }
    }

    /// Suppresses exactly one upcoming reconnect cycle.
    pub fn skip_next_reconnect(&self) {
        self.skip_next.store(true, Ordering::SeqCst);
    }

    pub async fn on_reconnect(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        if self.skip_next.swap(false, Ordering::SeqCst) {
            info!("Skipping reconnect after {}", trigger);
            return ReconnectOutcome::Skipped { trigger };
        }

        let phase = self.phases.current_phase();
        let ride_id = self.rides.active_ride_id();
        let strategy = if phase.is_active_trip() {
            RecoveryStrategy::FullResync
        } else {
            RecoveryStrategy::Prefetch
        };
        info!(
            "Reconnect after {} in phase {}: {:?}",
            trigger, phase, strategy
        );

        let recover = async {
            match strategy {
                RecoveryStrategy::Prefetch => self.prefetcher.prefetch().await,
                RecoveryStrategy::FullResync => self
                    .bus
                    .signal(ResyncSignal { trigger, phase })
                    .map(|listeners| debug!("Resync signalled to {} subsystems", listeners)),
            }
        };

        let chat = async {
            match &ride_id {
                Some(ride_id) => Some(self.chat.sync_messages(ride_id).await),
                None => None,
            }
        };

        let (recovery, chat) = tokio::join!(recover, chat);

        if let Err(err) = &recovery {
            warn!("Reconnect {:?} failed: {}", strategy, err);
        }

        let chat = ride_id.zip(chat).map(|(ride_id, result)| {
            match &result {
                Ok(count) => debug!("Synced {} chat messages for ride {}", count, ride_id),
                Err(err) => warn!("Chat resync for ride {} failed: {}", ride_id, err),
            }
            ChatResync {
                outcome: ActionOutcome::from_result(&result),
                ride_id,
            }
        });

        ReconnectOutcome::Completed(ReconnectReport {
            trigger,
            phase,
            strategy,
            recovery: ActionOutcome::from_result(&recovery),
            chat,
        })
    }

    /// Maps a lifecycle event to a reconnect, if it warrants one. Only a
    /// move into `Active` from another app state counts as a foreground.
    pub async fn handle(&self, event: LifecycleEvent) -> Option<ReconnectOutcome> {
        let trigger = match event {
            LifecycleEvent::TransportReconnected => ReconnectTrigger::TransportReconnected,
            LifecycleEvent::App(next) => {
                let previous = {
                    let mut current = self
                        .app_state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    std::mem::replace(&mut *current, next)
                };
                if previous == AppLifecycle::Active || next != AppLifecycle::Active {
                    return None;
                }
                ReconnectTrigger::AppForeground
            }
        };

        Some(self.on_reconnect(trigger).await)
    }

    /// Handles lifecycle events in arrival order on a spawned task. Each
    /// event yields exactly one entry on `outcomes`, `None` when it did not
    /// warrant a reconnect.
    pub fn listen(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
        outcomes: mpsc::UnboundedSender<Option<ReconnectOutcome>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let outcome = self.handle(event).await;
                let _ = outcomes.send(outcome);
            }
            debug!("Lifecycle event channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBackend;
    use crate::trip::{ActiveRide, TripPhaseStore};
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        phases: TripPhaseStore,
        rides: ActiveRide,
        backend: Arc<SimulatedBackend>,
        bus: ResyncBus,
        coordinator: Arc<ReconnectCoordinator>,
    }

    fn fixture() -> Fixture {
        let phases = TripPhaseStore::new();
        let rides = ActiveRide::new();
        let backend = Arc::new(SimulatedBackend::new());
        let bus = ResyncBus::new();
        let coordinator = Arc::new(ReconnectCoordinator::new(
            Arc::new(phases.clone()),
            Arc::new(rides.clone()),
            backend.clone(),
            backend.clone(),
            bus.clone(),
        ));
        Fixture {
            phases,
            rides,
            backend,
            bus,
            coordinator,
        }
    }

    fn completed(outcome: ReconnectOutcome) -> ReconnectReport {
        match outcome {
            ReconnectOutcome::Completed(report) => report,
            other => panic!("expected completed reconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_reconnect_prefetches_only() {
        let f = fixture();
        let mut listener = f.bus.subscribe();

        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::AppForeground)
                .await,
        );

        assert_eq!(report.strategy, RecoveryStrategy::Prefetch);
        assert!(report.recovery.is_success());
        assert_eq!(report.chat, None);
        assert_eq!(f.backend.prefetch_calls(), 1);
        assert_eq!(listener.try_recv(), Err(TryRecvError::Empty));
        assert!(f.backend.chat_syncs().is_empty());
    }

    #[tokio::test]
    async fn active_trip_signals_full_resync_and_syncs_chat() {
        let f = fixture();
        let mut listener = f.bus.subscribe();
        f.phases.transition(TripPhase::InProgress);
        f.rides.set("ride-7");

        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::TransportReconnected)
                .await,
        );

        assert_eq!(report.strategy, RecoveryStrategy::FullResync);
        assert_eq!(f.backend.prefetch_calls(), 0);
        assert_eq!(
            listener.try_recv().unwrap(),
            ResyncSignal {
                trigger: ReconnectTrigger::TransportReconnected,
                phase: TripPhase::InProgress,
            }
        );
        assert_eq!(f.backend.chat_syncs(), vec!["ride-7".to_string()]);
        assert_eq!(
            report.chat,
            Some(ChatResync {
                ride_id: "ride-7".into(),
                outcome: ActionOutcome::Succeeded,
            })
        );
    }

    #[tokio::test]
    async fn chat_resync_runs_regardless_of_phase() {
        let f = fixture();
        f.rides.set("ride-9");
        f.phases.transition(TripPhase::Completed);

        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::AppForeground)
                .await,
        );

        assert_eq!(report.strategy, RecoveryStrategy::Prefetch);
        assert_eq!(f.backend.prefetch_calls(), 1);
        assert_eq!(f.backend.chat_syncs(), vec!["ride-9".to_string()]);
    }

    #[tokio::test]
    async fn every_active_phase_takes_full_resync() {
        let f = fixture();
        let _listener = f.bus.subscribe();

        for phase in TripPhase::ALL {
            f.phases.transition(phase);
            let report = completed(
                f.coordinator
                    .on_reconnect(ReconnectTrigger::AppForeground)
                    .await,
            );
            let expected = if phase.is_active_trip() {
                RecoveryStrategy::FullResync
            } else {
                RecoveryStrategy::Prefetch
            };
            assert_eq!(report.strategy, expected, "{phase}");
        }
        assert_eq!(f.backend.prefetch_calls(), 3);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let f = fixture();
        f.rides.set("ride-1");
        f.backend.set_prefetch_failure(true);

        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::AppForeground)
                .await,
        );
        assert!(!report.recovery.is_success());
        assert_eq!(report.chat.map(|c| c.outcome), Some(ActionOutcome::Succeeded));

        f.backend.set_prefetch_failure(false);
        f.backend.set_chat_failure(true);
        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::AppForeground)
                .await,
        );
        assert!(report.recovery.is_success());
        assert!(!report.chat.unwrap().outcome.is_success());
        assert_eq!(f.backend.chat_syncs().len(), 2);
    }

    #[tokio::test]
    async fn resync_without_listeners_still_syncs_chat() {
        let f = fixture();
        f.phases.transition(TripPhase::Matching);
        f.rides.set("ride-3");

        let report = completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::TransportReconnected)
                .await,
        );
        assert_eq!(
            report.recovery,
            ActionOutcome::Failed {
                error: CollaboratorError::NoListeners.to_string()
            }
        );
        assert_eq!(report.chat.map(|c| c.outcome), Some(ActionOutcome::Succeeded));
        assert_eq!(f.backend.prefetch_calls(), 0);
    }

    #[tokio::test]
    async fn skip_flag_suppresses_one_cycle() {
        let f = fixture();
        f.rides.set("ride-5");
        f.coordinator.skip_next_reconnect();

        let outcome = f
            .coordinator
            .on_reconnect(ReconnectTrigger::AppForeground)
            .await;
        assert_eq!(
            outcome,
            ReconnectOutcome::Skipped {
                trigger: ReconnectTrigger::AppForeground
            }
        );
        assert_eq!(f.backend.prefetch_calls(), 0);
        assert!(f.backend.chat_syncs().is_empty());

        completed(
            f.coordinator
                .on_reconnect(ReconnectTrigger::AppForeground)
                .await,
        );
        assert_eq!(f.backend.prefetch_calls(), 1);
        assert_eq!(f.backend.chat_syncs().len(), 1);
    }

    #[tokio::test]
    async fn only_return_to_foreground_triggers() {
        let f = fixture();

        assert_eq!(
            f.coordinator
                .handle(LifecycleEvent::App(AppLifecycle::Active))
                .await,
            None
        );
        assert_eq!(
            f.coordinator
                .handle(LifecycleEvent::App(AppLifecycle::Background))
                .await,
            None
        );
        let outcome = f
            .coordinator
            .handle(LifecycleEvent::App(AppLifecycle::Active))
            .await;
        assert_eq!(
            completed(outcome.unwrap()).trigger,
            ReconnectTrigger::AppForeground
        );

        let outcome = f
            .coordinator
            .handle(LifecycleEvent::TransportReconnected)
            .await;
        assert_eq!(
            completed(outcome.unwrap()).trigger,
            ReconnectTrigger::TransportReconnected
        );
        assert_eq!(f.backend.prefetch_calls(), 2);
    }

    #[tokio::test]
    async fn listener_task_drains_events() {
        let f = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let worker = f.coordinator.clone().listen(rx, outcome_tx);

        tx.send(LifecycleEvent::App(AppLifecycle::Inactive)).unwrap();
        tx.send(LifecycleEvent::App(AppLifecycle::Active)).unwrap();
        tx.send(LifecycleEvent::TransportReconnected).unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(f.backend.prefetch_calls(), 2);
        assert_eq!(outcome_rx.recv().await, Some(None));
        let triggers: Vec<_> = [outcome_rx.recv().await, outcome_rx.recv().await]
            .into_iter()
            .map(|o| completed(o.flatten().unwrap()).trigger)
            .collect();
        assert_eq!(
            triggers,
            vec![
                ReconnectTrigger::AppForeground,
                ReconnectTrigger::TransportReconnected
            ]
        );
        assert_eq!(outcome_rx.recv().await, None);
    }
}
