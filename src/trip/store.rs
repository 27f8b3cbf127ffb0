use log::info;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::watch;

use super::phase::TripPhase;

/// Read-only view of the current ride phase.
pub trait TripPhaseQuery: Send + Sync {
    fn current_phase(&self) -> TripPhase;
}

/// Read-only view of the cached active ride.
pub trait RideCache: Send + Sync {
    fn active_ride_id(&self) -> Option<String>;
}

/// Holds the single current phase. Written by ride-event handlers.
#[derive(Debug, Clone)]
pub struct TripPhaseStore {
    tx: Arc<watch::Sender<TripPhase>>,
}

impl Default for TripPhaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TripPhaseStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TripPhase::Idle);
        Self { tx: Arc::new(tx) }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<TripPhase> {
        self.tx.subscribe()
    }

    /// Moves to `phase`, returning the previous one.
    pub fn transition(&self, phase: TripPhase) -> TripPhase {
        let previous = self.tx.send_replace(phase);
        if previous != phase {
            info!("Trip phase {} -> {}", previous, phase);
            if phase.is_terminal() {
                info!("Trip finished as {}", phase);
            }
        }
        previous
    }
}

impl TripPhaseQuery for TripPhaseStore {
    fn current_phase(&self) -> TripPhase {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActiveRide {
    ride_id: Arc<StdMutex<Option<String>>>,
}

impl ActiveRide {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ride_id: impl Into<String>) {
        *self.ride_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(ride_id.into());
    }

    pub fn clear(&self) {
        *self.ride_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl RideCache for ActiveRide {
    fn active_ride_id(&self) -> Option<String> {
        self.ride_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_visible_to_queries() {
        let store = TripPhaseStore::new();
        assert_eq!(store.current_phase(), TripPhase::Idle);

        assert_eq!(store.transition(TripPhase::Matching), TripPhase::Idle);
        assert_eq!(store.transition(TripPhase::InProgress), TripPhase::Matching);
        assert_eq!(store.current_phase(), TripPhase::InProgress);
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let store = TripPhaseStore::new();
        let mut rx = store.subscribe();

        store.transition(TripPhase::DriverEnRoute);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TripPhase::DriverEnRoute);
    }

    #[test]
    fn ride_cache_round_trip() {
        let rides = ActiveRide::new();
        assert_eq!(rides.active_ride_id(), None);
        rides.set("ride-42");
        assert_eq!(rides.active_ride_id().as_deref(), Some("ride-42"));
        rides.clear();
        assert_eq!(rides.active_ride_id(), None);
    }
}
