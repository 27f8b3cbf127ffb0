use log::{debug, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::error::GeocodeError;
use super::generation::{Generation, Ticket};
use super::geocoder::ReverseGeocoder;
use super::throttle::GeocodeThrottle;
use crate::location::{AddressPoint, AddressWriter, LocationFix, LocationState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub issued: u64,
    pub committed: u64,
    pub discarded: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct ThrottleState {
    throttle: GeocodeThrottle,
    generation: Generation,
    stats: GeocodeStats,
}

struct Inner {
    geocoder: Arc<dyn ReverseGeocoder>,
    writer: AddressWriter,
    state: StdMutex<ThrottleState>,
}

/// Turns the location stream into reverse-geocode lookups at a throttled
/// cadence and commits only the newest lookup's result.
#[derive(Clone)]
pub struct GeocodeService {
    inner: Arc<Inner>,
}

impl GeocodeService {
    pub fn new(
        geocoder: Arc<dyn ReverseGeocoder>,
        writer: AddressWriter,
        min_distance_m: f64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                geocoder,
                writer,
                state: StdMutex::new(ThrottleState {
                    throttle: GeocodeThrottle::new(min_distance_m),
                    generation: Generation::new(),
                    stats: GeocodeStats::default(),
                }),
            }),
        }
    }

    pub fn stats(&self) -> GeocodeStats {
        self.inner.lock().stats
    }

    #[cfg(test)]
    pub fn current_generation(&self) -> u64 {
        self.inner.lock().generation.current()
    }

    /// Feeds one fix through the throttle; spawns a lookup when accepted.
    pub fn observe(&self, fix: LocationFix) -> Option<Ticket> {
        let ticket = {
            let mut state = self.inner.lock();
            if !state.throttle.accept(&fix) {
                return None;
            }
            state.stats.issued += 1;
            state.generation.advance()
        };

        debug!(
            "Geocoding {}, {} (generation {})",
            fix.latitude,
            fix.longitude,
            ticket.value()
        );
        self.inner.writer.begin_lookup();

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.lookup(ticket, fix).await });
        Some(ticket)
    }

    /// Follows the location store, feeding every newly published fix.
    pub fn spawn(&self, mut locations: watch::Receiver<LocationState>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut seen_revision = 0;
            loop {
                let fix = {
                    let state = locations.borrow_and_update();
                    if state.revision != seen_revision {
                        seen_revision = state.revision;
                        state.location
                    } else {
                        None
                    }
                };

                if let Some(fix) = fix {
                    service.observe(fix);
                }

                if locations.changed().await.is_err() {
                    debug!("Location store closed, geocoding stopped");
                    break;
                }
            }
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lookup(&self, ticket: Ticket, fix: LocationFix) {
        let result = self
            .geocoder
            .reverse_geocode(fix.latitude, fix.longitude)
            .await;

        let mut state = self.lock();
        if !state.generation.is_current(ticket) {
            state.stats.discarded += 1;
            debug!(
                "Discarding geocode result for generation {} (current {})",
                ticket.value(),
                state.generation.current()
            );
            return;
        }

        let address = match result {
            Ok(label) => Some(label),
            Err(GeocodeError::NotFound { .. }) => None,
            Err(err) => {
                state.stats.failed += 1;
                warn!("Reverse geocode failed: {}", err);
                self.writer.lookup_failed();
                return;
            }
        };

        state.stats.committed += 1;
        self.writer.commit(AddressPoint {
            address,
            latitude: fix.latitude,
            longitude: fix.longitude,
        });
    }
}
