mod phase;
mod store;

pub use phase::TripPhase;
pub use store::{ActiveRide, RideCache, TripPhaseQuery, TripPhaseStore};
