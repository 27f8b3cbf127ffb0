mod backoff;
mod error;
mod geo;
mod sensor;
mod state;
mod tracker;
mod types;

pub use backoff::Backoff;
pub use error::SensorError;
pub use geo::haversine_distance_m;
#[cfg(test)]
pub use geo::offset_north;
pub use sensor::{LocationSensor, Subscription, WatchEvent};
pub use state::{AddressWriter, LocationState, LocationStore};
#[cfg(test)]
pub use tracker::TrackerMode;
pub use tracker::{PositionTracker, TrackerEvent, TrackerStatus, TrackingOptions};
pub use types::{Accuracy, AddressPoint, LocationFix, PermissionStatus, WatchOptions};
