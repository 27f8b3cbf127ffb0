mod error;
mod generation;
mod geocoder;
mod service;
mod throttle;

pub use error::GeocodeError;
pub use geocoder::{EchoGeocoder, NominatimGeocoder, ReverseGeocoder, DEFAULT_NOMINATIM_URL};
pub use service::{GeocodeService, GeocodeStats};
pub use throttle::DEFAULT_MIN_DISTANCE_M;
