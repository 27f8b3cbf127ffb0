use super::types::LocationFix;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two fixes in meters.
pub fn haversine_distance_m(from: &LocationFix, to: &LocationFix) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlat = (to.latitude - from.latitude).to_radians();
    let dlon = (to.longitude - from.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Fix displaced due north by `meters` along the meridian.
#[cfg(test)]
pub fn offset_north(fix: &LocationFix, meters: f64) -> LocationFix {
    let dlat = (meters / EARTH_RADIUS_M).to_degrees();
    LocationFix::new(fix.latitude + dlat, fix.longitude)
}
