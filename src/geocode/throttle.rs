use crate::location::{haversine_distance_m, LocationFix};

pub const DEFAULT_MIN_DISTANCE_M: f64 = 150.0;

/// Slack for haversine rounding: a point built exactly on the threshold
/// comes back a few picometres short.
const DISTANCE_TOLERANCE_M: f64 = 1e-6;

/// Decides which fixes are far enough from the last geocoded one to be
/// worth a reverse-geocode lookup.
#[derive(Debug, Clone)]
pub struct GeocodeThrottle {
    min_distance_m: f64,
    last_geocoded: Option<LocationFix>,
}

impl Default for GeocodeThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DISTANCE_M)
    }
}

impl GeocodeThrottle {
    pub fn new(min_distance_m: f64) -> Self {
        Self {
            min_distance_m,
            last_geocoded: None,
        }
    }

    #[cfg(test)]
    pub fn last_geocoded(&self) -> Option<&LocationFix> {
        self.last_geocoded.as_ref()
    }

    pub fn is_far_enough(&self, distance_m: f64) -> bool {
        distance_m + DISTANCE_TOLERANCE_M >= self.min_distance_m
    }

    /// Returns true and remembers `fix` when a lookup is warranted.
    pub fn accept(&mut self, fix: &LocationFix) -> bool {
        let accepted = match &self.last_geocoded {
            None => true,
            Some(last) => self.is_far_enough(haversine_distance_m(last, fix)),
        };
        if accepted {
            self.last_geocoded = Some(*fix);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::offset_north;

    fn origin() -> LocationFix {
        LocationFix::new(-26.2041, 28.0473)
    }

    #[test]
    fn first_fix_is_always_accepted() {
        let mut throttle = GeocodeThrottle::default();
        assert!(throttle.accept(&origin()));
        assert_eq!(throttle.last_geocoded(), Some(&origin()));
    }

    #[test]
    fn threshold_is_inclusive() {
        let throttle = GeocodeThrottle::default();
        assert!(throttle.is_far_enough(150.0));
        assert!(!throttle.is_far_enough(149.9));
    }

    #[test]
    fn exact_threshold_is_accepted_through_accept() {
        let mut throttle = GeocodeThrottle::default();
        throttle.accept(&origin());

        assert!(!throttle.accept(&offset_north(&origin(), 149.9)));
        let boundary = offset_north(&origin(), 150.0);
        assert!(throttle.accept(&boundary));
        assert_eq!(throttle.last_geocoded(), Some(&boundary));
    }

    #[test]
    fn nearby_fixes_are_rejected_without_moving_anchor() {
        let mut throttle = GeocodeThrottle::default();
        throttle.accept(&origin());

        assert!(!throttle.accept(&origin()));
        assert!(!throttle.accept(&offset_north(&origin(), 149.9)));
        assert_eq!(throttle.last_geocoded(), Some(&origin()));

        let far = offset_north(&origin(), 150.01);
        assert!(throttle.accept(&far));
        assert_eq!(throttle.last_geocoded(), Some(&far));
    }

    #[test]
    fn distance_is_measured_from_last_accepted_fix() {
        let mut throttle = GeocodeThrottle::default();
        let mut accepted = 0;
        let mut fix = origin();
        // 20 steps of 100 m: every second step crosses the threshold.
        for _ in 0..20 {
            if throttle.accept(&fix) {
                accepted += 1;
            }
            fix = offset_north(&fix, 100.0);
        }
        assert_eq!(accepted, 10);
    }
}
