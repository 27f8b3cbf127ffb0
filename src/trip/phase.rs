use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Where the current ride stands. Variants are declared in lifecycle order.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TripPhase {
    #[default]
    Idle,
    Matching,
    DriverEnRoute,
    DriverArrived,
    WaitingTimeout,
    InProgress,
    Completed,
    Cancelled,
}

impl TripPhase {
    #[cfg(test)]
    pub const ALL: [TripPhase; 8] = [
        TripPhase::Idle,
        TripPhase::Matching,
        TripPhase::DriverEnRoute,
        TripPhase::DriverArrived,
        TripPhase::WaitingTimeout,
        TripPhase::InProgress,
        TripPhase::Completed,
        TripPhase::Cancelled,
    ];

    /// Matching through in-progress, inclusive.
    pub fn is_active_trip(self) -> bool {
        (TripPhase::Matching..=TripPhase::InProgress).contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TripPhase::Completed | TripPhase::Cancelled)
    }
}
