use serde::Serialize;
use strum_macros::Display;
use tokio::sync::broadcast;

use super::error::CollaboratorError;
use crate::trip::TripPhase;

const BUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconnectTrigger {
    AppForeground,
    TransportReconnected,
}

/// Tells subsystems holding live ride state to refetch it from the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResyncSignal {
    pub trigger: ReconnectTrigger,
    pub phase: TripPhase,
}

/// Broadcast bus for full-resync signals. Location sharing, the trip sheet
/// and the matching view each hold a receiver.
#[derive(Debug, Clone)]
pub struct ResyncBus {
    tx: broadcast::Sender<ResyncSignal>,
}

impl Default for ResyncBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResyncSignal> {
        self.tx.subscribe()
    }

    /// Returns how many subsystems received the signal.
    pub fn signal(&self, signal: ResyncSignal) -> Result<usize, CollaboratorError> {
        self.tx
            .send(signal)
            .map_err(|_| CollaboratorError::NoListeners)
    }
}
