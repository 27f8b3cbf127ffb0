mod bus;
mod collaborators;
mod coordinator;
mod error;

pub use bus::ResyncBus;
pub use collaborators::{ChatHistory, ResourcePrefetcher};
#[cfg(test)]
pub use coordinator::{ReconnectReport, RecoveryStrategy};
pub use coordinator::{
    AppLifecycle, LifecycleEvent, ReconnectCoordinator, ReconnectOutcome,
};
pub use error::CollaboratorError;
