use async_trait::async_trait;

use super::error::CollaboratorError;

/// Refreshes cached reference data (fares, ride configuration).
#[async_trait]
pub trait ResourcePrefetcher: Send + Sync {
    async fn prefetch(&self) -> Result<(), CollaboratorError>;
}

/// Chat message history for a ride.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// Returns the number of messages pulled from the server.
    async fn sync_messages(&self, ride_id: &str) -> Result<usize, CollaboratorError>;
}
