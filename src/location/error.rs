use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location permission revoked")]
    PermissionRevoked,
    #[error("location provider unavailable: {0}")]
    Unavailable(String),
    #[error("location request timed out")]
    Timeout,
    #[error("sensor error: {0}")]
    Other(String),
}

impl SensorError {
    /// Permission failures are terminal for the watch session.
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            SensorError::PermissionDenied | SensorError::PermissionRevoked
        )
    }
}
