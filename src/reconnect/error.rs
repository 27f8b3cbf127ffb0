use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("no subsystem is listening for resync signals")]
    NoListeners,
}
