use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient capacity: {0}")]
    Capacity(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}
