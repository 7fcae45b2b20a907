//! Error types shared by the tracker, the submitter and the store service.

use thiserror::Error;

use crate::position::LocationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tracking session not found")]
    SessionNotFound,

    #[error("tracking session expired")]
    SessionExpired,

    #[error("malformed session metadata: {0}")]
    MalformedMetadata(String),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("reverse geocoding unavailable: {0}")]
    GeocodingUnavailable(String),

    #[error("store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("store read failed: {0}")]
    StoreReadFailed(String),

    #[error("invalid link: {0}")]
    InvalidLink(String),

    #[error("update feed error: {0}")]
    Feed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
