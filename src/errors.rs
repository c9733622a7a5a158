use std::io;

use thiserror::Error;

use crate::codec::DecodeError;
use crate::geocode::GeocodeError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Geocode(#[from] GeocodeError),
}

impl AppError {
    /// Errors worth retrying at the I/O boundary instead of aborting a worker.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Io(_) | AppError::Database(_) | AppError::Broker(_) => true,
            AppError::Geocode(err) => err.is_transient(),
            _ => false,
        }
    }
}
