//! Compute provisioner error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

pub type ComputeResult<T> = Result<T, ComputeError>;
