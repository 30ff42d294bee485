//! CI client error types.

use thiserror::Error;

/// Errors returned by the CI agent-pool API.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("invalid response: {0}")]
    Decode(String),
}

pub type CiResult<T> = Result<T, CiError>;
