//! Pool manager error types.

use thiserror::Error;

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("registry error: {0}")]
    State(#[from] stretch_state::StateError),

    #[error("ci error: {0}")]
    Ci(#[from] stretch_ci::CiError),

    #[error("compute error: {0}")]
    Compute(#[from] stretch_compute::ComputeError),

    #[error("lease {0} was taken over by another process")]
    LeaseLost(&'static str),
}

pub type PoolResult<T> = Result<T, PoolError>;
