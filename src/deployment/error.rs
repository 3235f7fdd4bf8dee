use thiserror::Error;

use crate::agent::registry::RegistryError;
use crate::tracker::TrackerError;

/// Errors surfaced by deployment operations. The HTTP boundary maps them
/// onto status codes: not-found 404, conflict 409, forbidden 403,
/// bad-request 400, the rest 500.
#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("deployment '{0}' not found")]
    NotFound(String),

    #[error("deployment conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
