//! Error taxonomy of the HTTP boundary.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::agent::registry::RegistryError;
use crate::container::ContainerClientError;
use crate::deployment::error::DeploymentError;
use crate::tracker::TrackerError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    /// Unexpected failures surface a generic message; the detail is logged.
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        error!(%err, "internal error on HTTP boundary");
        ApiError::Internal
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

impl From<DeploymentError> for ApiError {
    fn from(err: DeploymentError) -> Self {
        match err {
            DeploymentError::NotFound(msg) => ApiError::NotFound(msg),
            DeploymentError::Conflict(msg) => ApiError::Conflict(msg),
            DeploymentError::Forbidden(msg) => ApiError::Forbidden(msg),
            DeploymentError::BadRequest(msg) => ApiError::BadRequest(msg),
            DeploymentError::Registry(err) => err.into(),
            DeploymentError::Tracker(err) => err.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(msg) => ApiError::NotFound(msg),
            RegistryError::Ambiguous(..) => ApiError::BadRequest(err.to_string()),
            RegistryError::AlreadyRegistered(_) | RegistryError::PortInUse { .. } => {
                ApiError::Conflict(err.to_string())
            }
            RegistryError::MissingToken(_) => ApiError::BadRequest(err.to_string()),
            RegistryError::Token(_) | RegistryError::Store(_) => ApiError::internal(err),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        ApiError::internal(err)
    }
}

impl From<ContainerClientError> for ApiError {
    fn from(err: ContainerClientError) -> Self {
        match err {
            ContainerClientError::NotFound(name) => {
                ApiError::NotFound(format!("container '{name}' not found"))
            }
            other => ApiError::internal(other),
        }
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = ApiError::internal("database exploded at /secret/path");
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn deployment_errors_map_onto_the_taxonomy() {
        assert_eq!(
            ApiError::from(DeploymentError::Conflict("busy".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(DeploymentError::Forbidden("scope".into())).status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
