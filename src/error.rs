//! Contains the error type returned by every endpoint, so clients
//! always receive a consistent status code and json body.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use log::error;
use serde::Serialize;

/// Errors surfaced to http clients
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// A unique key (e.g. a username) is already taken
    #[error("{0}")]
    Conflict(String),
    /// Bad credentials; never says whether the username or the password was wrong
    #[error("invalid credentials")]
    Unauthorized,
    /// A referenced package or agent does not exist, or an agent has nothing pending
    #[error("{0}")]
    NotFound(String),
    /// The package already has a delivery record
    #[error("package {0} has already been delivered")]
    AlreadyDelivered(String),
    /// The request was malformed, e.g. a missing form field
    #[error("{0}")]
    BadRequest(String),
    /// An uploaded form field went over its size limit
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Any other persistence or io failure. Only a contextual message is
    /// returned, the underlying error is logged.
    #[error("{0}")]
    Internal(String),
}

impl HttpError {
    /// Log `err` and wrap it in an [`HttpError::Internal`] carrying only `context`
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, err);
        HttpError::Internal(context.to_owned())
    }
}

#[derive(Debug, Serialize)]
struct ErrorMessage {
    detail: String,
}

impl ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        match self {
            HttpError::Conflict(_) => StatusCode::BAD_REQUEST,
            HttpError::Unauthorized => StatusCode::UNAUTHORIZED,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::AlreadyDelivered(_) => StatusCode::BAD_REQUEST,
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorMessage {
            detail: self.to_string(),
        })
    }
}

impl From<actix_multipart::MultipartError> for HttpError {
    fn from(e: actix_multipart::MultipartError) -> Self {
        HttpError::BadRequest(format!("invalid multipart form: {}", e))
    }
}
