use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;
use crate::store::StoreError;

/// Body of every error response.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum BannerError {
    #[error("invalid request: {0}")]
    BadInput(String),
    #[error("banner not found")]
    NotFound,
    #[error("feature/tag already assigned")]
    Conflict,

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("forbidden")]
    Forbidden,
    #[error("failed to issue token: {0}")]
    TokenIssuing(#[source] AuthError),

    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error("banner {0} has no feature/tag assignments")]
    MissingAssignments(i64),
    #[error("failed to parse banner content: {0}")]
    ContentParsing(#[source] serde_json::Error),
    #[error("failed to serialize banner content: {0}")]
    ContentSerialization(#[source] serde_json::Error),
    #[error("rollback failed ({rollback}) after: {source}")]
    RollbackFailed {
        source: Box<BannerError>,
        rollback: StoreError,
    },
}

/// Store failures are internal unless they carry a meaning of their own.
impl From<StoreError> for BannerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => BannerError::NotFound,
            StoreError::UniqueViolation(_) => BannerError::Conflict,
            other => BannerError::Store(other),
        }
    }
}

impl BannerError {
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BannerError::BadInput(_) => StatusCode::BAD_REQUEST,
            BannerError::NotFound => StatusCode::NOT_FOUND,
            BannerError::Conflict => StatusCode::CONFLICT,
            BannerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BannerError::Forbidden => StatusCode::FORBIDDEN,
            BannerError::Store(_)
            | BannerError::TokenIssuing(_)
            | BannerError::MissingAssignments(_)
            | BannerError::ContentParsing(_)
            | BannerError::ContentSerialization(_)
            | BannerError::RollbackFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BannerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_internal() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("request rejected: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
