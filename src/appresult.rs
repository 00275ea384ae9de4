use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};

use crate::{notice::Notice, PeerError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        use PeerError::*;
        match self.0.downcast_ref::<PeerError>() {
            Some(Validation(_) | EmptyContent) => StatusCode::BAD_REQUEST,
            Some(Unauthenticated) => StatusCode::UNAUTHORIZED,
            Some(Forbidden(_)) => StatusCode::FORBIDDEN,
            Some(NotFound(_)) => StatusCode::NOT_FOUND,
            Some(DuplicateIdentity) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn notice(&self) -> Notice {
        match self.0.downcast_ref::<PeerError>() {
            Some(err) if self.status().is_client_error() => Notice::error(err.title(), err.to_string()),
            _ => Notice::error("Something went wrong", "An unexpected error occurred"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}\n\n{}", self.0, self.0.backtrace());
        }

        (status, Json(self.notice())).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
