use axum::response::{IntoResponse, Response};
use http::StatusCode;

#[derive(Debug)]
pub enum AppError {
    StreamNotFound(String),
    StreamAlreadyExists(String),
    Unauthorized(String),
    BadRequest(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn stream_not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::StreamNotFound(t.to_string())
    }

    pub fn unauthorized<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Unauthorized(t.to_string())
    }

    pub fn bad_request<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::BadRequest(t.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::StreamNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("stream not found: {id}")).into_response()
            }
            AppError::StreamAlreadyExists(id) => {
                (StatusCode::CONFLICT, format!("stream already exists: {id}")).into_response()
            }
            AppError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err).into_response(),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
