//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::error;

use crate::locking::LockTimeout;
use crate::paths::StorageError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    TooManyRequests(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "too many requests").into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound("not found".into()),
            ErrorKind::AlreadyExists => ApiError::Conflict("already exists".into()),
            ErrorKind::NotADirectory => ApiError::BadRequest("not a directory".into()),
            ErrorKind::IsADirectory => ApiError::BadRequest("is a directory".into()),
            ErrorKind::DirectoryNotEmpty => ApiError::Conflict("directory not empty".into()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => err.into(),
        }
    }
}

impl From<LockTimeout> for ApiError {
    fn from(_: LockTimeout) -> Self {
        ApiError::Conflict("path locked".into())
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            UploadError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            UploadError::NotFound => ApiError::NotFound("upload not found".into()),
            UploadError::Busy => ApiError::Conflict("upload session busy".into()),
            UploadError::AlreadyMerging => ApiError::Conflict("upload is being merged".into()),
            UploadError::QueueFull(retry_after) => ApiError::TooManyRequests(retry_after),
            UploadError::Io(err) => err.into(),
        }
    }
}
