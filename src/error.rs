use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ActilogError>;

#[derive(Debug, Error)]
pub enum ActilogError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Store failures are fatal and retryable by the caller; the engine
    /// never retries internally.
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for ActilogError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for ActilogError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ActilogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for ActilogError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for ActilogError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Serialization(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
