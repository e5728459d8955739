//! Remote sync API boundary.

mod http;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OutboxEntry, RecordId, RemoteRecord};

pub use http::HttpRemoteGateway;

/// Normalized failure of a remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection failure or timeout; nothing reached the server (or no answer came back)
    #[error("network error: {0}")]
    Network(String),
    /// The bearer credential was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Remote state diverged from the mutation's expectations
    #[error("conflict ({status}): {message}")]
    Conflict { status: u16, message: String },
    /// Server-side or rate-limit failure
    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },
    /// The remote permanently rejected the request
    #[error("request rejected ({status}): {message}")]
    ClientError { status: u16, message: String },
    /// A successful status carried a body that could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Build the error for a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = status.as_u16();
        match classify_status(status) {
            ErrorClass::Auth => Self::Unauthorized(message),
            ErrorClass::Conflict => Self::Conflict {
                status: code,
                message,
            },
            ErrorClass::Transient => Self::ServerError {
                status: code,
                message,
            },
            ErrorClass::Permanent => Self::ClientError {
                status: code,
                message,
            },
        }
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::ServerError { .. } | Self::InvalidResponse(_)
        )
    }

    /// Stable short name used in logs and the `sync_errors` table.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict { .. } => "conflict",
            Self::ServerError { .. } => "server_error",
            Self::ClientError { .. } => "client_error",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Auth,
    Conflict,
    Transient,
    Permanent,
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ErrorClass::Auth
    } else if matches!(
        status,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
    ) {
        ErrorClass::Conflict
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Remote acknowledgement of a pushed mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Server-side acknowledgement time, when reported
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// One incremental page of remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullBatch {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    #[serde(default)]
    pub deleted_ids: Vec<RecordId>,
    /// Server watermark for the next incremental pull
    pub last_sync_at: DateTime<Utc>,
}

/// Transport for pushing outbox entries and pulling remote changes.
pub trait RemoteGateway: Send + Sync + 'static {
    /// Replay one outbox entry against the remote.
    fn push(
        &self,
        entry: &OutboxEntry,
    ) -> impl Future<Output = Result<PushAck, RemoteError>> + Send;

    /// Fetch changes after `since` (everything when `None`).
    fn pull(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<PullBatch, RemoteError>> + Send;
}

impl<G: RemoteGateway> RemoteGateway for Arc<G> {
    fn push(
        &self,
        entry: &OutboxEntry,
    ) -> impl Future<Output = Result<PushAck, RemoteError>> + Send {
        G::push(self, entry)
    }

    fn pull(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<PullBatch, RemoteError>> + Send {
        G::pull(self, since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_taxonomy() {
        assert!(matches!(
            RemoteError::from_status(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::PRECONDITION_FAILED, ""),
            RemoteError::Conflict { status: 412, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::ServerError { status: 429, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::BAD_GATEWAY, ""),
            RemoteError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            RemoteError::ClientError { status: 422, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::FORBIDDEN, ""),
            RemoteError::ClientError { status: 403, .. }
        ));
    }

    #[test]
    fn retryable_errors() {
        assert!(RemoteError::Network("timeout".into()).is_retryable());
        assert!(RemoteError::InvalidResponse("eof".into()).is_retryable());
        assert!(!RemoteError::Unauthorized(String::new()).is_retryable());
        assert!(!RemoteError::Conflict {
            status: 409,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn pull_batch_tolerates_missing_lists() {
        let batch: PullBatch =
            serde_json::from_str(r#"{"last_sync_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.deleted_ids.is_empty());
    }
}
