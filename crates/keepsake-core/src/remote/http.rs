//! REST+JSON implementation of [`RemoteGateway`].

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{PullBatch, PushAck, RemoteError, RemoteGateway};
use crate::auth::{AuthError, CredentialProvider};
use crate::error::{Error, Result};
use crate::models::{OutboxEntry, OutboxOperation, RecordFields, RecordId};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Gateway speaking the `/records` sync API over HTTPS.
#[derive(Clone)]
pub struct HttpRemoteGateway<C> {
    base_url: String,
    client: Client,
    credentials: C,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    id: RecordId,
    fields: &'a RecordFields,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DeleteBody {
    deleted_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl<C: CredentialProvider> HttpRemoteGateway<C> {
    /// Create a gateway for `base_url` with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, credentials: C, timeout: Duration) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                Error::Config("API base URL must include http:// or https://".to_string())
            })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn record_url(&self, id: &RecordId) -> String {
        format!(
            "{}/records/{}",
            self.base_url,
            urlencoding::encode(&id.as_str())
        )
    }

    async fn authorized(
        &self,
        method: Method,
        url: &str,
    ) -> std::result::Result<RequestBuilder, RemoteError> {
        let token = self.credentials.bearer_token().await.map_err(|error| match error {
            AuthError::NotConfigured | AuthError::InvalidCredential(_) => {
                RemoteError::Unauthorized(error.to_string())
            }
            other => RemoteError::Network(other.to_string()),
        })?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json"))
    }

    async fn send(request: RequestBuilder) -> std::result::Result<Response, RemoteError> {
        request.send().await.map_err(|error| {
            if error.is_decode() {
                RemoteError::InvalidResponse(error.to_string())
            } else {
                RemoteError::Network(error.to_string())
            }
        })
    }

    async fn read_ack(response: Response) -> std::result::Result<PushAck, RemoteError> {
        let body = response
            .text()
            .await
            .map_err(|error| RemoteError::Network(error.to_string()))?;
        if body.trim().is_empty() {
            return Ok(PushAck::default());
        }
        serde_json::from_str(&body).map_err(|error| {
            RemoteError::InvalidResponse(format!("undecodable acknowledgement: {error}"))
        })
    }
}

impl<C: CredentialProvider> RemoteGateway for HttpRemoteGateway<C> {
    async fn push(&self, entry: &OutboxEntry) -> std::result::Result<PushAck, RemoteError> {
        let payload = &entry.payload;
        let request = match entry.operation {
            OutboxOperation::Create | OutboxOperation::Update => {
                let fields = payload.fields.as_ref().ok_or_else(|| RemoteError::ClientError {
                    status: 0,
                    message: format!("{} payload without fields", entry.operation),
                })?;
                let body = RecordBody {
                    id: entry.record_id,
                    fields,
                    updated_at: payload.updated_at,
                };
                let (method, url) = if entry.operation == OutboxOperation::Create {
                    (Method::POST, format!("{}/records", self.base_url))
                } else {
                    (Method::PUT, self.record_url(&entry.record_id))
                };
                self.authorized(method, &url).await?.json(&body)
            }
            OutboxOperation::Delete => {
                let body = DeleteBody {
                    deleted_at: payload.deleted_at.unwrap_or(payload.updated_at),
                };
                self.authorized(Method::DELETE, &self.record_url(&entry.record_id))
                    .await?
                    .json(&body)
            }
        };

        let response = Self::send(request).await?;
        let status = response.status();
        if status.is_success() {
            return Self::read_ack(response).await;
        }
        // Already gone remotely: the deletion's intent holds.
        if entry.operation == OutboxOperation::Delete
            && matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
        {
            return Ok(PushAck::default());
        }
        Err(error_from_response(response).await)
    }

    async fn pull(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<PullBatch, RemoteError> {
        let mut url = format!("{}/records/sync", self.base_url);
        if let Some(since) = since {
            url.push_str("?since=");
            url.push_str(&urlencoding::encode(
                &since.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
        }

        let response = Self::send(self.authorized(Method::GET, &url).await?).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|error| RemoteError::Network(error.to_string()))?;
        serde_json::from_str(&body).map_err(|error| {
            RemoteError::InvalidResponse(format!("undecodable sync batch: {error}"))
        })
    }
}

async fn error_from_response(response: Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    RemoteError::from_status(status, parse_api_error(status, &body))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}
