//! `reqwest` client for the remote upsert API

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{RemoteApi, RemoteError, ServerRecord, UpsertRequest};
use crate::auth::AuthToken;
use crate::config::ConfigError;
use crate::models::RecordId;
use crate::util::{error_excerpt, has_http_scheme, trimmed_non_empty};

/// Header carrying the trace id of the mutation being delivered
pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| ConfigError::Invalid(format!("HTTP client: {error}")))?;
        Ok(Self { base_url, client })
    }

    fn record_url(&self, id: &RecordId) -> String {
        format!("{}/records/{id}", self.base_url)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn upsert(
        &self,
        id: &RecordId,
        request: &UpsertRequest,
        token: &AuthToken,
    ) -> Result<ServerRecord, RemoteError> {
        let response = self
            .client
            .put(self.record_url(id))
            .bearer_auth(&token.value)
            .header(TRACE_ID_HEADER, request.trace_id.to_string())
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ServerRecord>()
                .await
                .map_err(|error| RemoteError::InvalidResponse(error.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }
}

fn map_status(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::CONFLICT => serde_json::from_str::<ServerRecord>(body).map_or_else(
            |error| RemoteError::InvalidResponse(format!("409 without server record: {error}")),
            |record| RemoteError::Conflict(Box::new(record)),
        ),
        status if status.is_server_error() => RemoteError::Server {
            status: status.as_u16(),
            message: parse_api_error(status, body),
        },
        status => RemoteError::Client {
            status: status.as_u16(),
            message: parse_api_error(status, body),
        },
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else if error.is_decode() {
        RemoteError::InvalidResponse(error.to_string())
    } else {
        RemoteError::Network(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", error_excerpt(&message), status.as_u16());
        }
    }

    let trimmed = error_excerpt(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String, ConfigError> {
    let base_url = trimmed_non_empty(Some(raw))
        .ok_or_else(|| ConfigError::Invalid("API base URL must not be empty".to_string()))?;
    if has_http_scheme(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::Invalid(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::Payload;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.example.com/v1/ ".to_string()).unwrap(),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn record_url_joins_id() {
        let api = HttpRemoteApi::new("http://localhost:8080/v1/").unwrap();
        let id = RecordId::new();
        assert_eq!(
            api.record_url(&id),
            format!("http://localhost:8080/v1/records/{id}")
        );
    }

    #[test]
    fn statuses_map_to_remote_errors() {
        assert_eq!(map_status(StatusCode::UNAUTHORIZED, ""), RemoteError::Unauthorized);
        assert_eq!(
            map_status(StatusCode::BAD_GATEWAY, ""),
            RemoteError::Server {
                status: 502,
                message: "HTTP 502".to_string()
            }
        );
        assert_eq!(
            map_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"error":"payload too large"}"#
            ),
            RemoteError::Client {
                status: 422,
                message: "payload too large (422)".to_string()
            }
        );
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retryable());
    }

    #[test]
    fn conflict_carries_server_record() {
        let server = ServerRecord {
            id: RecordId::new(),
            owner_id: "owner-1".to_string(),
            payload: Payload::new().with("name", "Server"),
            local_version: 4,
            updated_at: 99,
        };
        let body = serde_json::to_string(&server).unwrap();

        assert_eq!(
            map_status(StatusCode::CONFLICT, &body),
            RemoteError::Conflict(Box::new(server))
        );
        assert!(matches!(
            map_status(StatusCode::CONFLICT, "nope"),
            RemoteError::InvalidResponse(_)
        ));
    }
}
