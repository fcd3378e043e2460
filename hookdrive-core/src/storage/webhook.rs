//! Chat webhook transport: each chunk becomes one message attachment.

use super::transport::{ChunkTransport, RemoteObject, TransferFailure};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    #[serde(default)]
    attachments: Vec<AttachmentResponse>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    retry_after: Option<f64>,
}

#[derive(Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| crate::DriveError::Config(error.to_string()))?;
        Ok(Self { client })
    }

    fn upload_url(endpoint: &str) -> String {
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}wait=true", endpoint, separator)
    }

    fn message_url(endpoint: &str, message_id: &str) -> String {
        let base = endpoint.split('?').next().unwrap_or(endpoint);
        format!("{}/messages/{}", base.trim_end_matches('/'), message_id)
    }
}

#[async_trait]
impl ChunkTransport for WebhookTransport {
    async fn upload(
        &self,
        endpoint: &str,
        name: &str,
        data: Bytes,
    ) -> std::result::Result<RemoteObject, TransferFailure> {
        let size = data.len();
        let part = reqwest::multipart::Part::stream_with_length(data, size as u64)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|error| TransferFailure::Rejected(error.to_string()))?;
        let form = reqwest::multipart::Form::new().part("files[0]", part);

        let response = self
            .client
            .post(Self::upload_url(endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(upload_status_failure(status, &headers, &body, size));
        }

        let message: MessageResponse = response
            .json()
            .await
            .map_err(|error| TransferFailure::Unavailable(error.to_string()))?;
        let attachment = message.attachments.into_iter().next().ok_or_else(|| {
            TransferFailure::Rejected(format!("message {} carries no attachment", message.id))
        })?;

        Ok(RemoteObject {
            message_id: message.id,
            url: attachment.url,
        })
    }

    async fn download(&self, remote: &RemoteObject) -> std::result::Result<Bytes, TransferFailure> {
        let response = self
            .client
            .get(&remote.url)
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(fetch_status_failure(status, &headers, &body));
        }

        response
            .bytes()
            .await
            .map_err(|error| TransferFailure::Unavailable(error.to_string()))
    }

    async fn delete(
        &self,
        endpoint: &str,
        remote: &RemoteObject,
    ) -> std::result::Result<(), TransferFailure> {
        let response = self
            .client
            .delete(Self::message_url(endpoint, &remote.message_id))
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(upload_status_failure(status, &headers, &body, 0))
    }
}

fn request_failure(error: reqwest::Error) -> TransferFailure {
    if error.is_timeout() {
        TransferFailure::Timeout(error.to_string())
    } else if error.is_builder() {
        TransferFailure::Rejected(error.to_string())
    } else {
        TransferFailure::Unavailable(error.to_string())
    }
}

fn upload_status_failure(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    size: usize,
) -> TransferFailure {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransferFailure::RateLimited {
            retry_after: retry_after(headers, body),
        },
        StatusCode::PAYLOAD_TOO_LARGE => TransferFailure::PayloadTooLarge { size },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            TransferFailure::Unauthorized(format!("{}: {}", status, body))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            TransferFailure::Timeout(status.to_string())
        }
        status if status.is_server_error() => {
            TransferFailure::Unavailable(format!("{}: {}", status, body))
        }
        status => TransferFailure::Rejected(format!("{}: {}", status, body)),
    }
}

fn fetch_status_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> TransferFailure {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransferFailure::RateLimited {
            retry_after: retry_after(headers, body),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            TransferFailure::Timeout(status.to_string())
        }
        status if status.is_server_error() => {
            TransferFailure::Unavailable(format!("{}: {}", status, body))
        }
        status => TransferFailure::Rejected(format!("{}: {}", status, body)),
    }
}

/// Rate-limit hint, from the header first and the JSON body second. Both
/// carry seconds, possibly fractional.
fn retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());

    let seconds = from_header.or_else(|| {
        serde_json::from_str::<RateLimitResponse>(body)
            .ok()
            .and_then(|payload| payload.retry_after)
    })?;

    Duration::try_from_secs_f64(seconds).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_urls() {
        assert_eq!(
            WebhookTransport::upload_url("https://host/api/webhooks/1/token"),
            "https://host/api/webhooks/1/token?wait=true"
        );
        assert_eq!(
            WebhookTransport::upload_url("https://host/api/webhooks/1/token?thread_id=9"),
            "https://host/api/webhooks/1/token?thread_id=9&wait=true"
        );
        assert_eq!(
            WebhookTransport::message_url("https://host/api/webhooks/1/token?thread_id=9", "42"),
            "https://host/api/webhooks/1/token/messages/42"
        );
    }

    #[test]
    fn test_status_classification() {
        let headers = HeaderMap::new();
        assert!(matches!(
            upload_status_failure(StatusCode::PAYLOAD_TOO_LARGE, &headers, "", 9),
            TransferFailure::PayloadTooLarge { size: 9 }
        ));
        assert!(upload_status_failure(StatusCode::UNAUTHORIZED, &headers, "", 0).is_endpoint_fault());
        assert!(upload_status_failure(StatusCode::BAD_GATEWAY, &headers, "", 0).is_transient());
        assert!(!upload_status_failure(StatusCode::BAD_REQUEST, &headers, "", 0).is_transient());
        assert!(!fetch_status_failure(StatusCode::NOT_FOUND, &headers, "").is_endpoint_fault());
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers, ""), Some(Duration::from_secs(2)));

        let empty = HeaderMap::new();
        assert_eq!(
            retry_after(&empty, r#"{"message":"slow down","retry_after":0.5}"#),
            Some(Duration::from_millis(500))
        );
        assert_eq!(retry_after(&empty, "not json"), None);
        assert_eq!(retry_after(&empty, r#"{"retry_after":1e300}"#), None);
        assert_eq!(retry_after(&empty, r#"{"retry_after":-1}"#), None);

        let mut huge = HeaderMap::new();
        huge.insert(RETRY_AFTER, HeaderValue::from_static("1e20"));
        assert_eq!(retry_after(&huge, ""), None);
    }
}
