use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Location of one uploaded attachment on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Id of the message carrying the attachment, needed to delete it.
    pub message_id: String,
    /// Direct download url of the attachment.
    pub url: String,
}

/// Why a single transfer attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    RateLimited { retry_after: Option<Duration> },
    Timeout(String),
    Unavailable(String),
    PayloadTooLarge { size: usize },
    Rejected(String),
    Unauthorized(String),
    Corrupted { expected: String, actual: String },
}

impl TransferFailure {
    /// Transient failures are worth another attempt after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferFailure::RateLimited { .. }
                | TransferFailure::Timeout(_)
                | TransferFailure::Unavailable(_)
                | TransferFailure::Corrupted { .. }
        )
    }

    /// Failures caused by the endpoint itself rather than by the payload.
    pub fn is_endpoint_fault(&self) -> bool {
        matches!(self, TransferFailure::Unauthorized(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferFailure::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailure::RateLimited {
                retry_after: Some(after),
            } => write!(f, "rate limited, retry after {}ms", after.as_millis()),
            TransferFailure::RateLimited { retry_after: None } => write!(f, "rate limited"),
            TransferFailure::Timeout(message) => write!(f, "timeout: {}", message),
            TransferFailure::Unavailable(message) => write!(f, "unavailable: {}", message),
            TransferFailure::PayloadTooLarge { size } => {
                write!(f, "payload of {} bytes rejected as too large", size)
            }
            TransferFailure::Rejected(message) => write!(f, "rejected: {}", message),
            TransferFailure::Unauthorized(message) => write!(f, "unauthorized: {}", message),
            TransferFailure::Corrupted { expected, actual } => {
                write!(f, "corrupted payload: expected {}, got {}", expected, actual)
            }
        }
    }
}

/// Wire-level access to the attachment host. One call is one attempt; retry
/// and endpoint selection live in `ChunkStore`.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn upload(
        &self,
        endpoint: &str,
        name: &str,
        data: Bytes,
    ) -> std::result::Result<RemoteObject, TransferFailure>;

    async fn download(&self, remote: &RemoteObject) -> std::result::Result<Bytes, TransferFailure>;

    async fn delete(
        &self,
        endpoint: &str,
        remote: &RemoteObject,
    ) -> std::result::Result<(), TransferFailure>;
}
