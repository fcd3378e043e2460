use super::endpoint::{EndpointPool, EndpointStats, redact};
use super::retry::{RetryDecision, RetryPolicy};
use super::transport::{ChunkTransport, TransferFailure};
use crate::error::{DriveError, Result};
use crate::manifest::ChunkRef;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// ChunkStore moves single chunks to and from the endpoint pool.
/// Uploads rotate over healthy endpoints; downloads and removals go to the
/// endpoint recorded in the chunk reference.
pub struct ChunkStore {
    pool: EndpointPool,
    transport: Arc<dyn ChunkTransport>,
    retry: RetryPolicy,
}

impl ChunkStore {
    pub fn new(
        endpoints: Vec<String>,
        transport: Arc<dyn ChunkTransport>,
        retry: RetryPolicy,
        cooldown: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(DriveError::Config(
                "at least one endpoint is required".to_string(),
            ));
        }

        Ok(Self {
            pool: EndpointPool::new(endpoints, cooldown),
            transport,
            retry,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.pool.len()
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.pool.stats()
    }

    /// Upload one chunk, returning its reference.
    pub async fn upload(&self, data: Bytes) -> Result<ChunkRef> {
        let sha256 = compute_hash(&data);
        let size = data.len() as u64;
        let name = format!("{}.chunk", Ulid::new());
        let mut attempts = 0u32;

        loop {
            let endpoint = self.pool.select().ok_or(DriveError::NoHealthyEndpoint)?;
            attempts += 1;

            let failure = match self.transport.upload(&endpoint, &name, data.clone()).await {
                Ok(remote) => {
                    self.pool.record_success(&endpoint);
                    tracing::debug!(
                        "Stored chunk {} ({} bytes) via {} after {} attempt(s)",
                        sha256,
                        size,
                        redact(&endpoint),
                        attempts
                    );
                    return Ok(ChunkRef {
                        endpoint,
                        remote,
                        size,
                        sha256,
                    });
                }
                Err(failure) => failure,
            };

            if failure.is_endpoint_fault() {
                self.pool.mark_unhealthy(&endpoint);
            }

            match self.retry.decide(attempts, &failure) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        "Upload attempt {} via {} failed: {}; retrying in {}ms",
                        attempts,
                        redact(&endpoint),
                        failure,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(DriveError::Upload(format!(
                        "{} (after {} attempt(s))",
                        failure, attempts
                    )));
                }
            }
        }
    }

    /// Download one chunk, verifying its length and checksum.
    pub async fn download(&self, chunk: &ChunkRef) -> Result<Bytes> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let failure = match self.transport.download(&chunk.remote).await {
                Ok(bytes) => match check_payload(chunk, &bytes) {
                    Ok(()) => return Ok(bytes),
                    Err(failure) => failure,
                },
                Err(failure) => failure,
            };

            match self.retry.decide(attempts, &failure) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        "Download attempt {} of chunk {} failed: {}; retrying in {}ms",
                        attempts,
                        chunk.sha256,
                        failure,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(DriveError::Download(format!(
                        "chunk {}: {} (after {} attempt(s))",
                        chunk.sha256, failure, attempts
                    )));
                }
            }
        }
    }

    /// Best-effort removal of one chunk. The error is for the caller to log.
    pub async fn remove(&self, chunk: &ChunkRef) -> Result<()> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let failure = match self.transport.delete(&chunk.endpoint, &chunk.remote).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            match self.retry.decide(attempts, &failure) {
                RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
                RetryDecision::GiveUp => {
                    return Err(DriveError::Internal(format!(
                        "failed to remove chunk {}: {}",
                        chunk.remote.message_id, failure
                    )));
                }
            }
        }
    }
}

fn check_payload(chunk: &ChunkRef, bytes: &[u8]) -> std::result::Result<(), TransferFailure> {
    if bytes.len() as u64 != chunk.size {
        return Err(TransferFailure::Corrupted {
            expected: format!("{} bytes", chunk.size),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    if chunk.sha256.is_empty() {
        return Ok(());
    }
    verify_hash(bytes, &chunk.sha256).map_err(|_| TransferFailure::Corrupted {
        expected: chunk.sha256.clone(),
        actual: compute_hash(bytes),
    })
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(DriveError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryTransport;
    use crate::storage::EndpointHealth;

    fn endpoints(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("endpoint-{}", i)).collect()
    }

    fn store(transport: Arc<MemoryTransport>, count: usize) -> ChunkStore {
        ChunkStore::new(
            endpoints(count),
            transport,
            RetryPolicy::immediate(3),
            DEFAULT_COOLDOWN,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_remove() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone(), 2);

        let data = Bytes::from("test data content");
        let chunk = store.upload(data.clone()).await.unwrap();
        assert_eq!(chunk.size, data.len() as u64);
        assert_eq!(chunk.sha256, compute_hash(&data));

        let downloaded = store.download(&chunk).await.unwrap();
        assert_eq!(downloaded, data);

        store.remove(&chunk).await.unwrap();
        assert!(!transport.contains(&chunk.remote.message_id));
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let result = ChunkStore::new(
            Vec::new(),
            transport,
            RetryPolicy::default(),
            DEFAULT_COOLDOWN,
        );
        assert!(matches!(result, Err(DriveError::Config(_))));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_uploads([
            TransferFailure::RateLimited { retry_after: None },
            TransferFailure::Timeout("slow".to_string()),
        ]);
        let store = store(transport.clone(), 2);

        let chunk = store.upload(Bytes::from("payload")).await.unwrap();
        assert_eq!(transport.upload_attempts(), 3);
        assert!(transport.contains(&chunk.remote.message_id));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_uploads(
            (0..10).map(|_| TransferFailure::Unavailable("502".to_string())),
        );
        let store = store(transport.clone(), 2);

        let result = store.upload(Bytes::from("payload")).await;
        assert!(matches!(result, Err(DriveError::Upload(_))));
        assert_eq!(transport.upload_attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_fast() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_uploads([TransferFailure::PayloadTooLarge { size: 7 }]);
        let store = store(transport.clone(), 2);

        let result = store.upload(Bytes::from("payload")).await;
        assert!(matches!(result, Err(DriveError::Upload(_))));
        assert_eq!(transport.upload_attempts(), 1);
        assert!(
            store
                .endpoint_stats()
                .iter()
                .all(|stats| stats.health == EndpointHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_auth_failure_cools_endpoint_down() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_endpoint(
            "endpoint-0",
            TransferFailure::Unauthorized("unknown webhook".to_string()),
        );
        let store = store(transport.clone(), 2);

        assert!(store.upload(Bytes::from("first")).await.is_err());
        for _ in 0..4 {
            let chunk = store.upload(Bytes::from("next")).await.unwrap();
            assert_eq!(chunk.endpoint, "endpoint-1");
        }

        let stats = store.endpoint_stats();
        assert_eq!(stats[0].health, EndpointHealth::CoolingDown);
        assert_eq!(stats[1].load, 4);
    }

    #[tokio::test]
    async fn test_all_endpoints_unhealthy() {
        let transport = Arc::new(MemoryTransport::new());
        let unauthorized = TransferFailure::Unauthorized("401".to_string());
        transport.fail_endpoint("endpoint-0", unauthorized.clone());
        transport.fail_endpoint("endpoint-1", unauthorized);
        let store = store(transport.clone(), 2);

        assert!(store.upload(Bytes::from("a")).await.is_err());
        assert!(store.upload(Bytes::from("b")).await.is_err());
        let result = store.upload(Bytes::from("c")).await;
        assert!(matches!(result, Err(DriveError::NoHealthyEndpoint)));
    }

    #[tokio::test]
    async fn test_corrupted_download_is_retried() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone(), 1);

        let chunk = store.upload(Bytes::from("abcdef")).await.unwrap();
        transport.corrupt_next_downloads(1);

        let downloaded = store.download(&chunk).await.unwrap();
        assert_eq!(downloaded, Bytes::from("abcdef"));
        assert_eq!(transport.download_attempts(), 2);
    }

    #[tokio::test]
    async fn test_remove_failure_is_reported() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone(), 1);

        let chunk = store.upload(Bytes::from("abc")).await.unwrap();
        transport.fail_deletes(true);
        assert!(store.remove(&chunk).await.is_err());
        assert!(transport.contains(&chunk.remote.message_id));
    }

    #[test]
    fn test_compute_hash() {
        let data = b"hello world";
        let hash = compute_hash(data);
        assert_eq!(hash.len(), 64);
        assert!(verify_hash(data, &hash).is_ok());
        assert!(verify_hash(b"other", &hash).is_err());
    }
}
