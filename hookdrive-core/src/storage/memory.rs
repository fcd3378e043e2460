//! In-process attachment host for local development and tests, with failure
//! injection for exercising retry and cleanup paths.

use super::transport::{ChunkTransport, RemoteObject, TransferFailure};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    endpoint: String,
    data: Bytes,
}

#[derive(Debug, Default)]
struct Faults {
    next_uploads: Vec<TransferFailure>,
    uploads_after: Option<(u64, TransferFailure)>,
    endpoints: HashMap<String, TransferFailure>,
    next_downloads: Vec<TransferFailure>,
    corrupt_downloads: u64,
    fail_deletes: bool,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    uploads_by_endpoint: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
    upload_attempts: AtomicU64,
    successful_uploads: AtomicU64,
    download_attempts: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, so concurrent callers actually overlap.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    /// The next upload attempts fail, one failure consumed per attempt.
    pub fn fail_next_uploads(&self, failures: impl IntoIterator<Item = TransferFailure>) {
        let mut faults = lock(&self.faults);
        faults.next_uploads.extend(failures);
    }

    /// Every upload attempt after `successes` successful uploads fails.
    pub fn fail_uploads_after(&self, successes: u64, failure: TransferFailure) {
        lock(&self.faults).uploads_after = Some((successes, failure));
    }

    /// Every upload through `endpoint` fails until cleared.
    pub fn fail_endpoint(&self, endpoint: &str, failure: TransferFailure) {
        lock(&self.faults)
            .endpoints
            .insert(endpoint.to_string(), failure);
    }

    pub fn fail_next_downloads(&self, failures: impl IntoIterator<Item = TransferFailure>) {
        lock(&self.faults).next_downloads.extend(failures);
    }

    /// The next `count` downloads return flipped bytes.
    pub fn corrupt_next_downloads(&self, count: u64) {
        lock(&self.faults).corrupt_downloads += count;
    }

    pub fn fail_deletes(&self, fail: bool) {
        lock(&self.faults).fail_deletes = fail;
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        lock(&self.objects).contains_key(message_id)
    }

    pub fn upload_attempts(&self) -> u64 {
        self.upload_attempts.load(Ordering::Relaxed)
    }

    pub fn download_attempts(&self) -> u64 {
        self.download_attempts.load(Ordering::Relaxed)
    }

    /// Successful uploads per endpoint address.
    pub fn uploads_by_endpoint(&self) -> HashMap<String, u64> {
        lock(&self.uploads_by_endpoint).clone()
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn upload_fault(&self, endpoint: &str) -> Option<TransferFailure> {
        let mut faults = lock(&self.faults);
        if let Some(failure) = faults.endpoints.get(endpoint) {
            return Some(failure.clone());
        }
        if !faults.next_uploads.is_empty() {
            return Some(faults.next_uploads.remove(0));
        }
        if let Some((successes, failure)) = &faults.uploads_after {
            if self.successful_uploads.load(Ordering::SeqCst) >= *successes {
                return Some(failure.clone());
            }
        }
        None
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn upload(
        &self,
        endpoint: &str,
        name: &str,
        data: Bytes,
    ) -> std::result::Result<RemoteObject, TransferFailure> {
        self.upload_attempts.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        if let Some(failure) = self.upload_fault(endpoint) {
            return Err(failure);
        }

        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        lock(&self.objects).insert(
            message_id.clone(),
            StoredObject {
                endpoint: endpoint.to_string(),
                data,
            },
        );
        *lock(&self.uploads_by_endpoint)
            .entry(endpoint.to_string())
            .or_default() += 1;
        self.successful_uploads.fetch_add(1, Ordering::SeqCst);

        Ok(RemoteObject {
            url: format!("memory://{}/{}", message_id, name),
            message_id,
        })
    }

    async fn download(&self, remote: &RemoteObject) -> std::result::Result<Bytes, TransferFailure> {
        self.download_attempts.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let corrupt = {
            let mut faults = lock(&self.faults);
            if !faults.next_downloads.is_empty() {
                return Err(faults.next_downloads.remove(0));
            }
            if faults.corrupt_downloads > 0 {
                faults.corrupt_downloads -= 1;
                true
            } else {
                false
            }
        };

        let object = lock(&self.objects)
            .get(&remote.message_id)
            .cloned()
            .ok_or_else(|| TransferFailure::Rejected(format!("unknown object {}", remote.url)))?;

        if corrupt {
            let flipped: Vec<u8> = object.data.iter().map(|byte| !byte).collect();
            return Ok(Bytes::from(flipped));
        }
        Ok(object.data)
    }

    async fn delete(
        &self,
        endpoint: &str,
        remote: &RemoteObject,
    ) -> std::result::Result<(), TransferFailure> {
        self.simulate_latency().await;

        if lock(&self.faults).fail_deletes {
            return Err(TransferFailure::Unavailable("delete disabled".to_string()));
        }

        let mut objects = lock(&self.objects);
        match objects.get(&remote.message_id) {
            Some(object) if object.endpoint == endpoint => {
                objects.remove(&remote.message_id);
                Ok(())
            }
            Some(_) => Err(TransferFailure::Unauthorized(format!(
                "object {} belongs to another endpoint",
                remote.message_id
            ))),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
