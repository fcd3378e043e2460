//! Manager: splits streams into chunk-sized windows and turns them into
//! manifests, and reads byte ranges back out of manifests.

use crate::manifest::{ChunkRef, DEFAULT_CHUNK_SIZE, Manifest, validate_chunk_size};
use crate::storage::{
    ChunkStore, ChunkTransport, DEFAULT_COOLDOWN, DEFAULT_REQUEST_TIMEOUT, EndpointStats,
    RetryPolicy, WebhookTransport,
};
use crate::{DriveError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;

pub const DEFAULT_UPLOAD_WORKERS: usize = 4;
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

/// A boxed stream of bytes for range reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Clone, Default)]
pub struct ManagerBuilder {
    chunk_size: Option<i64>,
    endpoints: Option<Vec<String>>,
    upload_workers: Option<usize>,
    download_workers: Option<usize>,
    retry: Option<RetryPolicy>,
    cooldown: Option<Duration>,
    request_timeout: Option<Duration>,
    transport: Option<Arc<dyn ChunkTransport>>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size(mut self, chunk_size: i64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = Some(workers);
        self
    }

    pub fn download_workers(mut self, workers: usize) -> Self {
        self.download_workers = Some(workers);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn resolve_chunk_size(&self) -> Result<usize> {
        validate_chunk_size(self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE as i64))
    }

    fn resolve_endpoints(&self) -> Result<Vec<String>> {
        let endpoints: Vec<String> = self
            .endpoints
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();

        if endpoints.is_empty() {
            return Err(DriveError::Config(
                "endpoint list cannot be empty".to_string(),
            ));
        }

        Ok(endpoints)
    }

    fn resolve_workers(value: Option<usize>, default: usize, name: &str) -> Result<usize> {
        match value.unwrap_or(default) {
            0 => Err(DriveError::Config(format!("{} must be at least 1", name))),
            workers => Ok(workers),
        }
    }

    pub fn build(&self) -> Result<Manager> {
        let chunk_size = self.resolve_chunk_size()?;
        let endpoints = self.resolve_endpoints()?;
        let upload_workers =
            Self::resolve_workers(self.upload_workers, DEFAULT_UPLOAD_WORKERS, "upload_workers")?;
        let download_workers = Self::resolve_workers(
            self.download_workers,
            DEFAULT_DOWNLOAD_WORKERS,
            "download_workers",
        )?;

        let transport: Arc<dyn ChunkTransport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(WebhookTransport::new(
                self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )?),
        };

        let store = ChunkStore::new(
            endpoints,
            transport,
            self.retry.clone().unwrap_or_default(),
            self.cooldown.unwrap_or(DEFAULT_COOLDOWN),
        )?;

        tracing::info!(
            "Configured chunk manager: chunk_size={} endpoints={} upload_workers={} download_workers={}",
            chunk_size,
            store.endpoint_count(),
            upload_workers,
            download_workers
        );

        Ok(Manager {
            chunk_size,
            store: Arc::new(store),
            upload_workers,
            download_workers,
        })
    }
}

#[derive(Clone)]
pub struct Manager {
    chunk_size: usize,
    store: Arc<ChunkStore>,
    upload_workers: usize,
    download_workers: usize,
}

impl Manager {
    /// Manager over webhook endpoints with default pool sizes and retry policy.
    pub fn configure(chunk_size: i64, endpoints: Vec<String>) -> Result<Self> {
        ManagerBuilder::new()
            .chunk_size(chunk_size)
            .endpoints(endpoints)
            .build()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.store.endpoint_stats()
    }

    /// Upload everything `reader` yields. The manifest's `size` is the number
    /// of bytes consumed. At most `upload_workers` windows are in flight, so
    /// memory stays bounded regardless of input length.
    ///
    /// On failure every chunk this call managed to store is removed again and
    /// no manifest is returned.
    pub async fn put<R>(&self, mut reader: R) -> Result<Manifest>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut tasks: JoinSet<(usize, Result<ChunkRef>)> = JoinSet::new();
        let mut completed: BTreeMap<usize, ChunkRef> = BTreeMap::new();
        let mut failure: Option<DriveError> = None;
        let mut next_index = 0usize;

        'windows: loop {
            while tasks.len() >= self.upload_workers {
                if let Err(error) = join_next(&mut tasks, &mut completed).await {
                    failure = Some(error);
                    break 'windows;
                }
            }

            let window = match read_window(&mut reader, self.chunk_size).await {
                Ok(window) => window,
                Err(error) => {
                    failure = Some(error.into());
                    break;
                }
            };
            if window.is_empty() {
                break;
            }

            let last = window.len() < self.chunk_size;
            let index = next_index;
            let store = self.store.clone();
            tasks.spawn(async move { (index, store.upload(window).await) });
            next_index += 1;

            if last {
                break;
            }
        }

        while failure.is_none() && !tasks.is_empty() {
            if let Err(error) = join_next(&mut tasks, &mut completed).await {
                failure = Some(error);
            }
        }

        if let Some(error) = failure {
            // Uploads that already finished still report their chunk after the
            // abort, so they are removed along with the rest.
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok((index, Ok(chunk))) = joined {
                    completed.insert(index, chunk);
                }
            }
            tracing::warn!(
                "Put failed after {} stored chunk(s), removing them: {}",
                completed.len(),
                error
            );
            self.remove_chunks(completed.into_values().collect()).await;
            return Err(error);
        }

        let manifest = Manifest::new(completed.into_values().collect(), self.chunk_size as u64);
        tracing::debug!(
            "Put {} bytes as {} chunk(s)",
            manifest.size,
            manifest.chunk_count()
        );
        Ok(manifest)
    }

    /// Stream `min(length, size - offset)` bytes starting at `offset`. Only
    /// the overlapping chunks are fetched, up to `download_workers` at a time,
    /// and they are yielded in order.
    pub fn get(&self, manifest: &Manifest, offset: u64, length: u64) -> Result<ByteStream> {
        manifest.validate()?;

        let pieces: Vec<_> = manifest
            .spans(offset, length)
            .into_iter()
            .map(|span| (manifest.chunks[span.index].clone(), span))
            .collect();

        let store = self.store.clone();
        let stream = stream::iter(pieces)
            .map(move |(chunk, span)| {
                let store = store.clone();
                async move {
                    let bytes = store.download(&chunk).await?;
                    let start = span.start_in_chunk as usize;
                    let end = start + span.len as usize;
                    if end > bytes.len() {
                        return Err(DriveError::Download(format!(
                            "chunk {} is {} bytes, needed {}..{}",
                            chunk.sha256,
                            bytes.len(),
                            start,
                            end
                        )));
                    }
                    Ok(bytes.slice(start..end))
                }
            })
            .buffered(self.download_workers);

        Ok(Box::pin(stream))
    }

    /// `get` collected into one buffer.
    pub async fn read_range(&self, manifest: &Manifest, offset: u64, length: u64) -> Result<Bytes> {
        let mut stream = self.get(manifest, offset, length)?;
        let mut out = BytesMut::with_capacity(manifest.clip(offset, length) as usize);
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece?);
        }
        Ok(out.freeze())
    }

    /// Best-effort removal of every chunk in the manifest.
    pub async fn delete(&self, manifest: &Manifest) {
        self.remove_chunks(manifest.chunks.clone()).await;
    }

    async fn remove_chunks(&self, chunks: Vec<ChunkRef>) {
        if chunks.is_empty() {
            return;
        }

        let total = chunks.len();
        let store = self.store.clone();
        let failed = stream::iter(chunks)
            .map(|chunk| {
                let store = store.clone();
                async move {
                    match store.remove(&chunk).await {
                        Ok(()) => 0usize,
                        Err(error) => {
                            tracing::warn!("Leaking chunk {}: {}", chunk.remote.message_id, error);
                            1
                        }
                    }
                }
            })
            .buffer_unordered(self.upload_workers)
            .fold(0usize, |acc, failed| async move { acc + failed })
            .await;

        tracing::debug!("Removed {} of {} chunk(s)", total - failed, total);
    }
}

async fn join_next(
    tasks: &mut JoinSet<(usize, Result<ChunkRef>)>,
    completed: &mut BTreeMap<usize, ChunkRef>,
) -> Result<()> {
    match tasks.join_next().await {
        Some(Ok((index, Ok(chunk)))) => {
            completed.insert(index, chunk);
            Ok(())
        }
        Some(Ok((index, Err(error)))) => {
            tracing::warn!("Chunk {} failed: {}", index, error);
            Err(error)
        }
        Some(Err(join_error)) => Err(DriveError::Internal(format!(
            "upload worker failed: {}",
            join_error
        ))),
        None => Ok(()),
    }
}

/// Reads until `size` bytes are buffered or the reader is exhausted.
async fn read_window<R>(reader: &mut R, size: usize) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{MAX_CHUNK_SIZE, expected_chunk_count};
    use crate::storage::{MemoryTransport, RemoteObject, TransferFailure};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts overlapping uploads. With `stall` set, the first upload is
    /// rejected and every later one never completes.
    #[derive(Default)]
    struct TrackingTransport {
        inner: MemoryTransport,
        stall: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChunkTransport for TrackingTransport {
        async fn upload(
            &self,
            endpoint: &str,
            name: &str,
            data: Bytes,
        ) -> std::result::Result<RemoteObject, TransferFailure> {
            if self.stall {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(TransferFailure::Rejected("400".to_string()));
                }
                std::future::pending::<()>().await;
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.inner.upload(endpoint, name, data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn download(
            &self,
            remote: &RemoteObject,
        ) -> std::result::Result<Bytes, TransferFailure> {
            self.inner.download(remote).await
        }

        async fn delete(
            &self,
            endpoint: &str,
            remote: &RemoteObject,
        ) -> std::result::Result<(), TransferFailure> {
            self.inner.delete(endpoint, remote).await
        }
    }

    fn manager_with(transport: Arc<MemoryTransport>, chunk_size: i64, endpoints: usize) -> Manager {
        Manager::builder()
            .chunk_size(chunk_size)
            .endpoints((0..endpoints).map(|i| format!("endpoint-{}", i)).collect())
            .retry_policy(RetryPolicy::immediate(3))
            .transport(transport)
            .build()
            .unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_configure_validation() {
        let transport = Arc::new(MemoryTransport::new());
        let build = |chunk_size: i64, endpoints: Vec<String>| {
            Manager::builder()
                .chunk_size(chunk_size)
                .endpoints(endpoints)
                .transport(transport.clone())
                .build()
        };
        let one = vec!["endpoint-0".to_string()];

        assert!(matches!(build(0, one.clone()), Err(DriveError::Config(_))));
        assert!(matches!(build(-5, one.clone()), Err(DriveError::Config(_))));
        assert!(matches!(
            build(MAX_CHUNK_SIZE as i64 + 1, one.clone()),
            Err(DriveError::Config(_))
        ));
        assert!(build(MAX_CHUNK_SIZE as i64, one.clone()).is_ok());
        assert!(matches!(build(10, Vec::new()), Err(DriveError::Config(_))));
        assert!(matches!(
            build(10, vec![" ".to_string(), String::new()]),
            Err(DriveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_example_manifest_and_range() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport, 10, 2);

        let data = b"ABCDEFGHIJKLMNOPQRSTUVWXY";
        let manifest = manager.put(&data[..]).await.unwrap();

        let lengths: Vec<u64> = manifest.chunks.iter().map(|chunk| chunk.size).collect();
        assert_eq!(lengths, vec![10, 10, 5]);
        assert_eq!(manifest.size, 25);

        let range = manager.read_range(&manifest, 8, 5).await.unwrap();
        assert_eq!(&range[..], b"IJKLM");
    }

    #[tokio::test]
    async fn test_round_trip_and_chunk_count() {
        let transport = Arc::new(MemoryTransport::new());
        for chunk_size in [1i64, 3, 7, 64] {
            let manager = manager_with(transport.clone(), chunk_size, 3);
            for len in [0usize, 1, 2, 63, 64, 65, 200] {
                let data = sample(len);
                let manifest = manager.put(&data[..]).await.unwrap();
                assert_eq!(manifest.size, len as u64);
                assert_eq!(
                    manifest.chunk_count(),
                    expected_chunk_count(len as u64, chunk_size as u64)
                );

                let out = manager.read_range(&manifest, 0, len as u64).await.unwrap();
                assert_eq!(&out[..], &data[..]);
            }
        }
    }

    #[tokio::test]
    async fn test_range_reads_match_slices() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport, 16, 2);
        let data = sample(100);
        let manifest = manager.put(&data[..]).await.unwrap();

        for offset in [0u64, 1, 15, 16, 17, 50, 99, 100, 150] {
            for length in [0u64, 1, 15, 16, 33, 1000] {
                let out = manager.read_range(&manifest, offset, length).await.unwrap();
                let start = (offset as usize).min(data.len());
                let end = (start + length as usize).min(data.len());
                assert_eq!(&out[..], &data[start..end], "offset={} length={}", offset, length);
            }
        }
    }

    #[tokio::test]
    async fn test_order_preserved_with_concurrent_uploads() {
        let transport =
            Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(2)));
        let manager = Manager::builder()
            .chunk_size(4)
            .endpoints(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .upload_workers(8)
            .download_workers(8)
            .retry_policy(RetryPolicy::immediate(2))
            .transport(transport)
            .build()
            .unwrap();

        let data = sample(4 * 40 + 3);
        let manifest = manager.put(&data[..]).await.unwrap();
        assert_eq!(manifest.chunk_count(), 41);

        let out = manager.read_range(&manifest, 0, data.len() as u64).await.unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[tokio::test]
    async fn test_uploads_in_flight_are_bounded() {
        let transport = Arc::new(TrackingTransport {
            inner: MemoryTransport::new().with_latency(Duration::from_millis(1)),
            ..Default::default()
        });
        let manager = Manager::builder()
            .chunk_size(4)
            .endpoints(vec!["a".to_string(), "b".to_string()])
            .upload_workers(2)
            .retry_policy(RetryPolicy::immediate(2))
            .transport(transport.clone())
            .build()
            .unwrap();

        let data = sample(4 * 50);
        let manifest = manager.put(&data[..]).await.unwrap();
        assert_eq!(manifest.chunk_count(), 50);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);

        let out = manager.read_range(&manifest, 0, data.len() as u64).await.unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[tokio::test]
    async fn test_failed_put_does_not_wait_for_stalled_uploads() {
        let transport = Arc::new(TrackingTransport {
            stall: true,
            ..Default::default()
        });
        let manager = Manager::builder()
            .chunk_size(4)
            .endpoints(vec!["a".to_string()])
            .upload_workers(4)
            .retry_policy(RetryPolicy::immediate(1))
            .transport(transport.clone())
            .build()
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), manager.put(&sample(40)[..]))
            .await
            .expect("put should give up without waiting on stalled uploads");
        assert!(matches!(result, Err(DriveError::Upload(_))));
        assert_eq!(transport.inner.object_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_put_removes_uploaded_chunks() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_uploads_after(2, TransferFailure::PayloadTooLarge { size: 10 });
        let manager = Manager::builder()
            .chunk_size(10)
            .endpoints(vec!["endpoint-0".to_string()])
            .upload_workers(1)
            .retry_policy(RetryPolicy::immediate(3))
            .transport(transport.clone())
            .build()
            .unwrap();

        let data = sample(55);
        let result = manager.put(&data[..]).await;
        assert!(matches!(result, Err(DriveError::Upload(_))));
        assert_eq!(transport.object_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_chunks_and_tolerates_failures() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport.clone(), 8, 2);

        let manifest = manager.put(&sample(40)[..]).await.unwrap();
        assert_eq!(transport.object_count(), 5);

        transport.fail_deletes(true);
        manager.delete(&manifest).await;
        assert_eq!(transport.object_count(), 5);

        transport.fail_deletes(false);
        manager.delete(&manifest).await;
        assert_eq!(transport.object_count(), 0);
    }

    #[tokio::test]
    async fn test_load_is_spread_evenly() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport.clone(), 1, 3);

        let manifest = manager.put(&sample(300)[..]).await.unwrap();
        assert_eq!(manifest.chunk_count(), 300);

        let per_endpoint = transport.uploads_by_endpoint();
        assert_eq!(per_endpoint.len(), 3);
        for count in per_endpoint.values() {
            assert!((95..=105).contains(count), "uneven load: {:?}", per_endpoint);
        }

        let loads: Vec<u64> = manager.endpoint_stats().iter().map(|s| s.load).collect();
        assert_eq!(loads.iter().sum::<u64>(), 300);
    }

    #[tokio::test]
    async fn test_download_failure_surfaces_in_stream() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(transport.clone(), 4, 1);
        let manifest = manager.put(&sample(12)[..]).await.unwrap();

        transport.fail_next_downloads(
            (0..30).map(|_| TransferFailure::Unavailable("503".to_string())),
        );
        let result = manager.read_range(&manifest, 0, 12).await;
        assert!(matches!(result, Err(DriveError::Download(_))));
    }
}
