//! Read leases on committed manifests. A manifest superseded by a commit or a
//! remove is reclaimed only once the last read streaming it is dropped.

use crate::Result;
use crate::manager::Manager;
use crate::manifest::Manifest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Lease {
    readers: usize,
    retired: Option<Manifest>,
}

pub(crate) struct ManifestLeases {
    manager: Arc<Manager>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl ManifestLeases {
    pub(crate) fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up a manifest and leases it in one step. `retire` takes the same
    /// table lock after its metadata swap, so it always sees a lease taken on
    /// the manifest it replaced.
    pub(crate) fn pin<F>(self: &Arc<Self>, lookup: F) -> Result<(Manifest, Option<ReadLease>)>
    where
        F: FnOnce() -> Result<Manifest>,
    {
        let mut leases = self.table();
        let manifest = lookup()?;
        let lease = manifest_key(&manifest).map(|key| {
            leases.entry(key.clone()).or_default().readers += 1;
            ReadLease {
                owner: self.clone(),
                key,
            }
        });
        Ok((manifest, lease))
    }

    /// Reclaims a manifest that is no longer reachable from metadata, now or
    /// when its last reader lets go.
    pub(crate) async fn retire(&self, manifest: Manifest) {
        if let Some(key) = manifest_key(&manifest) {
            let mut leases = self.table();
            if let Some(lease) = leases.get_mut(&key) {
                tracing::debug!(
                    "Deferring removal of {} chunk(s) until {} read(s) finish",
                    manifest.chunk_count(),
                    lease.readers
                );
                lease.retired = Some(manifest);
                return;
            }
        }
        self.manager.delete(&manifest).await;
    }

    pub(crate) fn active(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, key: &str) {
        let retired = {
            let mut leases = self.table();
            let remaining = match leases.get_mut(key) {
                Some(lease) => {
                    lease.readers = lease.readers.saturating_sub(1);
                    lease.readers
                }
                None => return,
            };
            if remaining > 0 {
                return;
            }
            leases.remove(key).and_then(|lease| lease.retired)
        };

        let Some(manifest) = retired else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                runtime.spawn(async move { manager.delete(&manifest).await });
            }
            Err(_) => tracing::warn!(
                "Leaking {} chunk(s) of a superseded manifest: no runtime to remove them",
                manifest.chunk_count()
            ),
        }
    }
}

/// Keeps one manifest's chunks in place while held.
pub(crate) struct ReadLease {
    owner: Arc<ManifestLeases>,
    key: String,
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

/// Every upload stores fresh chunks, so the first chunk names its manifest.
/// Empty manifests own nothing and are never leased.
fn manifest_key(manifest: &Manifest) -> Option<String> {
    manifest
        .chunks
        .first()
        .map(|chunk| format!("{}#{}", chunk.endpoint, chunk.remote.message_id))
}
