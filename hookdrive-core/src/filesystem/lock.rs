use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Idle entries are swept once the table grows past this many paths.
const SWEEP_THRESHOLD: usize = 1024;

/// Per-path exclusive locks, created on first use.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.write().await;
            if locks.len() > SWEEP_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_same_path_is_exclusive() {
        let locks = PathLocks::new();
        let guard = locks.lock("/a").await;

        let mut contender = task::spawn(locks.lock("/a"));
        assert_pending!(contender.poll());

        let mut other = task::spawn(locks.lock("/b"));
        let _other_guard = assert_ready!(other.poll());

        drop(guard);
        assert!(contender.is_woken());
        let _guard = assert_ready!(contender.poll());
        drop(contender);
        drop(other);

        assert_eq!(locks.len().await, 2);
    }
}
