//! Metadata modules for Hookdrive
//!
//! Persists the directory tree and each file's committed manifest. Engines
//! are synchronous; every mutation is atomic on its own.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

use crate::manifest::Manifest;
use crate::path;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(EntryKind::File),
            "directory" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// A file or directory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// `None` until the first successful write.
    pub manifest: Option<Manifest>,
    /// Compare-and-swap token, bumped on every manifest commit.
    pub version: u64,
    pub modified_at: DateTime<Utc>,
}

impl Entry {
    pub fn directory(path: &str, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            manifest: None,
            version: 0,
            modified_at,
        }
    }

    pub fn file(path: &str, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::File,
            ..Self::directory(path, modified_at)
        }
    }

    pub fn name(&self) -> &str {
        path::name(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Storage contract for the namespace. Paths are already normalized and the
/// root directory always exists.
pub trait MetadataStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Entry>>;

    /// Fails with `AlreadyExists` if anything lives at `path`.
    fn create_dir(&self, path: &str) -> Result<Entry>;

    /// Returns the existing record when `path` is already a file.
    fn create_file(&self, path: &str) -> Result<Entry>;

    /// Children of `dir`, sorted by name.
    fn list(&self, dir: &str) -> Result<Vec<Entry>>;

    /// Installs `manifest` if the file is still at `expected_version`,
    /// otherwise fails with `Conflict`. Returns the committed record.
    fn commit_manifest(
        &self,
        path: &str,
        expected_version: u64,
        manifest: &Manifest,
        modified_at: DateTime<Utc>,
    ) -> Result<Entry>;

    /// Moves a file or a whole subtree. Never overwrites.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Removes a file record and returns it so its chunks can be reclaimed.
    fn remove_file(&self, path: &str) -> Result<Entry>;

    fn remove_dir(&self, path: &str) -> Result<()>;
}

/// Behaviour every engine must share.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::manifest::ChunkRef;
    use crate::storage::RemoteObject;
    use crate::DriveError;

    fn manifest(sizes: &[u64]) -> Manifest {
        let chunks = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ChunkRef {
                endpoint: "endpoint-0".to_string(),
                remote: RemoteObject {
                    message_id: i.to_string(),
                    url: format!("memory://{}", i),
                },
                size: *size,
                sha256: String::new(),
            })
            .collect();
        Manifest::new(chunks, 10)
    }

    pub fn root_exists(store: &dyn MetadataStore) {
        let root = store.get("/").unwrap().unwrap();
        assert!(root.is_dir());
        assert!(store.list("/").unwrap().is_empty());
        assert!(matches!(store.remove_dir("/"), Err(DriveError::InvalidRequest(_))));
        assert!(matches!(store.rename("/", "/x"), Err(DriveError::InvalidRequest(_))));
    }

    pub fn create_and_list(store: &dyn MetadataStore) {
        store.create_dir("/docs").unwrap();
        store.create_file("/docs/b.txt").unwrap();
        store.create_file("/docs/a.txt").unwrap();
        store.create_dir("/docs/c").unwrap();

        let names: Vec<String> = store
            .list("/docs")
            .unwrap()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c"]);

        let again = store.create_file("/docs/a.txt").unwrap();
        assert_eq!(again.version, 0);
        assert!(again.manifest.is_none());

        assert!(matches!(store.create_dir("/docs"), Err(DriveError::AlreadyExists(_))));
        assert!(matches!(store.create_file("/docs/c"), Err(DriveError::IsADirectory(_))));
        assert!(matches!(store.create_file("/missing/f"), Err(DriveError::NotFound(_))));
        assert!(matches!(
            store.create_file("/docs/a.txt/f"),
            Err(DriveError::NotADirectory(_))
        ));
        assert!(matches!(store.list("/docs/a.txt"), Err(DriveError::NotADirectory(_))));
        assert!(matches!(store.list("/nope"), Err(DriveError::NotFound(_))));
    }

    pub fn compare_and_swap(store: &dyn MetadataStore) {
        store.create_file("/f").unwrap();
        let first = manifest(&[10, 5]);
        let committed = store
            .commit_manifest("/f", 0, &first, Utc::now())
            .unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(committed.size, 15);

        let stale = store.commit_manifest("/f", 0, &manifest(&[1]), Utc::now());
        assert!(matches!(stale, Err(DriveError::Conflict(_))));

        let stored = store.get("/f").unwrap().unwrap();
        assert_eq!(stored.manifest, Some(first));
        assert_eq!(stored.version, 1);

        assert!(matches!(
            store.commit_manifest("/nope", 0, &manifest(&[1]), Utc::now()),
            Err(DriveError::NotFound(_))
        ));
        assert!(matches!(
            store.commit_manifest("/", 0, &manifest(&[1]), Utc::now()),
            Err(DriveError::IsADirectory(_))
        ));
    }

    pub fn rename_subtree(store: &dyn MetadataStore) {
        store.create_dir("/a").unwrap();
        store.create_dir("/a/b").unwrap();
        store.create_file("/a/b/f").unwrap();
        store
            .commit_manifest("/a/b/f", 0, &manifest(&[3]), Utc::now())
            .unwrap();
        store.create_dir("/z").unwrap();

        assert!(matches!(store.rename("/a", "/a/b/x"), Err(DriveError::InvalidRequest(_))));
        assert!(matches!(store.rename("/a", "/z"), Err(DriveError::AlreadyExists(_))));
        assert!(matches!(store.rename("/nope", "/y"), Err(DriveError::NotFound(_))));
        assert!(matches!(store.rename("/a", "/q/y"), Err(DriveError::NotFound(_))));

        store.rename("/a", "/z/moved").unwrap();
        assert!(store.get("/a").unwrap().is_none());
        assert!(store.get("/a/b/f").unwrap().is_none());
        let moved = store.get("/z/moved/b/f").unwrap().unwrap();
        assert_eq!(moved.size, 3);
        assert_eq!(moved.version, 1);
        assert_eq!(store.list("/z/moved").unwrap().len(), 1);
    }

    pub fn remove(store: &dyn MetadataStore) {
        store.create_dir("/d").unwrap();
        store.create_file("/d/f").unwrap();
        store
            .commit_manifest("/d/f", 0, &manifest(&[4]), Utc::now())
            .unwrap();

        assert!(matches!(store.remove_dir("/d"), Err(DriveError::DirectoryNotEmpty(_))));
        assert!(matches!(store.remove_file("/d"), Err(DriveError::IsADirectory(_))));
        assert!(matches!(store.remove_dir("/d/f"), Err(DriveError::NotADirectory(_))));

        let removed = store.remove_file("/d/f").unwrap();
        assert_eq!(removed.manifest.map(|m| m.chunk_count()), Some(1));
        assert!(matches!(store.remove_file("/d/f"), Err(DriveError::NotFound(_))));

        store.remove_dir("/d").unwrap();
        assert!(store.get("/d").unwrap().is_none());
    }
}
