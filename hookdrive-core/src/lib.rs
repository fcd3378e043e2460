//! Hookdrive Core - a virtual drive stored as chat webhook attachments
//!
//! Files are split into size-capped chunks that are spread over a pool of
//! webhook endpoints:
//! - Bounded, ordered chunk upload with retry and endpoint cool-down
//! - Byte-range reads that fetch only the chunks they touch
//! - Whole-file replace committed by compare-and-swap on a per-file version
//! - SQLite for the directory tree and manifests

pub mod error;
pub mod filesystem;
pub mod manager;
pub mod manifest;
pub mod metadata;
pub mod path;
pub mod storage;

pub use error::{DriveError, Result};
pub use filesystem::{DriveFs, FileHandle, FileInfo, OpenMode, PathLocks, ReadStream, VirtualFs};
pub use manager::{ByteStream, DEFAULT_DOWNLOAD_WORKERS, DEFAULT_UPLOAD_WORKERS, Manager, ManagerBuilder};
pub use manifest::{ChunkRef, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, Manifest, validate_chunk_size};
pub use metadata::{Entry, EntryKind, MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
pub use path::normalize_path;
pub use storage::{
    ChunkStore, ChunkTransport, EndpointHealth, EndpointStats, MemoryTransport, RemoteObject,
    RetryPolicy, TransferFailure, WebhookTransport, compute_hash, verify_hash,
};
