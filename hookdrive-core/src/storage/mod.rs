//! Storage modules for Hookdrive
//!
//! Provides single-chunk transfer against the endpoint pool, the backoff
//! policy it retries with, and the transports it can speak.

pub mod chunk_store;
pub mod endpoint;
pub mod memory;
pub mod retry;
pub mod transport;
pub mod webhook;

pub use chunk_store::{ChunkStore, DEFAULT_COOLDOWN, compute_hash, verify_hash};
pub use endpoint::{EndpointHealth, EndpointPool, EndpointStats};
pub use memory::MemoryTransport;
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{ChunkTransport, RemoteObject, TransferFailure};
pub use webhook::{DEFAULT_REQUEST_TIMEOUT, WebhookTransport};
