//! Open-file sessions.

use super::lease::ReadLease;
use crate::manager::{ByteStream, Manager};
use crate::manifest::Manifest;
use crate::{DriveError, Result};
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Bytes buffered between `write` calls and the chunking upload.
pub const WRITE_PIPE_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
}

/// A streaming upload fed through a bounded pipe. Dropping the session
/// without finishing it aborts the upload.
#[derive(Debug)]
pub struct WriteSession {
    pipe: Option<DuplexStream>,
    upload: Option<JoinHandle<Result<Manifest>>>,
    written: u64,
}

impl WriteSession {
    pub(crate) fn start(manager: &Manager) -> Self {
        let (pipe, reader) = tokio::io::duplex(WRITE_PIPE_CAPACITY);
        let manager = manager.clone();
        let upload = tokio::spawn(async move { manager.put(reader).await });

        Self {
            pipe: Some(pipe),
            upload: Some(upload),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns `false` when the upload side has gone away, which only happens
    /// once it failed.
    pub(crate) async fn feed(&mut self, data: &[u8]) -> bool {
        let Some(pipe) = self.pipe.as_mut() else {
            return false;
        };
        match pipe.write_all(data).await {
            Ok(()) => {
                self.written += data.len() as u64;
                true
            }
            Err(_) => false,
        }
    }

    /// Signals end of input and waits for the upload to settle.
    pub(crate) async fn finish(mut self) -> Result<Manifest> {
        if let Some(mut pipe) = self.pipe.take() {
            // A failed shutdown means the reader is gone; the upload result says why.
            let _ = pipe.shutdown().await;
        }

        let upload = self
            .upload
            .take()
            .ok_or_else(|| DriveError::Internal("write session already finished".to_string()))?;
        upload
            .await
            .map_err(|join_error| DriveError::Internal(format!("upload task failed: {}", join_error)))?
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if let Some(upload) = self.upload.take() {
            tracing::debug!("Abandoning unfinished write session");
            upload.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) enum HandleState {
    Read,
    Write(WriteSession),
    Closed,
}

/// Handle returned by `open`; valid until passed to `close`.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
    pub(crate) state: HandleState,
}

impl FileHandle {
    pub(crate) fn reader(path: String) -> Self {
        Self {
            path,
            state: HandleState::Read,
        }
    }

    pub(crate) fn writer(path: String, session: WriteSession) -> Self {
        Self {
            path,
            state: HandleState::Write(session),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes accepted so far by a write handle.
    pub fn bytes_written(&self) -> u64 {
        match &self.state {
            HandleState::Write(session) => session.written(),
            _ => 0,
        }
    }

    pub(crate) fn take_state(&mut self) -> HandleState {
        std::mem::replace(&mut self.state, HandleState::Closed)
    }
}

/// Bytes of one committed version of a file. The sizes describe the version
/// captured when the read started, whatever commits land while it streams.
pub struct ReadStream {
    file_size: u64,
    length: u64,
    inner: ByteStream,
    _lease: Option<ReadLease>,
}

impl ReadStream {
    pub(crate) fn new(
        manifest: &Manifest,
        offset: u64,
        length: u64,
        inner: ByteStream,
        lease: Option<ReadLease>,
    ) -> Self {
        Self {
            file_size: manifest.size,
            length: manifest.clip(offset, length),
            inner,
            _lease: lease,
        }
    }

    /// Size of the file version being read.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Total bytes this stream yields.
    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Stream for ReadStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
