//! Active chunked transfers and the locks they hold.
//!
//! A table entry is live exactly while the corresponding per-path lock is
//! held: registering a stream parks the guard here, and the guard drops when
//! the entry is taken for the final chunk (or cancelled) and not reinserted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

/// The per-path lock a stream retains across RPCs.
pub enum StreamGuard {
    /// Download in flight — readers of the path are unaffected, writers wait.
    Read(OwnedRwLockReadGuard<()>),
    /// Upload in flight — the path is exclusively held.
    Write(OwnedRwLockWriteGuard<()>),
}

/// One in-flight chunked transfer.
pub struct Transfer {
    pub file: tokio::fs::File,
    pub path: String,
    pub guard: StreamGuard,
}

impl Transfer {
    pub fn is_download(&self) -> bool {
        matches!(self.guard, StreamGuard::Read(_))
    }
}

/// chunk_id → in-flight transfer. Ids are globally unique and monotonic.
#[derive(Default)]
pub struct TransferTable {
    inner: Mutex<HashMap<i32, Transfer>>,
    next_id: AtomicI32,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a transfer and mint the chunk id identifying its stream.
    pub fn register(&self, transfer: Transfer) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(id, transfer);
        id
    }

    /// Remove a transfer for servicing. The caller reinserts it with
    /// [`reinsert`](Self::reinsert) unless the stream is finished — dropping
    /// the returned value releases the held lock.
    pub fn take(&self, chunk_id: i32) -> Option<Transfer> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(&chunk_id)
    }

    pub fn reinsert(&self, chunk_id: i32, transfer: Transfer) {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(chunk_id, transfer);
    }

    /// Number of streams currently holding a lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.len()
    }
}
