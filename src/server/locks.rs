//! Per-path reader/writer locks, created lazily on first reference.
//!
//! Guards are *owned* (`OwnedRwLockReadGuard` / `OwnedRwLockWriteGuard`) so a
//! chunked transfer can park its guard in the transfer table and release it
//! on the final chunk or on cancel — long after the RPC that acquired it has
//! returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Lazy map of path → reader/writer lock. The global mutex guards only the
/// map itself; waiting for a per-path lock never blocks other paths.
#[derive(Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            map.entry(path.to_owned())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Acquire the path's reader lock. Multiple readers may hold it at once;
    /// a writer excludes them all.
    pub async fn read_owned(&self, path: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(path).read_owned().await
    }

    /// Acquire the path's writer lock, excluding readers and other writers.
    pub async fn write_owned(&self, path: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(path).write_owned().await
    }

    /// Drop the lock entry for a path that no longer exists. In-flight guards
    /// keep the lock alive through their `Arc`; only the map entry goes away.
    pub fn remove(&self, path: &str) {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(path);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn locks_are_created_lazily_and_removed() {
        let locks = PathLocks::new();
        assert_eq!(locks.len(), 0);
        drop(locks.read_owned("a.txt").await);
        assert_eq!(locks.len(), 1);
        locks.remove("a.txt");
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn readers_share_and_writer_excludes() {
        let locks = Arc::new(PathLocks::new());

        let r1 = locks.read_owned("f").await;
        let r2 = locks.read_owned("f").await;

        let write_attempt = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _w = locks.write_owned("f").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !write_attempt.is_finished(),
            "writer must wait while readers hold the lock"
        );

        drop(r1);
        drop(r2);
        tokio::time::timeout(Duration::from_secs(1), write_attempt)
            .await
            .expect("writer should proceed once readers release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_paths_do_not_contend() {
        let locks = PathLocks::new();
        let _w1 = locks.write_owned("a").await;
        let _w2 = tokio::time::timeout(Duration::from_millis(100), locks.write_owned("b"))
            .await
            .expect("unrelated path should not block");
    }
}
