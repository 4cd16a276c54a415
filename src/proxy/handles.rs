//! Descriptor table for open files and directory pseudo-descriptors.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::proxy::state::VersionKey;
use crate::wire::OpenMode;

/// First descriptor handed out for regular files.
pub const FILE_FD_START: i32 = 1024;

/// First descriptor handed out for directory pseudo-handles. Disjoint from
/// the file range; directories carry no cache state.
pub const DIR_FD_START: i32 = 1 << 30;

/// Positions a seek is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// One open file: the OS handle (whose position read/write/lseek mutate), the
/// cached version it pins, and the mode it was opened with.
pub(crate) struct OpenHandle {
    pub(crate) file: tokio::sync::Mutex<tokio::fs::File>,
    pub(crate) key: VersionKey,
    pub(crate) mode: OpenMode,
}

#[derive(Clone)]
pub(crate) enum Descriptor {
    File(Arc<OpenHandle>),
    Directory,
}

/// Concurrent descriptor table with monotonic allocation.
pub(crate) struct FdTable {
    entries: scc::HashMap<i32, Descriptor>,
    next_file: AtomicI32,
    next_dir: AtomicI32,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
            next_file: AtomicI32::new(FILE_FD_START),
            next_dir: AtomicI32::new(DIR_FD_START),
        }
    }

    pub(crate) fn register_file(&self, handle: OpenHandle) -> i32 {
        let fd = self.next_file.fetch_add(1, Ordering::Relaxed);
        let _ = self.entries.insert(fd, Descriptor::File(Arc::new(handle)));
        fd
    }

    pub(crate) fn register_directory(&self) -> i32 {
        let fd = self.next_dir.fetch_add(1, Ordering::Relaxed);
        let _ = self.entries.insert(fd, Descriptor::Directory);
        fd
    }

    pub(crate) fn get(&self, fd: i32) -> Option<Descriptor> {
        self.entries.read(&fd, |_, d| d.clone())
    }

    pub(crate) fn remove(&self, fd: i32) -> Option<Descriptor> {
        self.entries.remove(&fd).map(|(_, d)| d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_and_directory_ranges_are_disjoint() {
        let table = FdTable::new();
        let dir_fd = table.register_directory();
        assert!(dir_fd >= DIR_FD_START);

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        tokio::fs::write(&path, b"x").await.unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let file_fd = table.register_file(OpenHandle {
            file: tokio::sync::Mutex::new(file),
            key: VersionKey::new("f", 0),
            mode: OpenMode::Read,
        });
        assert!(
            (FILE_FD_START..DIR_FD_START).contains(&file_fd),
            "file descriptors must stay below the directory range"
        );
    }

    #[test]
    fn remove_makes_descriptor_unknown() {
        let table = FdTable::new();
        let fd = table.register_directory();
        assert!(table.get(fd).is_some());
        assert!(table.remove(fd).is_some());
        assert!(table.get(fd).is_none());
        assert!(table.remove(fd).is_none());
    }
}
