#![allow(dead_code, reason = "each test binary uses a subset of these helpers")]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use cachefs::errors::RpcError;
use cachefs::proxy::Proxy;
use cachefs::remote::FileManager;
use cachefs::server::FileServer;
use cachefs::wire::{
    DeleteReply, FileChunk, SINGLE_CHUNK, UploadReply, ValidateParam, ValidateReply,
    next_chunk_len,
};

/// An in-process server over a temp directory seeded with `files`.
pub async fn server_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Arc<FileServer>) {
    let tmp = tempfile::tempdir().unwrap();
    write_tree(tmp.path(), files);
    let server = FileServer::open(tmp.path()).await.unwrap();
    (tmp, Arc::new(server))
}

pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (name, contents) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

/// A proxy over `remote` with a fresh cache root of the given capacity.
pub async fn proxy_over(
    remote: Arc<dyn FileManager>,
    capacity: u64,
) -> (tempfile::TempDir, Proxy) {
    let tmp = tempfile::tempdir().unwrap();
    let proxy = Proxy::new(remote, tmp.path(), capacity).await.unwrap();
    (tmp, proxy)
}

/// Read from `fd` until EOF.
pub async fn read_to_end(proxy: &Proxy, fd: i32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let data = proxy.read(fd, 64 * 1024).await.unwrap();
        if data.is_empty() {
            break;
        }
        out.extend_from_slice(&data);
    }
    out
}

/// Install `body` as the new canonical contents of `path` on the server,
/// chunked the way a real writer close would send it.
pub async fn upload_file(server: &FileServer, path: &str, body: &[u8]) {
    let (len, mut end_of_file) = next_chunk_len(body.len() as u64);
    let reply = server
        .upload(
            path.to_owned(),
            FileChunk {
                data: body[..len].to_vec().into(),
                end_of_file,
                chunk_id: SINGLE_CHUNK,
            },
        )
        .await
        .unwrap();

    let mut offset = len;
    while !end_of_file {
        let (len, last) = next_chunk_len((body.len() - offset) as u64);
        end_of_file = last;
        server
            .upload_chunk(FileChunk {
                data: body[offset..offset + len].to_vec().into(),
                end_of_file,
                chunk_id: reply.chunk_id,
            })
            .await
            .unwrap();
        offset += len;
    }
}

/// A [`FileManager`] decorator counting protocol traffic.
pub struct CountingRemote {
    inner: Arc<dyn FileManager>,
    /// Validate replies that carried content.
    chunk_validates: AtomicUsize,
    download_chunks: AtomicUsize,
    uploads: AtomicUsize,
    cancels: AtomicUsize,
}

impl CountingRemote {
    pub fn new(inner: Arc<dyn FileManager>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            chunk_validates: AtomicUsize::new(0),
            download_chunks: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn chunk_validate_count(&self) -> usize {
        self.chunk_validates.load(Ordering::Relaxed)
    }

    pub fn download_chunk_count(&self) -> usize {
        self.download_chunks.load(Ordering::Relaxed)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FileManager for CountingRemote {
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError> {
        let reply = self.inner.validate(param).await?;
        if reply.chunk.is_some() {
            self.chunk_validates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(reply)
    }

    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError> {
        self.download_chunks.fetch_add(1, Ordering::Relaxed);
        self.inner.download_chunk(chunk_id).await
    }

    async fn upload(&self, path: String, chunk: FileChunk) -> Result<UploadReply, RpcError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.inner.upload(path, chunk).await
    }

    async fn upload_chunk(&self, chunk: FileChunk) -> Result<(), RpcError> {
        self.inner.upload_chunk(chunk).await
    }

    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError> {
        self.cancels.fetch_add(1, Ordering::Relaxed);
        self.inner.cancel_chunk(chunk_id).await
    }

    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError> {
        self.inner.delete(path).await
    }
}

/// A [`FileManager`] decorator that can be switched into failing every
/// `download_chunk` call, for exercising a transfer that dies mid-stream.
pub struct FlakyDownloads {
    inner: Arc<dyn FileManager>,
    failing: AtomicBool,
}

impl FlakyDownloads {
    pub fn new(inner: Arc<dyn FileManager>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl FileManager for FlakyDownloads {
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError> {
        self.inner.validate(param).await
    }

    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError> {
        if self.failing.load(Ordering::Relaxed) {
            // A broken transport means the server eventually observes the
            // disconnect; cancel so its reader lock is not leaked.
            let _ = self.inner.cancel_chunk(chunk_id).await;
            return Err(RpcError::Remote("injected download failure".to_owned()));
        }
        self.inner.download_chunk(chunk_id).await
    }

    async fn upload(&self, path: String, chunk: FileChunk) -> Result<UploadReply, RpcError> {
        self.inner.upload(path, chunk).await
    }

    async fn upload_chunk(&self, chunk: FileChunk) -> Result<(), RpcError> {
        self.inner.upload_chunk(chunk).await
    }

    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError> {
        self.inner.cancel_chunk(chunk_id).await
    }

    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError> {
        self.inner.delete(path).await
    }
}

/// A [`FileManager`] decorator whose uploads always fail at the transport
/// level, for exercising the writer-close rollback path.
pub struct FailingUploads {
    inner: Arc<dyn FileManager>,
}

impl FailingUploads {
    pub fn new(inner: Arc<dyn FileManager>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl FileManager for FailingUploads {
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError> {
        self.inner.validate(param).await
    }

    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError> {
        self.inner.download_chunk(chunk_id).await
    }

    async fn upload(&self, _path: String, _chunk: FileChunk) -> Result<UploadReply, RpcError> {
        Err(RpcError::Remote("injected upload failure".to_owned()))
    }

    async fn upload_chunk(&self, _chunk: FileChunk) -> Result<(), RpcError> {
        Err(RpcError::Remote("injected upload failure".to_owned()))
    }

    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError> {
        self.inner.cancel_chunk(chunk_id).await
    }

    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError> {
        self.inner.delete(path).await
    }
}
