//! The authoritative file server: versioned store, per-path locking, and the
//! chunked-transfer state machine behind the RPC surface.

mod locks;
mod service;
mod store;
mod transfer;

pub use locks::PathLocks;
pub use service::FileServer;
pub use store::{FileStore, Verdict};
pub use transfer::{StreamGuard, Transfer, TransferTable};
