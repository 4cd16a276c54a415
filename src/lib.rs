//! AFS-style distributed file cache with open-close session semantics.
//!
//! A client issues POSIX-like file operations against a local [`proxy::Proxy`],
//! which caches file contents on local disk and revalidates them with a single
//! authoritative [`server::FileServer`] at open time (check-on-use). A file
//! opened at time `t` sees a consistent snapshot until closed, independent of
//! concurrent modifications by others; concurrent writers are isolated per-open
//! and resolve last-close-wins.
//!
//! The two halves talk through the [`remote::FileManager`] trait. The server
//! implements it directly (handy for in-process tests); [`rpc::RpcClient`]
//! implements it over a length-prefixed TCP transport so the two binaries can
//! run on separate hosts.

pub mod config;
pub mod errors;
pub mod proxy;
pub mod remote;
pub mod rpc;
pub mod server;
pub mod wire;
