//! Smoke-test CLI over the caching proxy: fetch, store, or remove one file
//! through the cache. The full client-facing RPC receiver lives outside this
//! crate; this tool exists to exercise a deployment end to end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt};

use cachefs::config::ProxyConfig;
use cachefs::errors::FsError;
use cachefs::proxy::Proxy;
use cachefs::rpc::RpcClient;
use cachefs::wire::OpenMode;

#[derive(Parser)]
#[command(name = "cachefs-proxy", version)]
struct Args {
    /// Host of the authoritative server.
    #[arg(long, env = "CACHEFS_SERVER_HOST", default_value = "127.0.0.1")]
    server_host: String,

    /// Port of the authoritative server.
    #[arg(long, env = "CACHEFS_SERVER_PORT", default_value_t = 9090)]
    server_port: u16,

    /// Local directory for cached file versions.
    #[arg(long, env = "CACHEFS_CACHE_ROOT")]
    cache_root: PathBuf,

    /// Cache capacity, e.g. "512mb".
    #[arg(long, env = "CACHEFS_CACHE_CAPACITY", default_value = "256mb")]
    cache_capacity: ByteSize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a file through the cache and write it to stdout.
    Cat { path: String },
    /// Store a local file on the server under the given path.
    Put { path: String, local: PathBuf },
    /// Remove a file from the server.
    Rm { path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ProxyConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        cache_root: args.cache_root,
        cache_capacity: args.cache_capacity,
    };
    if let Err(errors) = config.validate() {
        for message in errors {
            error!("{message}");
        }
        return ExitCode::FAILURE;
    }

    let remote = match RpcClient::connect(&config.server_host, config.server_port).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(
                host = %config.server_host,
                port = config.server_port,
                "failed to connect: {e}"
            );
            return ExitCode::FAILURE;
        }
    };

    let proxy = match Proxy::new(remote, &config.cache_root, config.cache_capacity.as_u64()).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("failed to prepare cache root: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&proxy, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e} (errno {})", e.errno());
            ExitCode::FAILURE
        }
    }
}

async fn run(proxy: &Proxy, command: Command) -> Result<(), FsError> {
    match command {
        Command::Cat { path } => {
            let fd = proxy.open(&path, OpenMode::Read).await?;
            let mut stdout = tokio::io::stdout();
            loop {
                let data = proxy.read(fd, 64 * 1024).await?;
                if data.is_empty() {
                    break;
                }
                stdout.write_all(&data).await.map_err(FsError::from)?;
            }
            stdout.flush().await.map_err(FsError::from)?;
            proxy.close(fd).await
        }
        Command::Put { path, local } => {
            let contents = tokio::fs::read(&local).await.map_err(FsError::from)?;
            let fd = proxy.open(&path, OpenMode::Create).await?;
            proxy.write(fd, &contents).await?;
            proxy.close(fd).await
        }
        Command::Rm { path } => proxy.unlink(&path).await,
    }
}
