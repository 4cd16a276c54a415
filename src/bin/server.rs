//! Serve a directory tree to caching proxies.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt};

use cachefs::config::ServerConfig;
use cachefs::rpc;
use cachefs::server::FileServer;

#[derive(Parser)]
#[command(name = "cachefs-server", version)]
struct Args {
    /// TCP port to listen on.
    #[arg(long, env = "CACHEFS_PORT", default_value_t = 9090)]
    port: u16,

    /// Directory holding the canonical file tree.
    #[arg(long, env = "CACHEFS_ROOT")]
    root_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig {
        port: args.port,
        root_dir: args.root_dir,
    };
    if let Err(errors) = config.validate() {
        for message in errors {
            error!("{message}");
        }
        return ExitCode::FAILURE;
    }

    let server = match FileServer::open(&config.root_dir).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(root = %config.root_dir.display(), "failed to open service root: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = config.port, "failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = rpc::serve(listener, server).await {
        error!("server terminated: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
