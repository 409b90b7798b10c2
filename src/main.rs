// FieldVault — Binary
//
// Thin wrapper over `fieldvault::cli`. Diagnostics are written to stderr;
// stdout carries only command results such as decrypted JSON.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fieldvault::cli::{execute, Cli};

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldvault=info"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = execute(Cli::parse()).await {
        eprintln!("fieldvault: {}", err);
        std::process::exit(1);
    }
}
