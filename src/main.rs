// src/main.rs

//! The main entry point for the Ignis Sentinel binary.

use anyhow::Result;
use std::env;
use std::path::Path;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Ignis Sentinel version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("sentinel.conf");

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ignis_sentinel=debug".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().with_ansi(true).init();

    if let Err(e) = ignis_sentinel::run(Path::new(config_path)).await {
        error!("Sentinel runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
