//! Deployment Manager - Entry Point
//!
//! Long-running service that accepts deployment requests and drives them
//! through build, start, monitoring and teardown.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deployd::app::options::{AppOptions, StorageOptions};
use deployd::app::run::run;
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::layout::StorageLayout;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --json-logs
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    if cli_args.contains_key("version") {
        println!("deployd {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // Initialize logging
    let mut log_options = LogOptions {
        json_format: cli_args.contains_key("json-logs"),
        ..Default::default()
    };
    if let Some(level) = cli_args.get("log-level") {
        match level.parse() {
            Ok(level) => log_options.log_level = level,
            Err(e) => {
                println!("{e}");
                return;
            }
        }
    }
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Assemble options from flags and environment
    let mut options = AppOptions::default();
    if let Some(workspace) = cli_args
        .get("workspace")
        .cloned()
        .or_else(|| env::var("DEPLOYD_WORKSPACE").ok())
    {
        options.workspace = PathBuf::from(workspace);
    }
    if let Some(storage) = cli_args
        .get("storage-dir")
        .cloned()
        .or_else(|| env::var("DEPLOYD_STORAGE_DIR").ok())
    {
        options.storage = StorageOptions {
            layout: StorageLayout::new(storage),
        };
    }
    if cli_args.contains_key("no-monitor") {
        options.enable_monitor = false;
    }

    info!("Running deployment manager with options: {:?}", options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the deployment manager: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
