//! scheme-daemon: keeps a directory of profiles in sync with the filesystem.
//!
//! Runs the scheme-core store against the native filesystem, feeding it
//! batches from a file watcher and saving on an interval.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use scheme_daemon::{Args, Config, Daemon, FileWatcher};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,scheme_daemon=debug,scheme_core=debug"
    } else {
        "info,scheme_daemon=info,scheme_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::try_from(args)?;
    info!("Starting scheme-daemon");
    info!("Root: {:?}", config.root);
    info!("Directory: {}", config.store.directory);
    if let Ok(json) = serde_json::to_string(&config) {
        debug!("Effective config: {}", json);
    }

    let daemon = tokio::task::spawn_blocking(move || Daemon::open(config)).await??;
    info!(
        "Loaded {} profile(s), current: {}",
        daemon.store().all_schemes().len(),
        daemon
            .store()
            .current_scheme_name()
            .unwrap_or_else(|| "<none>".to_string())
    );

    let mut watcher = FileWatcher::new(daemon.root().to_path_buf())?;
    info!("File watcher started");

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon
        .run(&mut watcher, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    info!("Shutting down");
    Ok(())
}
