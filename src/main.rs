//! Roomtester - room acoustics testbed
//!
//! Loads a reference and a room recording, estimates the room impulse
//! response, renders the processed source and serves the control plane.

use anyhow::{Context, Result};
use roomtester::cli::{self, Command};
use roomtester::config::AppConfig;
use roomtester::logging;
use roomtester_core::{
    load_and_prepare, write_wav, HistoryStore, MeterRegistry, MeteringContext, Source,
};
use roomtester_server::{start_server, AppState, ServerConfig};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let options = match cli::parse(std::env::args().skip(1)) {
        Ok(Command::Run(options)) => options,
        Ok(Command::Help) => {
            cli::print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("roomtester {} ({})", roomtester::VERSION, roomtester::BUILD_DATE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            cli::print_help();
            std::process::exit(2);
        }
    };

    let config_path = options.config_path.clone().unwrap_or_else(AppConfig::path);
    let (mut config, source) = AppConfig::load_from(&config_path);
    options.apply(&mut config);

    let _log_guard = logging::init(&config.log_dir).context("Failed to initialize logging")?;
    source.log();

    println!("Roomtester v{} - room acoustics testbed", roomtester::VERSION);
    println!("  reference: {}", config.reference_path.display());
    println!("  room:      {}", config.room_path.display());
    println!();

    let prepared = load_and_prepare(&config.reference_path, &config.room_path, &config.ir)
        .with_context(|| {
            format!(
                "Failed to prepare sources from {} and {}",
                config.reference_path.display(),
                config.room_path.display()
            )
        })?;

    if let Some(path) = &options.save_processed {
        write_wav(path, prepared.store.get(Source::Processed))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Processed source written");
    }

    let history = match HistoryStore::open(&config.history_path, config.snapshot_every) {
        Ok(history) => history,
        Err(e) => {
            warn!(
                path = %config.history_path.display(),
                "Failed to open meter history ({}), keeping it in memory",
                e
            );
            HistoryStore::in_memory()
        }
    };
    let metering = MeteringContext::new(MeterRegistry::with_builtin(), history);

    let server_config = ServerConfig {
        port: config.port,
        bind_addr: config.bind_addr.clone(),
    };

    let state = AppState::new(Arc::new(prepared.store), metering, server_config)
        .context("Failed to start playback engine")?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    info!(
        "Serving on http://{}:{} (WebSocket at /api/v1/ws)",
        config.bind_addr, config.port
    );
    runtime.block_on(start_server(state.clone(), shutdown_signal()))?;

    info!("Shutting down, flushing meter history");
    match state.metering.lock() {
        Ok(mut metering) => {
            if let Err(e) = metering.history_mut().snapshot() {
                error!("Failed to save meter history: {}", e);
            }
        }
        Err(_) => error!("Metering state poisoned, history not flushed"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received");
}
