//! Entry point: load configuration, open the domain log sinks, spawn the
//! scheduler and (if enabled) the control RPC, then wait for either to
//! exit or for a shutdown signal.

mod codec;
mod config;
mod context;
mod delivery;
mod errors;
mod logs;
mod mailbox;
mod models;
mod retry;
mod rpc;
mod rules;
mod scheduler;

use std::env::VarError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use context::ServiceContext;
use tracing_subscriber::EnvFilter;

const DATA_DIR_ENV: &str = "MAIL_FORWARD_GATEWAY_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "/etc/mail-forward-gateway";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = data_dir();
    tracing::info!(data_dir = %data_dir.display(), "starting up");

    let ctx = match ServiceContext::load(&data_dir) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "failed to load service context, exiting");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
        }) {
            tracing::warn!(error = %e, "failed to install shutdown signal handler");
        }
    }

    let api_enabled = ctx.config.lock().map(|c| c.api_enabled).unwrap_or(true);
    let api_port = ctx.config.lock().map(|c| c.api_port).unwrap_or(5555);

    let rpc_handle = if api_enabled {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        Some(thread::spawn(move || {
            if let Err(e) = rpc::run(ctx.clone(), api_port, shutdown) {
                ctx.logs.log_error(&format!("control RPC exited: {e}"));
            }
        }))
    } else {
        None
    };

    let scheduler_shutdown = shutdown.clone();
    let scheduler_ctx = ctx.clone();
    let scheduler_handle = thread::spawn(move || scheduler::run(scheduler_ctx, scheduler_shutdown));

    let _ = scheduler_handle.join();
    if let Some(handle) = rpc_handle {
        let _ = handle.join();
    }
}

fn data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(v) => PathBuf::from(v),
        Err(VarError::NotPresent) => PathBuf::from(DEFAULT_DATA_DIR),
        Err(VarError::NotUnicode(raw)) => {
            tracing::warn!(?raw, "{DATA_DIR_ENV} is not valid unicode, using default");
            PathBuf::from(DEFAULT_DATA_DIR)
        }
    }
}
