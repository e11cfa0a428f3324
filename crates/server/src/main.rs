mod api;
mod bootstrap;

use std::time::Duration;

use anyhow::Result;
use parley_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use parley_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let shutdown = async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    };
    let mut server = tokio::spawn(api::serve(listener, app.runtime.clone(), shutdown));

    spawn_guardrail_reloader(&app);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "parley-server started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        finished = &mut server => {
            finished??;
            return Ok(());
        }
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "parley-server stopping"
    );
    let _ = stop_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(finished) => finished??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "open connections did not drain within the grace period"
        ),
    }

    Ok(())
}

/// Re-reads guardrail settings from the config sources on SIGHUP.
#[cfg(unix)]
fn spawn_guardrail_reloader(app: &bootstrap::Application) {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = app.runtime.clone();
    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    event_name = "system.guardrails.reload_unavailable",
                    correlation_id = "bootstrap",
                    error = %error,
                    "SIGHUP handler could not be installed"
                );
                return;
            }
        };

        while hangups.recv().await.is_some() {
            match AppConfig::load(LoadOptions::default()) {
                Ok(config) => {
                    tracing::info!(
                        event_name = "system.guardrails.reloaded",
                        correlation_id = "reload",
                        guardrail_mode = config.guardrails.mode.as_str(),
                        "guardrail settings reloaded"
                    );
                    runtime.guardrails().reload(config.guardrails);
                }
                Err(error) => tracing::warn!(
                    event_name = "system.guardrails.reload_failed",
                    correlation_id = "reload",
                    error = %error,
                    "keeping previous guardrail settings"
                ),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_guardrail_reloader(_app: &bootstrap::Application) {}
