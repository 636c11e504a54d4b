//! # LexAI Live - Command Line Entry Point
//!
//! Opens a single voice session with the configured persona, prints status
//! changes to the log, and hangs up cleanly on Ctrl+C or SIGTERM.
//!
//! ## Configuration:
//! - `config.toml` in the working directory (optional)
//! - `APP_*` environment variables, e.g. `APP_SESSION__MODE=serious`
//! - `GEMINI_API_KEY` or `API_KEY` for the live endpoint
//!
//! ## Session Selection:
//! - `session.custom_persona` wins when set
//! - otherwise `session.preset` names a built-in simulator scenario
//! - otherwise the `session.mode` preset (cruise or serious) is used

use anyhow::Result;
use lexai_live::audio::session::{StatusCallback, StatusEvent, VolumeCallback};
use lexai_live::config::AppConfig;
use lexai_live::manager::SessionManager;
use lexai_live::persona::{find_preset, ConnectRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a shutdown signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting lexai-live v{}", env!("CARGO_PKG_VERSION"));
    info!("Live endpoint: {} (model {})", config.live.endpoint, config.live.model);
    tracing::debug!("Effective configuration:\n{}", config.to_toml()?);

    let request = connect_request(&config);
    let manager = SessionManager::new(config);

    setup_signal_handlers();

    let on_status: StatusCallback = Arc::new(|event: StatusEvent| match event.retry_after {
        Some(wait) => warn!(phase = event.phase.as_str(), retry_after_secs = wait.as_secs(), "{}", event.text),
        None => info!(phase = event.phase.as_str(), "{}", event.text),
    });
    let on_volume: VolumeCallback = Arc::new(|level| trace!(level, "Microphone level"));

    let phase = manager.connect(request, on_status, on_volume).await;
    if phase.is_terminal() {
        error!("Session did not open (phase {})", phase.as_str());
        return Ok(());
    }

    // Run until the user hangs up or the session ends on its own.
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) && !manager.phase().is_terminal() {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Hanging up...");
    manager.disconnect().await;
    info!("Session ended in phase {}", manager.phase().as_str());
    Ok(())
}

fn connect_request(config: &AppConfig) -> ConnectRequest {
    let session = &config.session;
    let request = ConnectRequest::new(session.mode);

    if let Some(persona) = session.custom_persona.as_deref() {
        return request.with_persona(persona);
    }

    match session.preset.as_deref() {
        Some(title) => match find_preset(title) {
            Some(preset) => {
                info!("Using simulator preset '{}'", preset.title);
                request.with_persona(preset.prompt)
            }
            None => {
                warn!("Unknown simulator preset '{}', using {} mode", title, session.mode);
                request
            }
        },
        None => request,
    }
}

/// Console logging, filtered by `RUST_LOG` (default `lexai_live=debug`).
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lexai_live=debug,tokio_tungstenite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip `SHUTDOWN_SIGNAL` on SIGINT or SIGTERM.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers ({}), falling back to Ctrl+C", e);
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}
