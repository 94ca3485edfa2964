//! voice-avatar-daemon: turn-taking coordinator for a conversational avatar
//!
//! This daemon sits between a browser client and the backend and provides:
//! - A turn arbiter deciding Silent / Listening / Speaking
//! - Feedback prevention: the microphone is never open while the bot speaks
//! - Single-session ownership of the client-side speech recognizer
//! - IPC server for the client and the perception service
//!
//! Out of scope: camera capture, speech synthesis itself, response
//! generation, and rendering.

mod avatar;
mod config;
mod events;
mod ipc;
mod lifecycle;
mod playback;
mod presence;
mod recognition;
mod state;

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::OutboundEvent;
use crate::ipc::{ClientLinks, Server};
use crate::lifecycle::ShutdownSignal;
use crate::playback::PlaybackSignal;
use crate::recognition::{Recognizer, RemoteEngine};
use crate::state::{Coordinator, Input};

/// Time given to subscriber forwarders to deliver the final events
const FLUSH_GRACE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-avatar-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        ?config.socket_path,
        language = %config.recognition.language,
        settle_ms = config.timings.settle.as_millis() as u64,
        "configuration loaded"
    );

    // Register signal handlers before anything long-running starts
    let mut shutdown = ShutdownSignal::new()?;

    // Create channels for inter-component communication
    // Signal sources -> coordinator
    let (input_tx, input_rx) = mpsc::unbounded_channel::<Input>();
    // Coordinator -> IPC subscribers
    let (event_tx, _event_rx) = broadcast::channel::<OutboundEvent>(64);

    // Every playback source shares this gate
    let playback = PlaybackSignal::new(input_tx.clone());

    // The recognizer runs in the browser; the daemon drives it remotely
    let engine = RemoteEngine::new(event_tx.clone(), config.recognition.clone());
    let mut coordinator = Coordinator::new(
        &config,
        Recognizer::new(engine),
        input_tx.clone(),
        event_tx.clone(),
    );

    let server = Server::new(
        &config.socket_path,
        ClientLinks {
            input_tx,
            events: event_tx.clone(),
            playback,
        },
    )?;

    // Subscribe to outbound events for the status snapshot
    let mut status_rx = event_tx.subscribe();
    let server_for_events = &server;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the coordinator (processes every signal)
        _ = coordinator.run(input_rx) => {
            info!("coordinator exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Keep the status snapshot in sync with published events
        _ = async {
            loop {
                match status_rx.recv().await {
                    Ok(event) => {
                        info!(%event, "outbound event");
                        server_for_events.apply_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "status receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("status sync exited");
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    // Leave the browser recognizer stopped, not capturing
    coordinator.shutdown();
    tokio::time::sleep(FLUSH_GRACE).await;

    server.shutdown().await;

    info!("voice-avatar-daemon stopped");

    Ok(())
}
