//! roomcall-core - Main entry point
//!
//! Joins one room on the signaling relay and negotiates a two-party
//! WebRTC call, logging call state transitions until interrupted.

mod args;
mod config;
mod media;
mod peer;
mod session;
mod signaling;

use args::Args;
use clap::Parser;
use config::Config;
use log::{error, info, warn};
use media::TrackCapture;
use peer::RtcPeerLinkFactory;
use session::SessionController;
use signaling::channel::SignalingChannel;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("ROOMCALL_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("roomcall-core v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    if let Some(ref server) = args.server {
        config.signaling.url = server.clone();
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let user_id = args
        .user
        .clone()
        .unwrap_or_else(|| format!("user_{}", uuid::Uuid::new_v4().simple()));
    info!("Joining room {} as {}", args.room, user_id);

    // Signaling channel task
    let (channel_tx, channel_events) = SignalingChannel::new(&config.signaling).spawn();

    // Session controller task
    let capture = Arc::new(TrackCapture::new(&config.media));
    let link_factory = Arc::new(RtcPeerLinkFactory::new(config.webrtc.clone()));
    let handle = SessionController::spawn(
        args.room.clone(),
        user_id,
        capture,
        link_factory,
        channel_tx.clone(),
        channel_events,
    );

    handle.start_call();

    // Log call state transitions until interrupted
    let mut snapshots = handle.watch();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    error!("Session controller stopped unexpectedly");
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                match snapshot.remote_user_id {
                    Some(ref peer) => info!("Call state: {} (peer {})", snapshot.call_state, peer),
                    None => info!("Call state: {}", snapshot.call_state),
                }
            }
        }
    }

    // Graceful teardown: leave the room, release resources, close the relay
    handle.end_call();
    handle.shutdown().await;
    let _ = channel_tx.send(signaling::channel::ChannelCommand::Shutdown);

    info!("roomcall-core stopped");
    Ok(())
}
