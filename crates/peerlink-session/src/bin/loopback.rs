//! Peerlink loopback demo
//!
//! Wires two registries together over an in-memory channel pair and
//! exchanges a text message between them.
//!
//! # Usage
//!
//! ```bash
//! peerlink-loopback --message "hello" --private
//! RUST_LOG=debug peerlink-loopback --config ./peerlink.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink_core::generate_peer_id;
use peerlink_session::{
    ChannelSessionRegistry, ChannelState, LoopbackChannel, RegistryEvent,
    SessionConfig, MESSAGING_CHANNEL_LABEL,
};

#[derive(Parser, Debug)]
#[command(name = "peerlink-loopback")]
#[command(about = "Exchange a message between two in-process peers")]
#[command(version)]
struct Args {
    /// Message to send
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// Mark the message as private
    #[arg(short, long)]
    private: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait for delivery
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => SessionConfig::load(),
    };

    let alice = ChannelSessionRegistry::new(peer_id()?, config.clone());
    let bob = ChannelSessionRegistry::new(peer_id()?, config);
    info!("Peers: {} <-> {}", alice.self_id(), bob.self_id());

    let mut bob_events = bob.subscribe();
    let (alice_end, bob_end) = LoopbackChannel::pair(MESSAGING_CHANNEL_LABEL);

    let factory_end = alice_end.clone();
    alice.ensure_messaging_session(bob.self_id(), move |_| Ok(factory_end))?;
    bob.attach_channel(alice.self_id(), bob_end);

    alice_end.establish();

    let outcome = alice.send_peer_message(bob.self_id(), args.message.as_str(), args.private)?;
    info!("Send outcome: {:?}", outcome);

    let deadline = tokio::time::sleep(Duration::from_secs(args.timeout));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("No message received within {}s", args.timeout);
                break;
            }
            event = bob_events.recv() => match event {
                Ok(RegistryEvent::IncomingMessage { message, peer_id, .. }) => {
                    info!(
                        "{} received {} from {} (private: {})",
                        bob.self_id(), message.content, peer_id, message.is_private
                    );
                    break;
                }
                Ok(RegistryEvent::DataChannelState { state, channel_id, .. }) => {
                    info!("{} channel {} is {}", bob.self_id(), channel_id, state);
                }
                Err(RecvError::Lagged(n)) => warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    alice.close_all();
    if let Ok(RegistryEvent::DataChannelState { state: ChannelState::Closed, .. }) =
        bob_events.try_recv()
    {
        info!("Channel closed on both ends");
    }
    info!("Remaining sessions: {} / {}", alice.session_count(), bob.session_count());

    Ok(())
}

fn peer_id() -> Result<String, String> {
    generate_peer_id().map_err(|e| format!("RNG failed: {}", e))
}
