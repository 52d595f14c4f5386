//! posecast - headless pose telemetry sender and listener
//!
//! Subcommands:
//! - `posecast run` - Capture synthetic bodies and stream them to peers over UDP
//! - `posecast listen` - Accept a stream and log what arrives
//! - `posecast config` - Print the default pipeline configuration

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use posecast_capture::SyntheticSource;
use posecast_engine::{Engine, EngineParts};
use posecast_ipc::{
    command_channel, event_channel, Compression, DeliveryMode, EngineCommand, EngineEvent,
    PipelineConfig,
};
use posecast_transport::{DirectPeerChannel, DistributionChannel, InboundMessage, PeerLink, UdpPeerLink};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Overrides;

#[derive(Parser)]
#[command(name = "posecast")]
#[command(about = "Stream tracked body poses to nearby devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream synthetic bodies over the direct channel
    Run {
        /// Address to bind the peer link to
        #[arg(short, long, default_value = "0.0.0.0:7070")]
        bind: SocketAddr,

        /// Display name announced to peers
        #[arg(short, long, default_value = "posecast")]
        name: String,

        /// Peers to invite (they must be listening)
        #[arg(short, long)]
        peer: Vec<SocketAddr>,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of synthetic bodies
        #[arg(long, default_value = "1")]
        bodies: usize,

        /// Synthetic capture rate in Hz
        #[arg(long, default_value = "60")]
        capture_hz: u32,

        /// Pacer frequency override
        #[arg(long)]
        hz: Option<u32>,

        /// Dispatch every Nth tick override
        #[arg(long)]
        skip: Option<u32>,

        /// Compress payloads
        #[arg(long)]
        compress: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Accept connections and log received frames
    Listen {
        /// Address to bind the peer link to
        #[arg(short, long, default_value = "0.0.0.0:7071")]
        bind: SocketAddr,

        /// Display name announced to peers
        #[arg(short, long, default_value = "listener")]
        name: String,

        /// Sender to connect to (it must be advertising)
        #[arg(long)]
        connect: Option<SocketAddr>,
    },

    /// Print the default pipeline configuration
    Config,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "posecast=debug,posecast_engine=debug,posecast_capture=debug,posecast_encoder=debug,posecast_transport=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            bind,
            name,
            peer,
            config: config_path,
            bodies,
            capture_hz,
            hz,
            skip,
            compress,
            duration,
        } => {
            let overrides = Overrides {
                target_hz: hz,
                skip_frames: skip,
                compress,
            };
            let config = config::load(config_path.as_deref(), &overrides)?;
            run(bind, name, peer, config, SyntheticSource::new(bodies, capture_hz), duration)
        }
        Commands::Listen {
            bind,
            name,
            connect,
        } => listen(bind, name, connect),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::default())?);
            Ok(())
        }
    }
}

fn run(
    bind: SocketAddr,
    name: String,
    peers: Vec<SocketAddr>,
    config: PipelineConfig,
    source: SyntheticSource,
    duration: Option<u64>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("posecast-rt")
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let link = runtime
        .block_on(UdpPeerLink::bind(bind, name))
        .context("Failed to bind peer link")?;
    info!(addr = %link.local_addr(), peer = %link.local_peer(), "Peer link ready");
    for addr in &peers {
        runtime
            .block_on(link.invite(*addr))
            .with_context(|| format!("Failed to invite {}", addr))?;
    }

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let parts = EngineParts::new(source).with_link(Arc::new(link));
    let mut engine = Engine::with_runtime(runtime, parts, command_rx, event_tx);
    let engine_thread = thread::Builder::new()
        .name("posecast-engine".into())
        .spawn(move || {
            info!("Engine thread starting");
            engine.run();
            info!("Engine thread stopped");
        })
        .context("Failed to spawn engine thread")?;

    command_tx.send(EngineCommand::StartAdvertising)?;
    command_tx.send(EngineCommand::Start { config })?;

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Duration elapsed, shutting down");
            command_tx.send(EngineCommand::Shutdown)?;
            drain_until_shutdown(&event_rx);
            break;
        }

        match event_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(EngineEvent::Shutdown) => break,
            Ok(event) => log_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = engine_thread.join();
    Ok(())
}

/// Log events until the engine acknowledges shutdown.
fn drain_until_shutdown(events: &crossbeam_channel::Receiver<EngineEvent>) {
    while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
        if matches!(event, EngineEvent::Shutdown) {
            break;
        }
        log_event(&event);
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged { current, .. } => info!(state = current.name(), "Engine state"),
        EngineEvent::Metrics(metrics) => info!(
            dispatches = metrics.dispatches,
            rate_hz = metrics.dispatch_rate_hz,
            bodies = metrics.tracked_bodies,
            bytes = metrics.bytes_sent,
            skipped = metrics.skipped_sends,
            "Metrics"
        ),
        EngineEvent::PerformanceWarning(warning) => warn!(?warning, "Performance warning"),
        EngineEvent::Error { recoverable, message } => warn!(recoverable, "Engine error: {}", message),
        other => debug!(?other, "Engine event"),
    }
}

fn listen(bind: SocketAddr, name: String, connect: Option<SocketAddr>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        let link = Arc::new(UdpPeerLink::bind(bind, name).await.context("Failed to bind peer link")?);
        link.start_advertising()?;
        info!(addr = %link.local_addr(), peer = %link.local_peer(), "Listening");

        if let Some(addr) = connect {
            link.invite(addr).await?;
        }

        let channel = DirectPeerChannel::new(link.clone(), Compression::Off, DeliveryMode::Unreliable);
        let mut interval = tokio::time::interval(Duration::from_millis(20));
        let mut frames = 0u64;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = interval.tick() => {
                    for message in channel.poll_inbound(usize::MAX) {
                        match message {
                            InboundMessage::Frame { from, frame } => {
                                frames += 1;
                                info!(%from, bodies = frame.len(), joints = frame.joint_count(), frames, "Frame received");
                            }
                            InboundMessage::Control { from, message } => {
                                info!(%from, key = %message.key, value = message.value, "Control received");
                            }
                            InboundMessage::Record { from, record } => {
                                debug!(%from, joint = %record.metadata.name, "Record received");
                            }
                        }
                    }
                }
            }
        }

        link.leave().await;
        info!(frames, "Listener stopped");
        anyhow::Ok(())
    })
}
