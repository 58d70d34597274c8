//! peercall CLI: two-party loopback call over in-process signaling

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use peercall_core::transport::{MemorySignalingBus, MemoryTransport};
use peercall_core::{MediaKind, RtcLocalTrack};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Disconnect grace window in milliseconds
    #[arg(long, global = true, env = "PEERCALL_GRACE_MS", default_value_t = 5000)]
    grace_ms: u64,

    /// Maximum concurrent calls per participant
    #[arg(long, global = true, env = "PEERCALL_MAX_CALLS", default_value_t = 10)]
    max_calls: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call between two in-process participants
    Loopback {
        /// Disable audio
        #[arg(long)]
        no_audio: bool,

        /// Enable video
        #[arg(long)]
        video: bool,

        /// Seconds to wait for the connection before giving up
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Swap the caller's outgoing video track once connected
        #[arg(long, requires = "video")]
        swap_video: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

impl Cli {
    fn service_config(&self) -> Result<ServiceConfig> {
        let config = ServiceConfig {
            call: CallManagerConfig {
                disconnect_grace: Duration::from_millis(self.grace_ms),
                max_concurrent_calls: self.max_calls,
                ..Default::default()
            },
        };
        config.call.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.service_config()?;

    match cli.command {
        Commands::Loopback {
            no_audio,
            video,
            seconds,
            swap_video,
        } => {
            let constraints = MediaConstraints {
                audio: !no_audio,
                video,
            };
            run_loopback(config, constraints, Duration::from_secs(seconds), swap_video).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn participant(
    bus: &Arc<MemorySignalingBus>,
    name: &str,
    config: &ServiceConfig,
) -> Result<CallService<MemoryTransport>> {
    let signaling = Arc::new(SignalingHandler::new(Arc::new(bus.connect(name))));
    let service = CallService::builder(signaling)
        .with_config(config.clone())
        .build()
        .with_context(|| format!("Failed to build service for {name}"))?;
    service.start()?;
    Ok(service)
}

async fn run_loopback(
    config: ServiceConfig,
    constraints: MediaConstraints,
    wait: Duration,
    swap_video: bool,
) -> Result<()> {
    let bus = MemorySignalingBus::new();
    let alice = participant(&bus, "alice", &config)?;
    let bob = Arc::new(participant(&bus, "bob", &config)?);
    let alice_id = PeerId::new("alice");
    let bob_id = PeerId::new("bob");

    // Bob picks up whatever rings
    let answering = {
        let bob = Arc::clone(&bob);
        let mut events = bob.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    CallEvent::IncomingCall {
                        peer, constraints, ..
                    } => {
                        println!(
                            "📞 bob: incoming call from {peer} (audio: {}, video: {})",
                            constraints.audio, constraints.video
                        );
                        if let Err(e) = bob.accept_call(&peer).await {
                            println!("❌ bob: could not accept: {e}");
                        }
                    }
                    CallEvent::StatusChanged { to, .. } => println!("   bob: {to}"),
                    CallEvent::CallEnded { reason, .. } => {
                        println!("   bob: call ended ({reason})");
                        break;
                    }
                    CallEvent::Error { error, .. } => println!("⚠️  bob: {error}"),
                }
            }
        })
    };

    let mut alice_events = alice.subscribe_events();
    let call_id = alice.start_call(bob_id.clone(), constraints).await?;
    println!("📞 alice: calling bob (call {call_id})");

    let started = Instant::now();
    let connected = timeout(wait, async {
        while let Ok(event) = alice_events.recv().await {
            match event {
                CallEvent::StatusChanged { to, .. } => {
                    println!("   alice: {to}");
                    if to == CallStatus::Connected {
                        return true;
                    }
                }
                CallEvent::CallEnded { reason, .. } => {
                    println!("   alice: call ended ({reason})");
                    return false;
                }
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !connected {
        alice.shutdown().await;
        bob.shutdown().await;
        bail!("Call did not connect within {}s", wait.as_secs());
    }
    println!("✅ connected in {:?}", started.elapsed());

    if swap_video {
        let track = Arc::new(RtcLocalTrack::new(MediaKind::Video));
        alice.replace_outgoing_track(&bob_id, track).await?;
        println!("🔁 alice: outgoing video track replaced");
    }

    sleep(Duration::from_secs(1)).await;
    alice.end_call(&bob_id).await?;
    let _ = timeout(Duration::from_secs(2), answering).await;

    for (name, service, remote) in [("alice", &alice, &bob_id), ("bob", &*bob, &alice_id)] {
        if let Some(snapshot) = service.snapshot(remote).await {
            println!("{name}: {}", serde_json::to_string(&snapshot)?);
        }
    }

    alice.stop();
    bob.stop();
    Ok(())
}
