use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use rtcall::config::SessionConfig;
use rtcall::session::TransportSession;
use rtcall::transport::{ConnectTarget, TokioWebSocketTransportFactory};
use rtcall::types::Connectivity;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// Connects to a signaling server, joins rooms, and logs everything it hears.
//
// Usage:
//   cargo run -- --url wss://signal.example.com/ws --token SECRET --room conv-1
//   cargo run -- -u ws://localhost:8080/ws -r conv-1 -r conv-2 --config session.json

#[derive(Parser, Debug)]
#[command(name = "rtcall", about = "Signaling session monitor")]
struct Args {
    /// Websocket endpoint of the signaling server.
    #[arg(short, long)]
    url: String,

    /// Bearer token sent with the websocket handshake.
    #[arg(short, long)]
    token: Option<String>,

    /// Room to join once connected. May be repeated.
    #[arg(short, long = "room")]
    rooms: Vec<String>,

    /// JSON file with session tuning (durations in milliseconds).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = load_config(args.config.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let session = TransportSession::new(Arc::new(TokioWebSocketTransportFactory::new()), config);

        session.on_connectivity_change(Arc::new(|status: Connectivity| match status {
            Connectivity::Reconnecting { attempt } => {
                warn!("Signaling link down, retry #{attempt} pending")
            }
            other => info!("Connectivity: {other:?}"),
        }));

        let mut inbound = session.subscribe();
        let mut target = ConnectTarget::new(args.url);
        if let Some(token) = args.token {
            target = target.with_credential(token);
        }
        session.connect(target);

        for room in args.rooms {
            if !session.join_room(room.clone()).await {
                info!("Queued join for {room} until the link is up");
            }
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, disconnecting");
                    break;
                }
                received = inbound.recv() => match received {
                    Ok(message) => match message.call_id() {
                        Some(call_id) => info!("<-- {} for call {}", message.name(), call_id.as_str()),
                        None => info!("<-- {}", message.name()),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} inbound messages"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        session.disconnect().await;
    });

    Ok(())
}
