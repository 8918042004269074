// SqAN Linux: headless mesh node, relay server or client.

use std::sync::Arc;

use anyhow::Context;
use sqan_core::{MeshCore, MeshEvent, NodeId, Packet};
use sqan_linux::config::{self, Config, Role};
use sqan_linux::{logging, EventSink, Permissive, RelayClient, RelayError, RelayServer};
use tokio::sync::{mpsc, Mutex};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("sqan-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load().context("loading configuration")?;
    logging::init(cfg.log_format);

    let node_id = cfg.node_id();
    let core = MeshCore::new(node_id, cfg.mesh.clone()).context("mesh settings")?;
    let core = Arc::new(Mutex::new(core));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, core))
}

/// Whichever side of the relay this node plays.
enum Relay {
    Server(RelayServer),
    Client(RelayClient),
}

impl Relay {
    async fn send(&self, packet: Packet, destination: NodeId) -> Result<(), RelayError> {
        match self {
            Relay::Server(s) => s.send(packet, destination).await,
            Relay::Client(c) => c.send(packet, destination).await,
        }
    }

    async fn shutdown(self) -> Result<(), RelayError> {
        match self {
            Relay::Server(s) => s.shutdown().await,
            Relay::Client(c) => c.shutdown().await,
        }
    }
}

async fn run(cfg: Config, core: sqan_linux::SharedCore) -> anyhow::Result<()> {
    let node_id = core.lock().await.node_id();
    tracing::info!(version = VERSION, node = %node_id, role = ?cfg.role, "starting");

    let (tx, rx) = mpsc::unbounded_channel();
    let log_task = tokio::spawn(log_events(rx));
    let events = EventSink::new(Some(tx));
    let auth = Arc::new(Permissive);

    let relay = match cfg.role {
        Role::Server => Relay::Server(
            RelayServer::bind(cfg.listen(), core.clone(), cfg.relay.clone(), auth, events)
                .await
                .context("starting relay server")?,
        ),
        Role::Client => {
            let client = RelayClient::new(
                cfg.server_addr(),
                core.clone(),
                cfg.relay.clone(),
                auth,
                events,
            );
            if let Err(e) = client.connect().await {
                tracing::warn!(server = %cfg.server_addr(), error = %e, "relay server unreachable, will retry");
            }
            Relay::Client(client)
        }
    };

    let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "signal handler failed");
                }
                break;
            }
            _ = heartbeat.tick() => {
                let packet = core.lock().await.heartbeat(cfg.callsign.clone());
                if let Err(e) = relay.send(packet, NodeId::BROADCAST).await {
                    tracing::debug!(error = %e, "heartbeat not sent");
                }
            }
        }
    }

    tracing::info!("shutting down");
    relay.shutdown().await?;
    log_task.abort();
    Ok(())
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            MeshEvent::DeliverLocal(p) => {
                tracing::info!(origin = %p.origin(), kind = ?p.kind(), hops = p.header.hop_count, "packet delivered")
            }
            MeshEvent::DeviceChanged(d) => {
                tracing::debug!(node = %d.node_id(), hops = d.hop_distance(), callsign = ?d.callsign(), "device updated")
            }
            MeshEvent::LinkStatusChanged { transport, status } => {
                tracing::info!(%transport, ?status, "link status")
            }
            MeshEvent::PacketDropped(reason) => tracing::debug!(%reason, "packet dropped"),
            MeshEvent::HighNoise { transport, good, bad } => {
                tracing::warn!(%transport, good, bad, "high line noise")
            }
            MeshEvent::Error(e) => tracing::warn!(error = %e, "mesh error"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
