//! Relay client: one outbound TCP connection to a relay server.
//!
//! A writer task drains the outbound channel; a reader task feeds inbound frames
//! to the core and queues any replies. `send` reconnects lazily when the link is down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sqan_core::wire::{self, LEN_SIZE};
use sqan_core::{DropReason, LinkStatus, MeshEvent, NodeId, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::auth::{Authenticator, CHALLENGE_LEN};
use crate::relay::{EventSink, RelayError, RelaySettings, SharedCore, TRANSPORT};

/// Up/down flag shared by the two tasks of one connection; reports the first `down` only.
#[derive(Clone)]
struct LinkHealth {
    alive: Arc<AtomicBool>,
    events: EventSink,
}

impl LinkHealth {
    fn new(events: EventSink) -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            events,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn down(&self, why: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::info!(reason = why, "relay link down");
            self.events.emit(MeshEvent::LinkStatusChanged {
                transport: TRANSPORT,
                status: LinkStatus::Disconnected,
            });
        }
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    health: LinkHealth,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
struct LinkState {
    conn: Option<Connection>,
    last_attempt: Option<Instant>,
}

pub struct RelayClient {
    server: String,
    core: SharedCore,
    settings: RelaySettings,
    authenticator: Arc<dyn Authenticator>,
    events: EventSink,
    link: Mutex<LinkState>,
}

impl RelayClient {
    /// `server` is a `host:port` string. Nothing is dialled until `connect` or `send`.
    pub fn new(
        server: impl Into<String>,
        core: SharedCore,
        settings: RelaySettings,
        authenticator: Arc<dyn Authenticator>,
        events: EventSink,
    ) -> Self {
        Self {
            server: server.into(),
            core,
            settings,
            authenticator,
            events,
            link: Mutex::new(LinkState::default()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        let link = self.link.lock().await;
        link.conn.as_ref().is_some_and(|c| c.health.is_alive())
    }

    pub async fn connect(&self) -> Result<(), RelayError> {
        let mut link = self.link.lock().await;
        self.ensure_connected(&mut link).await.map(|_| ())
    }

    /// Stamp and queue a packet for the server, reconnecting first if needed.
    pub async fn send(&self, packet: Packet, destination: NodeId) -> Result<(), RelayError> {
        let packet = self.core.lock().await.prepare_send(packet, destination);
        let frame = wire::encode_frame(&wire::encode(&packet))?;
        let mut link = self.link.lock().await;
        let sent = match self.ensure_connected(&mut link).await {
            Ok(conn) => conn.outbound.send(frame).map_err(|_| RelayError::LinkDown),
            Err(e) => Err(e),
        };
        if let Err(e) = &sent {
            tracing::debug!(error = %e, "relay send failed");
            self.events.dropped(DropReason::LinkDown);
        }
        sent
    }

    /// Say goodbye, let the writer drain, then stop both tasks.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let mut link = self.link.lock().await;
        let Some(conn) = link.conn.take() else {
            return Ok(());
        };
        let Connection {
            outbound,
            health,
            mut writer,
            reader,
        } = conn;
        reader.abort();
        let _ = reader.await;
        if health.is_alive() {
            let goodbye = {
                let mut core = self.core.lock().await;
                let me = core.node_id();
                core.prepare_send(Packet::disconnecting(me), NodeId::BROADCAST)
            };
            let _ = outbound.send(wire::encode_frame(&wire::encode(&goodbye))?);
        }
        drop(outbound);
        if tokio::time::timeout(self.settings.connect_timeout(), &mut writer)
            .await
            .is_err()
        {
            tracing::warn!("relay writer did not drain in time");
            writer.abort();
        }
        health.down("shutdown");
        Ok(())
    }

    async fn ensure_connected<'a>(
        &self,
        link: &'a mut LinkState,
    ) -> Result<&'a Connection, RelayError> {
        let alive = link.conn.as_ref().is_some_and(|c| c.health.is_alive());
        if !alive {
            if let Some(old) = link.conn.take() {
                old.abort();
            }
            let now = Instant::now();
            let spacing = self.settings.reconnect_spacing();
            if let Some(last) = link.last_attempt {
                let elapsed = now.duration_since(last);
                if elapsed < spacing {
                    return Err(RelayError::Backoff(spacing - elapsed));
                }
            }
            link.last_attempt = Some(now);
            link.conn = Some(self.establish().await?);
        }
        link.conn.as_ref().ok_or(RelayError::LinkDown)
    }

    async fn establish(&self) -> Result<Connection, RelayError> {
        let stream = tokio::time::timeout(
            self.settings.connect_timeout(),
            TcpStream::connect(self.server.as_str()),
        )
        .await
        .map_err(|_| RelayError::Timeout("connect"))?
        .map_err(|source| RelayError::Connect {
            addr: self.server.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let (mut rd, mut wr) = stream.into_split();

        let mut challenge = [0u8; CHALLENGE_LEN];
        tokio::time::timeout(self.settings.challenge_timeout(), rd.read_exact(&mut challenge))
            .await
            .map_err(|_| RelayError::Timeout("challenge"))??;
        wr.write_all(&self.authenticator.respond(&challenge)).await?;

        let health = LinkHealth::new(self.events.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(wr, rx, health.clone()));
        let reader = tokio::spawn(read_loop(
            rd,
            tx.clone(),
            self.core.clone(),
            self.settings.max_frame_len,
            health.clone(),
        ));
        tracing::info!(server = %self.server, "connected to relay server");
        self.events.emit(MeshEvent::LinkStatusChanged {
            transport: TRANSPORT,
            status: LinkStatus::Connected,
        });
        Ok(Connection {
            outbound: tx,
            health,
            writer,
            reader,
        })
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(conn) = self.link.get_mut().conn.take() {
            conn.abort();
        }
    }
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    health: LinkHealth,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = wr.write_all(&frame).await {
            health.down(&e.to_string());
            return;
        }
    }
    let _ = wr.shutdown().await;
}

async fn read_loop(
    mut rd: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    core: SharedCore,
    max_frame_len: usize,
    health: LinkHealth,
) {
    let why = loop {
        let mut prefix = [0u8; LEN_SIZE];
        if let Err(e) = rd.read_exact(&mut prefix).await {
            break e.to_string();
        }
        let len = match wire::parse_frame_len(prefix, max_frame_len) {
            Ok(len) => len,
            Err(e) => break format!("protocol violation: {}", e),
        };
        let mut body = vec![0u8; len];
        if let Err(e) = rd.read_exact(&mut body).await {
            break e.to_string();
        }
        let actions = core.lock().await.on_bytes_received(TRANSPORT, &body);
        // Relay actions are ignored: the server already floods to everyone else.
        for reply in health.events.absorb(actions) {
            match wire::encode_frame(&wire::encode(&reply)) {
                Ok(frame) => {
                    let _ = replies.send(frame);
                }
                Err(e) => tracing::warn!(error = %e, "cannot frame reply"),
            }
        }
    };
    health.down(&why);
}
