//! Relay server: accepts TCP peers, challenges them, then floods every frame a peer
//! sends to all other peers and hands packets addressed to this node to the core.
//!
//! One task owns every connection. Each loop turn waits on the listener, on the
//! readiness of all peer sockets at once, on host commands and on a housekeeping
//! tick; the woken peer's state machine then runs with non-blocking reads and writes.

use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use sqan_core::wire::{self, FrameDecodeError, LEN_SIZE};
use sqan_core::{DropReason, LinkStatus, MeshEvent, NodeId, Packet, PacketKind, TransportKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::auth::{self, Authenticator, Challenge, CHALLENGE_LEN};
use crate::relay::{EventSink, OutboundQueue, RelayError, RelaySettings, SharedCore, TRANSPORT};

const HOUSEKEEPING: Duration = Duration::from_millis(250);
const BIND_RETRY: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Connection counts, for hosts and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub active: usize,
    pub pending: usize,
    pub blacklisted: usize,
}

enum Command {
    Send { frame: Vec<u8>, destination: NodeId },
    Stats(oneshot::Sender<ServerStats>),
    Shutdown,
}

/// Handle to a running relay server.
pub struct RelayServer {
    local_addr: SocketAddr,
    core: SharedCore,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind the listener (retrying) and start the connection loop.
    pub async fn bind(
        addr: SocketAddr,
        core: SharedCore,
        settings: RelaySettings,
        authenticator: Arc<dyn Authenticator>,
        events: EventSink,
    ) -> Result<Self, RelayError> {
        let listener = bind_with_retry(addr, settings.bind_attempts).await?;
        let local_addr = listener.local_addr()?;
        let (node_id, max_hops) = {
            let core = core.lock().await;
            (core.node_id(), core.settings().hop_ceiling(TransportKind::Tcp))
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerLoop {
            listener,
            peers: Vec::new(),
            cursor: 0,
            core: core.clone(),
            node_id,
            max_hops,
            settings,
            authenticator,
            events,
            commands: rx,
            blacklist: HashMap::new(),
            limiter: AcceptLimiter::new(Instant::now()),
        };
        let task = tokio::spawn(server.run());
        tracing::info!(%local_addr, node = %node_id, "relay server listening");
        Ok(Self {
            local_addr,
            core,
            commands: tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a locally originated packet to the peers that can reach `destination`.
    pub async fn send(&self, packet: Packet, destination: NodeId) -> Result<(), RelayError> {
        let packet = self.core.lock().await.prepare_send(packet, destination);
        let frame = wire::encode_frame(&wire::encode(&packet))?;
        self.commands
            .send(Command::Send { frame, destination })
            .map_err(|_| RelayError::Closed)
    }

    pub async fn stats(&self) -> Result<ServerStats, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Close every connection and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| RelayError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }
}

async fn bind_with_retry(addr: SocketAddr, attempts: u32) -> Result<TcpListener, RelayError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(source) if attempt >= attempts => return Err(RelayError::Bind { addr, source }),
            Err(e) => {
                tracing::warn!(%addr, attempt, error = %e, "bind failed, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY).await;
            }
        }
    }
}

/// Accepts per one-second window.
struct AcceptLimiter {
    window_start: Instant,
    count: u32,
}

impl AcceptLimiter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant, limit: u32) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Clone, Copy)]
struct Handshake {
    challenge: Challenge,
    response: Challenge,
    filled: usize,
}

enum ReadState {
    ReadingLengthPrefix { buf: [u8; LEN_SIZE], filled: usize },
    ReadingBody { buf: Vec<u8>, filled: usize },
}

impl ReadState {
    fn length_prefix() -> Self {
        ReadState::ReadingLengthPrefix {
            buf: [0; LEN_SIZE],
            filled: 0,
        }
    }
}

enum PeerState {
    /// Challenge queued but not fully written.
    AwaitingChallenge(Handshake),
    AwaitingChallengeResponse(Handshake),
    Active(ReadState),
}

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    state: PeerState,
    node_id: Option<NodeId>,
    opened: Instant,
    queue: OutboundQueue,
    said_goodbye: bool,
}

impl Peer {
    fn is_active(&self) -> bool {
        matches!(self.state, PeerState::Active(_))
    }
}

/// Why a peer connection ended.
enum Closing {
    Eof,
    Goodbye,
    Rejected,
    ChallengeTimeout,
    Violation(FrameDecodeError),
    Io(io::Error),
    Shutdown,
}

impl fmt::Display for Closing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Closing::Eof => f.write_str("closed by peer"),
            Closing::Goodbye => f.write_str("peer disconnecting"),
            Closing::Rejected => f.write_str("challenge rejected"),
            Closing::ChallengeTimeout => f.write_str("challenge timed out"),
            Closing::Violation(e) => write!(f, "protocol violation: {}", e),
            Closing::Io(e) => write!(f, "i/o error: {}", e),
            Closing::Shutdown => f.write_str("server shutting down"),
        }
    }
}

enum Wake {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Peer { index: usize, readable: bool },
    Failed { index: usize, error: io::Error },
    Command(Command),
    Housekeeping,
}

struct ServerLoop {
    listener: TcpListener,
    peers: Vec<Peer>,
    /// First peer polled on the next turn, so a busy peer cannot starve the rest.
    cursor: usize,
    core: SharedCore,
    node_id: NodeId,
    max_hops: u8,
    settings: RelaySettings,
    authenticator: Arc<dyn Authenticator>,
    events: EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
    blacklist: HashMap<IpAddr, Instant>,
    limiter: AcceptLimiter,
}

/// Resolve when any peer is readable, or writable with data queued.
async fn next_ready(peers: &[Peer], cursor: usize) -> Wake {
    poll_fn(|cx| {
        let n = peers.len();
        for step in 0..n {
            let index = (cursor + step) % n;
            let peer = &peers[index];
            let readable = match peer.stream.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Wake::Failed { index, error }),
                Poll::Pending => false,
            };
            let writable = !peer.queue.is_empty()
                && match peer.stream.poll_write_ready(cx) {
                    Poll::Ready(Ok(())) => true,
                    Poll::Ready(Err(error)) => {
                        return Poll::Ready(Wake::Failed { index, error })
                    }
                    Poll::Pending => false,
                };
            if readable || writable {
                return Poll::Ready(Wake::Peer { index, readable });
            }
        }
        Poll::Pending
    })
    .await
}

/// `Ok(None)` when the socket has nothing more to give right now. `buf` must be non-empty.
fn read_some(stream: &TcpStream, buf: &mut [u8]) -> Result<Option<usize>, Closing> {
    match stream.try_read(buf) {
        Ok(0) => Err(Closing::Eof),
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Some(0)),
        Err(e) => Err(Closing::Io(e)),
    }
}

impl ServerLoop {
    async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let wake = tokio::select! {
                accepted = self.listener.accept() => Wake::Accepted(accepted),
                ready = next_ready(&self.peers, self.cursor) => ready,
                command = self.commands.recv() => Wake::Command(command.unwrap_or(Command::Shutdown)),
                _ = housekeeping.tick() => Wake::Housekeeping,
            };
            match wake {
                Wake::Accepted(Ok((stream, addr))) => self.on_accept(stream, addr),
                Wake::Accepted(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
                Wake::Peer { index, readable } => self.on_peer_ready(index, readable).await,
                Wake::Failed { index, error } => self.close(index, Closing::Io(error)).await,
                Wake::Command(Command::Shutdown) => break,
                Wake::Command(command) => self.on_command(command),
                Wake::Housekeeping => self.housekeeping().await,
            }
        }
        while !self.peers.is_empty() {
            self.close(self.peers.len() - 1, Closing::Shutdown).await;
        }
        tracing::info!(node = %self.node_id, "relay server stopped");
    }

    fn active_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_active()).count()
    }

    fn is_blacklisted(&self, ip: IpAddr, now: Instant) -> bool {
        self.blacklist.get(&ip).is_some_and(|until| *until > now)
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let now = Instant::now();
        if self.is_blacklisted(addr.ip(), now) {
            tracing::debug!(%addr, "refusing blacklisted address");
            return;
        }
        if !self.limiter.allow(now, self.settings.accept_limit_per_sec) {
            tracing::warn!(%addr, limit = self.settings.accept_limit_per_sec, "accept rate exceeded, refusing");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "set_nodelay failed");
        }
        let challenge = auth::new_challenge();
        let mut queue = OutboundQueue::new();
        queue.push(challenge.to_vec());
        self.peers.push(Peer {
            stream,
            addr,
            state: PeerState::AwaitingChallenge(Handshake {
                challenge,
                response: [0; CHALLENGE_LEN],
                filled: 0,
            }),
            node_id: None,
            opened: now,
            queue,
            said_goodbye: false,
        });
        tracing::debug!(%addr, "peer connected, challenge queued");
    }

    async fn on_peer_ready(&mut self, index: usize, readable: bool) {
        self.cursor = index + 1;
        if readable {
            if let Err(why) = self.read_peer(index).await {
                self.close(index, why).await;
                return;
            }
        }
        if let Err(why) = self.flush(index) {
            self.close(index, why).await;
        }
    }

    /// Advance the peer's read state machine until the socket runs dry or the
    /// per-wakeup frame budget is spent.
    async fn read_peer(&mut self, index: usize) -> Result<(), Closing> {
        let mut frames = 0;
        while frames < self.settings.reads_per_wakeup {
            let mut activated = false;
            let mut complete = None;
            let peer = &mut self.peers[index];
            match &mut peer.state {
                PeerState::AwaitingChallenge(hs) | PeerState::AwaitingChallengeResponse(hs) => {
                    let Some(n) = read_some(&peer.stream, &mut hs.response[hs.filled..])? else {
                        return Ok(());
                    };
                    hs.filled += n;
                    if hs.filled == CHALLENGE_LEN {
                        if !self.authenticator.verify(&hs.challenge, &hs.response) {
                            let until = Instant::now() + self.settings.blacklist();
                            self.blacklist.insert(peer.addr.ip(), until);
                            return Err(Closing::Rejected);
                        }
                        peer.state = PeerState::Active(ReadState::length_prefix());
                        activated = true;
                    }
                }
                PeerState::Active(ReadState::ReadingLengthPrefix { buf, filled }) => {
                    let Some(n) = read_some(&peer.stream, &mut buf[*filled..])? else {
                        return Ok(());
                    };
                    *filled += n;
                    if *filled == LEN_SIZE {
                        let len = wire::parse_frame_len(*buf, self.settings.max_frame_len)
                            .map_err(Closing::Violation)?;
                        peer.state = PeerState::Active(ReadState::ReadingBody {
                            buf: vec![0; len],
                            filled: 0,
                        });
                    }
                }
                PeerState::Active(ReadState::ReadingBody { buf, filled }) => {
                    let Some(n) = read_some(&peer.stream, &mut buf[*filled..])? else {
                        return Ok(());
                    };
                    *filled += n;
                    if *filled == buf.len() {
                        complete = Some(std::mem::take(buf));
                        peer.state = PeerState::Active(ReadState::length_prefix());
                    }
                }
            }
            if activated {
                self.on_activated(index);
            }
            if let Some(bytes) = complete {
                frames += 1;
                self.on_frame(index, bytes).await?;
            }
        }
        Ok(())
    }

    fn on_activated(&mut self, index: usize) {
        let addr = self.peers[index].addr;
        tracing::info!(%addr, "peer passed challenge");
        if self.active_count() == 1 {
            self.events.emit(MeshEvent::LinkStatusChanged {
                transport: TRANSPORT,
                status: LinkStatus::Connected,
            });
        }
    }

    async fn on_frame(&mut self, index: usize, bytes: Vec<u8>) -> Result<(), Closing> {
        // The frame boundary is intact, so a bad header costs one packet, not the link.
        let (kind, header) = match wire::decode_header(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                let addr = self.peers[index].addr;
                tracing::debug!(%addr, error = %e, "dropping undecodable frame");
                self.events.dropped(DropReason::Malformed(e));
                return Ok(());
            }
        };
        let peer = &mut self.peers[index];
        if header.hop_count == 0
            && peer.node_id.is_none()
            && !header.origin.is_broadcast()
            && header.origin != self.node_id
        {
            peer.node_id = Some(header.origin);
            let addr = peer.addr;
            tracing::debug!(%addr, node = %header.origin, "learned peer node id");
            let actions = self
                .core
                .lock()
                .await
                .on_peer_discovered(header.origin, Some(addr.to_string()));
            self.events.absorb(actions);
        }

        if header.is_addressed_to(self.node_id) {
            let actions = self.core.lock().await.on_bytes_received(TRANSPORT, &bytes);
            for reply in self.events.absorb(actions) {
                match wire::encode_frame(&wire::encode(&reply)) {
                    Ok(frame) => self.enqueue(index, frame),
                    Err(e) => tracing::warn!(error = %e, "cannot frame reply"),
                }
            }
        }

        if kind != PacketKind::Ping {
            self.flood(index, header.hop_count, bytes);
        }

        if kind == PacketKind::Disconnecting && header.hop_count == 0 {
            self.peers[index].said_goodbye = true;
            return Err(Closing::Goodbye);
        }
        Ok(())
    }

    /// Re-frame with the hop count bumped and queue to every other active peer.
    fn flood(&mut self, from: usize, hop_count: u8, mut bytes: Vec<u8>) {
        if hop_count >= self.max_hops {
            tracing::debug!(hop_count, ceiling = self.max_hops, "not relaying, hop limit reached");
            self.events.dropped(DropReason::HopLimit {
                hop_count,
                ceiling: self.max_hops,
            });
            return;
        }
        if let Err(e) = wire::set_hop_count(&mut bytes, hop_count + 1) {
            tracing::warn!(error = %e, "cannot rewrite hop count");
            return;
        }
        let frame = match wire::encode_frame(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "cannot re-frame packet");
                return;
            }
        };
        let cap = self.settings.queue_cap(self.peers.len());
        let mut trimmed = 0;
        for (i, peer) in self.peers.iter_mut().enumerate() {
            if i == from || !peer.is_active() {
                continue;
            }
            peer.queue.push(frame.clone());
            trimmed += peer.queue.trim(cap);
        }
        self.report_trimmed(trimmed);
    }

    fn enqueue(&mut self, index: usize, frame: Vec<u8>) {
        let cap = self.settings.queue_cap(self.peers.len());
        let queue = &mut self.peers[index].queue;
        queue.push(frame);
        let trimmed = queue.trim(cap);
        self.report_trimmed(trimmed);
    }

    fn report_trimmed(&self, count: usize) {
        if count > 0 {
            tracing::warn!(count, "outbound queue over capacity, dropped oldest frames");
            self.events.dropped(DropReason::QueueTrimmed { count });
        }
    }

    fn flush(&mut self, index: usize) -> Result<(), Closing> {
        let peer = &mut self.peers[index];
        while let Some(chunk) = peer.queue.front() {
            match peer.stream.try_write(chunk) {
                Ok(0) => return Err(Closing::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => peer.queue.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Closing::Io(e)),
            }
        }
        if peer.queue.is_empty() {
            if let PeerState::AwaitingChallenge(hs) = peer.state {
                peer.state = PeerState::AwaitingChallengeResponse(hs);
            }
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { frame, destination } => {
                let targets: Vec<usize> = self
                    .peers
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.is_active())
                    .filter(|(_, p)| {
                        destination.is_broadcast()
                            || p.node_id.is_none()
                            || p.node_id == Some(destination)
                    })
                    .map(|(i, _)| i)
                    .collect();
                if targets.is_empty() {
                    tracing::debug!(%destination, "no peer to send to");
                    self.events.dropped(DropReason::LinkDown);
                }
                for index in targets {
                    self.enqueue(index, frame.clone());
                }
            }
            Command::Stats(reply) => {
                let now = Instant::now();
                let active = self.active_count();
                let _ = reply.send(ServerStats {
                    active,
                    pending: self.peers.len() - active,
                    blacklisted: self.blacklist.values().filter(|u| **u > now).count(),
                });
            }
            Command::Shutdown => {}
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        self.blacklist.retain(|_, until| *until > now);
        let timeout = self.settings.challenge_timeout();
        let mut i = 0;
        while i < self.peers.len() {
            let peer = &self.peers[i];
            if !peer.is_active() && now.duration_since(peer.opened) >= timeout {
                self.close(i, Closing::ChallengeTimeout).await;
            } else {
                i += 1;
            }
        }
    }

    async fn close(&mut self, index: usize, why: Closing) {
        let peer = self.peers.swap_remove(index);
        if self.cursor >= self.peers.len() {
            self.cursor = 0;
        }
        match &why {
            Closing::Eof | Closing::Goodbye | Closing::Shutdown => {
                tracing::info!(addr = %peer.addr, node = ?peer.node_id, reason = %why, "peer closed")
            }
            _ => tracing::warn!(addr = %peer.addr, node = ?peer.node_id, reason = %why, "peer dropped"),
        }
        if let Some(node_id) = peer.node_id {
            let actions = self
                .core
                .lock()
                .await
                .on_peer_lost(node_id, peer.said_goodbye);
            self.events.absorb(actions);
        }
        if peer.is_active() && self.active_count() == 0 {
            self.events.emit(MeshEvent::LinkStatusChanged {
                transport: TRANSPORT,
                status: LinkStatus::Disconnected,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_refuses_past_limit_then_resets() {
        let start = Instant::now();
        let mut limiter = AcceptLimiter::new(start);
        assert!(limiter.allow(start, 2));
        assert!(limiter.allow(start, 2));
        assert!(!limiter.allow(start, 2));
        assert!(limiter.allow(start + Duration::from_secs(1), 2));
    }

    #[test]
    fn closing_reasons_display() {
        assert_eq!(Closing::Goodbye.to_string(), "peer disconnecting");
        assert!(Closing::Violation(FrameDecodeError::Negative(-1))
            .to_string()
            .contains("-1"));
    }
}
