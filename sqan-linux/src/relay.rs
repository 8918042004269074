//! Shared relay plumbing: settings, errors, the per-peer outbound queue and event fan-out.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqan_core::{
    Action, DropReason, FrameDecodeError, FrameEncodeError, MeshCore, MeshEvent, Packet,
    TransportId, TransportKind,
};
use tokio::sync::{mpsc, Mutex};

/// Forwarding state shared between the relay tasks and the daemon.
pub type SharedCore = Arc<Mutex<MeshCore>>;

/// Transport id the relay reports to the core, on both server and client.
pub const TRANSPORT: TransportId = TransportId::new(TransportKind::Tcp, 0);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySettings {
    /// Drop a connection that has not answered its challenge in time.
    #[serde(default = "default_challenge_timeout_ms")]
    pub challenge_timeout_ms: u64,
    #[serde(default = "default_blacklist_ms")]
    pub blacklist_ms: u64,
    #[serde(default = "default_accept_limit")]
    pub accept_limit_per_sec: u32,
    /// Per-peer queue cap is `queue_factor * connection count`.
    #[serde(default = "default_queue_factor")]
    pub queue_factor: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Frames read from one peer before yielding to the others.
    #[serde(default = "default_reads_per_wakeup")]
    pub reads_per_wakeup: usize,
    #[serde(default = "default_reconnect_spacing_ms")]
    pub reconnect_spacing_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
}

fn default_challenge_timeout_ms() -> u64 {
    5_000
}
fn default_blacklist_ms() -> u64 {
    300_000
}
fn default_accept_limit() -> u32 {
    100
}
fn default_queue_factor() -> usize {
    100
}
fn default_max_frame_len() -> usize {
    sqan_core::wire::MAX_FRAME_LEN
}
fn default_reads_per_wakeup() -> usize {
    10
}
fn default_reconnect_spacing_ms() -> u64 {
    2_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_bind_attempts() -> u32 {
    3
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            challenge_timeout_ms: default_challenge_timeout_ms(),
            blacklist_ms: default_blacklist_ms(),
            accept_limit_per_sec: default_accept_limit(),
            queue_factor: default_queue_factor(),
            max_frame_len: default_max_frame_len(),
            reads_per_wakeup: default_reads_per_wakeup(),
            reconnect_spacing_ms: default_reconnect_spacing_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            bind_attempts: default_bind_attempts(),
        }
    }
}

impl RelaySettings {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn blacklist(&self) -> Duration {
        Duration::from_millis(self.blacklist_ms)
    }

    pub fn reconnect_spacing(&self) -> Duration {
        Duration::from_millis(self.reconnect_spacing_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn queue_cap(&self, connections: usize) -> usize {
        self.queue_factor.saturating_mul(connections.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error("link down")]
    LinkDown,
    #[error("reconnect not allowed for another {0:?}")]
    Backoff(Duration),
    #[error("relay closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frames waiting for a writable socket. The front frame may be
/// partly written; `offset` marks how much of it has gone out.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<Vec<u8>>,
    offset: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Unwritten part of the front frame.
    pub fn front(&self) -> Option<&[u8]> {
        self.frames.front().map(|f| &f[self.offset..])
    }

    /// Record `n` bytes of the front frame as written.
    pub fn advance(&mut self, n: usize) {
        let Some(front) = self.frames.front() else {
            return;
        };
        self.offset += n;
        if self.offset >= front.len() {
            self.frames.pop_front();
            self.offset = 0;
        }
    }

    /// Drop the oldest frames until at most `cap` remain. A partly written front frame
    /// is never dropped. Returns how many frames were dropped.
    pub fn trim(&mut self, cap: usize) -> usize {
        let keep_front = self.offset > 0;
        let mut dropped = 0;
        while self.frames.len() > cap.max(usize::from(keep_front)) {
            let victim = usize::from(keep_front);
            if self.frames.remove(victim).is_none() {
                break;
            }
            dropped += 1;
        }
        dropped
    }
}

/// Optional host channel for mesh events.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<MeshEvent>>);

impl EventSink {
    pub fn new(tx: Option<mpsc::UnboundedSender<MeshEvent>>) -> Self {
        Self(tx)
    }

    pub fn emit(&self, event: MeshEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }

    pub fn dropped(&self, reason: DropReason) {
        self.emit(MeshEvent::PacketDropped(reason));
    }

    /// Forward host-facing actions. Returns reply packets for the caller to send;
    /// relay actions are left to the caller's own flooding.
    pub fn absorb(&self, actions: Vec<Action>) -> Vec<Packet> {
        let mut replies = Vec::new();
        for action in actions {
            match action {
                Action::Reply { packet, .. } => replies.push(packet),
                Action::Relay { .. } => {}
                other => {
                    if let Some(event) = MeshEvent::from_action(other) {
                        self.emit(event);
                    }
                }
            }
        }
        replies
    }
}
