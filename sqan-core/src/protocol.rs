//! Mesh packet types: header, typed payloads, node identity.

use std::fmt;
use std::num::NonZeroU8;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Midpoint value carried by a Ping that has not been answered yet.
pub const PING_REQUEST: i64 = -1;

/// Stable per-node identifier carried in `origin` / `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Reserved id meaning "everyone" as a destination and "unknown" as an origin.
    pub const BROADCAST: NodeId = NodeId(i32::MIN);

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Random id that is never the broadcast sentinel or zero.
    pub fn random() -> Self {
        loop {
            let id: i32 = rand::random();
            if id != 0 && id != i32::MIN {
                return NodeId(id);
            }
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Type byte of the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Heartbeat = 0,
    Ping = 1,
    RawBytes = 2,
    ChannelBytes = 3,
    VpnBytes = 4,
    Disconnecting = 5,
}

impl PacketKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::Ping),
            2 => Some(Self::RawBytes),
            3 => Some(Self::ChannelBytes),
            4 => Some(Self::VpnBytes),
            5 => Some(Self::Disconnecting),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Mesh housekeeping rather than application data.
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Ping | Self::Disconnecting)
    }
}

/// Routing fields common to every packet. The type byte lives with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Creator of the packet; never rewritten by relays.
    pub origin: NodeId,
    pub destination: NodeId,
    /// Creation time in ms since the epoch; doubles as the dedup id.
    pub time: i64,
    /// Relays traversed so far.
    pub hop_count: u8,
}

impl PacketHeader {
    pub fn new(origin: NodeId, destination: NodeId) -> Self {
        Self {
            origin,
            destination,
            time: now_millis(),
            hop_count: 0,
        }
    }

    /// True when `node` should consume this packet locally.
    pub fn is_addressed_to(&self, node: NodeId) -> bool {
        self.destination == node || self.destination.is_broadcast()
    }
}

/// Type-specific body of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Liveness beacon, optionally naming the sender.
    Heartbeat { callsign: Option<String> },
    /// Round-trip latency check. `midpoint` is `PING_REQUEST` until the target stamps it.
    Ping { midpoint: i64 },
    RawBytes(Vec<u8>),
    ChannelBytes { channel: String, data: Vec<u8> },
    /// Graceful leave of the origin.
    Disconnecting,
    /// Tunnelled IP traffic. `forward_index` names the next hop on the far side, if any.
    VpnBytes {
        forward_index: Option<NonZeroU8>,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Heartbeat { .. } => PacketKind::Heartbeat,
            Payload::Ping { .. } => PacketKind::Ping,
            Payload::RawBytes(_) => PacketKind::RawBytes,
            Payload::ChannelBytes { .. } => PacketKind::ChannelBytes,
            Payload::Disconnecting => PacketKind::Disconnecting,
            Payload::VpnBytes { .. } => PacketKind::VpnBytes,
        }
    }
}

/// A decoded or locally built packet. Values are immutable; relaying builds a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Payload,
    valid: bool,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Payload) -> Self {
        Self {
            header,
            payload,
            valid: true,
        }
    }

    pub(crate) fn with_validity(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn heartbeat(origin: NodeId, callsign: Option<String>) -> Self {
        Self::new(
            PacketHeader::new(origin, NodeId::BROADCAST),
            Payload::Heartbeat { callsign },
        )
    }

    pub fn ping_request(origin: NodeId, destination: NodeId) -> Self {
        Self::new(
            PacketHeader::new(origin, destination),
            Payload::Ping {
                midpoint: PING_REQUEST,
            },
        )
    }

    pub fn raw(origin: NodeId, destination: NodeId, data: Vec<u8>) -> Self {
        Self::new(
            PacketHeader::new(origin, destination),
            Payload::RawBytes(data),
        )
    }

    pub fn channel(
        origin: NodeId,
        destination: NodeId,
        channel: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            PacketHeader::new(origin, destination),
            Payload::ChannelBytes {
                channel: channel.into(),
                data,
            },
        )
    }

    pub fn disconnecting(origin: NodeId) -> Self {
        Self::new(
            PacketHeader::new(origin, NodeId::BROADCAST),
            Payload::Disconnecting,
        )
    }

    pub fn vpn(
        origin: NodeId,
        destination: NodeId,
        forward_index: Option<NonZeroU8>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            PacketHeader::new(origin, destination),
            Payload::VpnBytes {
                forward_index,
                data,
            },
        )
    }

    pub fn kind(&self) -> PacketKind {
        self.payload.kind()
    }

    pub fn origin(&self) -> NodeId {
        self.header.origin
    }

    pub fn destination(&self) -> NodeId {
        self.header.destination
    }

    /// False when the received checksum did not match the payload.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Copy of this packet one relay further along.
    pub fn relayed(&self) -> Packet {
        let mut next = self.clone();
        next.header.hop_count = next.header.hop_count.saturating_add(1);
        next
    }

    /// Copy of this packet re-addressed to `destination`.
    pub fn addressed_to(mut self, destination: NodeId) -> Packet {
        self.header.destination = destination;
        self
    }

    /// Ping request turned around by `responder`: same departure time, stamped midpoint.
    pub fn ping_reply(&self, responder: NodeId, midpoint: i64) -> Option<Packet> {
        match self.payload {
            Payload::Ping {
                midpoint: PING_REQUEST,
            } => Some(Packet::new(
                PacketHeader {
                    origin: responder,
                    destination: self.header.origin,
                    time: self.header.time,
                    hop_count: 0,
                },
                Payload::Ping { midpoint },
            )),
            _ => None,
        }
    }
}

/// Wall clock in ms since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
