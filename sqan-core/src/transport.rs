//! Transport seam: identities, link status, and the trait a physical link implements.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical link family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Sdr,
    Bluetooth,
    WifiDirect,
    WifiAware,
    Loopback,
}

impl TransportKind {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// One concrete link instance on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId {
    pub kind: TransportKind,
    pub index: u16,
}

impl TransportId {
    pub const fn new(kind: TransportKind, index: u16) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.index)
    }
}

/// Set of link kinds over which a device is directly reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LinkFlags(u8);

impl LinkFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, kind: TransportKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: TransportKind) {
        self.0 &= !kind.bit();
    }

    pub fn contains(self, kind: TransportKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Health of a link as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Connecting,
    Connected,
    /// Up, but losing frames.
    Degraded,
    Disconnected,
}

/// A physical link the mesh engine can drive. Received bytes are pushed into the
/// engine by the host, so the trait only covers the outbound side.
pub trait Transport {
    fn id(&self) -> TransportId;

    /// Largest buffer one `send` may carry. `Some` means packets are segmented first.
    fn frame_limit(&self) -> Option<usize> {
        None
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn status(&self) -> LinkStatus;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link down")]
    Down,
    #[error("frame of {len} bytes exceeds link limit {limit}")]
    Oversized { len: usize, limit: usize },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_flags_track_kinds() {
        let mut f = LinkFlags::empty();
        assert!(f.is_empty());
        f.insert(TransportKind::Tcp);
        f.insert(TransportKind::Sdr);
        assert!(f.contains(TransportKind::Tcp));
        assert!(f.contains(TransportKind::Sdr));
        assert!(!f.contains(TransportKind::Bluetooth));
        f.remove(TransportKind::Tcp);
        assert!(!f.contains(TransportKind::Tcp));
        f.clear();
        assert!(f.is_empty());
    }

    #[test]
    fn transport_id_display() {
        assert_eq!(TransportId::new(TransportKind::Sdr, 2).to_string(), "Sdr#2");
    }
}
