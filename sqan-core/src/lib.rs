//! SqAN mesh relay protocol engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod core;
pub mod dedup;
pub mod device;
pub mod integrity;
pub mod mesh;
pub mod protocol;
pub mod sar;
pub mod segment;
pub mod settings;
pub mod transport;
pub mod wire;

pub use crate::core::{Action, DropReason, MeshCore};
pub use dedup::DedupWindow;
pub use device::{DeviceStatus, DeviceTable, LatencyHistory, PeerDevice};
pub use mesh::{Mesh, MeshEvent};
pub use protocol::{NodeId, Packet, PacketHeader, PacketKind, Payload, PING_REQUEST};
pub use sar::{Reassembler, Reassembly, SarError, SegmentWrapper, Segmenter};
pub use segment::{Segment, SegmentScanner};
pub use settings::{Settings, SettingsError};
pub use transport::{LinkFlags, LinkStatus, Transport, TransportError, TransportId, TransportKind};
pub use wire::{decode, encode, DecodeError, FrameDecodeError, FrameEncodeError};
