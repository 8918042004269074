//! Mesh engine: MeshCore driving a set of transports, with SAR on links that need it.

use std::time::Instant;

use crate::core::{Action, DropReason, MeshCore};
use crate::device::PeerDevice;
use crate::protocol::{NodeId, Packet};
use crate::sar::{Reassembler, Reassembly, ReassemblyStats, SarError, SegmentWrapper};
use crate::segment::{ScanEvent, SegmentScanner, SEGMENT_HEADER_LEN};
use crate::transport::{LinkStatus, Transport, TransportId};
use crate::wire;

/// Event for the host (UI, IPC, transport selection).
#[derive(Debug, Clone)]
pub enum MeshEvent {
    DeliverLocal(Packet),
    DeviceChanged(PeerDevice),
    LinkStatusChanged {
        transport: TransportId,
        status: LinkStatus,
    },
    PacketDropped(DropReason),
    HighNoise {
        transport: TransportId,
        good: u64,
        bad: u64,
    },
    Error(String),
}

impl MeshEvent {
    /// Host-facing part of a core action. Relay and Reply are transmissions, not events.
    pub fn from_action(action: Action) -> Option<MeshEvent> {
        match action {
            Action::DeliverLocal(p) => Some(MeshEvent::DeliverLocal(p)),
            Action::DeviceChanged(d) => Some(MeshEvent::DeviceChanged(d)),
            Action::Dropped(r) => Some(MeshEvent::PacketDropped(r)),
            Action::Relay { .. } | Action::Reply { .. } => None,
        }
    }
}

struct SarState {
    wrapper: SegmentWrapper,
    scanner: SegmentScanner,
    reassembler: Reassembler,
}

struct Link<T> {
    transport: T,
    sar: Option<SarState>,
    last_status: LinkStatus,
}

/// Forwarding engine bound to its transports. Host pushes received bytes in and
/// calls `poll` periodically.
pub struct Mesh<T: Transport> {
    core: MeshCore,
    links: Vec<Link<T>>,
}

impl<T: Transport> Mesh<T> {
    pub fn new(core: MeshCore) -> Self {
        Self {
            core,
            links: Vec::new(),
        }
    }

    pub fn core(&self) -> &MeshCore {
        &self.core
    }

    pub fn add_transport(&mut self, transport: T) -> Result<(), SarError> {
        let sar = match transport.frame_limit() {
            Some(limit) => {
                let room = limit.saturating_sub(SEGMENT_HEADER_LEN);
                let size = self.core.settings().max_segment_payload.min(room);
                Some(SarState {
                    wrapper: SegmentWrapper::new(size)?,
                    scanner: SegmentScanner::new(),
                    reassembler: Reassembler::new(self.core.settings().segment_stale()),
                })
            }
            None => None,
        };
        let last_status = transport.status();
        self.links.push(Link {
            transport,
            sar,
            last_status,
        });
        Ok(())
    }

    pub fn transport(&self, id: TransportId) -> Option<&T> {
        self.links
            .iter()
            .map(|l| &l.transport)
            .find(|t| t.id() == id)
    }

    pub fn transport_mut(&mut self, id: TransportId) -> Option<&mut T> {
        self.links
            .iter_mut()
            .map(|l| &mut l.transport)
            .find(|t| t.id() == id)
    }

    pub fn reassembly_stats(&self, id: TransportId) -> Option<ReassemblyStats> {
        self.links
            .iter()
            .find(|l| l.transport.id() == id)
            .and_then(|l| l.sar.as_ref())
            .map(|s| s.reassembler.stats())
    }

    /// Originate `packet` toward `destination` on every link.
    pub fn send(&mut self, packet: Packet, destination: NodeId) -> Vec<MeshEvent> {
        let packet = self.core.prepare_send(packet, destination);
        let bytes = wire::encode(&packet);
        let mut events = Vec::new();
        for i in 0..self.links.len() {
            self.transmit(i, &bytes, &mut events);
        }
        events
    }

    /// Say goodbye on every link.
    pub fn shutdown(&mut self) -> Vec<MeshEvent> {
        let goodbye = Packet::disconnecting(self.core.node_id());
        self.send(goodbye, NodeId::BROADCAST)
    }

    pub fn on_bytes_received(&mut self, from: TransportId, bytes: &[u8]) -> Vec<MeshEvent> {
        self.on_bytes_received_at(from, bytes, Instant::now())
    }

    pub fn on_bytes_received_at(
        &mut self,
        from: TransportId,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        let Some(link) = self.links.iter_mut().find(|l| l.transport.id() == from) else {
            tracing::warn!(transport = %from, "bytes from unregistered transport");
            events.push(MeshEvent::Error(format!("unknown transport {}", from)));
            return events;
        };
        let packets = match &mut link.sar {
            None => vec![bytes.to_vec()],
            Some(sar) => collect_packets(from, sar, bytes, now, &mut events),
        };
        for packet in packets {
            let actions = self.core.on_bytes_received_at(from, &packet, now);
            self.apply(actions, &mut events);
        }
        events
    }

    /// Purge stale reassembly state and report link status changes.
    pub fn poll(&mut self) -> Vec<MeshEvent> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        for link in &mut self.links {
            if let Some(sar) = &mut link.sar {
                for packet_id in sar.reassembler.purge_stale(now) {
                    events.push(MeshEvent::PacketDropped(DropReason::StaleSegments { packet_id }));
                }
            }
            let status = link.transport.status();
            if status != link.last_status {
                link.last_status = status;
                tracing::info!(transport = %link.transport.id(), ?status, "link status changed");
                events.push(MeshEvent::LinkStatusChanged {
                    transport: link.transport.id(),
                    status,
                });
            }
        }
        events
    }

    fn apply(&mut self, actions: Vec<Action>, events: &mut Vec<MeshEvent>) {
        for action in actions {
            match action {
                Action::Relay { packet, arrived_on } => {
                    let bytes = wire::encode(&packet);
                    for i in 0..self.links.len() {
                        if self.links[i].transport.id() != arrived_on {
                            self.transmit(i, &bytes, events);
                        }
                    }
                }
                Action::Reply { packet, via } => {
                    let bytes = wire::encode(&packet);
                    if let Some(i) = self.links.iter().position(|l| l.transport.id() == via) {
                        self.transmit(i, &bytes, events);
                    }
                }
                other => events.extend(MeshEvent::from_action(other)),
            }
        }
    }

    fn transmit(&mut self, index: usize, bytes: &[u8], events: &mut Vec<MeshEvent>) {
        let link = &mut self.links[index];
        let id = link.transport.id();
        let frames = match &mut link.sar {
            None => vec![bytes.to_vec()],
            Some(sar) => match sar.wrapper.wrap(bytes) {
                Ok(segments) => segments.iter().map(|s| s.encode()).collect(),
                Err(e) => {
                    tracing::warn!(transport = %id, error = %e, "cannot segment packet");
                    events.push(MeshEvent::Error(e.to_string()));
                    return;
                }
            },
        };
        for frame in frames {
            if let Err(e) = link.transport.send(&frame) {
                tracing::debug!(transport = %id, error = %e, "send failed");
                events.push(MeshEvent::PacketDropped(DropReason::LinkDown));
                return;
            }
        }
    }
}

/// Run received bytes through the scanner and reassembler; return whole packets.
fn collect_packets(
    from: TransportId,
    sar: &mut SarState,
    bytes: &[u8],
    now: Instant,
    events: &mut Vec<MeshEvent>,
) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    for scanned in sar.scanner.push(bytes) {
        match scanned {
            ScanEvent::Segment(segment) => match sar.reassembler.accept(segment, now) {
                Reassembly::Complete(packet) => packets.push(packet),
                Reassembly::Pending | Reassembly::Duplicate => {}
            },
            ScanEvent::Corrupt => events.push(MeshEvent::PacketDropped(DropReason::CorruptSegment)),
            ScanEvent::LostBytes(n) => {
                events.push(MeshEvent::PacketDropped(DropReason::LineNoise { bytes: n }))
            }
            ScanEvent::HighNoise { good, bad } => {
                tracing::warn!(transport = %from, good, bad, "high line noise");
                events.push(MeshEvent::HighNoise {
                    transport: from,
                    good,
                    bad,
                });
            }
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use crate::settings::Settings;
    use crate::transport::{TransportError, TransportKind};
    use rand::seq::SliceRandom;
    use std::time::Duration;

    /// In-memory link that records what was sent.
    struct MemLink {
        id: TransportId,
        limit: Option<usize>,
        status: LinkStatus,
        sent: Vec<Vec<u8>>,
    }

    impl MemLink {
        fn new(id: TransportId, limit: Option<usize>) -> Self {
            Self {
                id,
                limit,
                status: LinkStatus::Connected,
                sent: Vec::new(),
            }
        }
    }

    impl Transport for MemLink {
        fn id(&self) -> TransportId {
            self.id
        }

        fn frame_limit(&self) -> Option<usize> {
            self.limit
        }

        fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            if self.status == LinkStatus::Disconnected {
                return Err(TransportError::Down);
            }
            if let Some(limit) = self.limit {
                if bytes.len() > limit {
                    return Err(TransportError::Oversized {
                        len: bytes.len(),
                        limit,
                    });
                }
            }
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn status(&self) -> LinkStatus {
            self.status
        }
    }

    const SDR: TransportId = TransportId::new(TransportKind::Sdr, 0);
    const TCP: TransportId = TransportId::new(TransportKind::Tcp, 0);

    fn node(id: i32) -> Mesh<MemLink> {
        let mut mesh = Mesh::new(MeshCore::new(NodeId(id), Settings::default()).unwrap());
        mesh.add_transport(MemLink::new(SDR, Some(240 + SEGMENT_HEADER_LEN)))
            .unwrap();
        mesh
    }

    fn take_sent(mesh: &mut Mesh<MemLink>, id: TransportId) -> Vec<Vec<u8>> {
        std::mem::take(&mut mesh.transport_mut(id).unwrap().sent)
    }

    #[test]
    fn large_packet_crosses_segmented_link_out_of_order() {
        let mut a = node(1);
        let mut b = node(2);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let events = a.send(Packet::raw(NodeId(1), NodeId(2), data.clone()), NodeId(2));
        assert!(events.is_empty());

        let mut frames = take_sent(&mut a, SDR);
        assert_eq!(frames.len(), 21);
        let last = frames.pop().unwrap();
        frames.shuffle(&mut rand::thread_rng());
        frames.push(last);

        let mut delivered = Vec::new();
        for f in &frames {
            for ev in b.on_bytes_received(SDR, f) {
                if let MeshEvent::DeliverLocal(p) = ev {
                    delivered.push(p);
                }
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, Payload::RawBytes(data));
        assert_eq!(delivered[0].origin(), NodeId(1));
        assert_eq!(
            b.reassembly_stats(SDR),
            Some(ReassemblyStats {
                created: 1,
                completed: 1,
                purged: 0
            })
        );
    }

    #[test]
    fn incomplete_message_dropped_once_when_stale() {
        let mut a = node(1);
        let mut b = node(2);
        a.send(Packet::raw(NodeId(1), NodeId(2), vec![7; 1000]), NodeId(2));
        let mut frames = take_sent(&mut a, SDR);
        frames.pop();
        let start = Instant::now();
        for f in &frames {
            assert!(b.on_bytes_received_at(SDR, f, start).is_empty());
        }
        assert!(b.poll_at(start + Duration::from_secs(1)).is_empty());
        let events = b.poll_at(start + Duration::from_secs(6));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            MeshEvent::PacketDropped(DropReason::StaleSegments { .. })
        ));
        assert!(b.poll_at(start + Duration::from_secs(20)).is_empty());
    }

    #[test]
    fn relay_skips_arrival_link() {
        let mut relay = node(2);
        relay.add_transport(MemLink::new(TCP, None)).unwrap();
        let p = Packet::channel(NodeId(1), NodeId::BROADCAST, "c", b"x".to_vec());
        let events = relay.on_bytes_received(TCP, &wire::encode(&p));
        assert!(events.iter().any(|e| matches!(e, MeshEvent::DeliverLocal(_))));
        assert!(take_sent(&mut relay, TCP).is_empty());
        let out = take_sent(&mut relay, SDR);
        assert_eq!(out.len(), 1);
        let (segment, _) = crate::segment::Segment::decode(&out[0]).unwrap();
        assert!(segment.is_standalone());
        let forwarded = wire::decode(segment.payload()).unwrap();
        assert_eq!(forwarded.header.hop_count, 1);
    }

    #[test]
    fn ping_reply_goes_back_on_arrival_link() {
        let mut b = node(2);
        b.add_transport(MemLink::new(TCP, None)).unwrap();
        let req = Packet::ping_request(NodeId(1), NodeId(2));
        b.on_bytes_received(TCP, &wire::encode(&req));
        assert!(take_sent(&mut b, SDR).is_empty());
        let replies = take_sent(&mut b, TCP);
        assert_eq!(replies.len(), 1);
        let reply = wire::decode(&replies[0]).unwrap();
        assert_eq!(reply.destination(), NodeId(1));
    }

    #[test]
    fn link_status_change_reported_once() {
        let mut a = node(1);
        assert!(a.poll().is_empty());
        a.transport_mut(SDR).unwrap().status = LinkStatus::Disconnected;
        let events = a.poll();
        assert!(matches!(
            events.as_slice(),
            [MeshEvent::LinkStatusChanged {
                status: LinkStatus::Disconnected,
                ..
            }]
        ));
        assert!(a.poll().is_empty());
        let events = a.send(Packet::raw(NodeId(1), NodeId(2), vec![1]), NodeId(2));
        assert!(matches!(
            events.as_slice(),
            [MeshEvent::PacketDropped(DropReason::LinkDown)]
        ));
    }

    #[test]
    fn shutdown_announces_departure() {
        let mut a = node(1);
        a.shutdown();
        let sent = take_sent(&mut a, SDR);
        assert_eq!(sent.len(), 1);
        let (segment, _) = crate::segment::Segment::decode(&sent[0]).unwrap();
        let goodbye = wire::decode(segment.payload()).unwrap();
        assert_eq!(goodbye.payload, Payload::Disconnecting);
    }

    #[test]
    fn oversized_message_reported_as_error() {
        let mut a = node(1);
        let events = a.send(Packet::raw(NodeId(1), NodeId(2), vec![0; 240 * 40]), NodeId(2));
        assert!(matches!(events.as_slice(), [MeshEvent::Error(_)]));
    }
}
