//! Host-driven API: MeshCore receives packets from any transport, returns actions.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::dedup::DedupWindow;
use crate::device::{DeviceTable, PeerDevice};
use crate::protocol::{now_millis, NodeId, Packet, PacketKind, Payload, PING_REQUEST};
use crate::settings::{Settings, SettingsError};
use crate::transport::TransportId;
use crate::wire::{self, DecodeError};

/// Why a packet (or part of one) was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Our own packet came back.
    OwnTraffic,
    InvalidChecksum,
    Duplicate,
    HopLimit { hop_count: u8, ceiling: u8 },
    /// Pings are only answered by their target and never relayed.
    PingMisaddressed,
    Malformed(DecodeError),
    /// A segmented message never completed.
    StaleSegments { packet_id: u8 },
    CorruptSegment,
    LineNoise { bytes: usize },
    /// Outbound backlog trimmed, oldest first.
    QueueTrimmed { count: usize },
    LinkDown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::OwnTraffic => f.write_str("own traffic looped back"),
            DropReason::InvalidChecksum => f.write_str("checksum mismatch"),
            DropReason::Duplicate => f.write_str("duplicate"),
            DropReason::HopLimit { hop_count, ceiling } => {
                write!(f, "hop count {} at ceiling {}", hop_count, ceiling)
            }
            DropReason::PingMisaddressed => f.write_str("ping not addressed to this node"),
            DropReason::Malformed(e) => write!(f, "malformed: {}", e),
            DropReason::StaleSegments { packet_id } => {
                write!(f, "segmented packet {} went stale", packet_id)
            }
            DropReason::CorruptSegment => f.write_str("corrupt segment"),
            DropReason::LineNoise { bytes } => write!(f, "{} bytes of line noise", bytes),
            DropReason::QueueTrimmed { count } => write!(f, "{} queued frames trimmed", count),
            DropReason::LinkDown => f.write_str("link down"),
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone)]
pub enum Action {
    /// Hand to local consumers.
    DeliverLocal(Packet),
    /// Re-transmit on every link except `arrived_on`. Hop count already incremented.
    Relay { packet: Packet, arrived_on: TransportId },
    /// Send on `via` only.
    Reply { packet: Packet, via: TransportId },
    DeviceChanged(PeerDevice),
    Dropped(DropReason),
}

/// Forwarding engine: device table, per-transport dedup, accept/relay/drop decisions.
pub struct MeshCore {
    node_id: NodeId,
    settings: Settings,
    devices: DeviceTable,
    dedup: HashMap<TransportId, DedupWindow>,
    /// Last `time` stamped on a locally originated packet.
    last_time: i64,
}

impl MeshCore {
    pub fn new(node_id: NodeId, settings: Settings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let devices = DeviceTable::new(settings.device_stale(), settings.latency_samples);
        Ok(Self {
            node_id,
            settings,
            devices,
            dedup: HashMap::new(),
            last_time: 0,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Stamp an outbound packet: our origin, given destination, fresh hop count and
    /// a creation time greater than any this node stamped before.
    pub fn prepare_send(&mut self, mut packet: Packet, destination: NodeId) -> Packet {
        packet.header.origin = self.node_id;
        packet.header.destination = destination;
        packet.header.hop_count = 0;
        packet.header.time = self.next_time();
        packet
    }

    pub fn heartbeat(&mut self, callsign: Option<String>) -> Packet {
        let mut packet = Packet::heartbeat(self.node_id, callsign);
        packet.header.time = self.next_time();
        packet
    }

    pub fn ping(&mut self, target: NodeId) -> Packet {
        let mut packet = Packet::ping_request(self.node_id, target);
        packet.header.time = self.next_time();
        packet
    }

    /// `time` doubles as the dedup id, so two packets from one node never share it,
    /// even within the same millisecond.
    fn next_time(&mut self) -> i64 {
        self.last_time = now_millis().max(self.last_time + 1);
        self.last_time
    }

    /// Raw bytes from a transport. Malformed input becomes a `Dropped` action.
    pub fn on_bytes_received(&mut self, from: TransportId, bytes: &[u8]) -> Vec<Action> {
        self.on_bytes_received_at(from, bytes, Instant::now())
    }

    pub fn on_bytes_received_at(
        &mut self,
        from: TransportId,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<Action> {
        match wire::decode(bytes) {
            Ok(packet) => self.handle(from, packet, bytes.len(), now),
            Err(e) => {
                tracing::debug!(transport = %from, error = %e, "dropping undecodable packet");
                vec![Action::Dropped(DropReason::Malformed(e))]
            }
        }
    }

    /// An already decoded packet from a transport.
    pub fn on_packet_received(&mut self, from: TransportId, packet: Packet) -> Vec<Action> {
        self.on_packet_received_at(from, packet, Instant::now())
    }

    pub fn on_packet_received_at(
        &mut self,
        from: TransportId,
        packet: Packet,
        now: Instant,
    ) -> Vec<Action> {
        let size = wire::encoded_len(&packet);
        self.handle(from, packet, size, now)
    }

    fn handle(&mut self, from: TransportId, packet: Packet, size: usize, now: Instant) -> Vec<Action> {
        let header = packet.header;
        let kind = packet.kind();

        if header.origin == self.node_id && kind != PacketKind::Ping {
            return drop_with(DropReason::OwnTraffic, from, &packet);
        }
        if kind == PacketKind::Heartbeat && !packet.is_valid() {
            return drop_with(DropReason::InvalidChecksum, from, &packet);
        }
        if !packet.is_valid() {
            tracing::warn!(transport = %from, origin = %header.origin, ?kind, "checksum mismatch");
        }
        let window = self.settings.dedup_window;
        let fresh = self
            .dedup
            .entry(from)
            .or_insert_with(|| DedupWindow::new(window))
            .check_and_record(header.time);
        if !fresh {
            return drop_with(DropReason::Duplicate, from, &packet);
        }

        if let Payload::Ping { midpoint } = packet.payload {
            return self.handle_ping(from, &packet, midpoint, now);
        }

        let mut actions = Vec::new();
        if !header.origin.is_broadcast() {
            let hop_stale = self.settings.hop_stale();
            let device = self.devices.resolve(header.origin, now);
            device.mark_contact(from.kind, header.hop_count, size, now, hop_stale);
            match &packet.payload {
                Payload::Heartbeat { callsign } => device.set_callsign(callsign.clone()),
                Payload::Disconnecting => {
                    device.mark_lost(true);
                    tracing::info!(node = %header.origin, "device disconnected");
                }
                _ => {}
            }
            actions.push(Action::DeviceChanged(device.clone()));
        }

        let for_us = header.is_addressed_to(self.node_id);
        if for_us && !kind.is_admin() {
            actions.push(Action::DeliverLocal(packet.clone()));
        }

        if header.destination != self.node_id {
            let ceiling = self.settings.hop_ceiling(from.kind);
            if header.hop_count < ceiling {
                actions.push(Action::Relay {
                    packet: packet.relayed(),
                    arrived_on: from,
                });
            } else {
                tracing::debug!(
                    transport = %from,
                    origin = %header.origin,
                    hop_count = header.hop_count,
                    ceiling,
                    "hop ceiling reached"
                );
                actions.push(Action::Dropped(DropReason::HopLimit {
                    hop_count: header.hop_count,
                    ceiling,
                }));
            }
        }
        actions
    }

    fn handle_ping(
        &mut self,
        from: TransportId,
        packet: &Packet,
        midpoint: i64,
        now: Instant,
    ) -> Vec<Action> {
        if packet.destination() != self.node_id {
            return drop_with(DropReason::PingMisaddressed, from, packet);
        }
        let origin = packet.origin();
        if midpoint == PING_REQUEST {
            let mut actions = Vec::new();
            if origin != self.node_id && !origin.is_broadcast() {
                let device = self.devices.resolve(origin, now);
                device.touch(now);
                actions.push(Action::DeviceChanged(device.clone()));
            }
            if let Some(reply) = packet.ping_reply(self.node_id, now_millis()) {
                actions.push(Action::Reply { packet: reply, via: from });
            }
            return actions;
        }
        let round_trip = now_millis() - packet.header.time;
        if origin == self.node_id || origin.is_broadcast() {
            // Answer from a peer that did not re-address its reply.
            tracing::debug!(round_trip, "ping reply without responder id");
            return Vec::new();
        }
        let device = self.devices.resolve(origin, now);
        device.touch(now);
        device.record_latency(round_trip);
        tracing::trace!(node = %origin, round_trip, "ping round trip");
        vec![Action::DeviceChanged(device.clone())]
    }

    /// Transport-level discovery of a peer, before any packet from it.
    pub fn on_peer_discovered(&mut self, node_id: NodeId, network_id: Option<String>) -> Vec<Action> {
        if node_id == self.node_id || node_id.is_broadcast() {
            return Vec::new();
        }
        let device = self.devices.resolve(node_id, Instant::now());
        if network_id.is_some() {
            device.network_id = network_id;
        }
        vec![Action::DeviceChanged(device.clone())]
    }

    /// The link to a peer went away. `graceful` when it said goodbye first.
    pub fn on_peer_lost(&mut self, node_id: NodeId, graceful: bool) -> Vec<Action> {
        match self.devices.get_mut(node_id) {
            Some(device) => {
                device.mark_lost(graceful);
                vec![Action::DeviceChanged(device.clone())]
            }
            None => Vec::new(),
        }
    }
}

fn drop_with(reason: DropReason, from: TransportId, packet: &Packet) -> Vec<Action> {
    tracing::debug!(
        transport = %from,
        origin = %packet.origin(),
        kind = ?packet.kind(),
        time = packet.header.time,
        %reason,
        "dropping packet"
    );
    vec![Action::Dropped(reason)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use crate::transport::TransportKind;

    const TCP: TransportId = TransportId::new(TransportKind::Tcp, 0);
    const SDR: TransportId = TransportId::new(TransportKind::Sdr, 0);
    const ME: NodeId = NodeId(1);

    fn core() -> MeshCore {
        MeshCore::new(ME, Settings::default()).unwrap()
    }

    fn with_time(mut p: Packet, time: i64) -> Packet {
        p.header.time = time;
        p
    }

    fn with_hops(mut p: Packet, hops: u8) -> Packet {
        p.header.hop_count = hops;
        p
    }

    fn dropped(actions: &[Action]) -> Option<&DropReason> {
        actions.iter().find_map(|a| match a {
            Action::Dropped(r) => Some(r),
            _ => None,
        })
    }

    fn relayed(actions: &[Action]) -> Option<&Packet> {
        actions.iter().find_map(|a| match a {
            Action::Relay { packet, .. } => Some(packet),
            _ => None,
        })
    }

    fn delivered(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::DeliverLocal(_)))
    }

    #[test]
    fn own_traffic_always_dropped() {
        let mut c = core();
        for (dest, hops) in [(NodeId::BROADCAST, 0), (NodeId(2), 3), (ME, 9)] {
            let p = with_hops(Packet::raw(ME, dest, vec![1]), hops);
            let actions = c.on_packet_received(TCP, p);
            assert_eq!(actions.len(), 1);
            assert_eq!(dropped(&actions), Some(&DropReason::OwnTraffic));
        }
        assert!(c.devices().is_empty());
    }

    #[test]
    fn broadcast_is_delivered_and_relayed() {
        let mut c = core();
        let p = Packet::channel(NodeId(2), NodeId::BROADCAST, "chat", b"hi".to_vec());
        let actions = c.on_packet_received(TCP, p.clone());
        assert!(delivered(&actions));
        let out = relayed(&actions).unwrap();
        assert_eq!(out.header.hop_count, 1);
        assert_eq!(out.origin(), NodeId(2));
        assert!(matches!(
            actions.iter().find(|a| matches!(a, Action::Relay { .. })),
            Some(Action::Relay { arrived_on, .. }) if *arrived_on == TCP
        ));
        let d = c.devices().get(NodeId(2)).unwrap();
        assert_eq!(d.hop_distance(), 0);
        assert!(d.direct_links().contains(TransportKind::Tcp));
    }

    #[test]
    fn unicast_to_self_not_relayed() {
        let mut c = core();
        let actions = c.on_packet_received(TCP, Packet::raw(NodeId(2), ME, vec![1]));
        assert!(delivered(&actions));
        assert!(relayed(&actions).is_none());
    }

    #[test]
    fn unicast_elsewhere_relayed_not_delivered() {
        let mut c = core();
        let actions = c.on_packet_received(TCP, Packet::raw(NodeId(2), NodeId(3), vec![1]));
        assert!(!delivered(&actions));
        assert!(relayed(&actions).is_some());
    }

    #[test]
    fn hop_ceiling_boundary() {
        let mut c = core();
        let ceiling = c.settings().max_hops;
        let below = with_time(
            with_hops(Packet::raw(NodeId(2), NodeId::BROADCAST, vec![1]), ceiling - 1),
            100,
        );
        let actions = c.on_packet_received(TCP, below);
        assert_eq!(relayed(&actions).unwrap().header.hop_count, ceiling);

        let at = with_time(
            with_hops(Packet::raw(NodeId(2), NodeId::BROADCAST, vec![1]), ceiling),
            101,
        );
        let actions = c.on_packet_received(TCP, at);
        assert!(relayed(&actions).is_none());
        assert_eq!(
            dropped(&actions),
            Some(&DropReason::HopLimit {
                hop_count: ceiling,
                ceiling
            })
        );
        // Still delivered locally: only the relay step is limited.
        assert!(delivered(&actions));
    }

    #[test]
    fn transport_specific_ceiling() {
        let mut settings = Settings::default();
        settings.hop_ceilings.insert(TransportKind::Sdr, 1);
        let mut c = MeshCore::new(ME, settings).unwrap();
        let p = with_hops(Packet::raw(NodeId(2), NodeId::BROADCAST, vec![1]), 1);
        assert!(relayed(&c.on_packet_received(SDR, p.clone())).is_none());
        assert!(relayed(&c.on_packet_received(TCP, p)).is_some());
    }

    #[test]
    fn duplicate_dropped_until_window_cycles() {
        let mut c = core();
        let p = with_time(Packet::raw(NodeId(2), NodeId::BROADCAST, vec![1]), 5_000);
        assert!(delivered(&c.on_packet_received(TCP, p.clone())));
        assert_eq!(
            dropped(&c.on_packet_received(TCP, p.clone())),
            Some(&DropReason::Duplicate)
        );
        // Another transport keeps its own window.
        assert!(delivered(&c.on_packet_received(SDR, p.clone())));
        for t in 0..10 {
            let filler = with_time(Packet::raw(NodeId(3), NodeId::BROADCAST, vec![2]), 6_000 + t);
            c.on_packet_received(TCP, filler);
        }
        assert!(delivered(&c.on_packet_received(TCP, p)));
    }

    #[test]
    fn invalid_heartbeat_dropped() {
        let mut c = core();
        let hb = Packet::heartbeat(NodeId(2), Some("BRAVO".into()));
        let mut bytes = wire::encode(&hb);
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        let actions = c.on_bytes_received(TCP, &bytes);
        assert_eq!(dropped(&actions), Some(&DropReason::InvalidChecksum));
        assert!(c.devices().get(NodeId(2)).is_none());
    }

    #[test]
    fn heartbeat_records_callsign() {
        let mut c = core();
        let hb = Packet::heartbeat(NodeId(2), Some("BRAVO".into()));
        let actions = c.on_bytes_received(TCP, &wire::encode(&hb));
        assert!(!delivered(&actions));
        assert_eq!(c.devices().get(NodeId(2)).unwrap().callsign(), Some("BRAVO"));
    }

    #[test]
    fn garbage_bytes_are_dropped_not_fatal() {
        let mut c = core();
        let actions = c.on_bytes_received(TCP, &[9, 9, 9]);
        assert!(matches!(dropped(&actions), Some(DropReason::Malformed(_))));
        let ok = c.on_packet_received(TCP, Packet::raw(NodeId(2), ME, vec![1]));
        assert!(delivered(&ok));
    }

    #[test]
    fn ping_request_answered_not_relayed() {
        let mut c = core();
        let req = Packet::ping_request(NodeId(2), ME);
        let actions = c.on_packet_received(SDR, req.clone());
        assert!(relayed(&actions).is_none());
        let reply = actions
            .iter()
            .find_map(|a| match a {
                Action::Reply { packet, via } => Some((packet, via)),
                _ => None,
            })
            .unwrap();
        assert_eq!(*reply.1, SDR);
        assert_eq!(reply.0.origin(), ME);
        assert_eq!(reply.0.destination(), NodeId(2));
        assert_eq!(reply.0.header.time, req.header.time);
        assert!(matches!(reply.0.payload, Payload::Ping { midpoint } if midpoint > 0));
    }

    #[test]
    fn ping_reply_records_latency_without_hops() {
        let mut c = core();
        c.on_packet_received(TCP, with_hops(Packet::raw(NodeId(2), ME, vec![1]), 2));
        let mut req = Packet::ping_request(ME, NodeId(2));
        req.header.time = now_millis() - 40;
        let reply = with_hops(req.ping_reply(NodeId(2), now_millis() - 20).unwrap(), 3);
        c.on_packet_received(TCP, reply);
        let d = c.devices().get(NodeId(2)).unwrap();
        assert_eq!(d.latency().len(), 1);
        assert!(d.latency().last().unwrap() >= 20);
        assert_eq!(d.hop_distance(), 2);
    }

    #[test]
    fn ping_for_someone_else_dropped() {
        let mut c = core();
        let actions = c.on_packet_received(TCP, Packet::ping_request(NodeId(2), NodeId(3)));
        assert_eq!(dropped(&actions), Some(&DropReason::PingMisaddressed));
        let actions = c.on_packet_received(
            TCP,
            with_time(Packet::ping_request(NodeId(2), NodeId::BROADCAST), 77),
        );
        assert_eq!(dropped(&actions), Some(&DropReason::PingMisaddressed));
    }

    #[test]
    fn disconnecting_marks_device_offline_and_relays() {
        let mut c = core();
        let now = Instant::now();
        c.on_packet_received_at(TCP, with_time(Packet::raw(NodeId(2), ME, vec![1]), 1), now);
        let actions =
            c.on_packet_received_at(TCP, with_time(Packet::disconnecting(NodeId(2)), 2), now);
        assert!(relayed(&actions).is_some());
        assert!(!delivered(&actions));
        assert_eq!(c.devices().status(NodeId(2), now), Some(DeviceStatus::Offline));
        assert!(c
            .devices()
            .get(NodeId(2))
            .unwrap()
            .direct_links()
            .is_empty());
    }

    #[test]
    fn relayed_hop_count_sets_distance() {
        let mut c = core();
        c.on_packet_received(TCP, with_hops(Packet::raw(NodeId(9), NodeId::BROADCAST, vec![]), 2));
        let d = c.devices().get(NodeId(9)).unwrap();
        assert_eq!(d.hop_distance(), 2);
        assert!(d.direct_links().is_empty());
    }

    #[test]
    fn peer_lost_without_goodbye_is_error() {
        let mut c = core();
        c.on_peer_discovered(NodeId(4), Some("192.168.1.4:1716".into()));
        assert_eq!(
            c.devices().get(NodeId(4)).unwrap().network_id.as_deref(),
            Some("192.168.1.4:1716")
        );
        c.on_peer_lost(NodeId(4), false);
        assert_eq!(
            c.devices().status(NodeId(4), Instant::now()),
            Some(DeviceStatus::Error)
        );
        assert!(c.on_peer_lost(NodeId(99), true).is_empty());
    }

    #[test]
    fn prepare_send_stamps_origin() {
        let mut c = core();
        let p = c.prepare_send(with_hops(Packet::raw(NodeId(7), NodeId(8), vec![]), 3), NodeId(5));
        assert_eq!(p.origin(), ME);
        assert_eq!(p.destination(), NodeId(5));
        assert_eq!(p.header.hop_count, 0);
    }

    #[test]
    fn back_to_back_sends_get_distinct_times() {
        let mut c = core();
        let mut last = 0;
        for _ in 0..100 {
            let hb = c.heartbeat(None);
            let p = c.prepare_send(Packet::disconnecting(ME), NodeId::BROADCAST);
            assert!(hb.header.time > last);
            assert!(p.header.time > hb.header.time);
            last = p.header.time;
        }
    }

    #[test]
    fn goodbye_right_after_heartbeat_marks_peer_offline() {
        let mut sender = MeshCore::new(NodeId(2), Settings::default()).unwrap();
        let mut receiver = core();
        let hb = sender.prepare_send(Packet::heartbeat(NodeId(2), None), NodeId::BROADCAST);
        let bye = sender.prepare_send(Packet::disconnecting(NodeId(2)), NodeId::BROADCAST);

        receiver.on_bytes_received(TCP, &wire::encode(&hb));
        let actions = receiver.on_bytes_received(TCP, &wire::encode(&bye));
        assert_eq!(dropped(&actions), None);
        assert_eq!(
            receiver.devices().status(NodeId(2), Instant::now()),
            Some(DeviceStatus::Offline)
        );
    }
}
