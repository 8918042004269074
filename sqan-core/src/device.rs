//! Device table: one entry per known mesh node.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::NodeId;
use crate::transport::{LinkFlags, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Known (e.g. from discovery) but no packet received yet.
    Online,
    Connected,
    /// Silent for longer than the staleness window.
    Stale,
    /// Link to the device failed without a goodbye.
    Error,
    /// Left gracefully.
    Offline,
}

/// Bounded ring of round-trip samples in ms.
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<i64>,
    capacity: usize,
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, round_trip_ms: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(round_trip_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// One-way estimate: mean of positive round trips, halved.
    pub fn average(&self) -> Option<i64> {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|&&s| s > 0)
            .fold((0i64, 0i64), |(sum, n), &s| (sum + s, n + 1));
        (count > 0).then(|| sum / (2 * count))
    }

    /// One-way estimate from the newest sample.
    pub fn last(&self) -> Option<i64> {
        self.samples.back().map(|s| s / 2)
    }
}

#[derive(Debug, Clone)]
pub struct PeerDevice {
    node_id: NodeId,
    /// Transport-session address (e.g. TCP peer address), when known.
    pub network_id: Option<String>,
    status: DeviceStatus,
    last_contact: Instant,
    hop_distance: u8,
    hops_known: bool,
    last_hop_update: Instant,
    direct: LinkFlags,
    latency: LatencyHistory,
    rx_bytes: u64,
    callsign: Option<String>,
}

impl PeerDevice {
    fn new(node_id: NodeId, now: Instant, latency_samples: usize) -> Self {
        Self {
            node_id,
            network_id: None,
            status: DeviceStatus::Online,
            last_contact: now,
            hop_distance: 0,
            hops_known: false,
            last_hop_update: now,
            direct: LinkFlags::empty(),
            latency: LatencyHistory::new(latency_samples),
            rx_bytes: 0,
            callsign: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Stored status, reading as `Stale` once `now - last_contact` exceeds `stale_after`.
    pub fn status_at(&self, now: Instant, stale_after: Duration) -> DeviceStatus {
        match self.status {
            DeviceStatus::Online | DeviceStatus::Connected
                if now.saturating_duration_since(self.last_contact) > stale_after =>
            {
                DeviceStatus::Stale
            }
            s => s,
        }
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub fn hop_distance(&self) -> u8 {
        self.hop_distance
    }

    pub fn direct_links(&self) -> LinkFlags {
        self.direct
    }

    pub fn latency(&self) -> &LatencyHistory {
        &self.latency
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn callsign(&self) -> Option<&str> {
        self.callsign.as_deref()
    }

    /// Liveness only: refresh contact time without touching routing state.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_contact = now;
        if self.status != DeviceStatus::Connected {
            self.status = DeviceStatus::Connected;
        }
    }

    /// A routed packet arrived from this device.
    pub(crate) fn mark_contact(
        &mut self,
        kind: TransportKind,
        hop_count: u8,
        bytes: usize,
        now: Instant,
        hop_stale: Duration,
    ) {
        self.touch(now);
        self.rx_bytes = self.rx_bytes.saturating_add(bytes as u64);
        // A longer path only wins once the shorter one has gone quiet.
        let closer = hop_count <= self.hop_distance;
        if !self.hops_known
            || closer
            || now.saturating_duration_since(self.last_hop_update) > hop_stale
        {
            self.hop_distance = hop_count;
            self.hops_known = true;
            self.last_hop_update = now;
        }
        if self.hop_distance == 0 && hop_count == 0 {
            self.direct.insert(kind);
        } else if self.hop_distance > 0 {
            self.direct.clear();
        }
    }

    pub(crate) fn set_callsign(&mut self, callsign: Option<String>) {
        if callsign.is_some() {
            self.callsign = callsign;
        }
    }

    pub(crate) fn record_latency(&mut self, round_trip_ms: i64) {
        self.latency.record(round_trip_ms);
    }

    pub(crate) fn mark_lost(&mut self, graceful: bool) {
        self.status = if graceful {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Error
        };
        self.direct.clear();
    }
}

/// Owned by the forwarding engine. Entries are resolved then updated, never blindly inserted.
#[derive(Debug)]
pub struct DeviceTable {
    devices: HashMap<NodeId, PeerDevice>,
    stale_after: Duration,
    latency_samples: usize,
}

impl DeviceTable {
    pub fn new(stale_after: Duration, latency_samples: usize) -> Self {
        Self {
            devices: HashMap::new(),
            stale_after,
            latency_samples,
        }
    }

    /// Entry for `node_id`, created on first sight.
    pub fn resolve(&mut self, node_id: NodeId, now: Instant) -> &mut PeerDevice {
        let samples = self.latency_samples;
        self.devices
            .entry(node_id)
            .or_insert_with(|| PeerDevice::new(node_id, now, samples))
    }

    pub fn get(&self, node_id: NodeId) -> Option<&PeerDevice> {
        self.devices.get(&node_id)
    }

    pub(crate) fn get_mut(&mut self, node_id: NodeId) -> Option<&mut PeerDevice> {
        self.devices.get_mut(&node_id)
    }

    pub fn status(&self, node_id: NodeId, now: Instant) -> Option<DeviceStatus> {
        self.get(node_id)
            .map(|d| d.status_at(now, self.stale_after))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices that currently read as Connected.
    pub fn active(&self, now: Instant) -> impl Iterator<Item = &PeerDevice> {
        let stale_after = self.stale_after;
        self.devices
            .values()
            .filter(move |d| d.status_at(now, stale_after) == DeviceStatus::Connected)
    }
}
