//! Segmentation and reassembly: split a serialized packet into segments,
//! track in-flight messages per packet id, reassemble.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::segment::{Segment, MAX_FRAME_PAYLOAD, MAX_PACKET_ID, MAX_SEGMENTS};

/// Default segment payload size in bytes.
pub const DEFAULT_SEGMENT_PAYLOAD: usize = 240;

/// Incomplete messages are discarded after this long.
pub const DEFAULT_SEGMENT_STALE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SarError {
    #[error("message of {len} bytes needs more than {max} segments")]
    TooLarge { len: usize, max: usize },
    #[error("segment payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("invalid segment size {0}")]
    InvalidSegmentSize(usize),
    #[error("invalid packet id {packet_id} or index {index}")]
    BadSequence { packet_id: u8, index: u8 },
}

/// Sender side: assigns packet ids and splits buffers into segments.
#[derive(Debug)]
pub struct SegmentWrapper {
    max_payload: usize,
    next_packet_id: u8,
}

impl SegmentWrapper {
    pub fn new(max_payload: usize) -> Result<Self, SarError> {
        if max_payload == 0 || max_payload > MAX_FRAME_PAYLOAD {
            return Err(SarError::InvalidSegmentSize(max_payload));
        }
        Ok(Self {
            max_payload,
            next_packet_id: 0,
        })
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split `bytes` into segments. A buffer that fits one segment goes out standalone
    /// and does not consume a packet id.
    pub fn wrap(&mut self, bytes: &[u8]) -> Result<Vec<Segment>, SarError> {
        if bytes.len() <= self.max_payload {
            return Ok(vec![Segment::standalone(bytes.to_vec())?]);
        }
        let count = bytes.len().div_ceil(self.max_payload);
        if count > MAX_SEGMENTS {
            return Err(SarError::TooLarge {
                len: bytes.len(),
                max: MAX_SEGMENTS,
            });
        }
        let packet_id = self.next_packet_id;
        self.next_packet_id = if packet_id >= MAX_PACKET_ID {
            0
        } else {
            packet_id + 1
        };
        bytes
            .chunks(self.max_payload)
            .enumerate()
            .map(|(i, chunk)| Segment::new(packet_id, i as u8, i + 1 == count, chunk.to_vec()))
            .collect()
    }
}

/// Receive side state for one packet id.
#[derive(Debug)]
pub struct Segmenter {
    packet_id: u8,
    created: Instant,
    /// Kept sorted by index.
    segments: Vec<Segment>,
}

impl Segmenter {
    pub fn new(packet_id: u8, now: Instant) -> Self {
        Self {
            packet_id,
            created: now,
            segments: Vec::new(),
        }
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    /// Store a segment. Returns false for a foreign packet id or an index already held.
    pub fn add(&mut self, segment: Segment) -> bool {
        if segment.packet_id() != self.packet_id || segment.is_standalone() {
            return false;
        }
        match self
            .segments
            .binary_search_by_key(&segment.index(), Segment::index)
        {
            Ok(_) => false,
            Err(pos) => {
                self.segments.insert(pos, segment);
                true
            }
        }
    }

    /// Contiguous run from index 0 that ends in a final segment.
    pub fn is_complete(&self) -> bool {
        let contiguous = self
            .segments
            .iter()
            .enumerate()
            .all(|(i, s)| s.index() as usize == i);
        contiguous && self.segments.last().is_some_and(Segment::is_final)
    }

    /// Payloads in index order. `None` until complete.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let len = self.segments.iter().map(|s| s.payload().len()).sum();
        let mut out = Vec::with_capacity(len);
        for s in &self.segments {
            out.extend_from_slice(s.payload());
        }
        Some(out)
    }

    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.created) > window
    }
}

/// Result of handing a segment to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// A whole message is ready.
    Complete(Vec<u8>),
    /// Stored; more segments needed.
    Pending,
    /// Index already held for this packet id.
    Duplicate,
}

/// Segmenter lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub created: u64,
    pub completed: u64,
    pub purged: u64,
}

/// All in-flight Segmenters of one link, keyed by packet id.
#[derive(Debug)]
pub struct Reassembler {
    active: HashMap<u8, Segmenter>,
    stale_after: Duration,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            active: HashMap::new(),
            stale_after,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn accept(&mut self, segment: Segment, now: Instant) -> Reassembly {
        if segment.is_standalone() {
            return Reassembly::Complete(segment.into_payload());
        }
        let packet_id = segment.packet_id();
        let stats = &mut self.stats;
        let segmenter = self.active.entry(packet_id).or_insert_with(|| {
            stats.created += 1;
            Segmenter::new(packet_id, now)
        });
        if !segmenter.add(segment) {
            return Reassembly::Duplicate;
        }
        match segmenter.reassemble() {
            Some(bytes) => {
                self.active.remove(&packet_id);
                self.stats.completed += 1;
                Reassembly::Complete(bytes)
            }
            None => Reassembly::Pending,
        }
    }

    /// Discard incomplete Segmenters older than the staleness window. Returns their packet ids.
    pub fn purge_stale(&mut self, now: Instant) -> Vec<u8> {
        let window = self.stale_after;
        let stale: Vec<u8> = self
            .active
            .values()
            .filter(|s| s.is_stale(now, window))
            .map(Segmenter::packet_id)
            .collect();
        for id in &stale {
            self.active.remove(id);
            self.stats.purged += 1;
            tracing::debug!(packet_id = id, "purged stale segmenter");
        }
        stale
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}
