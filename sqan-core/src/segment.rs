//! Segment frames for narrowband links and the receive-side stream scanner.
//!
//! Frame: marker `66 99`, payload length, flags, checksum, payload.
//! Flags: bit 7 final, bits 5-6 packet id, bits 0-4 index.

use crate::integrity;
use crate::sar::SarError;

pub const MARKER: [u8; 2] = [0x66, 0x99];
/// The marker as it appears when the link delivers every bit inverted.
const INVERSE_MARKER: [u8; 2] = [0x99, 0x66];
pub const SEGMENT_HEADER_LEN: usize = 5;
/// Largest payload a single frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize;

/// Index value marking a segment that carries a whole message.
pub const STANDALONE_INDEX: u8 = 0x1F;
/// Segments per multi-segment message (indices 0..=30).
pub const MAX_SEGMENTS: usize = STANDALONE_INDEX as usize;
/// Packet ids wrap after this value.
pub const MAX_PACKET_ID: u8 = 0b11;

const FLAG_FINAL: u8 = 0x80;
const PACKET_ID_SHIFT: u8 = 5;
const INDEX_MASK: u8 = 0x1F;

/// Good/bad frame ratio above which the link is reported as noisy.
pub const ACCEPTABLE_BAD_TO_GOOD: u64 = 8;
/// Skipped bytes per reported loss.
pub const LOST_BYTES_REPORT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    packet_id: u8,
    index: u8,
    is_final: bool,
    payload: Vec<u8>,
}

impl Segment {
    pub fn new(packet_id: u8, index: u8, is_final: bool, payload: Vec<u8>) -> Result<Self, SarError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(SarError::PayloadTooLarge(payload.len()));
        }
        if packet_id > MAX_PACKET_ID || index > STANDALONE_INDEX {
            return Err(SarError::BadSequence { packet_id, index });
        }
        Ok(Self {
            packet_id,
            index,
            is_final,
            payload,
        })
    }

    /// A segment delivered as-is, outside any Segmenter.
    pub fn standalone(payload: Vec<u8>) -> Result<Self, SarError> {
        Self::new(0, STANDALONE_INDEX, true, payload)
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn is_standalone(&self) -> bool {
        self.index == STANDALONE_INDEX
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    fn flags(&self) -> u8 {
        let fin = if self.is_final { FLAG_FINAL } else { 0 };
        fin | (self.packet_id << PACKET_ID_SHIFT) | (self.index & INDEX_MASK)
    }

    fn from_flags(flags: u8, payload: Vec<u8>) -> Self {
        Self {
            packet_id: (flags >> PACKET_ID_SHIFT) & MAX_PACKET_ID,
            index: flags & INDEX_MASK,
            is_final: flags & FLAG_FINAL != 0,
            payload,
        }
    }

    /// Serialize as one frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MARKER);
        out.push(self.payload.len() as u8);
        out.push(self.flags());
        out.push(integrity::segment_checksum(&self.payload));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one frame starting at the front of `bytes` (marker included).
    /// Returns the segment and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Segment, usize), SegmentDecodeError> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(SegmentDecodeError::NeedMore);
        }
        if bytes[..2] != MARKER {
            return Err(SegmentDecodeError::NoMarker);
        }
        let len = bytes[2] as usize;
        let total = SEGMENT_HEADER_LEN + len;
        if bytes.len() < total {
            return Err(SegmentDecodeError::NeedMore);
        }
        let payload = &bytes[SEGMENT_HEADER_LEN..total];
        if integrity::segment_checksum(payload) != bytes[4] {
            return Err(SegmentDecodeError::BadChecksum);
        }
        Ok((Segment::from_flags(bytes[3], payload.to_vec()), total))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame does not start with a segment marker")]
    NoMarker,
    #[error("segment checksum mismatch")]
    BadChecksum,
}

/// What the scanner found in the bytes handed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Segment(Segment),
    /// A framed segment failed its checksum.
    Corrupt,
    /// Bytes skipped while hunting for a marker.
    LostBytes(usize),
    /// Bad frames now outnumber good ones beyond the acceptable ratio.
    HighNoise { good: u64, bad: u64 },
}

/// Recovers segment frames from a raw byte stream with no frame boundaries.
#[derive(Debug, Default)]
pub struct SegmentScanner {
    buf: Vec<u8>,
    good: u64,
    bad: u64,
    lost: usize,
}

impl SegmentScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn good_frames(&self) -> u64 {
        self.good
    }

    pub fn bad_frames(&self) -> u64 {
        self.bad
    }

    /// Bytes buffered while waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<ScanEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            let Some((start, inverted)) = find_marker(&self.buf) else {
                // Keep a trailing byte that may be half of a marker.
                let keep = usize::from(matches!(self.buf.last(), Some(&0x66) | Some(&0x99)));
                let skipped = self.buf.len() - keep;
                self.buf.drain(..skipped);
                self.skip(skipped, &mut events);
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
                self.skip(start, &mut events);
            }
            if self.buf.len() < SEGMENT_HEADER_LEN {
                break;
            }
            let len = usize::from(if inverted { !self.buf[2] } else { self.buf[2] });
            let total = SEGMENT_HEADER_LEN + len;
            if self.buf.len() < total {
                break;
            }
            let mut frame: Vec<u8> = self.buf[..total].to_vec();
            if inverted {
                frame.iter_mut().for_each(|b| *b = !*b);
            }
            match Segment::decode(&frame) {
                Ok((segment, used)) => {
                    self.good += 1;
                    self.buf.drain(..used);
                    events.push(ScanEvent::Segment(segment));
                }
                Err(_) => {
                    // Drop only the marker and resync inside the suspect frame.
                    self.buf.drain(..MARKER.len());
                    self.bad += 1;
                    tracing::debug!(bad = self.bad, good = self.good, "corrupt segment frame");
                    events.push(ScanEvent::Corrupt);
                    if self.bad % ACCEPTABLE_BAD_TO_GOOD == 0
                        && self.bad > ACCEPTABLE_BAD_TO_GOOD * self.good.max(1)
                    {
                        events.push(ScanEvent::HighNoise {
                            good: self.good,
                            bad: self.bad,
                        });
                    }
                }
            }
        }
        events
    }

    fn skip(&mut self, n: usize, events: &mut Vec<ScanEvent>) {
        self.lost += n;
        while self.lost >= LOST_BYTES_REPORT {
            self.lost -= LOST_BYTES_REPORT;
            events.push(ScanEvent::LostBytes(LOST_BYTES_REPORT));
        }
    }
}

/// Earliest marker (plain or inverted) in `buf`.
fn find_marker(buf: &[u8]) -> Option<(usize, bool)> {
    buf.windows(2)
        .position(|w| w == MARKER || w == INVERSE_MARKER)
        .map(|i| (i, buf[i..i + 2] == INVERSE_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(id: u8, index: u8, fin: bool, payload: &[u8]) -> Segment {
        Segment::new(id, index, fin, payload.to_vec()).unwrap()
    }

    #[test]
    fn flags_layout() {
        let s = seg(2, 5, true, b"x");
        let frame = s.encode();
        assert_eq!(&frame[..2], &MARKER);
        assert_eq!(frame[2], 1);
        assert_eq!(frame[3], 0x80 | (2 << 5) | 5);
        assert_eq!(frame[4], integrity::segment_checksum(b"x"));
        let (back, used) = Segment::decode(&frame).unwrap();
        assert_eq!(back, s);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn standalone_uses_sentinel_index() {
        let s = Segment::standalone(vec![1, 2]).unwrap();
        assert!(s.is_standalone());
        assert!(s.is_final());
        let (back, _) = Segment::decode(&s.encode()).unwrap();
        assert!(back.is_standalone());
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(Segment::new(4, 0, false, vec![]).is_err());
        assert!(Segment::new(0, 32, false, vec![]).is_err());
        assert!(Segment::new(0, 0, false, vec![0; 256]).is_err());
    }

    #[test]
    fn decode_detects_bad_checksum() {
        let mut frame = seg(0, 0, false, b"abc").encode();
        frame[6] ^= 0x01;
        assert_eq!(Segment::decode(&frame), Err(SegmentDecodeError::BadChecksum));
        assert_eq!(Segment::decode(&frame[..3]), Err(SegmentDecodeError::NeedMore));
        assert_eq!(Segment::decode(&[0, 1, 2, 3, 4]), Err(SegmentDecodeError::NoMarker));
    }

    #[test]
    fn scanner_handles_split_and_glued_frames() {
        let a = seg(1, 0, false, b"first").encode();
        let b = seg(1, 1, true, b"second").encode();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        let mut scanner = SegmentScanner::new();
        let mut found = Vec::new();
        for piece in stream.chunks(3) {
            for ev in scanner.push(piece) {
                if let ScanEvent::Segment(s) = ev {
                    found.push(s);
                }
            }
        }
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].payload(), b"first");
        assert_eq!(found[1].payload(), b"second");
        assert_eq!(scanner.pending(), 0);
        assert_eq!(scanner.good_frames(), 2);
    }

    #[test]
    fn scanner_skips_leading_noise() {
        let mut stream = vec![0x01, 0x02, 0x03];
        stream.extend_from_slice(&seg(0, 3, false, b"ok").encode());
        let mut scanner = SegmentScanner::new();
        let events = scanner.push(&stream);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ScanEvent::Segment(s) if s.index() == 3));
    }

    #[test]
    fn scanner_recovers_inverted_frame() {
        let frame = seg(3, 7, true, b"upside down").encode();
        let inverted: Vec<u8> = frame.iter().map(|b| !b).collect();
        let mut scanner = SegmentScanner::new();
        let events = scanner.push(&inverted);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Segment(s) => {
                assert_eq!(s.packet_id(), 3);
                assert_eq!(s.index(), 7);
                assert_eq!(s.payload(), b"upside down");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn scanner_resyncs_after_corrupt_frame() {
        let mut bad = seg(0, 0, false, b"damaged").encode();
        bad[7] ^= 0xFF;
        let good = seg(0, 1, true, b"fine").encode();
        let mut stream = bad;
        stream.extend_from_slice(&good);
        let mut scanner = SegmentScanner::new();
        let events = scanner.push(&stream);
        assert!(events.contains(&ScanEvent::Corrupt));
        assert!(events
            .iter()
            .any(|e| matches!(e, ScanEvent::Segment(s) if s.payload() == b"fine")));
        assert_eq!(scanner.bad_frames(), 1);
    }

    #[test]
    fn scanner_reports_lost_bytes_every_hundred() {
        let mut scanner = SegmentScanner::new();
        let events = scanner.push(&[0x00; 250]);
        let lost: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::LostBytes(_)))
            .collect();
        assert_eq!(lost.len(), 2);
    }

    #[test]
    fn scanner_reports_high_noise() {
        let mut scanner = SegmentScanner::new();
        let mut bad = seg(0, 0, false, b"zz").encode();
        bad[5] ^= 0x10;
        let mut noisy = false;
        for _ in 0..(ACCEPTABLE_BAD_TO_GOOD * 2) {
            noisy |= scanner
                .push(&bad)
                .iter()
                .any(|e| matches!(e, ScanEvent::HighNoise { .. }));
        }
        assert!(noisy);
    }
}
