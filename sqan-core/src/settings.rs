//! Engine settings, passed in at construction.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::MAX_FRAME_PAYLOAD;
use crate::transport::TransportKind;

/// Tunables for the forwarding engine and SAR links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Hop ceiling for relaying (default 4).
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    /// Per-transport hop ceilings that override `max_hops`.
    #[serde(default)]
    pub hop_ceilings: BTreeMap<TransportKind, u8>,
    /// Segment payload size on links that need SAR (default 240, at most 255).
    #[serde(default = "default_max_segment_payload")]
    pub max_segment_payload: usize,
    #[serde(default = "default_segment_stale_ms")]
    pub segment_stale_ms: u64,
    /// Recent `time` values remembered per transport.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// A device not heard from for this long reads as stale.
    #[serde(default = "default_device_stale_ms")]
    pub device_stale_ms: u64,
    /// A larger hop count only replaces a smaller one older than this.
    #[serde(default = "default_hop_stale_ms")]
    pub hop_stale_ms: u64,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
}

fn default_max_hops() -> u8 {
    4
}
fn default_max_segment_payload() -> usize {
    crate::sar::DEFAULT_SEGMENT_PAYLOAD
}
fn default_segment_stale_ms() -> u64 {
    5_000
}
fn default_dedup_window() -> usize {
    10
}
fn default_device_stale_ms() -> u64 {
    60_000
}
fn default_hop_stale_ms() -> u64 {
    60_000
}
fn default_latency_samples() -> usize {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            hop_ceilings: BTreeMap::new(),
            max_segment_payload: default_max_segment_payload(),
            segment_stale_ms: default_segment_stale_ms(),
            dedup_window: default_dedup_window(),
            device_stale_ms: default_device_stale_ms(),
            hop_stale_ms: default_hop_stale_ms(),
            latency_samples: default_latency_samples(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_segment_payload == 0 || self.max_segment_payload > MAX_FRAME_PAYLOAD {
            return Err(SettingsError::SegmentPayload(self.max_segment_payload));
        }
        if self.dedup_window == 0 {
            return Err(SettingsError::Zero("dedup_window"));
        }
        if self.latency_samples == 0 {
            return Err(SettingsError::Zero("latency_samples"));
        }
        Ok(())
    }

    /// Hop ceiling that applies to packets arriving on `kind`.
    pub fn hop_ceiling(&self, kind: TransportKind) -> u8 {
        self.hop_ceilings.get(&kind).copied().unwrap_or(self.max_hops)
    }

    pub fn segment_stale(&self) -> Duration {
        Duration::from_millis(self.segment_stale_ms)
    }

    pub fn device_stale(&self) -> Duration {
        Duration::from_millis(self.device_stale_ms)
    }

    pub fn hop_stale(&self) -> Duration {
        Duration::from_millis(self.hop_stale_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("max_segment_payload must be 1..=255, got {0}")]
    SegmentPayload(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.max_hops, 4);
        assert_eq!(s.segment_stale(), Duration::from_secs(5));
        assert_eq!(s.device_stale(), Duration::from_secs(60));
    }

    #[test]
    fn hop_ceiling_override() {
        let mut s = Settings::default();
        s.hop_ceilings.insert(TransportKind::Sdr, 2);
        assert_eq!(s.hop_ceiling(TransportKind::Sdr), 2);
        assert_eq!(s.hop_ceiling(TransportKind::Tcp), 4);
    }

    #[test]
    fn rejects_bad_segment_size() {
        let mut s = Settings::default();
        s.max_segment_payload = 300;
        assert_eq!(s.validate(), Err(SettingsError::SegmentPayload(300)));
        s.max_segment_payload = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_zero_dedup_window() {
        let s = Settings {
            dedup_window: 0,
            ..Settings::default()
        };
        assert_eq!(s.validate(), Err(SettingsError::Zero("dedup_window")));
    }
}
