//! Per-encoding statistics built from the engine's media and retransmission counters

use super::layer::{cumulative_layers, LayerStats};
use crate::engine::SourceSnapshot;
use crate::types::EncodingId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregated statistics of one encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingStats {
    pub encoding_id: EncodingId,
    pub timestamp: DateTime<Utc>,
    /// Media bitrate, retransmissions excluded
    pub bitrate: u64,
    /// Media plus retransmission bitrate
    pub total_bitrate: u64,
    pub total_bytes: u64,
    pub lost_packets: u64,
    pub lost_packets_ratio: f64,
    pub num_packets: u64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Cumulative layers: each entry includes every layer it depends on
    pub layers: Vec<LayerStats>,
    /// Layers as reported by the engine
    pub individual: Vec<LayerStats>,
    /// Bitrate rank within the track, -1 when inactive
    pub simulcast_idx: i32,
    pub codec: Option<String>,
}

impl EncodingStats {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.bitrate > 0
    }

    #[must_use]
    pub const fn has_layers(&self) -> bool {
        !self.layers.is_empty()
    }

    /// The whole encoding viewed as a single layer
    #[must_use]
    pub fn as_single_layer(&self) -> LayerStats {
        LayerStats {
            encoding_id: self.encoding_id.clone(),
            spatial_layer_id: 0,
            temporal_layer_id: 0,
            total_bytes: self.total_bytes,
            num_packets: self.num_packets,
            bitrate: self.bitrate,
            total_bitrate: self.total_bitrate,
            active: self.is_active(),
            target_bitrate: None,
            target_width: None,
            target_height: None,
            target_fps: None,
            width: None,
            height: None,
            simulcast_idx: self.simulcast_idx,
            codec: self.codec.clone(),
        }
    }
}

/// Combine the media counters and optional retransmission counters of one encoding
#[must_use]
pub fn compute_encoding_stats(
    encoding_id: &EncodingId,
    media: &SourceSnapshot,
    rtx: Option<&SourceSnapshot>,
) -> EncodingStats {
    let (rtx_bytes, rtx_packets, rtx_lost, rtx_bitrate) = rtx.map_or((0, 0, 0, 0), |rtx| {
        (rtx.bytes, rtx.packets, rtx.lost_packets, rtx.bitrate)
    });

    let num_packets = media.packets + rtx_packets;
    let lost_packets = media.lost_packets + rtx_lost;

    let individual: Vec<LayerStats> = media
        .layers
        .iter()
        .map(|raw| LayerStats::from_raw(encoding_id, raw))
        .collect();
    let layers = if media.layers_aggregated {
        individual.clone()
    } else {
        cumulative_layers(&individual)
    };

    EncodingStats {
        encoding_id: encoding_id.clone(),
        timestamp: Utc::now(),
        bitrate: media.bitrate,
        total_bitrate: media.bitrate + rtx_bitrate,
        total_bytes: media.bytes + rtx_bytes,
        lost_packets,
        lost_packets_ratio: lost_packets_ratio(lost_packets, num_packets),
        num_packets,
        rtt_ms: media.rtt_ms,
        jitter_ms: media.jitter_ms,
        layers,
        individual,
        simulcast_idx: -1,
        codec: media.codec.clone(),
    }
}

fn lost_packets_ratio(lost_packets: u64, num_packets: u64) -> f64 {
    if num_packets == 0 {
        0.0
    } else {
        lost_packets as f64 / num_packets as f64
    }
}
