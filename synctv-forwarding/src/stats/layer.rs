//! Per spatial/temporal layer statistics

use crate::engine::RawLayer;
use crate::types::EncodingId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Statistics of one spatial/temporal layer, tagged with its encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub encoding_id: EncodingId,
    pub spatial_layer_id: u8,
    pub temporal_layer_id: u8,
    pub total_bytes: u64,
    pub num_packets: u64,
    pub bitrate: u64,
    pub total_bitrate: u64,
    pub active: bool,
    pub target_bitrate: Option<u64>,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub target_fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Rank of the owning encoding, -1 while unranked or inactive
    pub simulcast_idx: i32,
    pub codec: Option<String>,
}

impl LayerStats {
    #[must_use]
    pub fn from_raw(encoding_id: &EncodingId, raw: &RawLayer) -> Self {
        Self {
            encoding_id: encoding_id.clone(),
            spatial_layer_id: raw.spatial_layer_id,
            temporal_layer_id: raw.temporal_layer_id,
            total_bytes: raw.total_bytes,
            num_packets: raw.num_packets,
            bitrate: raw.bitrate,
            total_bitrate: raw.total_bitrate,
            active: raw.active,
            target_bitrate: raw.target_bitrate,
            target_width: raw.target_width,
            target_height: raw.target_height,
            target_fps: raw.target_fps,
            width: raw.width,
            height: raw.height,
            simulcast_idx: -1,
            codec: None,
        }
    }

    /// Bitrate used for ordering: the encoder's target when signaled, else the measurement
    #[must_use]
    pub fn ranking_bitrate(&self) -> u64 {
        self.target_bitrate.unwrap_or(self.bitrate)
    }

    /// Bitrate a subscriber should budget for this layer
    #[must_use]
    pub fn effective_bitrate(&self) -> u64 {
        self.target_bitrate
            .map_or(self.bitrate, |target| target.max(self.bitrate))
    }

    /// Whether the layer would be needed to decode `(spatial, temporal)`
    #[must_use]
    pub const fn is_at_or_below(&self, spatial: u8, temporal: u8) -> bool {
        self.spatial_layer_id <= spatial && self.temporal_layer_id <= temporal
    }

    #[must_use]
    pub fn fits_dimensions(&self, max_width: Option<u32>, max_height: Option<u32>) -> bool {
        let width = self.width.or(self.target_width);
        let height = self.height.or(self.target_height);
        let width_ok = match (width, max_width) {
            (Some(w), Some(max)) => w <= max,
            _ => true,
        };
        let height_ok = match (height, max_height) {
            (Some(h), Some(max)) => h <= max,
            _ => true,
        };
        width_ok && height_ok
    }
}

/// Roll individual layers up so that each entry covers every layer it depends on
///
/// A decoder at `(s, t)` needs all layers with `s' <= s` and `t' <= t`, so the
/// cumulative entry sums their counters. Descriptive fields (targets, size, activity)
/// stay those of the layer itself.
#[must_use]
pub fn cumulative_layers(individual: &[LayerStats]) -> Vec<LayerStats> {
    individual
        .iter()
        .map(|layer| {
            let mut rolled = layer.clone();
            rolled.total_bytes = 0;
            rolled.num_packets = 0;
            rolled.bitrate = 0;
            rolled.total_bitrate = 0;
            for lower in individual
                .iter()
                .filter(|other| other.is_at_or_below(layer.spatial_layer_id, layer.temporal_layer_id))
            {
                rolled.total_bytes += lower.total_bytes;
                rolled.num_packets += lower.num_packets;
                rolled.bitrate += lower.bitrate;
                rolled.total_bitrate += lower.total_bitrate;
            }
            rolled
        })
        .collect()
}

/// Highest bitrate first
///
/// Layers are compared on [`LayerStats::ranking_bitrate`], then on the measured bitrate,
/// then on layer ids, so the order is total and deterministic.
#[must_use]
pub fn compare_by_bitrate_desc(a: &LayerStats, b: &LayerStats) -> Ordering {
    b.ranking_bitrate()
        .cmp(&a.ranking_bitrate())
        .then_with(|| b.bitrate.cmp(&a.bitrate))
        .then_with(|| b.spatial_layer_id.cmp(&a.spatial_layer_id))
        .then_with(|| b.temporal_layer_id.cmp(&a.temporal_layer_id))
}
