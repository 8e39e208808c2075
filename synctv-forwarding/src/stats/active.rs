//! Track-level view: simulcast ranking and the active layer ladder

use super::encoding::EncodingStats;
use super::layer::{compare_by_bitrate_desc, LayerStats};
use crate::types::EncodingId;
use serde::{Deserialize, Serialize};

/// Summary of one encoding that currently carries media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEncoding {
    pub encoding_id: EncodingId,
    pub simulcast_idx: i32,
    pub codec: Option<String>,
    pub bitrate: u64,
    pub total_bitrate: u64,
    pub total_bytes: u64,
    pub num_packets: u64,
    pub lost_packets: u64,
    /// Highest bitrate first
    pub layers: Vec<LayerStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveEncoding {
    pub encoding_id: EncodingId,
}

/// Ranked view of what a track is currently carrying
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveLayersInfo {
    /// Highest bitrate first
    pub active: Vec<ActiveEncoding>,
    pub inactive: Vec<InactiveEncoding>,
    /// Every layer of every active encoding, highest bitrate first
    pub layers: Vec<LayerStats>,
}

impl ActiveLayersInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[must_use]
    pub fn encoding(&self, encoding_id: &EncodingId) -> Option<&ActiveEncoding> {
        self.active.iter().find(|e| &e.encoding_id == encoding_id)
    }

    /// Simulcast rank of an encoding, -1 when inactive or unknown
    #[must_use]
    pub fn simulcast_idx(&self, encoding_id: &EncodingId) -> i32 {
        self.encoding(encoding_id).map_or(-1, |e| e.simulcast_idx)
    }
}

/// Rank the encodings of one track by bitrate and stamp rank and codec onto their layers
///
/// Ranks count up from the lowest active bitrate (0) to the highest. Encodings without
/// media get -1. Ranks are only meaningful within this snapshot.
pub fn update_simulcast_index_and_codec(stats: &mut [EncodingStats]) {
    let mut order: Vec<usize> = (0..stats.len()).collect();
    // Stable: equal bitrates keep the order encodings were added in
    order.sort_by_key(|&i| stats[i].bitrate);

    let mut next_idx = 0;
    for i in order {
        let encoding = &mut stats[i];
        encoding.simulcast_idx = if encoding.is_active() {
            next_idx += 1;
            next_idx - 1
        } else {
            -1
        };

        let simulcast_idx = encoding.simulcast_idx;
        let codec = encoding.codec.clone();
        for layer in encoding
            .layers
            .iter_mut()
            .chain(encoding.individual.iter_mut())
        {
            layer.simulcast_idx = simulcast_idx;
            layer.codec.clone_from(&codec);
        }
    }
}

/// Split encodings into active/inactive and flatten the active layers into one ladder
///
/// Expects [`update_simulcast_index_and_codec`] to have run on `stats`.
#[must_use]
pub fn derive_active_layers(stats: &[EncodingStats]) -> ActiveLayersInfo {
    let mut info = ActiveLayersInfo::default();

    for encoding in stats {
        if !encoding.is_active() {
            info.inactive.push(InactiveEncoding {
                encoding_id: encoding.encoding_id.clone(),
            });
            continue;
        }

        let mut layers = if encoding.has_layers() {
            encoding.layers.clone()
        } else {
            vec![encoding.as_single_layer()]
        };
        layers.sort_by(compare_by_bitrate_desc);
        info.layers.extend(layers.iter().cloned());

        info.active.push(ActiveEncoding {
            encoding_id: encoding.encoding_id.clone(),
            simulcast_idx: encoding.simulcast_idx,
            codec: encoding.codec.clone(),
            bitrate: encoding.bitrate,
            total_bitrate: encoding.total_bitrate,
            total_bytes: encoding.total_bytes,
            num_packets: encoding.num_packets,
            lost_packets: encoding.lost_packets,
            layers,
        });
    }

    info.active.sort_by(|a, b| {
        b.bitrate
            .cmp(&a.bitrate)
            .then_with(|| b.simulcast_idx.cmp(&a.simulcast_idx))
    });
    info.layers.sort_by(compare_by_bitrate_desc);
    info
}
