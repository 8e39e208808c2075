//! Layer and encoding statistics aggregation
//!
//! Raw engine counters become [`EncodingStats`] per encoding, get ranked across the
//! track, and are finally flattened into an [`ActiveLayersInfo`] ladder that the
//! transponder walks when choosing what to forward.

mod active;
mod encoding;
mod layer;

pub use active::{
    derive_active_layers, update_simulcast_index_and_codec, ActiveEncoding, ActiveLayersInfo,
    InactiveEncoding,
};
pub use encoding::{compute_encoding_stats, EncodingStats};
pub use layer::{compare_by_bitrate_desc, cumulative_layers, LayerStats};
