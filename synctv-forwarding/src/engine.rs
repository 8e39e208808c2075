//! Narrow interfaces to the underlying media engine
//!
//! The engine owns the real media pipeline (RTP receive, SRTP, decoding). This crate
//! only ever sees per-source counters, per-layer descriptors and a forwarding sink
//! that can be pointed at a source.

use crate::error::Result;
use crate::types::HandleId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// A resource whose lifetime is owned by the native engine
pub trait NativeResource: Send + Sync + 'static {
    /// Stable identity of the underlying handle
    fn handle_id(&self) -> HandleId;

    /// Release the native resource. Must tolerate repeated calls.
    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Raw per-layer descriptor as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLayer {
    pub spatial_layer_id: u8,
    pub temporal_layer_id: u8,
    pub total_bytes: u64,
    pub num_packets: u64,
    /// Bits per second, averaged by the engine over ~1s
    pub bitrate: u64,
    pub total_bitrate: u64,
    pub active: bool,
    pub target_bitrate: Option<u64>,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub target_fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Last counter readout of a media or retransmission source
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    /// When the engine last refreshed these counters
    pub updated_at: Instant,
    pub bytes: u64,
    pub packets: u64,
    pub lost_packets: u64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Bits per second, averaged by the engine over ~1s
    pub bitrate: u64,
    pub codec: Option<String>,
    pub layers: Vec<RawLayer>,
    /// The engine already rolled `layers` up cumulatively
    pub layers_aggregated: bool,
}

impl SourceSnapshot {
    #[must_use]
    pub fn empty(updated_at: Instant) -> Self {
        Self {
            updated_at,
            bytes: 0,
            packets: 0,
            lost_packets: 0,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            bitrate: 0,
            codec: None,
            layers: Vec::new(),
            layers_aggregated: false,
        }
    }
}

/// Counter block of one encoding (media or retransmission stream)
#[async_trait]
pub trait MediaSource: NativeResource {
    /// Last snapshot without touching the engine
    fn snapshot(&self) -> SourceSnapshot;

    /// When the engine last refreshed the counters, without reading them
    fn last_updated(&self) -> Instant;

    /// Force a fresh snapshot synchronously
    fn update(&self);

    /// Request an out-of-band refresh and wait for the engine to complete it
    async fn refresh(&self) -> Result<()>;
}

/// Forwarding resource that copies one source into an output
pub trait ForwardingSink: NativeResource {
    /// Point the sink at a new source. `smooth` defers the switch to the next clean frame boundary.
    fn set_input(&self, source: Option<Arc<dyn MediaSource>>, smooth: bool);

    fn select_layer(&self, spatial_layer_id: u8, temporal_layer_id: u8);

    fn set_muted(&self, muted: bool);

    fn close(&self);
}
