//! Candidate ordering and bitrate fitting

use crate::stats::{compare_by_bitrate_desc, LayerStats};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Order in which the layer ladder is walked when fitting a target bitrate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Traversal {
    /// Highest bitrate first. Falls back to spatial-then-temporal when dimensions are capped.
    #[default]
    Bitrate,
    /// Highest spatial rank first, then highest temporal layer
    SpatialTemporal,
    /// Highest temporal layer first, then highest spatial rank
    TemporalSpatial,
    /// Step down spatial and temporal alternately, spatial first
    ZigZagSpatialTemporal,
    /// Step down spatial and temporal alternately, temporal first
    ZigZagTemporalSpatial,
}

/// Options of a target-bitrate selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetBitrateOptions {
    pub traversal: Option<Traversal>,
    /// Mute instead of sending the cheapest layer when nothing fits
    pub strict: Option<bool>,
    /// Force (or forbid) a smooth encoding switch; derived from the direction when unset
    pub smooth: Option<bool>,
    /// Only consider layers of these codecs
    pub codecs: Option<Vec<String>>,
    /// Prefer codecs in this order over anything else
    pub prefer_codecs: Option<Vec<String>>,
}

impl TargetBitrateOptions {
    #[must_use]
    pub const fn with_traversal(mut self, traversal: Traversal) -> Self {
        self.traversal = Some(traversal);
        self
    }

    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    #[must_use]
    pub const fn smooth(mut self, smooth: bool) -> Self {
        self.smooth = Some(smooth);
        self
    }

    #[must_use]
    pub fn codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.codecs = Some(codecs.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn prefer_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefer_codecs = Some(codecs.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of a target-bitrate selection
///
/// Carries the chosen layer, its position in the walked ladder and the whole ladder,
/// so callers get the decision context along with the number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitrateSelection {
    pub bitrate: u64,
    pub layer: Option<LayerStats>,
    pub rank: Option<usize>,
    pub layers: Vec<LayerStats>,
}

impl BitrateSelection {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.layer.is_none()
    }
}

impl From<BitrateSelection> for u64 {
    fn from(selection: BitrateSelection) -> Self {
        selection.bitrate
    }
}

/// Layer caps in effect for one selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Constraints {
    pub max_spatial_layer_id: u8,
    pub max_temporal_layer_id: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl Constraints {
    pub(crate) const fn has_dimensions(&self) -> bool {
        self.max_width.is_some() || self.max_height.is_some()
    }

    pub(crate) const fn admits(&self, layer: &LayerStats) -> bool {
        layer.spatial_layer_id <= self.max_spatial_layer_id
            && layer.temporal_layer_id <= self.max_temporal_layer_id
    }
}

/// Compare codec names, ignoring case and any `video/` style prefix
fn codec_matches(codec: &str, wanted: &str) -> bool {
    let strip = |name: &str| -> String {
        name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase()
    };
    strip(codec) == strip(wanted)
}

fn codec_position(layer: &LayerStats, codecs: &[String]) -> usize {
    layer
        .codec
        .as_deref()
        .and_then(|codec| codecs.iter().position(|wanted| codec_matches(codec, wanted)))
        .unwrap_or(codecs.len())
}

/// Spatial rank across encodings: simulcast index first, then the SVC spatial id
fn spatial_key(layer: &LayerStats) -> (i32, u8) {
    (layer.simulcast_idx, layer.spatial_layer_id)
}

/// Filter the ladder by caps and codecs, then order it for the walk
pub(crate) fn order_candidates(
    layers: &[LayerStats],
    constraints: &Constraints,
    traversal: Traversal,
    codecs: Option<&[String]>,
    prefer_codecs: Option<&[String]>,
) -> Vec<LayerStats> {
    let mut candidates: Vec<LayerStats> = layers
        .iter()
        .filter(|layer| constraints.admits(layer))
        .filter(|layer| {
            codecs.map_or(true, |codecs| {
                layer
                    .codec
                    .as_deref()
                    .is_some_and(|codec| codecs.iter().any(|wanted| codec_matches(codec, wanted)))
            })
        })
        .cloned()
        .collect();

    // Dense spatial ranks so zig-zag can step both axes one tier at a time
    let mut tiers: Vec<(i32, u8)> = candidates.iter().map(spatial_key).collect();
    tiers.sort_unstable();
    tiers.dedup();
    let spatial_rank = |layer: &LayerStats| -> usize {
        tiers
            .binary_search(&spatial_key(layer))
            .unwrap_or_default()
    };

    let by_spatial_temporal = |a: &LayerStats, b: &LayerStats| -> Ordering {
        spatial_rank(b)
            .cmp(&spatial_rank(a))
            .then_with(|| b.temporal_layer_id.cmp(&a.temporal_layer_id))
            .then_with(|| compare_by_bitrate_desc(a, b))
    };

    match traversal {
        Traversal::Bitrate if constraints.has_dimensions() => candidates.sort_by(by_spatial_temporal),
        Traversal::Bitrate => candidates.sort_by(compare_by_bitrate_desc),
        Traversal::SpatialTemporal => candidates.sort_by(by_spatial_temporal),
        Traversal::TemporalSpatial => candidates.sort_by(|a, b| {
            b.temporal_layer_id
                .cmp(&a.temporal_layer_id)
                .then_with(|| spatial_rank(b).cmp(&spatial_rank(a)))
                .then_with(|| compare_by_bitrate_desc(a, b))
        }),
        Traversal::ZigZagSpatialTemporal => candidates.sort_by(|a, b| {
            let diagonal_a = spatial_rank(a) + usize::from(a.temporal_layer_id);
            let diagonal_b = spatial_rank(b) + usize::from(b.temporal_layer_id);
            diagonal_b
                .cmp(&diagonal_a)
                .then_with(|| spatial_rank(b).cmp(&spatial_rank(a)))
                .then_with(|| compare_by_bitrate_desc(a, b))
        }),
        Traversal::ZigZagTemporalSpatial => candidates.sort_by(|a, b| {
            let diagonal_a = spatial_rank(a) + usize::from(a.temporal_layer_id);
            let diagonal_b = spatial_rank(b) + usize::from(b.temporal_layer_id);
            diagonal_b
                .cmp(&diagonal_a)
                .then_with(|| b.temporal_layer_id.cmp(&a.temporal_layer_id))
                .then_with(|| compare_by_bitrate_desc(a, b))
        }),
    }

    if let Some(prefer) = prefer_codecs {
        // Stable: the traversal order survives within each codec
        candidates.sort_by_key(|layer| codec_position(layer, prefer));
    }

    candidates
}

/// Result of walking an ordered ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pick {
    /// First layer in order that fits the target and the dimension caps
    Fit(usize),
    /// Nothing fits; the cheapest layer
    Cheapest(usize),
}

/// Walk the ordered ladder once
///
/// The order already encodes the preference, so the first fit wins. The cheapest layer
/// is tracked along the way as the fallback.
pub(crate) fn pick(ordered: &[LayerStats], target: u64, constraints: &Constraints) -> Option<Pick> {
    let mut cheapest: Option<(usize, u64)> = None;

    for (index, layer) in ordered.iter().enumerate() {
        let bitrate = layer.effective_bitrate();
        if bitrate <= target && layer.fits_dimensions(constraints.max_width, constraints.max_height) {
            return Some(Pick::Fit(index));
        }
        if cheapest.map_or(true, |(_, lowest)| bitrate < lowest) {
            cheapest = Some((index, bitrate));
        }
    }

    cheapest.map(|(index, _)| Pick::Cheapest(index))
}
