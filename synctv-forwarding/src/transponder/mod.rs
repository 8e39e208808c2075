//! Transponder: decides which encoding and layer of a track feeds one output
//!
//! A transponder is `unattached` until a track is set, `attached` while it forwards
//! one encoding/layer of that track, and `stopped` once [`Transponder::stop`] ran.
//! Stopping is terminal and releases the forwarding sink.
//!
//! Selection calls on one transponder are expected to come from a single control-plane
//! owner; the internal lock only keeps track notifications consistent with them.

mod selection;

pub use selection::{BitrateSelection, TargetBitrateOptions, Traversal};

use crate::config::ForwardingConfig;
use crate::engine::{ForwardingSink, MediaSource};
use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyRegistry};
use crate::stats::{ActiveLayersInfo, LayerStats};
use crate::track::{SubscriptionId, Track, TrackEvent};
use crate::types::{EncodingId, HandleId};
use parking_lot::Mutex;
use selection::{order_candidates, pick, Constraints, Pick};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the notification channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Notification published by a transponder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransponderEvent {
    Muted(bool),
    Stopped,
}

struct SelectionState {
    track: Option<Proxy<Track>>,
    subscription: Option<SubscriptionId>,
    encoding_id: Option<EncodingId>,
    encoding: Option<Proxy<dyn MediaSource>>,
    spatial_layer_id: u8,
    temporal_layer_id: u8,
    max_spatial_layer_id: u8,
    max_temporal_layer_id: u8,
    max_width: Option<u32>,
    max_height: Option<u32>,
    muted: bool,
    stopped: bool,
    last_selection: BitrateSelection,
}

impl SelectionState {
    const fn constraints(&self) -> Constraints {
        Constraints {
            max_spatial_layer_id: self.max_spatial_layer_id,
            max_temporal_layer_id: self.max_temporal_layer_id,
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }

    fn is_attached_to(&self, track: &Proxy<Track>) -> bool {
        self.track.as_ref().is_some_and(|current| current.ptr_eq(track))
    }
}

/// Forwarding decision engine for one output
pub struct Transponder {
    registry: ProxyRegistry,
    sink: Proxy<dyn ForwardingSink>,
    default_traversal: Traversal,
    strict_by_default: bool,
    state: Mutex<SelectionState>,
    events: broadcast::Sender<TransponderEvent>,
    weak_self: Weak<Transponder>,
}

impl Transponder {
    pub fn new(
        registry: ProxyRegistry,
        sink: Arc<dyn ForwardingSink>,
        config: &ForwardingConfig,
    ) -> Result<Arc<Self>> {
        let sink: Proxy<dyn ForwardingSink> = registry.wrap(sink)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(sink = %sink.id(), "Creating transponder");

        Ok(Arc::new_cyclic(|weak_self| Self {
            registry,
            sink,
            default_traversal: config.default_traversal,
            strict_by_default: config.strict_by_default,
            state: Mutex::new(SelectionState {
                track: None,
                subscription: None,
                encoding_id: None,
                encoding: None,
                spatial_layer_id: 0,
                temporal_layer_id: 0,
                max_spatial_layer_id: config.max_spatial_layer.unwrap_or(u8::MAX),
                max_temporal_layer_id: config.max_temporal_layer.unwrap_or(u8::MAX),
                max_width: None,
                max_height: None,
                muted: false,
                stopped: false,
                last_selection: BitrateSelection::none(),
            }),
            events,
            weak_self: weak_self.clone(),
        }))
    }

    /// Receive mute and stop notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransponderEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn sink_id(&self) -> HandleId {
        self.sink.id()
    }

    /// Attach to a track, re-select within the current one, or detach with `None`
    pub fn set_incoming_track(&self, track: Option<Arc<Track>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }

        let Some(track) = track else {
            self.detach_locked(&mut state)?;
            return Ok(());
        };

        let track: Proxy<Track> = self.registry.wrap(track)?;
        if !state.is_attached_to(&track) {
            self.detach_locked(&mut state)?;

            let weak = self.weak_self.clone();
            let track_handle = track.id();
            let subscription = track.with(|t| {
                t.subscribe(move |event| {
                    if let Some(transponder) = weak.upgrade() {
                        transponder.on_track_event(track_handle, event);
                    }
                })
            })?;
            state.subscription = Some(subscription);
            state.track = Some(track.clone());
            let track_id = track.handle().id().clone();
            info!(track_id = %track_id, sink = %self.sink.id(), "Transponder attached");
        }

        // Keep the current encoding if the track has it, otherwise start on the first one
        let encoding_ids = track.with(|t| t.encoding_ids())?;
        let next = state
            .encoding_id
            .clone()
            .filter(|id| encoding_ids.contains(id))
            .or_else(|| encoding_ids.first().cloned());
        match next {
            Some(encoding_id) => self.select_encoding_locked(&mut state, &encoding_id, false),
            None => self.clear_input_locked(&mut state),
        }
    }

    /// Track currently attached, if any
    #[must_use]
    pub fn track(&self) -> Option<Arc<Track>> {
        self.state.lock().track.as_ref().map(Proxy::handle)
    }

    fn on_track_event(&self, track_handle: HandleId, event: &TrackEvent) {
        let mut state = self.state.lock();
        if state.stopped || state.track.as_ref().map(Proxy::id) != Some(track_handle) {
            return;
        }

        match event {
            TrackEvent::EncodingAdded(encoding_id) => {
                let tracking = state.encoding_id.as_ref().map_or(true, |id| id == encoding_id);
                if tracking {
                    if let Err(e) = self.select_encoding_locked(&mut state, encoding_id, false) {
                        debug!(encoding_id = %encoding_id, error = %e, "Re-selection on new encoding failed");
                    }
                }
            }
            TrackEvent::Stopped => {
                debug!(sink = %self.sink.id(), "Attached track stopped, detaching");
                if let Err(e) = self.detach_locked(&mut state) {
                    debug!(error = %e, "Detach after track stop failed");
                }
            }
        }
    }

    fn detach_locked(&self, state: &mut SelectionState) -> Result<()> {
        if let Some(track) = state.track.take() {
            if let Some(subscription) = state.subscription.take() {
                // Raw handle: the track may already be released when it notifies us
                track.handle().unsubscribe(subscription);
            }
            let track_id = track.handle().id().clone();
            info!(track_id = %track_id, sink = %self.sink.id(), "Transponder detached");
        }
        self.clear_input_locked(state)
    }

    fn clear_input_locked(&self, state: &mut SelectionState) -> Result<()> {
        if state.encoding.take().is_some() {
            self.sink.with(|sink| sink.set_input(None, false))?;
        }
        state.encoding_id = None;
        Ok(())
    }

    /// Switch to an encoding of the attached track and a layer within it
    pub fn select(
        &self,
        encoding_id: &EncodingId,
        spatial_layer_id: u8,
        temporal_layer_id: u8,
        smooth: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        self.select_encoding_locked(&mut state, encoding_id, smooth)?;
        self.select_layer_locked(&mut state, spatial_layer_id, temporal_layer_id)
    }

    /// Forward another encoding of the attached track
    pub fn select_encoding(&self, encoding_id: &EncodingId, smooth: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        self.select_encoding_locked(&mut state, encoding_id, smooth)
    }

    fn select_encoding_locked(
        &self,
        state: &mut SelectionState,
        encoding_id: &EncodingId,
        smooth: bool,
    ) -> Result<()> {
        let track = state.track.as_ref().ok_or(Error::NoTrack)?;
        let encoding = track
            .with(|t| t.encoding(encoding_id))?
            .ok_or_else(|| Error::UnknownEncoding(encoding_id.clone()))?;

        let unchanged = state.encoding_id.as_ref() == Some(encoding_id)
            && state
                .encoding
                .as_ref()
                .is_some_and(|current| current.ptr_eq(encoding.media()));
        if unchanged {
            return Ok(());
        }

        let media = encoding.media().clone();
        let source = self.registry.unwrap(&media);
        self.sink.with(|sink| sink.set_input(Some(source), smooth))?;

        debug!(
            sink = %self.sink.id(),
            old_encoding = ?state.encoding_id,
            new_encoding = %encoding_id,
            smooth,
            "Switching encoding"
        );
        state.encoding_id = Some(encoding_id.clone());
        state.encoding = Some(media);
        Ok(())
    }

    /// Forward up to the given layer, clamped to the configured maxima
    pub fn select_layer(&self, spatial_layer_id: u8, temporal_layer_id: u8) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        self.select_layer_locked(&mut state, spatial_layer_id, temporal_layer_id)
    }

    fn select_layer_locked(
        &self,
        state: &mut SelectionState,
        spatial_layer_id: u8,
        temporal_layer_id: u8,
    ) -> Result<()> {
        let spatial = spatial_layer_id.min(state.max_spatial_layer_id);
        let temporal = temporal_layer_id.min(state.max_temporal_layer_id);
        if spatial == state.spatial_layer_id && temporal == state.temporal_layer_id {
            return Ok(());
        }

        self.sink.with(|sink| sink.select_layer(spatial, temporal))?;
        debug!(sink = %self.sink.id(), spatial, temporal, "Switching layer");
        state.spatial_layer_id = spatial;
        state.temporal_layer_id = temporal;
        Ok(())
    }

    /// Cap the forwarded layers. Negative values are rejected; the base layer is always allowed.
    pub fn set_maximum_layers(&self, spatial: i32, temporal: i32) -> Result<()> {
        if spatial < 0 || temporal < 0 {
            return Err(Error::InvalidMaximum { spatial, temporal });
        }

        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }

        state.max_spatial_layer_id = u8::try_from(spatial).unwrap_or(u8::MAX);
        state.max_temporal_layer_id = u8::try_from(temporal).unwrap_or(u8::MAX);
        let (current_spatial, current_temporal) = (state.spatial_layer_id, state.temporal_layer_id);
        self.select_layer_locked(&mut state, current_spatial, current_temporal)
    }

    /// Cap the resolution considered by bitrate-driven selection
    pub fn set_maximum_dimensions(&self, width: Option<u32>, height: Option<u32>) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        state.max_width = width;
        state.max_height = height;
        Ok(())
    }

    /// Suppress or resume output without touching the selected encoding and layer
    pub fn mute(&self, muted: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        self.set_muted_locked(&mut state, muted)
    }

    fn set_muted_locked(&self, state: &mut SelectionState, muted: bool) -> Result<()> {
        if state.muted == muted {
            return Ok(());
        }
        self.sink.with(|sink| sink.set_muted(muted))?;
        state.muted = muted;
        debug!(sink = %self.sink.id(), muted, "Mute state changed");
        // No receivers is fine
        let _ = self.events.send(TransponderEvent::Muted(muted));
        Ok(())
    }

    /// Pick the best layer whose bitrate fits `target` and forward it
    ///
    /// Returns [`BitrateSelection::none`] when no track is attached.
    pub fn set_target_bitrate(
        &self,
        target: u64,
        options: &TargetBitrateOptions,
    ) -> Result<BitrateSelection> {
        let track = {
            let state = self.state.lock();
            if state.stopped {
                return Err(Error::Stopped);
            }
            state.track.clone()
        };
        let Some(track) = track else {
            return Ok(BitrateSelection::none());
        };
        let Ok(info) = track.with(|t| t.get_active_layers()) else {
            return Ok(BitrateSelection::none());
        };

        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        if !state.is_attached_to(&track) {
            return Ok(state.last_selection.clone());
        }
        self.apply_target_bitrate_locked(&mut state, target, options, &info)
    }

    /// Like [`Transponder::set_target_bitrate`], deciding on freshly refreshed statistics
    ///
    /// If the transponder stops or leaves the track while the refresh is pending, the
    /// refreshed statistics are ignored and the previous selection is returned.
    pub async fn set_target_bitrate_async(
        &self,
        target: u64,
        options: &TargetBitrateOptions,
    ) -> Result<BitrateSelection> {
        let track = {
            let state = self.state.lock();
            if state.stopped {
                return Err(Error::Stopped);
            }
            state.track.clone()
        };
        let Some(track) = track else {
            return Ok(BitrateSelection::none());
        };
        let Ok(handle) = track.live_handle() else {
            return Ok(self.last_selection());
        };

        let info = handle.get_active_layers_async().await;

        let mut state = self.state.lock();
        if state.stopped || !state.is_attached_to(&track) || track.is_released() {
            debug!(sink = %self.sink.id(), "Selection target went away during refresh");
            return Ok(state.last_selection.clone());
        }
        self.apply_target_bitrate_locked(&mut state, target, options, &info)
    }

    fn apply_target_bitrate_locked(
        &self,
        state: &mut SelectionState,
        target: u64,
        options: &TargetBitrateOptions,
        info: &ActiveLayersInfo,
    ) -> Result<BitrateSelection> {
        let constraints = state.constraints();
        let traversal = options.traversal.unwrap_or(self.default_traversal);
        let strict = options.strict.unwrap_or(self.strict_by_default);
        let ordered = order_candidates(
            &info.layers,
            &constraints,
            traversal,
            options.codecs.as_deref(),
            options.prefer_codecs.as_deref(),
        );

        let chosen = match pick(&ordered, target, &constraints) {
            Some(Pick::Fit(index)) => Some(index),
            Some(Pick::Cheapest(index)) if !strict => Some(index),
            _ => None,
        };
        let Some((index, layer)) = chosen.and_then(|i| ordered.get(i).cloned().map(|l| (i, l)))
        else {
            if strict {
                self.set_muted_locked(state, true)?;
            }
            debug!(sink = %self.sink.id(), target, strict, candidates = ordered.len(), "No layer fits target bitrate");
            let selection = BitrateSelection {
                layers: ordered,
                ..BitrateSelection::none()
            };
            state.last_selection = selection.clone();
            return Ok(selection);
        };

        // Stepping up waits for a clean frame boundary unless told otherwise
        let previous_rank = state
            .encoding_id
            .as_ref()
            .map_or(-1, |id| info.simulcast_idx(id));
        let smooth = options
            .smooth
            .unwrap_or(layer.simulcast_idx >= previous_rank);

        self.select_encoding_locked(state, &layer.encoding_id, smooth)?;
        self.select_layer_locked(state, layer.spatial_layer_id, layer.temporal_layer_id)?;
        // Unmute only once the new layer is in place
        self.set_muted_locked(state, false)?;

        debug!(
            sink = %self.sink.id(),
            target,
            encoding_id = %layer.encoding_id,
            spatial = layer.spatial_layer_id,
            temporal = layer.temporal_layer_id,
            bitrate = layer.effective_bitrate(),
            "Selected layer for target bitrate"
        );

        let selection = BitrateSelection {
            bitrate: layer.effective_bitrate(),
            layer: Some(layer),
            rank: Some(index),
            layers: ordered,
        };
        state.last_selection = selection.clone();
        Ok(selection)
    }

    /// Layers of the attached track within the configured maxima, highest bitrate first
    pub fn get_available_layers(&self) -> Result<Vec<LayerStats>> {
        let (track, constraints) = self.track_and_constraints()?;
        let Some(track) = track else {
            return Ok(Vec::new());
        };
        let info = track.with(|t| t.get_active_layers()).unwrap_or_default();
        Ok(available_layers(&info, &constraints))
    }

    pub async fn get_available_layers_async(&self) -> Result<Vec<LayerStats>> {
        let (track, constraints) = self.track_and_constraints()?;
        let Some(handle) = track.and_then(|t| t.live_handle().ok()) else {
            return Ok(Vec::new());
        };
        let info = handle.get_active_layers_async().await;
        Ok(available_layers(&info, &constraints))
    }

    fn track_and_constraints(&self) -> Result<(Option<Proxy<Track>>, Constraints)> {
        let state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        Ok((state.track.clone(), state.constraints()))
    }

    /// Stop forwarding for good. A second call does nothing.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;

        if let Some(track) = state.track.take() {
            if let Some(subscription) = state.subscription.take() {
                track.handle().unsubscribe(subscription);
            }
        }
        state.encoding = None;
        state.encoding_id = None;
        drop(state);

        // The sink may already be gone if the engine tore it down first
        let _ = self.sink.with(|sink| sink.close());
        self.registry.release(&self.sink);

        info!(sink = %self.sink.id(), "Transponder stopped");
        let _ = self.events.send(TransponderEvent::Stopped);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    #[must_use]
    pub fn encoding_id(&self) -> Option<EncodingId> {
        self.state.lock().encoding_id.clone()
    }

    #[must_use]
    pub fn spatial_layer_id(&self) -> u8 {
        self.state.lock().spatial_layer_id
    }

    #[must_use]
    pub fn temporal_layer_id(&self) -> u8 {
        self.state.lock().temporal_layer_id
    }

    #[must_use]
    pub fn maximum_layers(&self) -> (u8, u8) {
        let state = self.state.lock();
        (state.max_spatial_layer_id, state.max_temporal_layer_id)
    }

    #[must_use]
    pub fn maximum_dimensions(&self) -> (Option<u32>, Option<u32>) {
        let state = self.state.lock();
        (state.max_width, state.max_height)
    }

    /// Result of the most recent bitrate-driven selection
    #[must_use]
    pub fn last_selection(&self) -> BitrateSelection {
        self.state.lock().last_selection.clone()
    }
}

fn available_layers(info: &ActiveLayersInfo, constraints: &Constraints) -> Vec<LayerStats> {
    info.layers
        .iter()
        .filter(|layer| constraints.admits(layer))
        .cloned()
        .collect()
}
