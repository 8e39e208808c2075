//! Forwarding Manager - owns tracks and transponders for one engine instance
//!
//! This module provides:
//! - Track and output registration with concurrent access
//! - Routing bandwidth estimates to the right transponder
//! - Periodic sweeping of stopped tracks and transponders
//! - Global statistics

use crate::config::ForwardingConfig;
use crate::engine::{ForwardingSink, MediaSource};
use crate::error::{Error, Result};
use crate::proxy::ProxyRegistry;
use crate::track::Track;
use crate::transponder::{BitrateSelection, TargetBitrateOptions, Transponder};
use crate::types::{EncodingId, OutputId, TrackId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Global forwarding statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub tracks: usize,
    pub encodings: usize,
    pub transponders: usize,
    /// Transponders currently forwarding from a track
    pub attached_transponders: usize,
    pub muted_transponders: usize,
    /// Entries in the proxy registry
    pub live_proxies: usize,
}

/// Top-level owner of tracks and transponders
pub struct ForwardingManager {
    config: Arc<ForwardingConfig>,
    registry: ProxyRegistry,
    tracks: DashMap<TrackId, Arc<Track>>,
    transponders: DashMap<OutputId, Arc<Transponder>>,
}

impl ForwardingManager {
    pub fn new(config: ForwardingConfig) -> Arc<Self> {
        info!(
            stats_cache_window_ms = config.stats_cache_window_ms,
            default_traversal = ?config.default_traversal,
            strict_by_default = config.strict_by_default,
            "Forwarding manager initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            registry: ProxyRegistry::new(),
            tracks: DashMap::new(),
            transponders: DashMap::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// Get or create a track
    pub fn create_track(&self, track_id: TrackId) -> Arc<Track> {
        let entry = self
            .tracks
            .entry(track_id.clone())
            .or_insert_with(|| Track::new(track_id, self.registry.clone(), &self.config));
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn track(&self, track_id: &TrackId) -> Option<Arc<Track>> {
        self.tracks.get(track_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Register an encoding on a known track
    pub fn add_encoding(
        &self,
        track_id: &TrackId,
        encoding_id: EncodingId,
        media: Arc<dyn MediaSource>,
        rtx: Option<Arc<dyn MediaSource>>,
    ) -> Result<()> {
        let track = self
            .track(track_id)
            .ok_or_else(|| Error::UnknownTrack(track_id.clone()))?;
        track.add_encoding(encoding_id, media, rtx)
    }

    /// Stop and forget a track. Attached transponders detach on their own.
    pub fn remove_track(&self, track_id: &TrackId) -> bool {
        let Some((_, track)) = self.tracks.remove(track_id) else {
            return false;
        };
        track.stop();
        info!(track_id = %track_id, remaining_tracks = self.tracks.len(), "Removed track");
        true
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Create a transponder driving `sink` under a fresh output ID
    pub fn create_transponder(
        &self,
        sink: Arc<dyn ForwardingSink>,
    ) -> Result<(OutputId, Arc<Transponder>)> {
        let output_id = OutputId::generate();
        let transponder = Transponder::new(self.registry.clone(), sink, &self.config)?;
        self.transponders
            .insert(output_id.clone(), Arc::clone(&transponder));

        info!(
            output_id = %output_id,
            total_transponders = self.transponders.len(),
            "Created transponder"
        );
        Ok((output_id, transponder))
    }

    #[must_use]
    pub fn transponder(&self, output_id: &OutputId) -> Option<Arc<Transponder>> {
        self.transponders
            .get(output_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn require_transponder(&self, output_id: &OutputId) -> Result<Arc<Transponder>> {
        self.transponder(output_id)
            .ok_or_else(|| Error::UnknownOutput(output_id.clone()))
    }

    /// Point an output at a track
    pub fn attach(&self, output_id: &OutputId, track_id: &TrackId) -> Result<()> {
        let transponder = self.require_transponder(output_id)?;
        let track = self
            .track(track_id)
            .ok_or_else(|| Error::UnknownTrack(track_id.clone()))?;
        transponder.set_incoming_track(Some(track))?;
        debug!(output_id = %output_id, track_id = %track_id, "Attached output");
        Ok(())
    }

    pub fn detach(&self, output_id: &OutputId) -> Result<()> {
        self.require_transponder(output_id)?.set_incoming_track(None)
    }

    /// Stop and forget a transponder
    pub fn remove_transponder(&self, output_id: &OutputId) -> bool {
        let Some((_, transponder)) = self.transponders.remove(output_id) else {
            return false;
        };
        transponder.stop();
        info!(
            output_id = %output_id,
            remaining_transponders = self.transponders.len(),
            "Removed transponder"
        );
        true
    }

    /// Feed a bandwidth estimate for one output into its transponder
    ///
    /// Rejected preconditions (unknown output, stopped transponder, ...) only skip this
    /// cycle and yield `Ok(None)`; the estimator keeps running.
    pub async fn apply_bandwidth_estimate(
        &self,
        output_id: &OutputId,
        bitrate: u64,
        options: &TargetBitrateOptions,
    ) -> Result<Option<BitrateSelection>> {
        let result = match self.require_transponder(output_id) {
            Ok(transponder) => transponder.set_target_bitrate_async(bitrate, options).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(selection) => {
                debug!(
                    output_id = %output_id,
                    estimate = bitrate,
                    selected = selection.bitrate,
                    "Applied bandwidth estimate"
                );
                Ok(Some(selection))
            }
            Err(e) if e.is_precondition() => {
                warn!(output_id = %output_id, error = %e, "Skipping bandwidth estimate");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop stopped tracks and transponders, returning how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.tracks.len() + self.transponders.len();
        self.transponders.retain(|_, transponder| !transponder.is_stopped());
        self.tracks.retain(|_, track| !track.is_stopped());
        let removed = before.saturating_sub(self.tracks.len() + self.transponders.len());

        if removed > 0 {
            info!(
                removed,
                remaining_tracks = self.tracks.len(),
                remaining_transponders = self.transponders.len(),
                "Swept stopped resources"
            );
        }
        removed
    }

    /// Run [`ForwardingManager::sweep`] periodically until `shutdown` fires
    ///
    /// The task only holds a weak reference and ends on its own once the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            info!(interval_secs = period.as_secs(), "Starting sweeper task");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("Sweeper task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            debug!("Manager dropped, sweeper exiting");
                            break;
                        };
                        manager.sweep();
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            tracks: self.tracks.len(),
            transponders: self.transponders.len(),
            live_proxies: self.registry.len(),
            ..Default::default()
        };

        for entry in self.tracks.iter() {
            stats.encodings += entry.value().encodings().len();
        }
        for entry in self.transponders.iter() {
            let transponder = entry.value();
            if transponder.track().is_some() {
                stats.attached_transponders += 1;
            }
            if transponder.is_muted() {
                stats.muted_transponders += 1;
            }
        }

        stats
    }

    /// Stop every transponder and track
    pub fn shutdown(&self) {
        let outputs: Vec<OutputId> = self
            .transponders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for output_id in &outputs {
            self.remove_transponder(output_id);
        }

        let tracks = self.track_ids();
        for track_id in &tracks {
            self.remove_track(track_id);
        }

        info!(
            transponders = outputs.len(),
            tracks = tracks.len(),
            "Forwarding manager shut down"
        );
    }
}
