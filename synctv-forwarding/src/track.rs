//! Tracks and their encodings
//!
//! A [`Track`] groups the encodings (simulcast streams or SVC streams) the engine
//! receives for one piece of media. It owns the proxies of their counter sources,
//! caches aggregated statistics, and notifies subscribers when encodings appear or
//! the track stops.

use crate::config::ForwardingConfig;
use crate::engine::{MediaSource, NativeResource, SourceSnapshot};
use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyRegistry};
use crate::stats::{
    compute_encoding_stats, derive_active_layers, update_simulcast_index_and_codec,
    ActiveLayersInfo, EncodingStats,
};
use crate::types::{EncodingId, HandleId, TrackId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Notification delivered to track subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    /// A new encoding started (or an existing ID got a new source)
    EncodingAdded(EncodingId),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&TrackEvent) + Send + Sync>;

/// One encoding of a track with its counter sources
pub struct Encoding {
    id: EncodingId,
    media: Proxy<dyn MediaSource>,
    rtx: Option<Proxy<dyn MediaSource>>,
}

impl Encoding {
    #[must_use]
    pub const fn id(&self) -> &EncodingId {
        &self.id
    }

    #[must_use]
    pub const fn media(&self) -> &Proxy<dyn MediaSource> {
        &self.media
    }

    #[must_use]
    pub const fn rtx(&self) -> Option<&Proxy<dyn MediaSource>> {
        self.rtx.as_ref()
    }

    fn sources(&self) -> impl Iterator<Item = &Proxy<dyn MediaSource>> {
        std::iter::once(&self.media).chain(self.rtx.iter())
    }
}

struct CachedStats {
    computed_at: Instant,
    stats: EncodingStats,
}

/// A received track made of one or more encodings
pub struct Track {
    id: TrackId,
    handle_id: HandleId,
    registry: ProxyRegistry,
    cache_window: Duration,
    encodings: RwLock<Vec<Arc<Encoding>>>,
    stats_cache: Mutex<HashMap<EncodingId, CachedStats>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    stopped: AtomicBool,
}

impl Track {
    pub fn new(id: TrackId, registry: ProxyRegistry, config: &ForwardingConfig) -> Arc<Self> {
        info!(track_id = %id, "Creating track");
        Arc::new(Self {
            id,
            handle_id: HandleId::next(),
            registry,
            cache_window: config.stats_cache_window(),
            encodings: RwLock::new(Vec::new()),
            stats_cache: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    /// Register an encoding and notify subscribers
    ///
    /// Re-adding a known ID swaps in the new sources, which is how the engine reports
    /// a simulcast stream that restarted.
    pub fn add_encoding(
        &self,
        encoding_id: EncodingId,
        media: Arc<dyn MediaSource>,
        rtx: Option<Arc<dyn MediaSource>>,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        let media = self.registry.wrap(media)?;
        let rtx = rtx.map(|rtx| self.registry.wrap(rtx)).transpose()?;
        let encoding = Arc::new(Encoding {
            id: encoding_id.clone(),
            media,
            rtx,
        });

        let replaced = {
            let mut encodings = self.encodings.write();
            // `stop` flips the flag under this lock, so the check cannot go stale
            if self.is_stopped() {
                drop(encodings);
                for source in encoding.sources() {
                    self.registry.release(source);
                }
                return Err(Error::Stopped);
            }
            if let Some(slot) = encodings.iter_mut().find(|e| e.id == encoding_id) {
                Some(std::mem::replace(slot, encoding))
            } else {
                encodings.push(encoding);
                None
            }
        };
        if let Some(old) = replaced {
            let current = self.encoding(&encoding_id);
            for source in old.sources() {
                let still_used = current
                    .as_ref()
                    .is_some_and(|c| c.sources().any(|s| s.ptr_eq(source)));
                if !still_used {
                    self.registry.release(source);
                }
            }
        }
        self.stats_cache.lock().remove(&encoding_id);

        debug!(track_id = %self.id, encoding_id = %encoding_id, "Encoding added");
        self.emit(&TrackEvent::EncodingAdded(encoding_id));
        Ok(())
    }

    #[must_use]
    pub fn encoding(&self, encoding_id: &EncodingId) -> Option<Arc<Encoding>> {
        self.encodings
            .read()
            .iter()
            .find(|e| &e.id == encoding_id)
            .cloned()
    }

    #[must_use]
    pub fn encodings(&self) -> Vec<Arc<Encoding>> {
        self.encodings.read().clone()
    }

    #[must_use]
    pub fn encoding_ids(&self) -> Vec<EncodingId> {
        self.encodings.read().iter().map(|e| e.id.clone()).collect()
    }

    /// Ranked statistics of every encoding, served from cache while fresh
    #[must_use]
    pub fn get_stats(&self) -> Vec<EncodingStats> {
        let now = Instant::now();
        let mut stats: Vec<EncodingStats> = self
            .encodings()
            .iter()
            .map(|encoding| self.cached_or_compute(encoding, now))
            .collect();
        update_simulcast_index_and_codec(&mut stats);
        stats
    }

    /// Refresh every source out of band, then compute ranked statistics
    ///
    /// If the track stops while refreshes are pending, the results are discarded and
    /// the last cached statistics are returned instead.
    pub async fn get_stats_async(&self) -> Vec<EncodingStats> {
        let encodings = self.encodings();
        let refreshes = encodings
            .iter()
            .flat_map(|encoding| encoding.sources())
            .map(|source| async move {
                let handle = source.live_handle()?;
                handle.refresh().await
            });

        for result in futures::future::join_all(refreshes).await {
            if let Err(e) = result {
                warn!(track_id = %self.id, error = %e, "Source refresh failed");
            }
        }

        if self.is_stopped() {
            debug!(track_id = %self.id, "Track stopped during refresh, discarding results");
            return self.cached_stats();
        }

        let now = Instant::now();
        let mut stats: Vec<EncodingStats> = encodings
            .iter()
            .map(|encoding| {
                let stats = self.compute(encoding, now);
                self.store(encoding, now, &stats);
                stats
            })
            .collect();
        update_simulcast_index_and_codec(&mut stats);
        stats
    }

    #[must_use]
    pub fn get_active_layers(&self) -> ActiveLayersInfo {
        derive_active_layers(&self.get_stats())
    }

    pub async fn get_active_layers_async(&self) -> ActiveLayersInfo {
        derive_active_layers(&self.get_stats_async().await)
    }

    fn cached_or_compute(&self, encoding: &Encoding, now: Instant) -> EncodingStats {
        if let Some(cached) = self.stats_cache.lock().get(&encoding.id) {
            let fresh = now.saturating_duration_since(cached.computed_at) <= self.cache_window;
            if fresh && !self.source_is_stale(encoding, now) {
                return cached.stats.clone();
            }
        }

        let stats = self.compute(encoding, now);
        self.store(encoding, now, &stats);
        stats
    }

    fn source_is_stale(&self, encoding: &Encoding, now: Instant) -> bool {
        encoding
            .media
            .with(|source| self.is_stale(source, now))
            .unwrap_or(false)
    }

    fn is_stale(&self, source: &dyn MediaSource, now: Instant) -> bool {
        now.saturating_duration_since(source.last_updated()) > self.cache_window
    }

    fn compute(&self, encoding: &Encoding, now: Instant) -> EncodingStats {
        let media = self.read_source(&encoding.media, now);
        let rtx = encoding.rtx.as_ref().map(|rtx| self.read_source(rtx, now));
        compute_encoding_stats(&encoding.id, &media, rtx.as_ref())
    }

    /// Last snapshot of a source, forcing an engine update first if it is too old
    fn read_source(&self, source: &Proxy<dyn MediaSource>, now: Instant) -> SourceSnapshot {
        source
            .with(|source| {
                if self.is_stale(source, now) {
                    source.update();
                }
                source.snapshot()
            })
            .unwrap_or_else(|_| SourceSnapshot::empty(now))
    }

    fn store(&self, encoding: &Encoding, now: Instant, stats: &EncodingStats) {
        // Checked under the cache lock: `stop` sets the flag before clearing the cache
        let mut cache = self.stats_cache.lock();
        if self.is_stopped() {
            return;
        }
        cache.insert(
            encoding.id.clone(),
            CachedStats {
                computed_at: now,
                stats: stats.clone(),
            },
        );
    }

    fn cached_stats(&self) -> Vec<EncodingStats> {
        let cache = self.stats_cache.lock();
        let mut stats: Vec<EncodingStats> = self
            .encodings
            .read()
            .iter()
            .filter_map(|encoding| cache.get(&encoding.id).map(|c| c.stats.clone()))
            .collect();
        drop(cache);
        update_simulcast_index_and_codec(&mut stats);
        stats
    }

    /// Subscribe to track events. Delivery is synchronous, in subscription order.
    pub fn subscribe(&self, listener: impl Fn(&TrackEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a subscription. Unknown or already removed IDs are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn emit(&self, event: &TrackEvent) {
        // Listeners may call back into the track, so deliver without holding the lock
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track, release its sources and notify subscribers once
    pub fn stop(&self) {
        let encodings = {
            let mut encodings = self.encodings.write();
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *encodings)
        };
        for encoding in &encodings {
            for source in encoding.sources() {
                self.registry.release(source);
            }
        }
        self.stats_cache.lock().clear();
        self.registry.evict(self.handle_id);

        info!(track_id = %self.id, encodings = encodings.len(), "Track stopped");
        self.emit(&TrackEvent::Stopped);
        self.listeners.lock().clear();
    }
}

impl NativeResource for Track {
    fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    fn release(&self) {
        self.stop();
    }

    fn is_released(&self) -> bool {
        self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{simulcast_track, FakeSource};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    /// Source that stops its track the first time its liveness is checked, as an
    /// engine thread tearing the track down mid-registration would
    struct StoppingSource {
        inner: Arc<FakeSource>,
        track: Weak<Track>,
        armed: AtomicBool,
    }

    impl NativeResource for StoppingSource {
        fn handle_id(&self) -> HandleId {
            self.inner.handle_id()
        }

        fn release(&self) {
            self.inner.release();
        }

        fn is_released(&self) -> bool {
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(track) = self.track.upgrade() {
                    track.stop();
                }
            }
            self.inner.is_released()
        }
    }

    #[async_trait]
    impl MediaSource for StoppingSource {
        fn snapshot(&self) -> SourceSnapshot {
            self.inner.snapshot()
        }

        fn last_updated(&self) -> Instant {
            self.inner.last_updated()
        }

        fn update(&self) {
            self.inner.update();
        }

        async fn refresh(&self) -> Result<()> {
            self.inner.refresh().await
        }
    }

    #[test]
    fn test_stats_ranked_per_track() {
        let (track, _sources) = simulcast_track(&[("l", 100), ("off", 0), ("h", 900), ("m", 300)]);

        let stats = track.get_stats();
        let ranks: Vec<(String, i32)> = stats
            .iter()
            .map(|s| (s.encoding_id.to_string(), s.simulcast_idx))
            .collect();
        assert_eq!(
            ranks,
            vec![
                ("l".to_string(), 0),
                ("off".to_string(), -1),
                ("h".to_string(), 2),
                ("m".to_string(), 1)
            ]
        );

        let info = track.get_active_layers();
        let bitrates: Vec<u64> = info.layers.iter().map(|l| l.bitrate).collect();
        assert_eq!(bitrates, vec![900, 300, 100]);
        assert_eq!(info.inactive.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_cached_within_window() {
        let (track, sources) = simulcast_track(&[("h", 900)]);
        let source = &sources[0];

        let first = track.get_stats();
        assert_eq!(first[0].bitrate, 900);
        let reads = source.snapshot_reads();

        // Engine moves on, but the cached value is still fresh
        source.set_bitrate(500);
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(track.get_stats()[0].bitrate, 900);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(track.get_stats()[0].bitrate, 500);
        assert!(source.snapshot_reads() > reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_does_not_read_counters() {
        let (track, sources) = simulcast_track(&[("h", 900)]);
        let _ = track.get_stats();
        let reads = sources[0].snapshot_reads();

        tokio::time::advance(Duration::from_millis(50)).await;
        let _ = track.get_stats();
        let _ = track.get_active_layers();
        assert_eq!(sources[0].snapshot_reads(), reads);
    }

    #[test]
    fn test_rtx_counted_in_totals_but_not_bitrate() {
        let track = Track::new(
            TrackId::generate(),
            ProxyRegistry::new(),
            &ForwardingConfig::default(),
        );
        let media = FakeSource::new(800_000);
        let rtx = FakeSource::new(80_000);
        track
            .add_encoding(
                EncodingId::from("h"),
                Arc::clone(&media) as Arc<dyn MediaSource>,
                Some(Arc::clone(&rtx) as Arc<dyn MediaSource>),
            )
            .unwrap();

        let stats = track.get_stats();
        assert_eq!(stats[0].bitrate, 800_000);
        assert_eq!(stats[0].total_bitrate, 880_000);
        assert_eq!(stats[0].total_bytes, 110_000);
        assert_eq!(stats[0].num_packets, 110);
        assert!(rtx.snapshot_reads() > 0);

        track.stop();
        assert!(media.is_released());
        assert!(rtx.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_source_forces_update() {
        let (track, sources) = simulcast_track(&[("h", 900)]);
        let source = &sources[0];
        source.set_auto_touch(false);

        tokio::time::advance(Duration::from_millis(150)).await;
        let _ = track.get_stats();
        assert_eq!(source.update_calls(), 1);

        // Fresh again after the forced update: no more updates within the window
        let _ = track.get_stats();
        assert_eq!(source.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_async_stats_refresh_sources() {
        let (track, sources) = simulcast_track(&[("l", 100), ("h", 900)]);
        sources[1].set_bitrate(1200);

        let info = track.get_active_layers_async().await;
        assert_eq!(info.layers[0].bitrate, 1200);
        assert!(sources.iter().all(|s| s.refresh_calls() == 1));
    }

    #[tokio::test]
    async fn test_async_stats_discarded_after_stop() {
        let (track, sources) = simulcast_track(&[("h", 900)]);
        let _ = track.get_stats();

        let gate = sources[0].hold_refresh();
        let pending = {
            let track = Arc::clone(&track);
            tokio::spawn(async move { track.get_stats_async().await })
        };
        tokio::task::yield_now().await;

        track.stop();
        gate.notify_one();

        let stats = pending.await.unwrap();
        assert!(stats.is_empty());
        assert!(track.stats_cache.lock().is_empty());
    }

    #[test]
    fn test_subscribers_notified_in_order() {
        let (track, _sources) = simulcast_track(&[("l", 100)]);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            track.subscribe(move |event| order.lock().push((tag, event.clone())));
        }

        track
            .add_encoding(EncodingId::from("h"), FakeSource::new(900), None)
            .unwrap();

        let seen = order.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("first", TrackEvent::EncodingAdded(EncodingId::from("h"))),
                ("second", TrackEvent::EncodingAdded(EncodingId::from("h"))),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let (track, _sources) = simulcast_track(&[("l", 100)]);
        let id = track.subscribe(|_| {});
        assert!(track.unsubscribe(id));
        assert!(!track.unsubscribe(id));
        assert_eq!(track.subscriber_count(), 0);
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_sources() {
        let (track, sources) = simulcast_track(&[("l", 100), ("h", 900)]);
        let stopped = Arc::new(AtomicUsize::new(0));
        {
            let stopped = Arc::clone(&stopped);
            track.subscribe(move |event| {
                if *event == TrackEvent::Stopped {
                    stopped.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        track.stop();
        track.stop();

        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(sources.iter().all(|s| s.is_released()));
        assert!(track.encodings().is_empty());
        assert!(matches!(
            track.add_encoding(EncodingId::from("x"), FakeSource::new(1), None),
            Err(Error::Stopped)
        ));
    }

    #[test]
    fn test_stop_during_add_encoding_releases_new_sources() {
        let (track, sources) = simulcast_track(&[("l", 100)]);
        let inner = FakeSource::new(900);
        let source = Arc::new(StoppingSource {
            inner: Arc::clone(&inner),
            track: Arc::downgrade(&track),
            armed: AtomicBool::new(true),
        });

        let result = track.add_encoding(EncodingId::from("x"), source, None);
        assert!(matches!(result, Err(Error::Stopped)));
        assert!(track.is_stopped());
        assert!(track.encodings().is_empty());
        assert!(inner.is_released());
        assert!(sources[0].is_released());
        assert!(track.registry.is_empty());
    }

    #[test]
    fn test_stats_not_stored_after_stop() {
        let (track, _sources) = simulcast_track(&[("h", 900)]);
        let encoding = track.encoding(&EncodingId::from("h")).unwrap();
        let now = Instant::now();
        let stats = track.compute(&encoding, now);

        track.stop();
        track.store(&encoding, now, &stats);
        assert!(track.stats_cache.lock().is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let (track, _sources) = simulcast_track(&[("l", 100)]);
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let weak_track = Arc::downgrade(&track);
        let id = {
            let slot = Arc::clone(&slot);
            track.subscribe(move |_| {
                if let (Some(track), Some(id)) = (weak_track.upgrade(), *slot.lock()) {
                    track.unsubscribe(id);
                }
            })
        };
        *slot.lock() = Some(id);

        track
            .add_encoding(EncodingId::from("h"), FakeSource::new(900), None)
            .unwrap();
        assert_eq!(track.subscriber_count(), 0);
    }
}
