//! Test helpers: a fake media engine for unit tests
//!
//! [`FakeSource`] serves counters that tests mutate directly, and [`FakeSink`]
//! records every command a transponder issues.

use crate::config::ForwardingConfig;
use crate::engine::{ForwardingSink, MediaSource, NativeResource, RawLayer, SourceSnapshot};
use crate::error::Result;
use crate::proxy::ProxyRegistry;
use crate::track::Track;
use crate::types::{EncodingId, HandleId, TrackId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct FakeSource {
    id: HandleId,
    snapshot: Mutex<SourceSnapshot>,
    auto_touch: AtomicBool,
    released: AtomicBool,
    snapshot_reads: AtomicUsize,
    update_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeSource {
    /// A simulcast-style source without sub-layers
    pub fn new(bitrate: u64) -> Arc<Self> {
        Self::from_snapshot(SourceSnapshot {
            bytes: bitrate / 8,
            packets: bitrate / 8000,
            bitrate,
            codec: Some("VP8".to_string()),
            ..SourceSnapshot::empty(Instant::now())
        })
    }

    /// An SVC source; the encoding bitrate is the sum of its layers
    pub fn with_layers(layers: Vec<RawLayer>) -> Arc<Self> {
        let bitrate = layers.iter().map(|l| l.bitrate).sum();
        Self::from_snapshot(SourceSnapshot {
            bytes: layers.iter().map(|l| l.total_bytes).sum(),
            packets: layers.iter().map(|l| l.num_packets).sum(),
            bitrate,
            codec: Some("VP9".to_string()),
            layers,
            ..SourceSnapshot::empty(Instant::now())
        })
    }

    fn from_snapshot(snapshot: SourceSnapshot) -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            snapshot: Mutex::new(snapshot),
            auto_touch: AtomicBool::new(true),
            released: AtomicBool::new(false),
            snapshot_reads: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_gate: Mutex::new(None),
        })
    }

    pub fn set_bitrate(&self, bitrate: u64) {
        self.snapshot.lock().bitrate = bitrate;
    }

    pub fn set_codec(&self, codec: &str) {
        self.snapshot.lock().codec = Some(codec.to_string());
    }

    /// When off, `updated_at` only moves on `update`/`refresh`
    pub fn set_auto_touch(&self, enabled: bool) {
        self.auto_touch.store(enabled, Ordering::SeqCst);
    }

    /// Make the next refreshes wait until the returned gate is notified
    pub fn hold_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.refresh_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn snapshot_reads(&self) -> usize {
        self.snapshot_reads.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl NativeResource for FakeSource {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeSource {
    fn snapshot(&self) -> SourceSnapshot {
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = self.snapshot.lock();
        if self.auto_touch.load(Ordering::SeqCst) {
            snapshot.updated_at = Instant::now();
        }
        snapshot.clone()
    }

    fn last_updated(&self) -> Instant {
        self.snapshot.lock().updated_at
    }

    fn update(&self) {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshot.lock().updated_at = Instant::now();
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.refresh_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.snapshot.lock().updated_at = Instant::now();
        Ok(())
    }
}

/// Command issued to a [`FakeSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCommand {
    SetInput { source: Option<HandleId>, smooth: bool },
    SelectLayer(u8, u8),
    Mute(bool),
    Close,
}

pub struct FakeSink {
    id: HandleId,
    commands: Mutex<Vec<SinkCommand>>,
    released: AtomicBool,
    release_calls: AtomicUsize,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            commands: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            release_calls: AtomicUsize::new(0),
        })
    }

    pub fn commands(&self) -> Vec<SinkCommand> {
        self.commands.lock().clone()
    }

    pub fn take_commands(&self) -> Vec<SinkCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Most recent `SetInput` command
    pub fn last_input(&self) -> Option<(Option<HandleId>, bool)> {
        self.commands.lock().iter().rev().find_map(|c| match c {
            SinkCommand::SetInput { source, smooth } => Some((*source, *smooth)),
            _ => None,
        })
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

impl NativeResource for FakeSink {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn release(&self) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl ForwardingSink for FakeSink {
    fn set_input(&self, source: Option<Arc<dyn MediaSource>>, smooth: bool) {
        self.commands.lock().push(SinkCommand::SetInput {
            source: source.map(|s| s.handle_id()),
            smooth,
        });
    }

    fn select_layer(&self, spatial_layer_id: u8, temporal_layer_id: u8) {
        self.commands
            .lock()
            .push(SinkCommand::SelectLayer(spatial_layer_id, temporal_layer_id));
    }

    fn set_muted(&self, muted: bool) {
        self.commands.lock().push(SinkCommand::Mute(muted));
    }

    fn close(&self) {
        self.commands.lock().push(SinkCommand::Close);
    }
}

/// Raw SVC layer with the given ids and bitrate
pub fn raw_layer(spatial: u8, temporal: u8, bitrate: u64) -> RawLayer {
    RawLayer {
        spatial_layer_id: spatial,
        temporal_layer_id: temporal,
        total_bytes: bitrate / 8,
        num_packets: bitrate / 8000,
        bitrate,
        total_bitrate: bitrate,
        active: true,
        ..RawLayer::default()
    }
}

/// Track with one single-layer encoding per `(id, bitrate)` pair, in order
pub fn simulcast_track(encodings: &[(&str, u64)]) -> (Arc<Track>, Vec<Arc<FakeSource>>) {
    simulcast_track_in(&ProxyRegistry::new(), encodings)
}

pub fn simulcast_track_in(
    registry: &ProxyRegistry,
    encodings: &[(&str, u64)],
) -> (Arc<Track>, Vec<Arc<FakeSource>>) {
    let track = Track::new(
        TrackId::generate(),
        registry.clone(),
        &ForwardingConfig::default(),
    );
    let sources = encodings
        .iter()
        .map(|(id, bitrate)| {
            let source = FakeSource::new(*bitrate);
            track
                .add_encoding(EncodingId::from(*id), Arc::clone(&source) as Arc<dyn MediaSource>, None)
                .unwrap();
            source
        })
        .collect();
    (track, sources)
}
