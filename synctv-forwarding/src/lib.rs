//! `SyncTV` Forwarding control plane
//!
//! Decides which encoding and which spatial/temporal layer of a received track is
//! forwarded to each output, and aggregates the engine's raw counters into the
//! statistics those decisions are made on. The media engine itself (RTP, SRTP,
//! codecs) stays behind the narrow traits in [`engine`].
//!
//! ## Architecture
//!
//! - **`Track`**: Encodings of one received track, with cached statistics
//! - **`Transponder`**: Per-output selection state machine
//! - **`ProxyRegistry`**: Identity-preserving wrappers around engine handles
//! - **`ForwardingManager`**: Owns tracks and transponders, routes bandwidth estimates
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_forwarding::{ForwardingConfig, ForwardingManager, TargetBitrateOptions, TrackId};
//!
//! let manager = ForwardingManager::new(ForwardingConfig::load(None)?);
//! let track = manager.create_track(TrackId::from("camera"));
//! track.add_encoding("h".into(), engine_source, None)?;
//!
//! let (output, _transponder) = manager.create_transponder(engine_sink)?;
//! manager.attach(&output, track.id())?;
//! manager
//!     .apply_bandwidth_estimate(&output, 1_200_000, &TargetBitrateOptions::default())
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manager;
pub mod proxy;
pub mod stats;
pub mod track;
pub mod transponder;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::{ForwardingConfig, LoggingConfig};
pub use engine::{ForwardingSink, MediaSource, NativeResource, RawLayer, SourceSnapshot};
pub use error::{Error, Result};
pub use manager::{ForwardingManager, ManagerStats};
pub use proxy::{IntoProxy, Proxy, ProxyRegistry};
pub use stats::{ActiveLayersInfo, EncodingStats, LayerStats};
pub use track::{Encoding, SubscriptionId, Track, TrackEvent};
pub use transponder::{
    BitrateSelection, TargetBitrateOptions, Transponder, TransponderEvent, Traversal,
};
pub use types::{EncodingId, HandleId, OutputId, TrackId};
