use crate::types::{EncodingId, HandleId, OutputId, TrackId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(EncodingId),

    #[error("No track attached")]
    NoTrack,

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Unknown output: {0}")]
    UnknownOutput(OutputId),

    #[error("Already stopped")]
    Stopped,

    #[error("Invalid maximum layers: spatial={spatial}, temporal={temporal}")]
    InvalidMaximum { spatial: i32, temporal: i32 },

    #[error("Resource already released: {0}")]
    Released(HandleId),

    #[error("Handle {0} is already wrapped under a different interface")]
    HandleTypeMismatch(HandleId),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error is a rejected precondition (caller misuse) rather than an engine fault
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::UnknownEncoding(_)
                | Self::NoTrack
                | Self::UnknownTrack(_)
                | Self::UnknownOutput(_)
                | Self::Stopped
                | Self::InvalidMaximum { .. }
                | Self::Released(_)
                | Self::HandleTypeMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
