//! Failure kinds surfaced by the pipeline and its collaborators.
//!
//! Most functions return `anyhow::Result`; these variants mark the failures a
//! caller may want to tell apart, and can be recovered with
//! `anyhow::Error::downcast_ref::<LivedetError>()`.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum LivedetError {
    /// The detector could not process a sampled frame. Fatal to the pipeline.
    #[error("detector failed on frame {frame_index}")]
    DetectorFailure {
        frame_index: u64,
        #[source]
        source: BoxError,
    },

    /// The frame source could not produce a requested frame. Fatal to the pipeline.
    #[error("frame source failed at frame {frame_index}")]
    SourceFailure {
        frame_index: u64,
        #[source]
        source: BoxError,
    },

    /// Writing to one stream client failed. Ends that client only.
    #[error("stream write to {peer} failed")]
    StreamWriteFailure {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// Mirroring the prediction log to object storage failed. Logged, never fatal.
    #[error("upload of {bucket}/{key} failed")]
    StorageUploadFailure {
        bucket: String,
        key: String,
        #[source]
        source: BoxError,
    },

    /// The stream listener could not be bound or run.
    #[error("stream broadcaster on {addr}: {reason}")]
    Broadcaster { addr: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LivedetError {
    /// Whether this failure ends the frame pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DetectorFailure { .. }
                | Self::SourceFailure { .. }
                | Self::Broadcaster { .. }
                | Self::Config(_)
        )
    }
}
