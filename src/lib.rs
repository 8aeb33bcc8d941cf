//! Live object-detection video pipeline.
//!
//! Samples every Kth frame from a video source, runs an object detector on it,
//! suppresses overlapping detections, draws the survivors onto the frame and
//! serves the latest annotated frame to any number of HTTP clients as a
//! multipart JPEG stream. Every drawn detection is appended to a local
//! prediction log that is mirrored to object storage.
//!
//! # Module Structure
//!
//! - `geometry`: boxes, IOU and grid-to-pixel mapping
//! - `detect`: detector backends, label table and the suppressor
//! - `ingest`: frame sources (synthetic, image directories, video files, HTTP cameras)
//! - `annotate`: box and caption drawing
//! - `predictions` / `storage`: the prediction log and its object-store mirror
//! - `frame`: the published-frame slot shared with stream workers
//! - `stream`: the MJPEG broadcaster and a blocking stream reader
//! - `pipeline`: the sampling loop tying it all together
//! - `config`: file + environment configuration for the daemon

use anyhow::{anyhow, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod predictions;
pub mod storage;
pub mod stream;

pub use annotate::Annotator;
pub use config::LivedetConfig;
pub use detect::{Detection, DetectorBackend, GridSize, InputShape, LabelTable, Suppressor};
pub use error::LivedetError;
pub use frame::{Frame, PublishedFrame, Snapshot};
pub use geometry::{intersection_over_union, BoundingBox, PixelBox};
pub use ingest::{open_source, FrameSource};
pub use pipeline::{FramePipeline, PipelineConfig, PipelineReport, PipelineState, StepOutcome};
pub use predictions::{PredictionLog, PredictionLogConfig, PredictionRecord, UploadMode};
pub use storage::{FilesystemObjectStore, InMemoryObjectStore, ObjectStore};
pub use stream::{StreamBroadcaster, StreamConfig, StreamHandle};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("system clock is before the unix epoch"))?;
    i64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("system clock out of range"))
}
