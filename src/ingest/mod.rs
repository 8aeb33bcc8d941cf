//! Frame sources.
//!
//! Sources are addressed by frame index so the pipeline can sample every
//! Kth frame. Supported inputs:
//! - `stub://name?frames=N&width=W&height=H`: synthetic frames (tests, demos)
//! - a local directory of JPEG/PNG images, read in file-name order
//! - a local video file (feature: ingest-file-ffmpeg)
//! - an `http(s)://` MJPEG feed or JPEG snapshot endpoint (feature: remote-http)
//!
//! Other URL schemes are rejected.

#[cfg(feature = "remote-http")]
pub mod http;
pub mod images;
pub mod synthetic;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;

use std::path::Path;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

#[cfg(feature = "remote-http")]
pub use http::HttpSource;
pub use images::ImageSequenceSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// A grabber the pipeline samples frames from.
pub trait FrameSource: Send {
    /// Human-readable source description for logs and errors.
    fn name(&self) -> &str;

    /// Open the underlying input.
    fn start(&mut self) -> Result<()>;

    /// Total frame count when known up front.
    fn length_in_frames(&self) -> Option<u64>;

    /// Fetch frame `index`. `Ok(None)` means the source has no such frame
    /// (exhausted); errors are genuine read/decode failures.
    fn grab(&mut self, index: u64) -> Result<Option<Frame>>;

    /// Release the underlying input. Idempotent.
    fn stop(&mut self) -> Result<()>;

    fn stats(&self) -> SourceStats;
}

/// Counters reported by every source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_grabbed: u64,
    pub source: String,
}

/// Open a source from its configured URI.
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>> {
    if uri.trim().is_empty() {
        return Err(anyhow!("frame source must not be empty"));
    }
    match uri.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
        Some(scheme) if scheme == "stub" => {
            Ok(Box::new(SyntheticSource::new(SyntheticConfig::parse(uri)?)))
        }
        Some(scheme) if scheme == "http" || scheme == "https" => open_http(uri),
        Some(scheme) => Err(anyhow!(
            "unsupported frame source scheme '{}' in '{}'; expected stub://, http(s):// or a local path",
            scheme,
            uri
        )),
        None if Path::new(uri).is_dir() => Ok(Box::new(ImageSequenceSource::new(uri))),
        None => open_video_file(uri),
    }
}

#[cfg(feature = "remote-http")]
fn open_http(uri: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(HttpSource::new(uri)?))
}

#[cfg(not(feature = "remote-http"))]
fn open_http(uri: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "http frame source '{}' requires the remote-http feature",
        uri
    ))
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_video_file(uri: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(file_ffmpeg::FfmpegFileSource::new(uri)))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_video_file(uri: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "'{}' is not an image directory; video files require the ingest-file-ffmpeg feature",
        uri
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_schemes() {
        assert!(open_source("rtsp://camera/stream").is_err());
        assert!(open_source("ftp://example.com/video.mp4").is_err());
        assert!(open_source("   ").is_err());
    }

    #[cfg(feature = "remote-http")]
    #[test]
    fn opens_http_camera_urls_without_connecting() {
        let source = open_source("http://192.168.1.10:8080/video").unwrap();
        assert_eq!(source.name(), "http://192.168.1.10:8080/video");
        assert_eq!(source.length_in_frames(), None);
    }

    #[test]
    fn opens_stub_sources() {
        let source = open_source("stub://demo?frames=3").unwrap();
        assert_eq!(source.length_in_frames(), Some(3));
    }

    #[test]
    fn opens_image_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = open_source(dir.path().to_str().unwrap()).unwrap();
        assert!(source.name().contains(&*dir.path().to_string_lossy()));
    }
}
