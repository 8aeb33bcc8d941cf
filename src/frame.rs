//! Frames and the published-frame handoff.
//!
//! - `Frame`: one decoded RGB image plus its source index and capture time.
//! - `Snapshot`: an immutable published frame; its JPEG encoding is computed at
//!   most once and shared by every stream worker.
//! - `PublishedFrame`: the single-writer / many-reader slot. Publishing swaps in a
//!   new `Arc<Snapshot>`; readers clone the `Arc` and never see a half-written
//!   image. The lock only guards the pointer swap, never encoding or I/O.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// One decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Index of the frame within its source.
    pub index: u64,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, timestamp_ms: i64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp_ms,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Immutable published frame.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub frame: Frame,
    jpeg_quality: u8,
    jpeg: OnceLock<Arc<[u8]>>,
}

impl Snapshot {
    fn new(generation: u64, frame: Frame, jpeg_quality: u8) -> Self {
        Self {
            generation,
            frame,
            jpeg_quality,
            jpeg: OnceLock::new(),
        }
    }

    /// JPEG bytes for this snapshot, encoded on first use.
    ///
    /// Concurrent first callers may each encode once; only one result is kept.
    pub fn jpeg(&self) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.jpeg.get() {
            return Ok(bytes.clone());
        }
        let encoded: Arc<[u8]> = encode_jpeg(&self.frame.image, self.jpeg_quality)?.into();
        Ok(self.jpeg.get_or_init(|| encoded).clone())
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::with_capacity(
        (image.width() as usize) * (image.height() as usize) / 4,
    ));
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode frame as jpeg")?;
    Ok(buf.into_inner())
}

/// Latest annotated frame shared between the pipeline and stream workers.
#[derive(Debug)]
pub struct PublishedFrame {
    slot: RwLock<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    jpeg_quality: u8,
}

impl PublishedFrame {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            jpeg_quality,
        }
    }

    /// Replace the current frame. Returns the new generation (starting at 1).
    pub fn publish(&self, frame: Frame) -> u64 {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(Snapshot::new(generation, frame, self.jpeg_quality));
        let previous = {
            let mut slot = match self.slot.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.replace(snapshot)
        };
        self.generation.store(generation, Ordering::Release);
        // Drop the old snapshot outside the lock; readers may still hold it.
        drop(previous);
        generation
    }

    /// Current snapshot, if anything has been published yet.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        let slot = match self.slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }

    /// Generation of the most recent publish; 0 before the first frame.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for PublishedFrame {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}
