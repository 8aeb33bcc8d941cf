use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One scored box produced by a detector backend.
///
/// Coordinates are in detection-grid units (columns/rows of the model output),
/// not pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_id: usize, confidence: f64) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }

    /// `round(confidence * 100)` as shown on frames and written to the log.
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

/// Model input geometry expected by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Output grid geometry; detections are expressed in these units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}
