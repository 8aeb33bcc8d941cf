//! Axis-aligned box math shared by suppression and annotation.
//!
//! Boxes are stored as corner pairs (`x1,y1` top-left, `x2,y2` bottom-right) in
//! whatever coordinate space the caller works in. The detector emits grid-space
//! boxes; the annotator scales them into pixel space before drawing.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in corner form.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a center point and extents (YOLO-style outputs).
    pub fn from_center(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Area of the box. Inverted boxes count as empty.
    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Area shared with `other`, zero when the boxes do not overlap.
    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        // Both extents clamp independently: two negatives would otherwise
        // multiply into a positive "overlap" for diagonal neighbours.
        let w = (ix2 - ix1).max(0.0);
        let h = (iy2 - iy1).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        intersection_over_union(self, other)
    }

    /// Map this box from a `from_w x from_h` space into a `to_w x to_h` space,
    /// rounding each corner half away from zero.
    pub fn scale(&self, from_w: f64, from_h: f64, to_w: f64, to_h: f64) -> PixelBox {
        PixelBox {
            x1: scale_coordinate(self.x1, from_w, to_w),
            y1: scale_coordinate(self.y1, from_h, to_h),
            x2: scale_coordinate(self.x2, from_w, to_w),
            y2: scale_coordinate(self.y2, from_h, to_h),
        }
    }
}

/// Integer box in pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    /// Clip to a `width x height` canvas. Returns `None` when nothing remains.
    pub fn clip(&self, width: u32, height: u32) -> Option<PixelBox> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let (lx, hx) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (ly, hy) = (self.y1.min(self.y2), self.y1.max(self.y2));
        if hx < 0 || hy < 0 || lx > max_x || ly > max_y {
            return None;
        }
        Some(PixelBox {
            x1: lx.clamp(0, max_x),
            y1: ly.clamp(0, max_y),
            x2: hx.clamp(0, max_x),
            y2: hy.clamp(0, max_y),
        })
    }
}

/// `pixel = round(pixel_extent * value / grid_extent)`, half away from zero.
pub fn scale_coordinate(value: f64, from_extent: f64, to_extent: f64) -> i32 {
    if from_extent == 0.0 {
        return 0;
    }
    (to_extent * value / from_extent).round() as i32
}

/// Intersection-over-union of two boxes in the same coordinate space.
///
/// Returns 0 for disjoint boxes and when the union is empty.
pub fn intersection_over_union(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let inter = a.intersection_area(b);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}
