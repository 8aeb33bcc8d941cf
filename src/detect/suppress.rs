//! Greedy confidence-ordered box suppression.

use crate::detect::result::Detection;
use crate::geometry::intersection_over_union;

pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;

/// Greedy non-maximum suppression.
///
/// Repeatedly keeps the most confident remaining detection (earliest wins on
/// ties) and discards every remaining detection whose IOU with it exceeds the
/// threshold. Output order is the order of selection.
#[derive(Clone, Copy, Debug)]
pub struct Suppressor {
    iou_threshold: f64,
}

impl Suppressor {
    pub fn new(iou_threshold: f64) -> Self {
        Self { iou_threshold }
    }

    pub fn iou_threshold(&self) -> f64 {
        self.iou_threshold
    }

    pub fn suppress(&self, detections: &[Detection]) -> Vec<Detection> {
        let mut removed = vec![false; detections.len()];
        let mut remaining = detections.len();
        let mut kept = Vec::new();

        while remaining > 0 {
            let Some(best) = self.select_best(detections, &removed) else {
                break;
            };
            removed[best] = true;
            remaining -= 1;

            let winner = &detections[best];
            for (idx, candidate) in detections.iter().enumerate() {
                if removed[idx] {
                    continue;
                }
                if intersection_over_union(&winner.bbox, &candidate.bbox) > self.iou_threshold {
                    removed[idx] = true;
                    remaining -= 1;
                }
            }
            kept.push(winner.clone());
        }
        kept
    }

    fn select_best(&self, detections: &[Detection], removed: &[bool]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, det) in detections.iter().enumerate() {
            if removed[idx] {
                continue;
            }
            match best {
                None => best = Some(idx),
                // Strictly greater keeps the first-encountered index on ties; NaN never wins.
                Some(current) if det.confidence > detections[current].confidence => {
                    best = Some(idx)
                }
                Some(current)
                    if detections[current].confidence.is_nan() && !det.confidence.is_nan() =>
                {
                    best = Some(idx)
                }
                _ => {}
            }
        }
        best
    }
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD)
    }
}
