//! Draws retained detections onto frames and records them.

use std::fs;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::{Detection, GridSize, LabelTable};
use crate::predictions::{PredictionLog, PredictionRecord};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const DEFAULT_TEXT_SCALE: f32 = 24.0;
/// Text sits this many pixels inside the box's bottom-left corner.
const TEXT_INSET: i32 = 2;

/// Load a TrueType/OpenType font for label text.
pub fn load_font(path: &Path) -> Result<FontVec> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    FontVec::try_from_vec(bytes).map_err(|_| anyhow!("invalid font file {}", path.display()))
}

pub struct Annotator {
    labels: LabelTable,
    font: Option<FontVec>,
    scale: PxScale,
    color: Rgb<u8>,
}

impl Annotator {
    pub fn new(labels: LabelTable, font: Option<FontVec>) -> Self {
        if font.is_none() {
            log::warn!("annotator: no font available; boxes will be drawn without labels");
        }
        Self {
            labels,
            font,
            scale: PxScale::from(DEFAULT_TEXT_SCALE),
            color: BOX_COLOR,
        }
    }

    pub fn with_text_scale(mut self, scale: f32) -> Self {
        self.scale = PxScale::from(scale);
        self
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    /// Caption drawn next to a box, e.g. `car, 87%`.
    pub fn caption(&self, detection: &Detection) -> String {
        format!(
            "{}, {}%",
            self.labels.display(detection.class_id),
            detection.confidence_percent()
        )
    }

    /// Draw every detection onto `image` and append one record each to `log`.
    ///
    /// Detections are in `grid` units and are mapped onto the image's own
    /// pixel size. Returns the number of records appended.
    pub fn annotate(
        &self,
        image: &mut RgbImage,
        detections: &[Detection],
        grid: GridSize,
        timestamp_ms: i64,
        log: &mut PredictionLog,
    ) -> usize {
        let mut appended = 0;
        for detection in detections {
            self.draw(image, detection, grid);
            let record = PredictionRecord {
                label: self.labels.display(detection.class_id),
                confidence_percent: detection.confidence_percent(),
                timestamp_ms,
            };
            match log.append(&record) {
                Ok(()) => appended += 1,
                Err(err) => log::warn!("annotator: prediction not recorded: {:#}", err),
            }
        }
        log.finish_frame();
        appended
    }

    fn draw(&self, image: &mut RgbImage, detection: &Detection, grid: GridSize) {
        let (width, height) = image.dimensions();
        let mapped = detection.bbox.scale(
            grid.width as f64,
            grid.height as f64,
            width as f64,
            height as f64,
        );
        if mapped.clip(width, height).is_none() {
            log::debug!(
                "annotator: box {:?} lies outside the {}x{} frame",
                mapped,
                width,
                height
            );
            return;
        }
        // Outline the real box. Edges beyond the frame are parked one pixel off
        // canvas, so they stay invisible instead of landing on the border.
        let (max_x, max_y) = (width as i32, height as i32);
        let x1 = mapped.x1.min(mapped.x2).clamp(-1, max_x);
        let x2 = mapped.x1.max(mapped.x2).clamp(-1, max_x);
        let y1 = mapped.y1.min(mapped.y2).clamp(-1, max_y);
        let y2 = mapped.y1.max(mapped.y2).clamp(-1, max_y);
        let rect = Rect::at(x1, y1).of_size(x1.abs_diff(x2) + 1, y1.abs_diff(y2) + 1);
        draw_hollow_rect_mut(image, rect, self.color);

        if let Some(font) = &self.font {
            let caption = self.caption(detection);
            let (_, text_height) = text_size(self.scale, font, &caption);
            // Baseline at the bottom-left inside corner of the unclipped box.
            let x = mapped.x1.min(mapped.x2) + TEXT_INSET;
            let y = mapped.y1.max(mapped.y2) - TEXT_INSET - text_height as i32;
            draw_text_mut(image, self.color, x, y, self.scale, font, &caption);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;
    use crate::predictions::{read_records, PredictionLogConfig, UploadMode};
    use crate::storage::InMemoryObjectStore;

    const GRID: GridSize = GridSize {
        width: 26,
        height: 13,
    };

    fn open_log(dir: &Path) -> PredictionLog {
        let cfg = PredictionLogConfig {
            path: dir.join("predictions.csv"),
            bucket: "detections".to_string(),
            key: "predictions.csv".to_string(),
            upload: UploadMode::PerRecord,
        };
        PredictionLog::open(cfg, Box::new(InMemoryObjectStore::new())).unwrap()
    }

    fn annotator() -> Annotator {
        Annotator::new(LabelTable::from_names(["person", "car"]), None)
    }

    #[test]
    fn draws_grid_box_at_scaled_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path());
        let background = Rgb([10, 10, 10]);
        let mut image = RgbImage::from_pixel(832, 416, background);
        let detection = Detection::new(BoundingBox::new(5.0, 2.0, 10.0, 8.0), 1, 0.874);

        let appended = annotator().annotate(&mut image, &[detection], GRID, 42, &mut log);
        assert_eq!(appended, 1);

        for (x, y) in [(160, 64), (320, 256), (240, 64), (160, 200), (320, 100)] {
            assert_eq!(image.get_pixel(x, y), &BOX_COLOR, "edge pixel ({x}, {y})");
        }
        assert_eq!(image.get_pixel(240, 160), &background);
        assert_eq!(image.get_pixel(159, 64), &background);
        assert_eq!(image.get_pixel(321, 256), &background);

        let records = read_records(log.path()).unwrap();
        assert_eq!(
            records,
            vec![PredictionRecord {
                label: "car".to_string(),
                confidence_percent: 87,
                timestamp_ms: 42,
            }]
        );
    }

    #[test]
    fn no_detections_leaves_frame_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path());
        let original = RgbImage::from_fn(64, 32, |x, y| Rgb([x as u8, y as u8, 7]));
        let mut image = original.clone();

        let appended = annotator().annotate(&mut image, &[], GRID, 1, &mut log);
        assert_eq!(appended, 0);
        assert_eq!(image, original);
        assert_eq!(log.appended(), 0);
        assert!(!log.path().exists());
    }

    #[test]
    fn boxes_outside_the_frame_are_clipped_but_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path());
        let background = Rgb([0, 0, 0]);
        let mut image = RgbImage::new(52, 26);
        // Maps to pixels (40, 20)-(80, 60): only the top and left edges are visible.
        let detections = [
            Detection::new(BoundingBox::new(20.0, 10.0, 40.0, 30.0), 0, 0.6),
            Detection::new(BoundingBox::new(-9.0, -9.0, -5.0, -5.0), 7, 0.5),
        ];

        let appended = annotator().annotate(&mut image, &detections, GRID, 1, &mut log);
        assert_eq!(appended, 2);
        assert_eq!(image.get_pixel(40, 20), &BOX_COLOR);
        assert_eq!(image.get_pixel(51, 20), &BOX_COLOR);
        assert_eq!(image.get_pixel(40, 25), &BOX_COLOR);
        // No edge is painted along the frame border where the box has none.
        assert_eq!(image.get_pixel(51, 23), &background);
        assert_eq!(image.get_pixel(45, 25), &background);
        assert_eq!(image.get_pixel(51, 25), &background);

        let labels: Vec<String> = read_records(log.path())
            .unwrap()
            .into_iter()
            .map(|r| r.label)
            .collect();
        assert_eq!(labels, vec!["person".to_string(), "class 7".to_string()]);
    }

    #[test]
    fn caption_uses_label_and_rounded_percent() {
        let detection = Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0, 0.906);
        assert_eq!(annotator().caption(&detection), "person, 91%");
    }

    #[test]
    fn missing_font_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_font(&dir.path().join("absent.ttf")).is_err());
        let bogus = dir.path().join("bogus.ttf");
        fs::write(&bogus, b"not a font").unwrap();
        assert!(load_font(&bogus).is_err());
    }
}
