#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, GridSize, InputShape};
use crate::geometry::BoundingBox;

/// Tiny YOLOv2 (VOC) anchor priors in grid units, as `(w, h)` pairs.
pub const DEFAULT_ANCHORS: [(f64, f64); 5] = [
    (1.08, 1.19),
    (3.42, 4.41),
    (6.63, 11.38),
    (9.42, 5.11),
    (16.62, 10.52),
];

/// Tract-based backend for YOLOv2-style ONNX models.
///
/// The model takes a `1x3xHxW` float tensor in `[0, 1]` and produces raw logits
/// shaped `1 x anchors*(5+classes) x gridH x gridW`. Decoded boxes stay in grid
/// units; confidence is the sigmoid objectness and the class is the argmax of the
/// class scores.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input: InputShape,
    grid: GridSize,
    anchors: Vec<(f64, f64)>,
    num_classes: usize,
    confidence_threshold: f64,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input: InputShape,
        grid: GridSize,
        num_classes: usize,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(
                        1,
                        input.channels as usize,
                        input.height as usize,
                        input.width as usize
                    ),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input,
            grid,
            anchors: DEFAULT_ANCHORS.to_vec(),
            num_classes,
            confidence_threshold: 0.5,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Override the anchor priors.
    pub fn with_anchors(mut self, anchors: Vec<(f64, f64)>) -> Self {
        self.anchors = anchors;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if width != self.input.width || height != self.input.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.input.width,
                self.input.height
            ));
        }

        let channels = self.input.channels as usize;
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;

        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let width = width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, channels, height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * channels + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let stride = 5 + self.num_classes;
        let shape = view.shape();
        let expected = [
            1,
            self.anchors.len() * stride,
            self.grid.height as usize,
            self.grid.width as usize,
        ];
        if shape != expected.as_slice() {
            return Err(anyhow!(
                "model output shape {:?} does not match expected {:?}",
                shape,
                expected
            ));
        }

        let mut detections = Vec::new();
        for (anchor, &(prior_w, prior_h)) in self.anchors.iter().enumerate() {
            let base = anchor * stride;
            for row in 0..self.grid.height as usize {
                for col in 0..self.grid.width as usize {
                    let at = |offset: usize| view[[0, base + offset, row, col]] as f64;
                    let objectness = sigmoid(at(4));
                    if objectness < self.confidence_threshold {
                        continue;
                    }
                    let class_id = (0..self.num_classes)
                        .max_by(|a, b| at(5 + a).total_cmp(&at(5 + b)))
                        .unwrap_or(0);
                    let cx = col as f64 + sigmoid(at(0));
                    let cy = row as f64 + sigmoid(at(1));
                    let w = prior_w * at(2).exp();
                    let h = prior_h * at(3).exp();
                    detections.push(Detection::new(
                        BoundingBox::from_center(cx, cy, w, h),
                        class_id,
                        objectness,
                    ));
                }
            }
        }
        Ok(detections)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_shape(&self) -> InputShape {
        self.input
    }

    fn grid(&self) -> GridSize {
        self.grid
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}
