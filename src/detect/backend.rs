use anyhow::Result;

use crate::detect::result::{Detection, GridSize, InputShape};

/// Detector backend trait.
///
/// The model is a black box: the pipeline resizes each sampled frame to
/// `input_shape()` and hands over tightly packed RGB bytes; the backend returns
/// scored boxes in `grid()` units. Any error is treated as fatal by the pipeline.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Input geometry the model expects.
    fn input_shape(&self) -> InputShape;

    /// Output grid geometry used for the returned coordinates.
    fn grid(&self) -> GridSize;

    /// Run detection on a resized RGB frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
