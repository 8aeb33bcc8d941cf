use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, GridSize, InputShape};

pub const DEFAULT_INPUT: InputShape = InputShape {
    width: 832,
    height: 416,
    channels: 3,
};

pub const DEFAULT_GRID: GridSize = GridSize {
    width: 26,
    height: 13,
};

/// One scripted reply from [`StubBackend`].
#[derive(Clone, Debug)]
pub enum StubResponse {
    Detections(Vec<Detection>),
    Fail(String),
}

/// Stub backend for demos and tests.
///
/// Without a script every call returns no detections. With a script, calls
/// consume the queued responses in order and fall back to empty results once it
/// runs out.
pub struct StubBackend {
    input: InputShape,
    grid: GridSize,
    script: VecDeque<StubResponse>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            input: DEFAULT_INPUT,
            grid: DEFAULT_GRID,
            script: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn with_geometry(mut self, input: InputShape, grid: GridSize) -> Self {
        self.input = input;
        self.grid = grid;
        self
    }

    pub fn with_script(mut self, script: impl IntoIterator<Item = StubResponse>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_shape(&self) -> InputShape {
        self.input
    }

    fn grid(&self) -> GridSize {
        self.grid
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        let expected = (width as usize) * (height as usize) * (self.input.channels as usize);
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} bytes for {}x{} input, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        match self.script.pop_front() {
            Some(StubResponse::Detections(detections)) => Ok(detections),
            Some(StubResponse::Fail(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}
