//! Synthetic frame source (`stub://`).
//!
//! Produces deterministic gradient frames with a bright square that moves one
//! step per frame, so annotated output changes visibly over time.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const DEFAULT_FRAMES: u64 = 300;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const SQUARE: u32 = 48;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://synthetic".to_string(),
            frames: DEFAULT_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl SyntheticConfig {
    /// Parse `stub://name?frames=N&width=W&height=H`; every query key is optional.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source uri must start with stub://"))?;
        let mut cfg = Self {
            name: uri.to_string(),
            ..Self::default()
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(cfg);
        };
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub query parameter '{}'", pair))?;
            match key {
                "frames" => {
                    cfg.frames = value
                        .parse()
                        .with_context(|| format!("invalid frames value '{}'", value))?
                }
                "width" => {
                    cfg.width = value
                        .parse()
                        .with_context(|| format!("invalid width value '{}'", value))?
                }
                "height" => {
                    cfg.height = value
                        .parse()
                        .with_context(|| format!("invalid height value '{}'", value))?
                }
                other => return Err(anyhow!("unknown stub query parameter '{}'", other)),
            }
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(anyhow!("stub frame dimensions must be non-zero"));
        }
        Ok(cfg)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    started: bool,
    frames_grabbed: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            started: false,
            frames_grabbed: 0,
        }
    }

    fn render(&self, index: u64) -> RgbImage {
        let (w, h) = (self.config.width, self.config.height);
        let travel_x = w.saturating_sub(SQUARE).max(1) as u64;
        let travel_y = h.saturating_sub(SQUARE).max(1) as u64;
        let sx = ((index * 7) % travel_x) as u32;
        let sy = ((index * 3) % travel_y) as u32;
        RgbImage::from_fn(w, h, |x, y| {
            if x >= sx && x < sx + SQUARE && y >= sy && y < sy + SQUARE {
                Rgb([250, 240, 40])
            } else {
                let r = (x * 255 / w.max(1)) as u8;
                let b = (y * 255 / h.max(1)) as u8;
                Rgb([r / 2, (index % 64) as u8, b / 2])
            }
        })
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        log::info!(
            "frame source: {} ({} synthetic frames, {}x{})",
            self.config.name,
            self.config.frames,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn length_in_frames(&self) -> Option<u64> {
        Some(self.config.frames)
    }

    fn grab(&mut self, index: u64) -> Result<Option<Frame>> {
        if !self.started {
            return Err(anyhow!("synthetic source not started; call start() first"));
        }
        if index >= self.config.frames {
            return Ok(None);
        }
        self.frames_grabbed += 1;
        Ok(Some(Frame::new(index, crate::now_ms()?, self.render(index))))
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_grabbed: self.frames_grabbed,
            source: self.config.name.clone(),
        }
    }
}
