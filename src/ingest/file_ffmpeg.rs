//! Local video file source using FFmpeg.
//!
//! Decoding is sequential; `grab(i)` decodes and discards frames until it
//! reaches `i`. Requesting an earlier index reopens the file. Container
//! timestamps are not consulted, so index `i` is the `i`th decoded frame.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

struct Decoding {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    next_index: u64,
    eof: bool,
    length: Option<u64>,
}

pub(crate) struct FfmpegFileSource {
    path: String,
    decoding: Option<Decoding>,
    frames_grabbed: u64,
}

impl FfmpegFileSource {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            decoding: None,
            frames_grabbed: 0,
        }
    }

    fn open(&self) -> Result<Decoding> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", self.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let length = u64::try_from(input_stream.frames()).ok().filter(|n| *n > 0);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Decoding {
            input,
            stream_index,
            decoder,
            scaler,
            next_index: 0,
            eof: false,
            length,
        })
    }
}

impl Decoding {
    /// Decode the next frame in stream order, `None` at end of file.
    fn decode_next(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                self.next_index += 1;
                return frame_to_image(&rgb_frame).map(Some);
            }
            if self.eof {
                return Ok(None);
            }
            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof = true;
                }
            }
        }
    }
}

impl FrameSource for FfmpegFileSource {
    fn name(&self) -> &str {
        &self.path
    }

    fn start(&mut self) -> Result<()> {
        let decoding = self.open()?;
        log::info!(
            "frame source: {} (ffmpeg, {} frames)",
            self.path,
            decoding
                .length
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        self.decoding = Some(decoding);
        Ok(())
    }

    fn length_in_frames(&self) -> Option<u64> {
        self.decoding.as_ref().and_then(|d| d.length)
    }

    fn grab(&mut self, index: u64) -> Result<Option<Frame>> {
        let needs_reopen = match &self.decoding {
            None => return Err(anyhow!("ffmpeg source not started; call start() first")),
            Some(decoding) => index < decoding.next_index,
        };
        if needs_reopen {
            log::debug!("ffmpeg source: rewinding {} for frame {}", self.path, index);
            self.decoding = Some(self.open()?);
        }
        let Some(decoding) = self.decoding.as_mut() else {
            return Err(anyhow!("ffmpeg source not started; call start() first"));
        };
        loop {
            let target = decoding.next_index;
            let Some(image) = decoding.decode_next()? else {
                return Ok(None);
            };
            if target == index {
                self.frames_grabbed += 1;
                return Ok(Some(Frame::new(index, crate::now_ms()?, image)));
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.decoding = None;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_grabbed: self.frames_grabbed,
            source: self.path.clone(),
        }
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("ffmpeg frame buffer does not match {}x{}", width, height))
}
