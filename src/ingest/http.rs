//! HTTP camera source (MJPEG or single-JPEG snapshots).
//!
//! A `multipart/*` response is read as a continuous MJPEG feed: frames are cut
//! out of the byte stream by their JPEG start/end markers, so part headers and
//! boundaries are not interpreted. Any other response type is treated as a
//! snapshot endpoint and re-fetched for every grabbed frame.
//!
//! A live feed cannot rewind. `grab(i)` decodes forward, discarding frames
//! until it reaches `i`; asking for an index that has already passed is an
//! error. The end of the feed is reported as exhaustion.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

enum Feed {
    Mjpeg(MjpegScanner),
    Snapshot,
}

pub struct HttpSource {
    url: String,
    agent: ureq::Agent,
    feed: Option<Feed>,
    next_index: u64,
    frames_grabbed: u64,
}

impl HttpSource {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("invalid source url '{}'", url))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported http source scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            feed: None,
            next_index: 0,
            frames_grabbed: 0,
        })
    }

    fn fetch_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        match self.feed.as_mut() {
            Some(Feed::Mjpeg(scanner)) => scanner.next_jpeg(),
            Some(Feed::Snapshot) => self.fetch_snapshot(),
            None => Err(anyhow!("http source not started; call start() first")),
        }
    }
}

impl FrameSource for HttpSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn start(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to {}", self.url))?;
        let content_type = response.content_type().to_ascii_lowercase();
        if content_type.starts_with("multipart/") {
            self.feed = Some(Feed::Mjpeg(MjpegScanner::new(response.into_reader())));
            log::info!("frame source: {} (mjpeg feed)", self.url);
        } else {
            self.feed = Some(Feed::Snapshot);
            log::info!(
                "frame source: {} (snapshot endpoint, {})",
                self.url,
                content_type
            );
        }
        self.next_index = 0;
        Ok(())
    }

    fn length_in_frames(&self) -> Option<u64> {
        None
    }

    fn grab(&mut self, index: u64) -> Result<Option<Frame>> {
        if index < self.next_index {
            return Err(anyhow!(
                "live source {} is already past frame {} (next is {})",
                self.url,
                index,
                self.next_index
            ));
        }
        if matches!(self.feed, Some(Feed::Snapshot)) {
            // Every fetch is a fresh frame; there is nothing to skip.
            self.next_index = index;
        }
        loop {
            let Some(jpeg) = self.next_jpeg()? else {
                return Ok(None);
            };
            let current = self.next_index;
            self.next_index += 1;
            if current < index {
                continue;
            }
            let image = image::load_from_memory(&jpeg)
                .with_context(|| format!("decode frame {} from {}", current, self.url))?
                .into_rgb8();
            self.frames_grabbed += 1;
            return Ok(Some(Frame::new(current, crate::now_ms()?, image)));
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.feed = None;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_grabbed: self.frames_grabbed,
            source: self.url.clone(),
        }
    }
}

/// Cuts JPEG images out of a byte stream by their SOI/EOI markers.
pub(crate) struct MjpegScanner {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegScanner {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` once the stream ends.
    pub(crate) fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(jpeg));
            }
            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // No complete image in a window this large; keep the tail only.
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
