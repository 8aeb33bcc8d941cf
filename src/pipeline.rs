//! Frame pipeline: sample, detect, suppress, annotate, publish.
//!
//! The pipeline runs on the caller's thread in strict frame order. Frame `i`
//! is requested for `i = 0, K, 2K, ...`; the first missing frame ends the run.
//! Detector and source failures are fatal: the source and the stream listener
//! are released and the error is returned with the frame index attached.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};

use crate::annotate::{self, Annotator};
use crate::config::LivedetConfig;
use crate::detect::{self, DetectorBackend, LabelTable, Suppressor};
use crate::error::LivedetError;
use crate::frame::{Frame, PublishedFrame};
use crate::ingest::{self, FrameSource};
use crate::predictions::PredictionLog;
use crate::storage;
use crate::stream::{StreamBroadcaster, StreamHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Exhausted,
    Failed,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Sample every Kth frame. Must be at least 1.
    pub skip_frames: u64,
    pub iou_threshold: f64,
    /// Info-level progress line every this many sampled frames.
    pub progress_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_frames: 5,
            iou_threshold: detect::suppress::DEFAULT_IOU_THRESHOLD,
            progress_every: 50,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.skip_frames == 0 {
            return Err(LivedetError::Config("skip_frames must be at least 1".to_string()).into());
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(
                LivedetError::Config("iou_threshold must be within [0, 1]".to_string()).into(),
            );
        }
        Ok(())
    }
}

/// Result of one [`FramePipeline::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Processed {
        index: u64,
        detections: usize,
        records: usize,
    },
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_sampled: u64,
    pub detections_retained: u64,
    pub records_appended: u64,
    pub upload_failures: u64,
    pub final_state: PipelineState,
}

pub struct FramePipeline {
    cfg: PipelineConfig,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    suppressor: Suppressor,
    annotator: Annotator,
    log: PredictionLog,
    frames: Arc<PublishedFrame>,
    broadcaster: Option<StreamBroadcaster>,
    stream: Option<StreamHandle>,
    state: PipelineState,
    next_index: u64,
    frames_sampled: u64,
    detections_retained: u64,
    records_appended: u64,
}

impl FramePipeline {
    pub fn new(
        cfg: PipelineConfig,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        annotator: Annotator,
        log: PredictionLog,
        broadcaster: StreamBroadcaster,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            suppressor: Suppressor::new(cfg.iou_threshold),
            cfg,
            source,
            detector,
            annotator,
            log,
            frames: broadcaster.frames(),
            broadcaster: Some(broadcaster),
            stream: None,
            state: PipelineState::Idle,
            next_index: 0,
            frames_sampled: 0,
            detections_retained: 0,
            records_appended: 0,
        })
    }

    /// Wire every component from a resolved configuration.
    pub fn from_config(cfg: &LivedetConfig) -> Result<Self> {
        let labels = LabelTable::from_names(cfg.labels.iter().cloned());
        let source = ingest::open_source(&cfg.source)?;
        let detector = detect::open_backend(&cfg.detector, &labels)?;
        let store = storage::open_store(&cfg.storage)?;
        let log = PredictionLog::open(cfg.predictions.clone(), store)?;
        let font = match &cfg.annotate.font_path {
            Some(path) => match annotate::load_font(path) {
                Ok(font) => Some(font),
                Err(err) => {
                    log::warn!("annotator: {:#}", err);
                    None
                }
            },
            None => None,
        };
        let annotator = Annotator::new(labels, font).with_text_scale(cfg.annotate.text_scale);
        let frames = Arc::new(PublishedFrame::new(cfg.jpeg_quality));
        let broadcaster = StreamBroadcaster::new(cfg.stream.clone(), frames);
        let pipeline_cfg = PipelineConfig {
            skip_frames: cfg.skip_frames,
            iou_threshold: cfg.iou_threshold,
            progress_every: cfg.progress_every,
        };
        Self::new(pipeline_cfg, source, detector, annotator, log, broadcaster)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn frames(&self) -> Arc<PublishedFrame> {
        Arc::clone(&self.frames)
    }

    /// Address the stream listener is bound to while running.
    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(|handle| handle.addr)
    }

    pub fn active_clients(&self) -> usize {
        self.stream
            .as_ref()
            .map(StreamHandle::active_clients)
            .unwrap_or(0)
    }

    /// `Idle -> Running`: open the source and the stream listener.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(anyhow!("pipeline cannot start from {:?}", self.state));
        }
        if let Err(err) = self.source.start() {
            return Err(self.fail(LivedetError::SourceFailure {
                frame_index: 0,
                source: err.into(),
            }));
        }
        if let Err(err) = self.detector.warm_up() {
            return Err(self.fail(LivedetError::DetectorFailure {
                frame_index: 0,
                source: err.context("detector warm-up failed").into(),
            }));
        }
        let Some(broadcaster) = self.broadcaster.take() else {
            return Err(anyhow!("stream broadcaster already consumed"));
        };
        match broadcaster.start() {
            Ok(handle) => self.stream = Some(handle),
            Err(err) => {
                self.release();
                self.state = PipelineState::Failed;
                return Err(err);
            }
        }
        self.state = PipelineState::Running;
        log::info!(
            "pipeline: running {} with {} detector, sampling every {} frames",
            self.source.name(),
            self.detector.name(),
            self.cfg.skip_frames
        );
        Ok(())
    }

    /// Process the next sampled frame.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state != PipelineState::Running {
            return Err(anyhow!("pipeline is not running ({:?})", self.state));
        }
        let index = self.next_index;
        let frame = match self.source.grab(index) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.exhaust();
                return Ok(StepOutcome::Exhausted);
            }
            Err(err) => {
                return Err(self.fail(LivedetError::SourceFailure {
                    frame_index: index,
                    source: err.into(),
                }))
            }
        };
        let (detections, records) = self.process(frame)?;
        self.next_index = index.saturating_add(self.cfg.skip_frames);
        self.frames_sampled += 1;
        self.detections_retained += detections as u64;
        self.records_appended += records as u64;

        log::debug!(
            "pipeline: frame {} -> {} detections, {} records",
            index,
            detections,
            records
        );
        if self.frames_sampled % self.cfg.progress_every.max(1) == 0 {
            log::info!(
                "pipeline: {} frames sampled, {} detections, {} stream clients, {} upload failures",
                self.frames_sampled,
                self.detections_retained,
                self.active_clients(),
                self.log.upload_failures()
            );
        }
        Ok(StepOutcome::Processed {
            index,
            detections,
            records,
        })
    }

    fn process(&mut self, mut frame: Frame) -> Result<(usize, usize)> {
        let input = self.detector.input_shape();
        let resized;
        let pixels: &[u8] = if frame.image.dimensions() == (input.width, input.height) {
            frame.image.as_raw()
        } else {
            resized = imageops::resize(
                &frame.image,
                input.width,
                input.height,
                FilterType::Triangle,
            );
            resized.as_raw()
        };
        let raw = match self.detector.detect(pixels, input.width, input.height) {
            Ok(raw) => raw,
            Err(err) => {
                return Err(self.fail(LivedetError::DetectorFailure {
                    frame_index: frame.index,
                    source: err.into(),
                }))
            }
        };
        let retained = self.suppressor.suppress(&raw);
        let timestamp_ms = crate::now_ms().context("read wall clock")?;
        let records = self.annotator.annotate(
            &mut frame.image,
            &retained,
            self.detector.grid(),
            timestamp_ms,
            &mut self.log,
        );
        self.frames.publish(frame);
        Ok((retained.len(), records))
    }

    /// Run until the source is exhausted or a fatal error occurs.
    pub fn run(&mut self) -> Result<PipelineReport> {
        if self.state == PipelineState::Idle {
            self.start()?;
        }
        loop {
            if self.step()? == StepOutcome::Exhausted {
                break;
            }
        }
        let report = self.report();
        log::info!(
            "pipeline: finished after {} sampled frames ({} detections, {} records, {} upload failures)",
            report.frames_sampled,
            report.detections_retained,
            report.records_appended,
            report.upload_failures
        );
        Ok(report)
    }

    /// Release the source and stream listener; always ends in `Stopped`.
    pub fn stop(&mut self) {
        self.release();
        self.state = PipelineState::Stopped;
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            frames_sampled: self.frames_sampled,
            detections_retained: self.detections_retained,
            records_appended: self.records_appended,
            upload_failures: self.log.upload_failures(),
            final_state: self.state,
        }
    }

    fn exhaust(&mut self) {
        self.state = PipelineState::Exhausted;
        log::info!(
            "pipeline: source {} exhausted at frame {}",
            self.source.name(),
            self.next_index
        );
        self.stop();
    }

    /// Release resources and hand the error back. Reporting it is up to the
    /// caller, which receives it from `start`, `step` or `run`.
    fn fail(&mut self, err: LivedetError) -> anyhow::Error {
        let err = anyhow::Error::from(err);
        self.release();
        self.state = PipelineState::Failed;
        err
    }

    fn release(&mut self) {
        if let Err(err) = self.source.stop() {
            log::warn!(
                "pipeline: source {} did not stop cleanly: {:#}",
                self.source.name(),
                err
            );
        }
        if let Some(handle) = self.stream.take() {
            if let Err(err) = handle.stop() {
                log::warn!("pipeline: {:#}", err);
            }
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.release();
        }
    }
}
