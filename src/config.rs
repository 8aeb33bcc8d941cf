use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{GridSize, InputShape};
use crate::error::LivedetError;
use crate::predictions::{PredictionLogConfig, UploadMode};
use crate::stream::{StreamConfig, DEFAULT_BOUNDARY};

const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_STREAM_PORT: u16 = 7000;
const DEFAULT_SKIP_FRAMES: u64 = 5;
const DEFAULT_IOU_THRESHOLD: f64 = 0.5;
const DEFAULT_PROGRESS_EVERY: u64 = 50;
const DEFAULT_JPEG_QUALITY: u8 = crate::frame::DEFAULT_JPEG_QUALITY;
const DEFAULT_POLL_INTERVAL_MS: u64 = 20;
const DEFAULT_KEEPALIVE_MS: u64 = 1000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_INPUT: InputShape = InputShape {
    width: 832,
    height: 416,
    channels: 3,
};
const DEFAULT_GRID: GridSize = GridSize {
    width: 26,
    height: 13,
};
const DEFAULT_DETECTION_THRESHOLD: f64 = 0.5;
const DEFAULT_BUCKET: &str = "livedet-predictions";
const DEFAULT_KEY: &str = "predictions.csv";
const DEFAULT_STORAGE_ROOT: &str = "object-store";
const DEFAULT_TEXT_SCALE: f32 = crate::annotate::DEFAULT_TEXT_SCALE;

#[derive(Debug, Deserialize, Default)]
struct LivedetConfigFile {
    source: Option<String>,
    skip_frames: Option<u64>,
    iou_threshold: Option<f64>,
    labels: Option<LabelsFile>,
    progress_every: Option<u64>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
    predictions: Option<PredictionsConfigFile>,
    storage: Option<StorageConfigFile>,
    annotate: Option<AnnotateConfigFile>,
}

/// Labels may be written as a list or as one comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelsFile {
    List(Vec<String>),
    Csv(String),
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    addr: Option<String>,
    port: Option<u16>,
    boundary: Option<String>,
    jpeg_quality: Option<u8>,
    poll_interval_ms: Option<u64>,
    keepalive_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    grid_width: Option<u32>,
    grid_height: Option<u32>,
    threshold: Option<f64>,
    anchors: Option<Vec<[f64; 2]>>,
}

#[derive(Debug, Deserialize, Default)]
struct PredictionsConfigFile {
    path: Option<PathBuf>,
    bucket: Option<String>,
    key: Option<String>,
    upload: Option<UploadMode>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    backend: Option<String>,
    root: Option<PathBuf>,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotateConfigFile {
    font_path: Option<PathBuf>,
    text_scale: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct LivedetConfig {
    pub source: String,
    pub skip_frames: u64,
    pub iou_threshold: f64,
    pub labels: Vec<String>,
    /// Log an info-level progress line every this many sampled frames.
    pub progress_every: u64,
    pub stream: StreamConfig,
    pub jpeg_quality: u8,
    pub detector: DetectorSettings,
    pub predictions: PredictionLogConfig,
    pub storage: StorageSettings,
    pub annotate: AnnotateSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input: InputShape,
    pub grid: GridSize,
    pub threshold: f64,
    pub anchors: Option<Vec<(f64, f64)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem,
    Memory,
    Http,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub root: PathBuf,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnnotateSettings {
    pub font_path: Option<PathBuf>,
    pub text_scale: f32,
}

impl LivedetConfig {
    /// Resolve from `$LIVEDET_CONFIG` (if set), defaults and the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVEDET_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(Path::new),
        )
    }

    /// Like [`LivedetConfig::load`] with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LivedetConfigFile) -> Result<Self> {
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamConfig {
            addr: stream_file.addr.unwrap_or_else(|| {
                format!(
                    "0.0.0.0:{}",
                    stream_file.port.unwrap_or(DEFAULT_STREAM_PORT)
                )
            }),
            boundary: stream_file
                .boundary
                .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string()),
            poll_interval: Duration::from_millis(
                stream_file
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            keepalive_interval: Duration::from_millis(
                stream_file.keepalive_ms.unwrap_or(DEFAULT_KEEPALIVE_MS),
            ),
            write_timeout: Duration::from_millis(
                stream_file
                    .write_timeout_ms
                    .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
            ),
            ..StreamConfig::default()
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input: InputShape {
                width: detector_file.input_width.unwrap_or(DEFAULT_INPUT.width),
                height: detector_file.input_height.unwrap_or(DEFAULT_INPUT.height),
                channels: DEFAULT_INPUT.channels,
            },
            grid: GridSize {
                width: detector_file.grid_width.unwrap_or(DEFAULT_GRID.width),
                height: detector_file.grid_height.unwrap_or(DEFAULT_GRID.height),
            },
            threshold: detector_file
                .threshold
                .unwrap_or(DEFAULT_DETECTION_THRESHOLD),
            anchors: detector_file
                .anchors
                .map(|anchors| anchors.into_iter().map(|[w, h]| (w, h)).collect()),
        };

        let predictions_file = file.predictions.unwrap_or_default();
        let predictions = PredictionLogConfig {
            path: match predictions_file.path {
                Some(path) => path,
                None => default_predictions_path()?,
            },
            bucket: predictions_file
                .bucket
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            key: predictions_file
                .key
                .unwrap_or_else(|| DEFAULT_KEY.to_string()),
            upload: predictions_file.upload.unwrap_or(UploadMode::PerRecord),
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            backend: match storage_file.backend.as_deref() {
                Some(name) => parse_storage_backend(name)?,
                None => StorageBackend::Filesystem,
            },
            root: storage_file
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            endpoint: storage_file.endpoint,
        };

        let annotate_file = file.annotate.unwrap_or_default();
        let annotate = AnnotateSettings {
            font_path: annotate_file.font_path,
            text_scale: annotate_file.text_scale.unwrap_or(DEFAULT_TEXT_SCALE),
        };

        Ok(Self {
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            skip_frames: file.skip_frames.unwrap_or(DEFAULT_SKIP_FRAMES),
            iou_threshold: file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            labels: match file.labels {
                Some(LabelsFile::List(labels)) => labels,
                Some(LabelsFile::Csv(labels)) => split_csv(&labels),
                None => Vec::new(),
            },
            progress_every: file.progress_every.unwrap_or(DEFAULT_PROGRESS_EVERY),
            stream,
            jpeg_quality: stream_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            detector,
            predictions,
            storage,
            annotate,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("LIVEDET_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source;
            }
        }
        if let Ok(addr) = std::env::var("LIVEDET_STREAM_ADDR") {
            if !addr.trim().is_empty() {
                self.stream.addr = addr;
            }
        }
        if let Ok(skip) = std::env::var("LIVEDET_SKIP_FRAMES") {
            self.skip_frames = skip
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVEDET_SKIP_FRAMES must be a positive integer"))?;
        }
        if let Ok(labels) = std::env::var("LIVEDET_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.labels = parsed;
            }
        }
        if let Ok(bucket) = std::env::var("LIVEDET_BUCKET") {
            if !bucket.trim().is_empty() {
                self.predictions.bucket = bucket;
            }
        }
        if let Ok(key) = std::env::var("LIVEDET_KEY") {
            if !key.trim().is_empty() {
                self.predictions.key = key;
            }
        }
        if let Ok(path) = std::env::var("LIVEDET_PREDICTIONS_PATH") {
            if !path.trim().is_empty() {
                self.predictions.path = PathBuf::from(path);
            }
        }
        if let Ok(root) = std::env::var("LIVEDET_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.storage.root = PathBuf::from(root);
            }
        }
        if let Ok(path) = std::env::var("LIVEDET_FONT_PATH") {
            if !path.trim().is_empty() {
                self.annotate.font_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("LIVEDET_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> anyhow::Error { LivedetError::Config(msg.to_string()).into() };
        if self.skip_frames == 0 {
            return Err(invalid("skip_frames must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(invalid("iou_threshold must be within [0, 1]"));
        }
        if self.progress_every == 0 {
            return Err(invalid("progress_every must be at least 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid("stream.jpeg_quality must be within 1..=100"));
        }
        let boundary = &self.stream.boundary;
        if boundary.is_empty()
            || boundary.len() > 70
            || !boundary
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "'()+_,-./:=?".contains(c))
        {
            return Err(invalid("stream.boundary must be 1-70 plain ASCII characters"));
        }
        if self.stream.poll_interval.is_zero() || self.stream.keepalive_interval.is_zero() {
            return Err(invalid("stream intervals must be greater than zero"));
        }
        let d = &self.detector;
        if d.input.width == 0 || d.input.height == 0 || d.grid.width == 0 || d.grid.height == 0
        {
            return Err(invalid("detector input and grid dimensions must be non-zero"));
        }
        if !(0.0..=1.0).contains(&d.threshold) {
            return Err(invalid("detector.threshold must be within [0, 1]"));
        }
        if self.predictions.bucket.trim().is_empty() || self.predictions.key.trim().is_empty() {
            return Err(invalid("predictions.bucket and predictions.key must be set"));
        }
        if self.storage.backend == StorageBackend::Http && self.storage.endpoint.is_none() {
            return Err(invalid("storage.endpoint is required for the http backend"));
        }
        if self.annotate.text_scale.is_nan() || self.annotate.text_scale <= 0.0 {
            return Err(invalid("annotate.text_scale must be positive"));
        }
        Ok(())
    }
}

/// `predictions-<epochMillis>.csv` in the working directory.
fn default_predictions_path() -> Result<PathBuf> {
    Ok(PathBuf::from(format!(
        "predictions-{}.csv",
        crate::now_ms()?
    )))
}

fn parse_storage_backend(name: &str) -> Result<StorageBackend> {
    match name {
        "fs" | "filesystem" => Ok(StorageBackend::Filesystem),
        "memory" => Ok(StorageBackend::Memory),
        "http" => Ok(StorageBackend::Http),
        other => Err(anyhow!(
            "unknown storage backend '{}'; expected fs, memory or http",
            other
        )),
    }
}

fn read_config_file(path: &Path) -> Result<LivedetConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
