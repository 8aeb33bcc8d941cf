//! Durable prediction log with an object-storage mirror.
//!
//! Every retained detection becomes one `label;confidencePercent;timestampMillis`
//! line in a local append-only file. After appending, the whole file is uploaded
//! to a fixed bucket/key so the remote copy reflects the local log. Upload
//! failures are logged and counted but never stop the pipeline; the local file
//! always keeps the record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LivedetError;
use crate::storage::ObjectStore;

/// One persisted detection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub label: String,
    pub confidence_percent: u32,
    pub timestamp_ms: i64,
}

impl PredictionRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{}",
            self.label, self.confidence_percent, self.timestamp_ms
        )
    }

    /// Parse one log line. Labels may themselves contain `;`, so the numeric
    /// fields are taken from the right.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.rsplitn(3, ';');
        let timestamp = parts.next();
        let confidence = parts.next();
        let label = parts.next();
        let (Some(label), Some(confidence), Some(timestamp)) = (label, confidence, timestamp)
        else {
            return Err(anyhow!("malformed prediction line '{}'", line));
        };
        Ok(Self {
            label: label.to_string(),
            confidence_percent: confidence
                .trim()
                .parse()
                .with_context(|| format!("invalid confidence in '{}'", line))?,
            timestamp_ms: timestamp
                .trim()
                .parse()
                .with_context(|| format!("invalid timestamp in '{}'", line))?,
        })
    }
}

/// When the local log is mirrored to object storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadMode {
    /// Upload after every appended record.
    PerRecord,
    /// Upload once per annotated frame that appended at least one record.
    PerFrame,
}

impl std::str::FromStr for UploadMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "per-record" => Ok(Self::PerRecord),
            "per-frame" => Ok(Self::PerFrame),
            other => Err(anyhow!(
                "unknown upload mode '{}'; expected per-record or per-frame",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PredictionLogConfig {
    pub path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub upload: UploadMode,
}

pub struct PredictionLog {
    cfg: PredictionLogConfig,
    store: Box<dyn ObjectStore>,
    appended: u64,
    uploads: u64,
    upload_failures: u64,
    dirty: bool,
}

impl PredictionLog {
    /// Prepare the local file location and the remote bucket.
    ///
    /// A bucket that cannot be created is logged; uploads will then fail and be
    /// counted like any other upload failure.
    pub fn open(cfg: PredictionLogConfig, mut store: Box<dyn ObjectStore>) -> Result<Self> {
        if let Some(parent) = cfg.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create prediction log dir {}", parent.display())
            })?;
        }
        if let Err(err) = store.ensure_bucket(&cfg.bucket) {
            log::warn!(
                "prediction log: bucket '{}' unavailable on {} store: {:#}",
                cfg.bucket,
                store.name(),
                err
            );
        }
        log::info!(
            "prediction log: {} -> {}:{}/{} ({:?})",
            cfg.path.display(),
            store.name(),
            cfg.bucket,
            cfg.key,
            cfg.upload
        );
        Ok(Self {
            cfg,
            store,
            appended: 0,
            uploads: 0,
            upload_failures: 0,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.cfg.path
    }

    /// Append one record locally, then mirror per the upload mode.
    ///
    /// Errors only when the local append fails; upload problems are absorbed.
    pub fn append(&mut self, record: &PredictionRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.path)
            .with_context(|| format!("failed to open {}", self.cfg.path.display()))?;
        writeln!(file, "{}", record.to_line())
            .with_context(|| format!("failed to append to {}", self.cfg.path.display()))?;
        file.flush()?;
        self.appended += 1;
        self.dirty = true;

        if self.cfg.upload == UploadMode::PerRecord {
            self.sync_remote();
        }
        Ok(())
    }

    /// End-of-frame hook: uploads pending records in per-frame mode.
    pub fn finish_frame(&mut self) {
        if self.cfg.upload == UploadMode::PerFrame && self.dirty {
            self.sync_remote();
        }
    }

    fn sync_remote(&mut self) {
        match self.upload() {
            Ok(()) => {
                self.uploads += 1;
                self.dirty = false;
            }
            Err(err) => {
                self.upload_failures += 1;
                log::warn!("{}", err);
            }
        }
    }

    fn upload(&mut self) -> std::result::Result<(), LivedetError> {
        let failure = |source: anyhow::Error| LivedetError::StorageUploadFailure {
            bucket: self.cfg.bucket.clone(),
            key: self.cfg.key.clone(),
            source: source.into(),
        };
        let bytes = fs::read(&self.cfg.path)
            .with_context(|| format!("failed to read {}", self.cfg.path.display()))
            .map_err(failure)?;
        self.store
            .put_object(&self.cfg.bucket, &self.cfg.key, &bytes)
            .map_err(failure)
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn upload_failures(&self) -> u64 {
        self.upload_failures
    }
}

/// Read a prediction log back into records.
pub fn read_records(path: &Path) -> Result<Vec<PredictionRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read prediction log {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(PredictionRecord::parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    fn record(label: &str, confidence_percent: u32, timestamp_ms: i64) -> PredictionRecord {
        PredictionRecord {
            label: label.to_string(),
            confidence_percent,
            timestamp_ms,
        }
    }

    fn open_log(dir: &Path, store: &InMemoryObjectStore, upload: UploadMode) -> PredictionLog {
        let cfg = PredictionLogConfig {
            path: dir.join("logs").join("predictions.csv"),
            bucket: "detections".to_string(),
            key: "predictions.csv".to_string(),
            upload,
        };
        PredictionLog::open(cfg, Box::new(store.clone())).unwrap()
    }

    #[test]
    fn line_format_round_trips() {
        let rec = record("traffic;light", 87, 1_700_000_000_123);
        assert_eq!(rec.to_line(), "traffic;light;87;1700000000123");
        assert_eq!(PredictionRecord::parse_line(&rec.to_line()).unwrap(), rec);
        assert!(PredictionRecord::parse_line("missing fields").is_err());
        assert!(PredictionRecord::parse_line("car;high;12").is_err());
    }

    #[test]
    fn every_append_mirrors_the_whole_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let mut log = open_log(dir.path(), &store, UploadMode::PerRecord);
        assert!(store.has_bucket("detections"));

        log.append(&record("car", 91, 1)).unwrap();
        assert_eq!(store.get("detections", "predictions.csv").unwrap(), b"car;91;1\n");
        log.append(&record("dog", 55, 2)).unwrap();
        assert_eq!(
            store.get("detections", "predictions.csv").unwrap(),
            b"car;91;1\ndog;55;2\n"
        );
        assert_eq!(log.appended(), 2);
        assert_eq!(log.uploads(), 2);
        assert_eq!(
            read_records(log.path()).unwrap(),
            vec![record("car", 91, 1), record("dog", 55, 2)]
        );
    }

    #[test]
    fn upload_failure_keeps_local_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let mut log = open_log(dir.path(), &store, UploadMode::PerRecord);
        store.set_fail_puts(true);

        log.append(&record("car", 91, 1)).unwrap();
        assert_eq!(log.upload_failures(), 1);
        assert!(store.get("detections", "predictions.csv").is_none());
        assert_eq!(read_records(log.path()).unwrap(), vec![record("car", 91, 1)]);

        // The next successful upload carries the lagging record along.
        store.set_fail_puts(false);
        log.append(&record("dog", 40, 2)).unwrap();
        assert_eq!(
            store.get("detections", "predictions.csv").unwrap(),
            b"car;91;1\ndog;40;2\n"
        );
    }

    #[test]
    fn per_frame_mode_uploads_once_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let mut log = open_log(dir.path(), &store, UploadMode::PerFrame);

        log.append(&record("car", 91, 1)).unwrap();
        log.append(&record("car", 70, 1)).unwrap();
        assert!(store.get("detections", "predictions.csv").is_none());
        log.finish_frame();
        assert_eq!(log.uploads(), 1);
        log.finish_frame();
        assert_eq!(log.uploads(), 1);
        assert_eq!(
            store.get("detections", "predictions.csv").unwrap(),
            b"car;91;1\ncar;70;1\n"
        );
    }

    #[test]
    fn upload_mode_parses() {
        assert_eq!("per-frame".parse::<UploadMode>().unwrap(), UploadMode::PerFrame);
        assert!("sometimes".parse::<UploadMode>().is_err());
    }
}
