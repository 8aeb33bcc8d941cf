//! Object storage the prediction log is mirrored to.
//!
//! Credentials and bucket provisioning policy live outside this crate; stores
//! only need to create a bucket when missing and overwrite one object.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{StorageBackend, StorageSettings};

pub trait ObjectStore: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Create `bucket` when it does not exist yet.
    fn ensure_bucket(&mut self, bucket: &str) -> Result<()>;

    /// Store `bytes` under `bucket/key`, replacing any previous object.
    fn put_object(&mut self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Build the configured object store.
pub fn open_store(settings: &StorageSettings) -> Result<Box<dyn ObjectStore>> {
    match settings.backend {
        StorageBackend::Filesystem => Ok(Box::new(FilesystemObjectStore::new(&settings.root)?)),
        StorageBackend::Memory => {
            log::warn!("object store: in-memory backend, predictions will not outlive the process");
            Ok(Box::new(InMemoryObjectStore::new()))
        }
        StorageBackend::Http => open_http(settings),
    }
}

#[cfg(feature = "remote-http")]
fn open_http(settings: &StorageSettings) -> Result<Box<dyn ObjectStore>> {
    let endpoint = settings
        .endpoint
        .as_deref()
        .ok_or_else(|| anyhow!("http object store requires storage.endpoint"))?;
    Ok(Box::new(HttpObjectStore::new(endpoint)?))
}

#[cfg(not(feature = "remote-http"))]
fn open_http(_settings: &StorageSettings) -> Result<Box<dyn ObjectStore>> {
    Err(anyhow!("http object store requires the remote-http feature"))
}

/// Buckets are directories under `root`; objects are files written atomically.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create object store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(sanitize_segment(bucket)?)
            .join(sanitize_key(key)?))
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn ensure_bucket(&mut self, bucket: &str) -> Result<()> {
        let dir = self.root.join(sanitize_segment(bucket)?);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create bucket {}", dir.display()))?;
        Ok(())
    }

    fn put_object(&mut self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let bucket_dir = self.root.join(sanitize_segment(bucket)?);
        if !bucket_dir.is_dir() {
            return Err(anyhow!("bucket '{}' does not exist", bucket));
        }
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, bytes)
    }
}

type Buckets = HashMap<String, HashMap<String, Vec<u8>>>;

/// In-memory store. Clones share the same buckets, so a test can keep a handle
/// while the prediction log owns another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryObjectStore {
    buckets: Arc<Mutex<Buckets>>,
    fail_puts: Arc<Mutex<bool>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_object` fail (or succeed again).
    pub fn set_fail_puts(&self, fail: bool) {
        match self.fail_puts.lock() {
            Ok(mut guard) => *guard = fail,
            Err(poisoned) => *poisoned.into_inner() = fail,
        }
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let buckets = self.buckets.lock().ok()?;
        buckets.get(bucket).and_then(|objects| objects.get(key)).cloned()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets
            .lock()
            .map(|buckets| buckets.contains_key(bucket))
            .unwrap_or(false)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ensure_bucket(&mut self, bucket: &str) -> Result<()> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?;
        buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn put_object(&mut self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let fail = self
            .fail_puts
            .lock()
            .map(|guard| *guard)
            .map_err(|_| anyhow!("object store lock poisoned"))?;
        if fail {
            return Err(anyhow!("object store unavailable"));
        }
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| anyhow!("bucket '{}' does not exist", bucket))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// S3-style HTTP store using path-style URLs (`{endpoint}/{bucket}/{key}`).
///
/// Requests are unsigned; point it at an endpoint that accepts anonymous
/// writes or sits behind a signing proxy.
#[cfg(feature = "remote-http")]
pub struct HttpObjectStore {
    endpoint: url::Url,
    agent: ureq::Agent,
}

#[cfg(feature = "remote-http")]
impl HttpObjectStore {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint)
            .with_context(|| format!("invalid object store endpoint '{}'", endpoint))?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported object store scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(10))
            .build();
        Ok(Self { endpoint, agent })
    }

    fn url_for(&self, segments: &[&str]) -> Result<url::Url> {
        let mut url = self.endpoint.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("object store endpoint cannot be a base url"))?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }
}

#[cfg(feature = "remote-http")]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &'static str {
        "http"
    }

    fn ensure_bucket(&mut self, bucket: &str) -> Result<()> {
        let url = self.url_for(&[bucket])?;
        if self.agent.head(url.as_str()).call().is_ok() {
            return Ok(());
        }
        match self.agent.put(url.as_str()).send_bytes(&[]) {
            Ok(_) => Ok(()),
            // 409: created concurrently or already owned by us.
            Err(ureq::Error::Status(409, _)) => Ok(()),
            Err(err) => Err(anyhow!("create bucket '{}' failed: {}", bucket, err)),
        }
    }

    fn put_object(&mut self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        use sha2::{Digest, Sha256};

        let url = self.url_for(&[bucket, key])?;
        let digest = hex::encode(Sha256::digest(bytes));
        self.agent
            .put(url.as_str())
            .set("Content-Type", "text/csv")
            .set("x-amz-content-sha256", &digest)
            .send_bytes(bytes)
            .map_err(|err| anyhow!("put {}/{} failed: {}", bucket, key, err))?;
        Ok(())
    }
}

fn sanitize_segment(segment: &str) -> Result<String> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && segment != "."
        && segment != "..";
    if !valid {
        return Err(anyhow!("invalid bucket name '{}'", segment));
    }
    Ok(segment.to_string())
}

fn sanitize_key(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return Err(anyhow!("invalid object key '{}'", key)),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(anyhow!("object key must not be empty"));
    }
    Ok(out)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
