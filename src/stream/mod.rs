//! MJPEG broadcaster.
//!
//! One listener thread accepts connections; every client gets its own worker
//! thread that writes the multipart header once and then a JPEG part whenever
//! the published frame changes. Workers only read the shared
//! [`PublishedFrame`], so a slow or dead client never holds up the pipeline or
//! the other clients.

pub mod client;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::error::LivedetError;
use crate::frame::PublishedFrame;

pub const DEFAULT_BOUNDARY: &str = "stream";
const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub addr: String,
    pub boundary: String,
    /// Sleep between frame checks in each worker.
    pub poll_interval: Duration,
    /// Re-send the current frame after this long without a new one.
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    /// How long to wait for the client's request head before streaming anyway.
    pub request_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7000".to_string(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            poll_interval: Duration::from_millis(20),
            keepalive_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(200),
        }
    }
}

/// Response head written once per connection, ending with the first boundary.
pub fn stream_header(boundary: &str) -> String {
    format!(
        "HTTP/1.0 200 OK\r\n\
         Connection: close\r\n\
         Max-Age: 0\r\n\
         Expires: 0\r\n\
         Cache-Control: no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0\r\n\
         Pragma: no-cache\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={boundary}\r\n\
         \r\n\
         --{boundary}\r\n"
    )
}

/// Write one JPEG part followed by the boundary delimiter.
pub fn write_part<W: Write>(out: &mut W, boundary: &str, jpeg: &[u8]) -> std::io::Result<()> {
    write!(
        out,
        "Content-type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )?;
    out.write_all(jpeg)?;
    write!(out, "\r\n--{}\r\n", boundary)?;
    out.flush()
}

/// Connected clients, keyed by worker id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, SocketAddr>>,
}

impl WorkerRegistry {
    fn register(self: &Arc<Self>, peer: SocketAddr) -> WorkerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.clients.lock() {
            Ok(mut clients) => {
                clients.insert(id, peer);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, peer);
            }
        }
        WorkerGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    fn deregister(&self, id: u64) {
        match self.clients.lock() {
            Ok(mut clients) => {
                clients.remove(&id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&id);
            }
        }
    }

    pub fn active(&self) -> usize {
        match self.clients.lock() {
            Ok(clients) => clients.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        match self.clients.lock() {
            Ok(clients) => clients.values().copied().collect(),
            Err(poisoned) => poisoned.into_inner().values().copied().collect(),
        }
    }
}

/// Removes its worker from the registry however the worker ends.
struct WorkerGuard {
    id: u64,
    registry: Arc<WorkerRegistry>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    pub addr: SocketAddr,
    registry: Arc<WorkerRegistry>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Close the listener. Connected clients keep streaming until they leave.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream listener thread panicked"))?;
        }
        log::info!(
            "stream: listener on {} closed ({} clients still connected)",
            self.addr,
            self.registry.active()
        );
        Ok(())
    }

    pub fn active_clients(&self) -> usize {
        self.registry.active()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }
}

pub struct StreamBroadcaster {
    cfg: StreamConfig,
    frames: Arc<PublishedFrame>,
}

impl StreamBroadcaster {
    pub fn new(cfg: StreamConfig, frames: Arc<PublishedFrame>) -> Self {
        Self { cfg, frames }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    /// The frame slot workers read from; the pipeline publishes into it.
    pub fn frames(&self) -> Arc<PublishedFrame> {
        Arc::clone(&self.frames)
    }

    /// Bind the listener and start accepting clients on a background thread.
    pub fn start(self) -> Result<StreamHandle> {
        let broadcaster_err = |reason: String| LivedetError::Broadcaster {
            addr: self.cfg.addr.clone(),
            reason,
        };
        let listener = TcpListener::bind(self.cfg.addr.as_str())
            .map_err(|err| broadcaster_err(format!("bind failed: {}", err)))?;
        let addr = listener
            .local_addr()
            .map_err(|err| broadcaster_err(format!("local address unavailable: {}", err)))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| broadcaster_err(format!("set_nonblocking failed: {}", err)))?;

        let registry = Arc::new(WorkerRegistry::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry_thread = registry.clone();
        let join = std::thread::Builder::new()
            .name("livedet-stream".to_string())
            .spawn(move || {
                if let Err(err) = run_listener(listener, self, registry_thread, shutdown_thread) {
                    log::error!("stream listener stopped: {}", err);
                }
            })?;
        log::info!("stream: serving mjpeg on http://{}/", addr);

        Ok(StreamHandle {
            addr,
            registry,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_listener(
    listener: TcpListener,
    broadcaster: StreamBroadcaster,
    registry: Arc<WorkerRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => spawn_worker(stream, peer, &broadcaster, &registry),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // ECONNABORTED and friends only affect one connection.
                log::warn!("stream: accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    Ok(())
}

fn spawn_worker(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: &StreamBroadcaster,
    registry: &Arc<WorkerRegistry>,
) {
    let guard = registry.register(peer);
    let cfg = broadcaster.cfg.clone();
    let frames = broadcaster.frames.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("livedet-client-{}", guard.id))
        .spawn(move || {
            let _guard = guard;
            log::info!("stream: client {} connected", peer);
            match serve_client(stream, peer, &frames, &cfg) {
                Ok(()) => log::info!("stream: client {} disconnected", peer),
                Err(err) => log::info!("stream: client {} dropped: {}", peer, err),
            }
        });
    if let Err(err) = spawned {
        log::warn!("stream: could not start worker for {}: {}", peer, err);
    }
}

fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    frames: &PublishedFrame,
    cfg: &StreamConfig,
) -> Result<(), LivedetError> {
    let write_failure = |source: std::io::Error| LivedetError::StreamWriteFailure {
        peer: peer.to_string(),
        source,
    };
    stream.set_nonblocking(false).map_err(write_failure)?;
    drain_request(&mut stream, cfg.request_timeout);
    stream
        .set_write_timeout(Some(cfg.write_timeout))
        .map_err(write_failure)?;
    let _ = stream.set_nodelay(true);

    stream
        .write_all(stream_header(&cfg.boundary).as_bytes())
        .map_err(write_failure)?;
    stream.flush().map_err(write_failure)?;

    let mut sent_generation = 0u64;
    let mut last_sent = Instant::now();
    let mut last_checked = Instant::now();
    loop {
        let due = frames.generation() != sent_generation
            || last_sent.elapsed() >= cfg.keepalive_interval;
        let snapshot = if due { frames.latest() } else { None };
        let Some(snapshot) = snapshot else {
            // Idle workers never write, so a departed client only shows up as EOF.
            if last_checked.elapsed() >= cfg.keepalive_interval {
                if peer_closed(&mut stream).map_err(write_failure)? {
                    return Ok(());
                }
                last_checked = Instant::now();
            }
            std::thread::sleep(cfg.poll_interval);
            continue;
        };
        let jpeg = match snapshot.jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!(
                    "stream: frame {} could not be encoded: {:#}",
                    snapshot.frame.index,
                    err
                );
                sent_generation = snapshot.generation;
                last_sent = Instant::now();
                continue;
            }
        };
        write_part(&mut stream, &cfg.boundary, &jpeg).map_err(write_failure)?;
        sent_generation = snapshot.generation;
        last_sent = Instant::now();
    }
}

/// Non-blocking liveness check: `true` once the client has closed its side.
/// Anything the client sends after its request is discarded.
fn peer_closed(stream: &mut TcpStream) -> std::io::Result<bool> {
    stream.set_nonblocking(true)?;
    let mut buf = [0u8; 512];
    let closed = loop {
        match stream.read(&mut buf) {
            Ok(0) => break true,
            Ok(_) => break false,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break false,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break true,
        }
    };
    stream.set_nonblocking(false)?;
    Ok(closed)
}

/// Read and discard the client's request head. Best effort: clients that send
/// nothing, or send garbage, still get the stream.
fn drain_request(stream: &mut TcpStream, timeout: Duration) {
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                data.extend_from_slice(&buf[..n]);
                if data.len() > MAX_REQUEST_BYTES || data.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    if let Some(line) = data.split(|b| *b == b'\n').next().filter(|l| !l.is_empty()) {
        log::debug!("stream: request {}", String::from_utf8_lossy(line).trim_end());
    }
    let _ = stream.set_read_timeout(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_wire_format() {
        let header = stream_header("stream");
        assert!(header.starts_with("HTTP/1.0 200 OK\r\nConnection: close\r\n"));
        assert!(header.contains("\r\nPragma: no-cache\r\n"));
        assert!(header.ends_with(
            "Content-Type: multipart/x-mixed-replace; boundary=stream\r\n\r\n--stream\r\n"
        ));
    }

    #[test]
    fn part_is_framed_by_length_and_boundary() {
        let mut out = Vec::new();
        write_part(&mut out, "b", &[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let mut expected = b"Content-type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n--b\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn registry_counts_live_workers() {
        let registry = Arc::new(WorkerRegistry::default());
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let a = registry.register(peer);
        let b = registry.register(peer);
        assert_eq!(registry.active(), 2);
        drop(a);
        assert_eq!(registry.active(), 1);
        drop(b);
        assert_eq!(registry.active(), 0);
    }
}
